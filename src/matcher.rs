//! Matching scanned advertisements against the registry.

use crate::device_id::DeviceId;
use crate::registry::{Registry, SensorInfo};
use crate::transport::{Advertisement, Transport, TransportError};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Errors that end a scan abnormally.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScanError {
    #[error("failed to start scan: {0}")]
    Start(TransportError),
    #[error("scan failed: {0}")]
    Transport(TransportError),
    #[error("advertisement stream ended before the scan finished")]
    StreamClosed,
}

/// A registry entry seen during the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchedDevice {
    /// The identifier that matched, as stored in the registry
    pub id: DeviceId,
    pub info: SensorInfo,
}

#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// How long to scan; zero scans until cancelled
    pub duration: Duration,
    /// Stop as soon as every registry entry has been seen
    pub stop_when_complete: bool,
}

/// Why a scan finished. All of these are normal outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanStop {
    Deadline,
    Cancelled,
    Complete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScanOutcome {
    /// Matched devices, sorted by identifier
    pub devices: Vec<MatchedDevice>,
    pub stop: ScanStop,
}

/// Accumulates registry hits from a sequence of advertisements.
#[derive(Debug)]
pub struct Matcher<'r> {
    registry: &'r Registry,
    found: BTreeMap<DeviceId, SensorInfo>,
}

impl<'r> Matcher<'r> {
    pub fn new(registry: &'r Registry) -> Self {
        Self {
            registry,
            found: BTreeMap::new(),
        }
    }

    /// Resolve an advertisement by address first, then by local name.
    pub fn lookup(&self, advertisement: &Advertisement) -> Option<(&'r DeviceId, &'r SensorInfo)> {
        self.registry
            .get_key_value(&advertisement.address.to_string())
            .or_else(|| {
                advertisement
                    .local_name
                    .as_deref()
                    .and_then(|name| self.registry.get_key_value(name))
            })
    }

    /// Record an advertisement. Returns the identifier it matched, if any.
    pub fn observe(&mut self, advertisement: &Advertisement) -> Option<&'r DeviceId> {
        let (id, info) = self.lookup(advertisement)?;
        if self.found.insert(id.clone(), info.clone()).is_none() {
            info!("Found {} ({}) at {}", id, info.name, advertisement.address);
        } else {
            debug!("Seen {} again", id);
        }
        Some(id)
    }

    /// Whether every registry entry has been matched.
    pub fn is_complete(&self) -> bool {
        self.found.len() == self.registry.len()
    }

    pub fn into_matches(self) -> Vec<MatchedDevice> {
        self.found
            .into_iter()
            .map(|(id, info)| MatchedDevice { id, info })
            .collect()
    }
}

/// Scan for registry devices until the deadline, cancellation, or (optionally)
/// until all of them have been seen.
pub async fn scan_for_known_devices(
    transport: &dyn Transport,
    registry: &Registry,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<ScanOutcome, ScanError> {
    let mut advertisements = transport.scan().await.map_err(ScanError::Start)?;
    let mut matcher = Matcher::new(registry);

    // Zero, or a duration past the end of the clock, scans until cancelled.
    let deadline = if options.duration.is_zero() {
        None
    } else {
        Instant::now().checked_add(options.duration)
    };
    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expired);

    let stop = loop {
        if options.stop_when_complete && matcher.is_complete() {
            break ScanStop::Complete;
        }

        tokio::select! {
            _ = &mut expired => break ScanStop::Deadline,
            _ = cancel.cancelled() => break ScanStop::Cancelled,
            item = advertisements.recv() => match item {
                Some(Ok(advertisement)) => {
                    matcher.observe(&advertisement);
                }
                Some(Err(e)) => return Err(ScanError::Transport(e)),
                None => return Err(ScanError::StreamClosed),
            },
        }
    };

    debug!("Scan stopped: {:?}", stop);
    Ok(ScanOutcome {
        devices: matcher.into_matches(),
        stop,
    })
}
