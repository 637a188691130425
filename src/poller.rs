//! Reading measurements from matched devices, one session at a time.

use crate::matcher::MatchedDevice;
use crate::measurement::{MeasurementKind, MeasurementSet, is_service_of_interest};
use crate::transport::{Session, Transport, TransportError};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default deadline for one device session (connect, discover, read).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long to wait for a disconnect to complete.
const DISCONNECT_GRACE: Duration = Duration::from_secs(5);

/// Errors that make a device yield no measurements.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PollError {
    #[error("failed to connect: {0}")]
    Connect(TransportError),
    #[error("can't discover profile: {0}")]
    Discovery(TransportError),
    #[error("session timed out after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Deadline for the whole session, from connect to the last read
    pub timeout: Duration,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Outcome of polling one device.
pub type PollResult = Result<MeasurementSet, PollError>;

/// Read every interesting characteristic the session exposes.
///
/// A failed or undecodable read is logged and skipped; only discovery
/// failure is an error.
async fn read_measurements(
    session: &mut dyn Session,
    device: &MatchedDevice,
) -> Result<MeasurementSet, PollError> {
    debug!("Discovering profile for device {}...", device.id);
    let services = session.discover().await.map_err(PollError::Discovery)?;
    let mut set = MeasurementSet::new(session.address(), device.info.name.as_str());

    for service in services.iter().filter(|s| is_service_of_interest(&s.uuid)) {
        for characteristic in &service.characteristics {
            let Some(kind) = MeasurementKind::from_uuid(&characteristic.uuid) else {
                continue;
            };
            if !characteristic.readable {
                debug!("{} of {} is not readable", kind, device.id);
                continue;
            }

            match session.read(characteristic.handle).await {
                Ok(raw) => {
                    if let Err(e) = set.record(kind, &raw) {
                        warn!("Bad {} value from {}: {}", kind, device.id, e);
                    }
                }
                Err(e) => warn!("Failed to read {} from {}: {}", kind, device.id, e),
            }
        }
    }

    set.timestamp = SystemTime::now();
    Ok(set)
}

/// Run `future` to completion, or give up at `deadline`. `None` never expires.
async fn before<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

/// Connect to one device, read its measurements and disconnect.
///
/// The whole session is bounded by `options.timeout` (unbounded if that
/// overflows the clock) and aborted when `cancel` fires. Whatever happens
/// after the connection is established, the session is disconnected and the
/// disconnect watcher joined before this returns.
pub async fn poll_device(
    transport: &dyn Transport,
    device: &MatchedDevice,
    options: &PollOptions,
    cancel: &CancellationToken,
) -> PollResult {
    info!("Connecting to {}...", device.id);
    let deadline = Instant::now().checked_add(options.timeout);

    let mut session = tokio::select! {
        _ = cancel.cancelled() => return Err(PollError::Cancelled),
        result = before(deadline, transport.connect(&device.id)) => match result {
            None => return Err(PollError::Timeout(options.timeout)),
            Some(Err(e)) => return Err(PollError::Connect(e)),
            Some(Ok(session)) => session,
        },
    };

    // The peer may drop the link on its own, so watch for it in the background.
    let address = session.address();
    let link_down = session.disconnected();
    let mut watcher = tokio::spawn(async move {
        link_down.await;
        info!("[ {} ] is disconnected", address);
    });

    let result = tokio::select! {
        _ = cancel.cancelled() => Err(PollError::Cancelled),
        result = before(deadline, read_measurements(&mut *session, device)) => {
            result.unwrap_or(Err(PollError::Timeout(options.timeout)))
        }
    };

    debug!("Disconnecting [ {} ]", address);
    match tokio::time::timeout(DISCONNECT_GRACE, session.disconnect()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Error disconnecting {}: {}", device.id, e),
        Err(_) => warn!("Disconnecting {} timed out", device.id),
    }
    if tokio::time::timeout(DISCONNECT_GRACE, &mut watcher).await.is_err() {
        warn!(
            "{} did not report disconnection within {:?}",
            device.id, DISCONNECT_GRACE
        );
        watcher.abort();
    }

    result
}

/// Poll matched devices strictly one after another.
///
/// Returns one result per device, in input order. A failing device does not
/// affect the others. Once `cancel` fires, the remaining devices are reported
/// as cancelled without connecting.
pub async fn poll_devices(
    transport: &dyn Transport,
    devices: Vec<MatchedDevice>,
    options: &PollOptions,
    cancel: &CancellationToken,
) -> Vec<(MatchedDevice, PollResult)> {
    info!("Polling {} devices", devices.len());
    let mut results = Vec::with_capacity(devices.len());

    for device in devices {
        let result = if cancel.is_cancelled() {
            Err(PollError::Cancelled)
        } else {
            poll_device(transport, &device, options, cancel).await
        };

        match &result {
            Ok(set) => debug!("Got {:?} from {}", set, device.id),
            Err(e) => warn!("Error polling device {}: {}", device.id, e),
        }
        results.push((device, result));
    }

    results
}
