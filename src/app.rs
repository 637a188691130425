//! One relay cycle: scan, poll, assemble and publish.
//!
//! This module is decoupled from process setup and exit codes so it can be
//! driven deterministically with an injected transport and broker.

use crate::broker::{Broker, BrokerEndpoint};
use crate::matcher::{ScanError, ScanOptions, scan_for_known_devices};
use crate::output::json::JsonFormatter;
use crate::payload::assemble_all;
use crate::poller::{DEFAULT_CONNECT_TIMEOUT, PollOptions, poll_devices};
use crate::publisher::{DEFAULT_DISCONNECT_GRACE, PublishError, publish_all};
use crate::registry::{ConfigError, Registry};
use crate::transport::mock::MockTransport;
use crate::transport::{Backend, Transport};
use clap::Parser;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Command line options.
#[derive(Parser, Debug, Clone)]
#[command(author, about, version)]
pub struct Options {
    /// How long to scan for advertisements; 0 scans until interrupted.
    /// Accepts duration with suffix: 5s, 1m, 500ms, 2h.
    /// Without suffix, value is interpreted as seconds.
    #[arg(long, default_value = "5s", value_parser = crate::duration::parse_duration)]
    pub scan_duration: Duration,

    /// Settings file mapping device addresses or ATC names to a name and topic.
    /// Read as TOML when it ends in `.toml`, as INI otherwise.
    #[arg(long, default_value = "devices.ini", value_name = "FILE")]
    pub device_settings: PathBuf,

    /// MQTT broker host
    #[arg(long, default_value = "localhost")]
    pub mqtt_host: String,

    /// MQTT broker port
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Client identifier presented to the broker
    #[arg(long, default_value = "atc-sensor-relay")]
    pub mqtt_client_id: String,

    /// Bluetooth transport backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Deadline for each device session, from connect to the last read
    #[arg(long, default_value = "60s", value_parser = crate::duration::parse_duration)]
    pub connect_timeout: Duration,

    /// Stop scanning as soon as every configured device has been seen
    #[arg(long)]
    pub stop_when_complete: bool,

    /// Print the messages instead of publishing them
    #[arg(long)]
    pub dry_run: bool,

    /// Verbose output, log every advertisement match and payload
    #[arg(short = 'v', long = "verbose", conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short = 'q', long = "quiet")]
    pub quiet: bool,
}

/// Settings for one cycle, fixed before it starts.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub scan: ScanOptions,
    pub poll: PollOptions,
    pub endpoint: BrokerEndpoint,
    /// How long queued messages get when disconnecting from the broker
    pub disconnect_grace: Duration,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            scan: ScanOptions {
                duration: Duration::from_secs(5),
                stop_when_complete: false,
            },
            poll: PollOptions {
                timeout: DEFAULT_CONNECT_TIMEOUT,
            },
            endpoint: BrokerEndpoint {
                host: "localhost".into(),
                port: 1883,
                client_id: "atc-sensor-relay".into(),
            },
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
        }
    }
}

impl From<&Options> for CycleConfig {
    fn from(options: &Options) -> Self {
        Self {
            scan: ScanOptions {
                duration: options.scan_duration,
                stop_when_complete: options.stop_when_complete,
            },
            poll: PollOptions {
                timeout: options.connect_timeout,
            },
            endpoint: BrokerEndpoint {
                host: options.mqtt_host.clone(),
                port: options.mqtt_port,
                client_id: options.mqtt_client_id.clone(),
            },
            disconnect_grace: DEFAULT_DISCONNECT_GRACE,
        }
    }
}

/// Which phase an interrupt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    Scan,
    Cycle,
}

/// User interrupts for one cycle.
///
/// The first interrupt while scanning only ends the scan; the cycle goes on
/// with whatever was found. Any interrupt after that cancels the cycle.
#[derive(Debug, Clone)]
pub struct Interrupt {
    cycle: CancellationToken,
    scan: CancellationToken,
}

impl Default for Interrupt {
    fn default() -> Self {
        Self::new()
    }
}

impl Interrupt {
    pub fn new() -> Self {
        let cycle = CancellationToken::new();
        let scan = cycle.child_token();
        Self { cycle, scan }
    }

    pub fn trigger(&self) -> Interrupted {
        if self.scan.is_cancelled() {
            self.cycle.cancel();
            Interrupted::Cycle
        } else {
            self.scan.cancel();
            Interrupted::Scan
        }
    }

    /// Mark the scan as over, so the next interrupt cancels the cycle.
    pub fn finish_scan(&self) {
        self.scan.cancel();
    }

    pub fn scan_token(&self) -> &CancellationToken {
        &self.scan
    }

    pub fn cycle_token(&self) -> &CancellationToken {
        &self.cycle
    }
}

/// Errors that abort a cycle.
#[derive(Error, Debug)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Counts for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub matched: usize,
    /// Devices whose session completed
    pub polled: usize,
    /// Devices whose session failed or was skipped
    pub failed: usize,
    pub published: usize,
    pub cancelled: bool,
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "matched={} polled={} failed={} published={}",
            self.matched, self.polled, self.failed, self.published
        )?;
        if self.cancelled {
            write!(f, " (cancelled)")?;
        }
        Ok(())
    }
}

/// Open the transport the cycle will use.
///
/// Nothing is opened for an empty registry, since the cycle has nothing to
/// look for.
pub async fn open_transport(
    backend: Backend,
    registry: &Registry,
) -> Result<Option<Box<dyn Transport>>, ScanError> {
    if registry.is_empty() {
        return Ok(None);
    }

    let transport: Box<dyn Transport> = match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => Box::new(
            crate::transport::bluer::BluerTransport::new()
                .await
                .map_err(ScanError::Start)?,
        ),
        Backend::Mock => Box::new(MockTransport::from_registry(registry)),
    };
    Ok(Some(transport))
}

/// Run one full cycle against the given transport and broker.
///
/// An empty registry or a scan without matches is a normal, quiet cycle. A
/// cancelled cycle publishes nothing.
pub async fn run_cycle(
    config: &CycleConfig,
    registry: &Registry,
    transport: &dyn Transport,
    broker: &dyn Broker,
    interrupt: &Interrupt,
) -> Result<CycleReport, RunError> {
    let report = cycle(config, registry, transport, broker, interrupt).await?;
    info!("Cycle finished: {}", report);
    Ok(report)
}

async fn cycle(
    config: &CycleConfig,
    registry: &Registry,
    transport: &dyn Transport,
    broker: &dyn Broker,
    interrupt: &Interrupt,
) -> Result<CycleReport, RunError> {
    let mut report = CycleReport::default();

    if registry.is_empty() {
        warn!("No devices configured, nothing to do");
        interrupt.finish_scan();
        return Ok(report);
    }

    info!(
        "Scanning for {} devices ({:?})",
        registry.len(),
        config.scan.duration
    );
    let outcome = scan_for_known_devices(transport, registry, &config.scan, interrupt.scan_token()).await;
    interrupt.finish_scan();
    let outcome = outcome?;

    report.matched = outcome.devices.len();
    if outcome.devices.is_empty() {
        info!("No configured devices found");
        return Ok(report);
    }

    let results = poll_devices(transport, outcome.devices, &config.poll, interrupt.cycle_token()).await;
    report.polled = results.iter().filter(|(_, r)| r.is_ok()).count();
    report.failed = results.len() - report.polled;

    if interrupt.cycle_token().is_cancelled() {
        warn!("Interrupted, not publishing");
        report.cancelled = true;
        return Ok(report);
    }

    let messages = assemble_all(&results);
    let published = publish_all(
        broker,
        &config.endpoint,
        &messages,
        &JsonFormatter,
        config.disconnect_grace,
    )
    .await?;
    report.published = published.published;

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::memory::MemoryBroker;
    use crate::device_id::DeviceId;
    use crate::mac_address::MacAddress;
    use crate::registry::SensorInfo;
    use crate::test_utils::{TEST_MAC, test_registry};
    use crate::transport::mock::MockDevice;
    use std::time::{SystemTime, UNIX_EPOCH};

    const DESK: MacAddress = MacAddress([0xA4, 0xC1, 0x38, 0x0C, 0x5B, 0x45]);

    fn desk_registry() -> Registry {
        [(
            DeviceId::from_address(DESK),
            SensorInfo::new("desk", "temperature/room"),
        )]
        .into_iter()
        .collect()
    }

    #[test]
    fn test_options_defaults() {
        let options = Options::try_parse_from(["atc-sensor-relay"]).unwrap();
        assert_eq!(options.scan_duration, Duration::from_secs(5));
        assert_eq!(options.device_settings, PathBuf::from("devices.ini"));
        assert_eq!(options.connect_timeout, Duration::from_secs(60));

        let config = CycleConfig::from(&options);
        assert_eq!(config.endpoint.to_string(), "localhost:1883");
        assert_eq!(config.endpoint.client_id, "atc-sensor-relay");
        assert!(!config.scan.stop_when_complete);
    }

    #[test]
    fn test_options_overrides() {
        let options = Options::try_parse_from([
            "atc-sensor-relay",
            "--scan-duration",
            "0",
            "--mqtt-host",
            "broker.lan",
            "--mqtt-port",
            "8883",
            "--connect-timeout",
            "500ms",
            "--backend",
            "mock",
            "--stop-when-complete",
        ])
        .unwrap();
        let config = CycleConfig::from(&options);

        assert!(config.scan.duration.is_zero());
        assert!(config.scan.stop_when_complete);
        assert_eq!(config.poll.timeout, Duration::from_millis(500));
        assert_eq!(config.endpoint.to_string(), "broker.lan:8883");
        assert_eq!(options.backend, Backend::Mock);
    }

    #[test]
    fn test_options_reject_verbose_and_quiet() {
        assert!(Options::try_parse_from(["atc-sensor-relay", "-v", "-q"]).is_err());
        assert!(Options::try_parse_from(["atc-sensor-relay", "--scan-duration", "soon"]).is_err());
    }

    #[test]
    fn test_interrupt_phases() {
        let interrupt = Interrupt::new();
        assert_eq!(interrupt.trigger(), Interrupted::Scan);
        assert!(interrupt.scan_token().is_cancelled());
        assert!(!interrupt.cycle_token().is_cancelled());

        assert_eq!(interrupt.trigger(), Interrupted::Cycle);
        assert!(interrupt.cycle_token().is_cancelled());
    }

    #[test]
    fn test_interrupt_after_scan_cancels_cycle() {
        let interrupt = Interrupt::new();
        interrupt.finish_scan();
        assert_eq!(interrupt.trigger(), Interrupted::Cycle);
        assert!(interrupt.cycle_token().is_cancelled());
    }

    #[tokio::test]
    async fn test_empty_registry_opens_no_transport() {
        let transport = open_transport(Backend::default(), &Registry::default())
            .await
            .unwrap();
        assert!(transport.is_none());

        let transport = open_transport(Backend::Mock, &test_registry()).await.unwrap();
        assert!(transport.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_scan_duration_runs_until_interrupted() {
        let options = Options::try_parse_from([
            "atc-sensor-relay",
            "--scan-duration",
            "18446744073709551615",
        ])
        .unwrap();
        let registry = test_registry();
        let transport = MockTransport::from_registry(&registry);
        let broker = MemoryBroker::new();
        let interrupt = Interrupt::new();

        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let report = run_cycle(
            &CycleConfig::from(&options),
            &registry,
            &transport,
            &broker,
            &interrupt,
        )
        .await
        .unwrap();
        assert_eq!(report.published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_max_connect_timeout_polls_without_deadline() {
        let options = Options::try_parse_from([
            "atc-sensor-relay",
            "--connect-timeout",
            "18446744073709551615",
        ])
        .unwrap();
        let registry = test_registry();
        let transport = MockTransport::from_registry(&registry);
        let broker = MemoryBroker::new();

        let report = run_cycle(
            &CycleConfig::from(&options),
            &registry,
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await
        .unwrap();
        assert_eq!(report.polled, 2);
        assert_eq!(report.published, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_publishes_desk_reading() {
        let registry = desk_registry();
        let transport = MockTransport::new(vec![
            MockDevice::new(DESK, Some("ATC_0C5B45"))
                .with_temperature(215)
                .with_humidity(4500),
        ]);
        let broker = MemoryBroker::new();

        let report = run_cycle(
            &CycleConfig::default(),
            &registry,
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            report,
            CycleReport {
                matched: 1,
                polled: 1,
                failed: 0,
                published: 1,
                cancelled: false,
            }
        );

        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "temperature/room");

        let body: serde_json::Value = serde_json::from_slice(&published[0].payload).unwrap();
        assert_eq!(body["address"], "a4:c1:38:0c:5b:45");
        assert_eq!(body["sensorname"], "desk");
        assert_eq!(body["temperature"], 21.5);
        assert_eq!(body["humidity"], 45);
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs();
        let timestamp = body["timestamp"].as_u64().unwrap();
        assert!(now.abs_diff(timestamp) < 60);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_registry_does_nothing() {
        let transport = MockTransport::new(vec![MockDevice::new(TEST_MAC, None)]);
        let broker = MemoryBroker::new();

        let report = run_cycle(
            &CycleConfig::default(),
            &Registry::default(),
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await
        .unwrap();

        assert_eq!(report, CycleReport::default());
        assert_eq!(transport.activity().scans, 0);
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_matches_skips_polling_and_publishing() {
        let transport = MockTransport::new(vec![MockDevice::new(
            MacAddress([1, 2, 3, 4, 5, 6]),
            Some("ATC_000000"),
        )]);
        let broker = MemoryBroker::new();

        let report = run_cycle(
            &CycleConfig::default(),
            &test_registry(),
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.matched, 0);
        assert!(transport.activity().connects.is_empty());
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incomplete_device_is_not_published() {
        let registry = test_registry();
        let transport = MockTransport::new(vec![
            MockDevice::new(TEST_MAC, None)
                .with_temperature(250)
                .with_humidity(5000),
            MockDevice::new(MacAddress([1, 2, 3, 4, 5, 6]), Some("ATC_8B1F2A")).with_temperature(180),
        ]);
        let broker = MemoryBroker::new();

        let report = run_cycle(
            &CycleConfig::default(),
            &registry,
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await
        .unwrap();

        assert_eq!(report.polled, 2);
        assert_eq!(report.published, 1);
        assert_eq!(broker.published()[0].topic, "temperature/room");
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_during_scan_still_publishes() {
        let registry = test_registry();
        let transport = MockTransport::from_registry(&registry);
        let broker = MemoryBroker::new();
        let interrupt = Interrupt::new();
        let config = CycleConfig {
            scan: ScanOptions {
                duration: Duration::ZERO,
                stop_when_complete: false,
            },
            ..CycleConfig::default()
        };

        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.trigger();
        });

        let report = run_cycle(&config, &registry, &transport, &broker, &interrupt)
            .await
            .unwrap();

        assert!(!report.cancelled);
        assert_eq!(report.published, 2);
        let topics: Vec<String> = broker.published().into_iter().map(|m| m.topic).collect();
        assert_eq!(topics, vec!["temperature/room", "temperature/kitchen"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_while_polling_publishes_nothing() {
        let registry = test_registry();
        let transport = MockTransport::new(vec![
            MockDevice::new(TEST_MAC, None).hanging_connect(),
            MockDevice::new(MacAddress([1, 2, 3, 4, 5, 6]), Some("ATC_8B1F2A"))
                .with_temperature(200)
                .with_humidity(4000),
        ]);
        let broker = MemoryBroker::new();
        let interrupt = Interrupt::new();

        let trigger = interrupt.clone();
        tokio::spawn(async move {
            // The scan ends after 5s; this lands while the first session hangs.
            tokio::time::sleep(Duration::from_secs(10)).await;
            trigger.trigger();
        });

        let report = run_cycle(
            &CycleConfig::default(),
            &registry,
            &transport,
            &broker,
            &interrupt,
        )
        .await
        .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.failed, 2);
        assert_eq!(transport.activity().connects.len(), 1);
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_failure_aborts_cycle() {
        let transport = MockTransport::new(vec![]).failing_scan("adapter powered off");
        let broker = MemoryBroker::new();

        let result = run_cycle(
            &CycleConfig::default(),
            &test_registry(),
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Scan(_))));
        assert_eq!(broker.connects(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_broker_failure_aborts_cycle() {
        let registry = test_registry();
        let transport = MockTransport::from_registry(&registry);
        let broker = MemoryBroker::new().failing_connect("connection refused");

        let result = run_cycle(
            &CycleConfig::default(),
            &registry,
            &transport,
            &broker,
            &Interrupt::new(),
        )
        .await;

        assert!(matches!(result, Err(RunError::Publish(_))));
    }
}
