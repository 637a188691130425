//! `atc-sensor-relay` library.
//!
//! The binary (`src/main.rs`) is responsible for process setup and exit codes.
//! One relay cycle lives in [`crate::app`] where it can be tested
//! deterministically with an injected transport and broker.

pub mod app;
pub mod broker;
pub mod device_id;
pub mod duration;
pub mod mac_address;
pub mod matcher;
pub mod measurement;
pub mod output;
pub mod payload;
pub mod poller;
pub mod publisher;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use app::{CycleConfig, CycleReport, Interrupt, Options, RunError, run_cycle};
pub use broker::{Broker, BrokerConnection, BrokerEndpoint, BrokerError};
pub use device_id::DeviceId;
pub use duration::parse_duration;
pub use mac_address::MacAddress;
pub use measurement::{MeasurementKind, MeasurementSet};
pub use output::{PayloadFormatter, SerializationError};
pub use payload::{OutboundMessage, SensorPayload};
pub use registry::{ConfigError, Registry, SensorInfo};
pub use transport::{Backend, Session, Transport, TransportError};
