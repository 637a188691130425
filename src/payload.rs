//! Assembling outbound MQTT messages from polled measurements.

use crate::matcher::MatchedDevice;
use crate::measurement::{MeasurementKind, MeasurementSet};
use crate::poller::PollResult;
use crate::registry::SensorInfo;
use serde::Serialize;
use std::time::UNIX_EPOCH;
use thiserror::Error;
use tracing::warn;

/// The message body published for one sensor.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorPayload {
    pub address: String,
    pub sensorname: String,
    pub temperature: f32,
    pub humidity: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub battery: Option<u8>,
    /// Seconds since the Unix epoch
    pub timestamp: u64,
}

/// A payload and the topic it goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: SensorPayload,
}

/// Reasons a measurement set yields no message.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AssembleError {
    #[error("no {kind} reading from {address}")]
    Missing {
        address: String,
        kind: MeasurementKind,
    },
}

/// Build the message for one device. Temperature and humidity are required.
pub fn assemble(set: &MeasurementSet, info: &SensorInfo) -> Result<OutboundMessage, AssembleError> {
    let missing = |kind| AssembleError::Missing {
        address: set.address.to_string(),
        kind,
    };
    let temperature = set
        .temperature
        .ok_or_else(|| missing(MeasurementKind::Temperature))?;
    let humidity = set
        .humidity
        .ok_or_else(|| missing(MeasurementKind::Humidity))?;

    let timestamp = set
        .timestamp
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default();

    Ok(OutboundMessage {
        topic: info.topic.clone(),
        payload: SensorPayload {
            address: set.address.to_string(),
            sensorname: set.name.clone(),
            temperature,
            humidity,
            battery: set.battery,
            timestamp,
        },
    })
}

/// Turn poll results into messages, logging and dropping failed or
/// incomplete devices.
pub fn assemble_all(results: &[(MatchedDevice, PollResult)]) -> Vec<OutboundMessage> {
    results
        .iter()
        .filter_map(|(device, result)| {
            let set = result.as_ref().ok()?;
            match assemble(set, &device.info) {
                Ok(message) => Some(message),
                Err(e) => {
                    warn!("Dropping {}: {}", device.id, e);
                    None
                }
            }
        })
        .collect()
}
