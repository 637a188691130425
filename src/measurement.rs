//! Measurements read from a sensor and the GATT characteristics they come from.
//!
//! The ATC firmware exposes the standard Environmental Sensing service with
//! little-endian 16-bit temperature (0.1 °C) and humidity (0.01 %) values, and
//! the standard Battery service with a one-byte percentage.

use crate::mac_address::MacAddress;
use std::time::SystemTime;
use thiserror::Error;
use uuid::Uuid;

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG-assigned number into a full 128-bit UUID.
pub const fn bluetooth_uuid(short: u16) -> Uuid {
    Uuid::from_u128(((short as u128) << 96) | BLUETOOTH_BASE_UUID)
}

/// Environmental Sensing service (0x181A)
pub const ENVIRONMENTAL_SENSING_SERVICE: Uuid = bluetooth_uuid(0x181A);
/// Battery service (0x180F)
pub const BATTERY_SERVICE: Uuid = bluetooth_uuid(0x180F);
/// Temperature characteristic (0x2A1F, 0.1 °C)
pub const TEMPERATURE_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A1F);
/// Humidity characteristic (0x2A6F, 0.01 %)
pub const HUMIDITY_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A6F);
/// Battery level characteristic (0x2A19, percent)
pub const BATTERY_LEVEL_CHARACTERISTIC: Uuid = bluetooth_uuid(0x2A19);

/// Whether the poller should look inside a service.
pub fn is_service_of_interest(uuid: &Uuid) -> bool {
    *uuid == ENVIRONMENTAL_SENSING_SERVICE || *uuid == BATTERY_SERVICE
}

/// Errors decoding a raw characteristic value.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DecodeError {
    #[error("{kind} value too short: expected {expected} bytes, got {actual}")]
    TooShort {
        kind: MeasurementKind,
        expected: usize,
        actual: usize,
    },
}

/// The characteristics the relay reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MeasurementKind {
    Temperature,
    Humidity,
    Battery,
}

impl MeasurementKind {
    /// Map a characteristic UUID to the measurement it carries.
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        match *uuid {
            TEMPERATURE_CHARACTERISTIC => Some(Self::Temperature),
            HUMIDITY_CHARACTERISTIC => Some(Self::Humidity),
            BATTERY_LEVEL_CHARACTERISTIC => Some(Self::Battery),
            _ => None,
        }
    }

    pub fn uuid(self) -> Uuid {
        match self {
            Self::Temperature => TEMPERATURE_CHARACTERISTIC,
            Self::Humidity => HUMIDITY_CHARACTERISTIC,
            Self::Battery => BATTERY_LEVEL_CHARACTERISTIC,
        }
    }
}

impl std::fmt::Display for MeasurementKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Temperature => write!(f, "temperature"),
            Self::Humidity => write!(f, "humidity"),
            Self::Battery => write!(f, "battery"),
        }
    }
}

fn le_u16(kind: MeasurementKind, raw: &[u8]) -> Result<u16, DecodeError> {
    match raw {
        [lo, hi, ..] => Ok(u16::from_le_bytes([*lo, *hi])),
        _ => Err(DecodeError::TooShort {
            kind,
            expected: 2,
            actual: raw.len(),
        }),
    }
}

/// Decode a temperature value in °C (unsigned, tenths of a degree).
pub fn decode_temperature(raw: &[u8]) -> Result<f32, DecodeError> {
    le_u16(MeasurementKind::Temperature, raw).map(|v| f32::from(v) / 10.0)
}

/// Decode a relative humidity in whole percent (hundredths, truncated).
pub fn decode_humidity(raw: &[u8]) -> Result<u16, DecodeError> {
    le_u16(MeasurementKind::Humidity, raw).map(|v| v / 100)
}

/// Decode a battery level in percent.
pub fn decode_battery(raw: &[u8]) -> Result<u8, DecodeError> {
    raw.first().copied().ok_or(DecodeError::TooShort {
        kind: MeasurementKind::Battery,
        expected: 1,
        actual: 0,
    })
}

/// Measurements read from one device during a cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    /// Address of the device the session was opened to
    pub address: MacAddress,
    /// Display name from the registry
    pub name: String,
    /// When the set was captured
    pub timestamp: SystemTime,
    /// Temperature in Celsius
    pub temperature: Option<f32>,
    /// Relative humidity in whole percent
    pub humidity: Option<u16>,
    /// Battery level in percent
    pub battery: Option<u8>,
}

impl MeasurementSet {
    pub fn new(address: MacAddress, name: impl Into<String>) -> Self {
        Self {
            address,
            name: name.into(),
            timestamp: SystemTime::now(),
            temperature: None,
            humidity: None,
            battery: None,
        }
    }

    /// Decode `raw` as `kind` and store it, replacing any earlier value.
    pub fn record(&mut self, kind: MeasurementKind, raw: &[u8]) -> Result<(), DecodeError> {
        match kind {
            MeasurementKind::Temperature => self.temperature = Some(decode_temperature(raw)?),
            MeasurementKind::Humidity => self.humidity = Some(decode_humidity(raw)?),
            MeasurementKind::Battery => self.battery = Some(decode_battery(raw)?),
        }
        Ok(())
    }
}
