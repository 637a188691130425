//! Device identifiers used as registry keys and scan match keys.

use crate::mac_address::MacAddress;
use crate::transport::Advertisement;
use std::borrow::Borrow;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Local-name prefix assigned by the ATC thermometer firmware (after normalization).
const ATC_NAME_PREFIX: &str = "atc_";

/// Normalize a raw identifier: trim surrounding whitespace and lower-case it.
///
/// Both the registry loader and the advertisement matcher go through this
/// function, so a configured key and an observed address always agree.
///
/// # Example
/// ```
/// use atc_sensor_relay::device_id::normalize;
///
/// assert_eq!(normalize(" A4:C1:38:0C:5B:45 "), "a4:c1:38:0c:5b:45");
/// assert_eq!(normalize(&normalize("ATC_8B1F2A")), normalize("ATC_8B1F2A"));
/// ```
pub fn normalize(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// Errors returned when a string is neither an address nor an ATC name.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("'{0}' is neither a MAC address nor an ATC device name")]
pub struct ParseDeviceIdError(pub String);

/// A normalized device identifier: a hardware address or an ATC firmware name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(String);

impl DeviceId {
    /// Identifier for an observed hardware address.
    pub fn from_address(address: MacAddress) -> Self {
        Self(address.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The hardware address, when this identifier is one.
    pub fn address(&self) -> Option<MacAddress> {
        self.0.parse().ok()
    }

    /// Whether an advertisement belongs to the device this identifier names.
    pub fn matches(&self, advertisement: &Advertisement) -> bool {
        match self.address() {
            Some(address) => advertisement.address == address,
            None => advertisement
                .local_name
                .as_deref()
                .is_some_and(|name| normalize(name) == self.0),
        }
    }
}

fn is_atc_name(normalized: &str) -> bool {
    normalized
        .strip_prefix(ATC_NAME_PREFIX)
        .is_some_and(|suffix| {
            !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_alphanumeric())
        })
}

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(address) = s.parse::<MacAddress>() {
            return Ok(Self::from_address(address));
        }

        let normalized = normalize(s);
        if is_atc_name(&normalized) {
            Ok(Self(normalized))
        } else {
            Err(ParseDeviceIdError(s.to_string()))
        }
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for DeviceId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl From<MacAddress> for DeviceId {
    fn from(address: MacAddress) -> Self {
        Self::from_address(address)
    }
}
