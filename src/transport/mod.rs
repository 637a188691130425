//! BLE transport abstraction.
//!
//! The relay only needs a handful of capabilities from the Bluetooth stack:
//! scanning for advertisements, connecting to one device, discovering its
//! GATT services, reading a characteristic and disconnecting. They are
//! expressed as the [`Transport`] and [`Session`] traits so backends can be
//! selected at startup and tests can run without radio hardware.

#[cfg(feature = "bluer")]
pub mod bluer;

pub mod mock;

use crate::device_id::DeviceId;
use crate::mac_address::MacAddress;
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Channel buffer size for advertisements forwarded by a backend.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 100;

/// An unconnected broadcast observed during a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: MacAddress,
    pub local_name: Option<String>,
}

/// Error type for transport operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// The session dropped while it was in use
    #[error("device disconnected")]
    Disconnected,
    /// No characteristic with the given handle in this session
    #[error("unknown characteristic handle {0}")]
    UnknownCharacteristic(usize),
}

/// Convenience alias for advertisements or the error that ended the scan.
pub type AdvertisementResult = Result<Advertisement, TransportError>;

/// A GATT characteristic exposed by a connected device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharacteristicInfo {
    /// Session-local handle passed back to [`Session::read`]
    pub handle: usize,
    pub uuid: Uuid,
    pub readable: bool,
}

/// A GATT service and its characteristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub uuid: Uuid,
    pub characteristics: Vec<CharacteristicInfo>,
}

/// An established connection to one device.
pub trait Session: Send {
    /// Address of the connected device.
    fn address(&self) -> MacAddress;

    /// Resolves once the link is down, whether we closed it or the peer did.
    fn disconnected(&self) -> BoxFuture<'static, ()>;

    /// Enumerate the device's services and characteristics.
    fn discover(&mut self) -> BoxFuture<'_, Result<Vec<ServiceInfo>, TransportError>>;

    /// Read the raw value of a characteristic returned by [`Session::discover`].
    fn read(&mut self, handle: usize) -> BoxFuture<'_, Result<Vec<u8>, TransportError>>;

    /// Close the connection.
    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}

/// A Bluetooth stack capable of scanning and connecting.
pub trait Transport: Send + Sync {
    /// Start scanning. Advertisements are delivered until the receiver is
    /// dropped; an `Err` item reports a failure that ended the scan.
    fn scan(&self) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementResult>, TransportError>>;

    /// Connect to the first device whose advertisement matches `target`.
    fn connect<'a>(
        &'a self,
        target: &'a DeviceId,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>>;
}

/// Available transport backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Simulated sensors built from the device settings, for dry runs
    Mock,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(not(feature = "bluer"))]
        return Backend::Mock;
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            Backend::Mock => write!(f, "mock"),
        }
    }
}

impl std::str::FromStr for Backend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            #[cfg(feature = "bluer")]
            "bluer" | "bluez" | "default" => Ok(Backend::Bluer),
            "mock" | "simulated" => Ok(Backend::Mock),
            _ => Err(format!("Unknown backend: {}", s)),
        }
    }
}
