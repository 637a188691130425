//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisement, AdvertisementResult, CharacteristicInfo,
    ServiceInfo, Session, Transport, TransportError,
};
use crate::device_id::DeviceId;
use crate::mac_address::MacAddress;
use bluer::gatt::remote::Characteristic;
use bluer::{Adapter, AdapterEvent, Address, Device, DeviceEvent, DeviceProperty};
use futures::StreamExt;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tracing::debug;

impl From<bluer::Error> for TransportError {
    fn from(err: bluer::Error) -> Self {
        TransportError::Bluetooth(err.to_string())
    }
}

/// Transport backed by the default BlueZ adapter.
pub struct BluerTransport {
    // Keeps the D-Bus connection alive for the adapter handle
    _session: bluer::Session,
    adapter: Adapter,
}

impl BluerTransport {
    /// Open a BlueZ session and power on the default adapter.
    pub async fn new() -> Result<Self, TransportError> {
        let session = bluer::Session::new().await?;
        let adapter = session.default_adapter().await?;
        adapter.set_powered(true).await?;
        debug!("Using Bluetooth adapter {}", adapter.name());
        Ok(Self {
            _session: session,
            adapter,
        })
    }

    async fn advertisement(adapter: &Adapter, address: Address) -> Advertisement {
        let local_name = match adapter.device(address) {
            Ok(device) => device.name().await.ok().flatten(),
            Err(_) => None,
        };
        Advertisement {
            address: address.into(),
            local_name,
        }
    }

    /// The advertisement for `address`, if BlueZ has heard it during this
    /// discovery. Devices cached from earlier sessions have no RSSI.
    async fn live_advertisement(adapter: &Adapter, address: Address) -> Option<Advertisement> {
        let device = adapter.device(address).ok()?;
        let rssi = device.rssi().await.ok().flatten();
        let local_name = device.name().await.ok().flatten();
        heard(address.into(), local_name, rssi)
    }

    /// Find the address of a device matching `target`, discovering if BlueZ
    /// does not know it yet.
    async fn locate(&self, target: &DeviceId) -> Result<Address, TransportError> {
        for address in self.adapter.device_addresses().await? {
            if target.matches(&Self::advertisement(&self.adapter, address).await) {
                return Ok(address);
            }
        }

        debug!("{} not cached by BlueZ, discovering", target);
        let mut events = Box::pin(self.adapter.discover_devices_with_changes().await?);
        while let Some(event) = events.next().await {
            if let AdapterEvent::DeviceAdded(address) = event
                && target.matches(&Self::advertisement(&self.adapter, address).await)
            {
                return Ok(address);
            }
        }

        Err(TransportError::Bluetooth(format!(
            "discovery ended before {target} was seen"
        )))
    }
}

/// An advertisement for a device with a signal reading, `None` for one that
/// BlueZ only remembers.
fn heard(
    address: MacAddress,
    local_name: Option<String>,
    rssi: Option<i16>,
) -> Option<Advertisement> {
    rssi.map(|_| Advertisement {
        address,
        local_name,
    })
}

impl Transport for BluerTransport {
    fn scan(&self) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementResult>, TransportError>> {
        Box::pin(async move {
            let adapter = self.adapter.clone();
            // Property changes arrive as `DeviceAdded` too, so a name
            // resolved after the first sighting is still reported.
            let mut events = Box::pin(adapter.discover_devices_with_changes().await?);
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

            // The task owns the discovery stream; dropping it stops discovery.
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tx.closed() => break,
                        event = events.next() => match event {
                            Some(AdapterEvent::DeviceAdded(address)) => {
                                let Some(advertisement) =
                                    Self::live_advertisement(&adapter, address).await
                                else {
                                    continue;
                                };
                                if tx.send(Ok(advertisement)).await.is_err() {
                                    break;
                                }
                            }
                            Some(_) => {}
                            None => {
                                let _ = tx
                                    .send(Err(TransportError::Bluetooth(
                                        "discovery stream ended".into(),
                                    )))
                                    .await;
                                break;
                            }
                        },
                    }
                }
            });

            Ok(rx)
        })
    }

    fn connect<'a>(
        &'a self,
        target: &'a DeviceId,
    ) -> BoxFuture<'a, Result<Box<dyn Session>, TransportError>> {
        Box::pin(async move {
            let address = self.locate(target).await?;
            let device = self.adapter.device(address)?;
            if !device.is_connected().await? {
                device.connect().await?;
            }
            let session: Box<dyn Session> = Box::new(BluerSession {
                device,
                characteristics: Vec::new(),
            });
            Ok(session)
        })
    }
}

struct BluerSession {
    device: Device,
    characteristics: Vec<Characteristic>,
}

impl Session for BluerSession {
    fn address(&self) -> MacAddress {
        self.device.address().into()
    }

    fn disconnected(&self) -> BoxFuture<'static, ()> {
        let device = self.device.clone();
        Box::pin(async move {
            let Ok(events) = device.events().await else {
                return;
            };
            let mut events = Box::pin(events);
            // Subscribed first, so a drop between the check and the loop is still seen.
            if !device.is_connected().await.unwrap_or(false) {
                return;
            }
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(false)) = event {
                    break;
                }
            }
        })
    }

    fn discover(&mut self) -> BoxFuture<'_, Result<Vec<ServiceInfo>, TransportError>> {
        Box::pin(async move {
            self.characteristics.clear();
            let mut services = Vec::new();

            for service in self.device.services().await? {
                let mut characteristics = Vec::new();
                for characteristic in service.characteristics().await? {
                    characteristics.push(CharacteristicInfo {
                        handle: self.characteristics.len(),
                        uuid: characteristic.uuid().await?,
                        readable: characteristic.flags().await?.read,
                    });
                    self.characteristics.push(characteristic);
                }
                services.push(ServiceInfo {
                    uuid: service.uuid().await?,
                    characteristics,
                });
            }

            Ok(services)
        })
    }

    fn read(&mut self, handle: usize) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
        Box::pin(async move {
            let characteristic = self
                .characteristics
                .get(handle)
                .ok_or(TransportError::UnknownCharacteristic(handle))?;
            Ok(characteristic.read().await?)
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move { Ok(self.device.disconnect().await?) })
    }
}
