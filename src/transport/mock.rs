//! Simulated transport.
//!
//! [`MockTransport`] serves a fixed set of [`MockDevice`]s. It backs the
//! `mock` backend (dry runs without a Bluetooth adapter) and the unit tests,
//! which use its builder methods to inject connect, discovery and read
//! failures.

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisement, AdvertisementResult, CharacteristicInfo,
    ServiceInfo, Session, Transport, TransportError,
};
use crate::device_id::DeviceId;
use crate::mac_address::MacAddress;
use crate::measurement::{
    BATTERY_SERVICE, ENVIRONMENTAL_SENSING_SERVICE, MeasurementKind, bluetooth_uuid,
};
use crate::registry::Registry;
use futures::future::BoxFuture;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

#[derive(Debug, Clone)]
struct MockCharacteristic {
    service: Uuid,
    uuid: Uuid,
    readable: bool,
    value: Result<Vec<u8>, TransportError>,
    hangs: bool,
}

/// How a simulated step (connect, discovery) ends.
#[derive(Debug, Clone, Default)]
enum Step {
    #[default]
    Succeed,
    Fail(TransportError),
    Hang,
}

impl Step {
    async fn run(&self) -> Result<(), TransportError> {
        match self {
            Step::Succeed => Ok(()),
            Step::Fail(e) => Err(e.clone()),
            Step::Hang => std::future::pending().await,
        }
    }
}

/// A simulated sensor.
#[derive(Debug, Clone)]
pub struct MockDevice {
    advertisement: Advertisement,
    characteristics: Vec<MockCharacteristic>,
    connect: Step,
    discovery: Step,
}

impl MockDevice {
    pub fn new(address: MacAddress, local_name: Option<&str>) -> Self {
        Self {
            advertisement: Advertisement {
                address,
                local_name: local_name.map(str::to_string),
            },
            characteristics: Vec::new(),
            connect: Step::Succeed,
            discovery: Step::Succeed,
        }
    }

    pub fn advertisement(&self) -> &Advertisement {
        &self.advertisement
    }

    fn with_value(mut self, service: Uuid, kind: MeasurementKind, raw: Vec<u8>) -> Self {
        self.characteristics.push(MockCharacteristic {
            service,
            uuid: kind.uuid(),
            readable: true,
            value: Ok(raw),
            hangs: false,
        });
        self
    }

    /// Expose a temperature characteristic holding `raw` tenths of a degree.
    pub fn with_temperature(self, raw: u16) -> Self {
        self.with_value(
            ENVIRONMENTAL_SENSING_SERVICE,
            MeasurementKind::Temperature,
            raw.to_le_bytes().to_vec(),
        )
    }

    /// Expose a humidity characteristic holding `raw` hundredths of a percent.
    pub fn with_humidity(self, raw: u16) -> Self {
        self.with_value(
            ENVIRONMENTAL_SENSING_SERVICE,
            MeasurementKind::Humidity,
            raw.to_le_bytes().to_vec(),
        )
    }

    pub fn with_battery(self, percent: u8) -> Self {
        self.with_value(BATTERY_SERVICE, MeasurementKind::Battery, vec![percent])
    }

    /// Expose an arbitrary characteristic value.
    pub fn with_raw(mut self, service: Uuid, uuid: Uuid, readable: bool, raw: Vec<u8>) -> Self {
        self.characteristics.push(MockCharacteristic {
            service,
            uuid,
            readable,
            value: Ok(raw),
            hangs: false,
        });
        self
    }

    /// Make reads of `kind` fail.
    pub fn failing_read(mut self, kind: MeasurementKind) -> Self {
        for characteristic in &mut self.characteristics {
            if characteristic.uuid == kind.uuid() {
                characteristic.value = Err(TransportError::Bluetooth("read failed".into()));
            }
        }
        self
    }

    /// Never answer reads of `kind`.
    pub fn hanging_read(mut self, kind: MeasurementKind) -> Self {
        for characteristic in &mut self.characteristics {
            if characteristic.uuid == kind.uuid() {
                characteristic.hangs = true;
            }
        }
        self
    }

    pub fn failing_connect(mut self, message: &str) -> Self {
        self.connect = Step::Fail(TransportError::Bluetooth(message.into()));
        self
    }

    /// Never complete the connection attempt.
    pub fn hanging_connect(mut self) -> Self {
        self.connect = Step::Hang;
        self
    }

    pub fn failing_discovery(mut self, message: &str) -> Self {
        self.discovery = Step::Fail(TransportError::Bluetooth(message.into()));
        self
    }

    /// Connect, then never finish service discovery.
    pub fn hanging_discovery(mut self) -> Self {
        self.discovery = Step::Hang;
        self
    }

    fn services(&self) -> Vec<ServiceInfo> {
        let mut services: Vec<ServiceInfo> = Vec::new();
        for (handle, characteristic) in self.characteristics.iter().enumerate() {
            let info = CharacteristicInfo {
                handle,
                uuid: characteristic.uuid,
                readable: characteristic.readable,
            };
            match services.iter_mut().find(|s| s.uuid == characteristic.service) {
                Some(service) => service.characteristics.push(info),
                None => services.push(ServiceInfo {
                    uuid: characteristic.service,
                    characteristics: vec![info],
                }),
            }
        }
        // Generic Access is always present on real devices
        services.insert(
            0,
            ServiceInfo {
                uuid: bluetooth_uuid(0x1800),
                characteristics: Vec::new(),
            },
        );
        services
    }
}

/// What the transport was asked to do, for assertions in tests.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MockActivity {
    pub scans: usize,
    pub connects: Vec<DeviceId>,
    pub reads: usize,
    pub disconnects: usize,
}

#[derive(Debug, Clone, Default)]
enum ScanEnd {
    /// Keep the stream open until the receiver is dropped
    #[default]
    Open,
    Close,
    Fail(TransportError),
}

/// Transport serving simulated devices.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    devices: Vec<MockDevice>,
    scan_end: ScanEnd,
    activity: Arc<Mutex<MockActivity>>,
}

impl MockTransport {
    pub fn new(devices: Vec<MockDevice>) -> Self {
        Self {
            devices,
            ..Default::default()
        }
    }

    /// Simulate one healthy sensor for every registry entry.
    ///
    /// Devices configured by ATC name get an address derived from their
    /// position in the registry.
    pub fn from_registry(registry: &Registry) -> Self {
        let devices = registry
            .iter()
            .enumerate()
            .map(|(i, (id, _))| {
                let (address, name) = match id.address() {
                    Some(address) => (address, None),
                    None => {
                        let [.., high, mid, low] = i.to_be_bytes();
                        (
                            MacAddress([0xA4, 0xC1, 0x38, high, mid, low]),
                            Some(id.as_str().to_uppercase()),
                        )
                    }
                };
                // Readings cycle through a small plausible range.
                let step = (i % 20) as u16;
                MockDevice::new(address, name.as_deref())
                    .with_temperature(200 + step * 5)
                    .with_humidity(4500 + step * 100)
                    .with_battery(100 - step as u8)
            })
            .collect();
        Self::new(devices)
    }

    /// End the advertisement stream after the last device instead of keeping it open.
    pub fn closing_scan(mut self) -> Self {
        self.scan_end = ScanEnd::Close;
        self
    }

    /// Report `message` as a scan failure after the last advertisement.
    pub fn failing_scan(mut self, message: &str) -> Self {
        self.scan_end = ScanEnd::Fail(TransportError::Bluetooth(message.into()));
        self
    }

    pub fn activity(&self) -> MockActivity {
        self.activity
            .lock()
            .map(|activity| activity.clone())
            .unwrap_or_default()
    }

    fn note(&self, f: impl FnOnce(&mut MockActivity)) {
        if let Ok(mut activity) = self.activity.lock() {
            f(&mut activity);
        }
    }
}

impl Transport for MockTransport {
    fn scan(&self) -> BoxFuture<'_, Result<mpsc::Receiver<AdvertisementResult>, TransportError>> {
        self.note(|a| a.scans += 1);
        let advertisements: Vec<Advertisement> = self
            .devices
            .iter()
            .map(|d| d.advertisement.clone())
            .collect();
        let scan_end = self.scan_end.clone();

        Box::pin(async move {
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);
            tokio::spawn(async move {
                for advertisement in advertisements {
                    if tx.send(Ok(advertisement)).await.is_err() {
                        return;
                    }
                }
                match scan_end {
                    ScanEnd::Open => tx.closed().await,
                    ScanEnd::Close => {}
                    ScanEnd::Fail(e) => {
                        let _ = tx.send(Err(e)).await;
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
        self.note(|a| a.connects.push(target.clone()));
        Box::pin(async move {
            let device = self
                .devices
                .iter()
                .find(|d| target.matches(&d.advertisement))
                .ok_or_else(|| TransportError::Bluetooth(format!("{target} not found")))?;

            device.connect.run().await?;

            let (connected, _) = watch::channel(true);
            let session: Box<dyn Session> = Box::new(MockSession {
                device: device.clone(),
                connected,
                activity: Arc::clone(&self.activity),
            });
            Ok(session)
        })
    }
}

struct MockSession {
    device: MockDevice,
    connected: watch::Sender<bool>,
    activity: Arc<Mutex<MockActivity>>,
}

impl MockSession {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if *self.connected.borrow() {
            Ok(())
        } else {
            Err(TransportError::Disconnected)
        }
    }
}

impl Session for MockSession {
    fn address(&self) -> MacAddress {
        self.device.advertisement.address
    }

    fn disconnected(&self) -> BoxFuture<'static, ()> {
        let mut rx = self.connected.subscribe();
        Box::pin(async move {
            // A dropped sender means the session is gone, which counts as down.
            let _ = rx.wait_for(|connected| !*connected).await;
        })
    }

    fn discover(&mut self) -> BoxFuture<'_, Result<Vec<ServiceInfo>, TransportError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            self.device.discovery.run().await?;
            Ok(self.device.services())
        })
    }

    fn read(&mut self, handle: usize) -> BoxFuture<'_, Result<Vec<u8>, TransportError>> {
        Box::pin(async move {
            self.ensure_connected()?;
            if let Ok(mut activity) = self.activity.lock() {
                activity.reads += 1;
            }
            let characteristic = self
                .device
                .characteristics
                .get(handle)
                .ok_or(TransportError::UnknownCharacteristic(handle))?;
            if characteristic.hangs {
                std::future::pending::<()>().await;
            }
            characteristic.value.clone()
        })
    }

    fn disconnect(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(async move {
            if let Ok(mut activity) = self.activity.lock() {
                activity.disconnects += 1;
            }
            self.connected.send_replace(false);
            Ok(())
        })
    }
}
