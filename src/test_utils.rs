use crate::device_id::DeviceId;
use crate::mac_address::MacAddress;
use crate::registry::{Registry, SensorInfo};

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// A registry with one sensor configured by address and one by ATC name.
///
/// - `aa:bb:cc:dd:ee:ff` is `desk`, published to `temperature/room`
/// - `atc_8b1f2a` is `kitchen`, published to `temperature/kitchen`
pub fn test_registry() -> Registry {
    [
        (
            DeviceId::from_address(TEST_MAC),
            SensorInfo::new("desk", "temperature/room"),
        ),
        (
            "ATC_8B1F2A".parse::<DeviceId>().unwrap(),
            SensorInfo::new("kitchen", "temperature/kitchen"),
        ),
    ]
    .into_iter()
    .collect()
}
