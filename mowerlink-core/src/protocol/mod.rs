//! Reverse-engineered GOAT BLE protocol.
//!
//! Nothing here is authoritative; it is what has been observed on the wire
//! between the vendor app and a GOAT-0050.
//!
//! ```text
//! Service 0x8888
//! ├── 0xFF01  notify/indicate   status stream (8-byte telemetry frames)
//! │   └── 0x2902 client characteristic config
//! └── 0xFF02  write/write-no-rsp command channel
//! ```

pub mod command;
pub mod telemetry;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

pub use command::{JoystickInput, MowerCommand};
pub use telemetry::{MowerStatus, Position, Telemetry, TELEMETRY_FRAME_LEN};

// =============================================================================
// GATT Layout
// =============================================================================

/// Generic Access service (0x1800)
pub const GENERIC_ACCESS_SERVICE: u16 = 0x1800;

/// Generic Attribute service (0x1801)
pub const GENERIC_ATTRIBUTE_SERVICE: u16 = 0x1801;

/// Vendor service carrying the mower protocol
pub const MOWER_SERVICE: u16 = 0x8888;

/// Notify/indicate characteristic (status stream)
pub const NOTIFY_CHARACTERISTIC: u16 = 0xFF01;

/// Write characteristic (command channel)
pub const WRITE_CHARACTERISTIC: u16 = 0xFF02;

/// Services requested when selecting the device
pub const OPTIONAL_SERVICES: [u16; 3] = [
    GENERIC_ACCESS_SERVICE,
    GENERIC_ATTRIBUTE_SERVICE,
    MOWER_SERVICE,
];

/// Format a 16-bit UUID the way captures label characteristics ("FF01").
pub fn short_uuid_label(uuid: u16) -> String {
    format!("{:04X}", uuid)
}

bitflags! {
    /// GATT characteristic properties, as reported during discovery.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
    }
}

impl CharacteristicProperties {
    /// Can this characteristic push values to us?
    pub fn can_notify(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// Can we write commands to this characteristic?
    pub fn can_write(&self) -> bool {
        self.intersects(Self::WRITE | Self::WRITE_WITHOUT_RESPONSE)
    }
}

// =============================================================================
// Device Selection
// =============================================================================

/// Exact advertised name of the known mower
pub const DEVICE_NAME: &str = "GOAT-0050";

/// Advertised name prefix shared by the GOAT family
pub const DEVICE_NAME_PREFIX: &str = "GOAT";

/// Name filter applied to advertisements when selecting a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceFilter {
    /// Exact name match
    pub name: String,
    /// Prefix match
    pub name_prefix: String,
}

impl Default for DeviceFilter {
    fn default() -> Self {
        DeviceFilter {
            name: DEVICE_NAME.to_string(),
            name_prefix: DEVICE_NAME_PREFIX.to_string(),
        }
    }
}

impl DeviceFilter {
    /// Check an advertised name against the filter.
    ///
    /// Devices without a name never match.
    pub fn matches(&self, advertised: Option<&str>) -> bool {
        match advertised {
            Some(name) => {
                name == self.name || (!self.name_prefix.is_empty() && name.starts_with(&self.name_prefix))
            }
            None => false,
        }
    }
}

// =============================================================================
// Device Identity
// =============================================================================

/// Identity of the mower this protocol was captured from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub name: String,
    pub serial: String,
    pub wifi_address: String,
    pub bluetooth_address: String,
    pub firmware_version: String,
    /// Live connection flag, filled in by the link layer
    pub connected: bool,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        DeviceInfo {
            name: DEVICE_NAME.to_string(),
            serial: "E03C35162F09HVXP0050".to_string(),
            wifi_address: "64:82:14:1D:37:AE".to_string(),
            bluetooth_address: "64:82:14:1D:37:AF".to_string(),
            firmware_version: "1.2.120".to_string(),
            connected: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_filter() {
        let filter = DeviceFilter::default();
        assert!(filter.matches(Some("GOAT-0050")));
        assert!(filter.matches(Some("GOAT-0123")));
        assert!(!filter.matches(Some("goat-0050")));
        assert!(!filter.matches(Some("Roomba")));
        assert!(!filter.matches(None));
    }

    #[test]
    fn test_characteristic_properties() {
        let notify = CharacteristicProperties::NOTIFY | CharacteristicProperties::READ;
        assert!(notify.can_notify());
        assert!(!notify.can_write());

        let write = CharacteristicProperties::WRITE_WITHOUT_RESPONSE;
        assert!(write.can_write());
        assert!(!write.can_notify());
    }

    #[test]
    fn test_short_uuid_label() {
        assert_eq!(short_uuid_label(NOTIFY_CHARACTERISTIC), "FF01");
        assert_eq!(short_uuid_label(MOWER_SERVICE), "8888");
    }
}
