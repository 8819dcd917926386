//! Bluetooth LE access.
//!
//! The link layer talks to the radio through two small traits so the
//! platform stack can be swapped out:
//!
//! ```text
//! BleAdapter ──request_device──► BlePeripheral ──subscribe──► notification stream
//!                                     └──────────write──────► command channel
//! ```
//!
//! - [`simulated`] - in-process mower used by tests and `--simulate`
//! - `platform` - platform Bluetooth through btleplug (feature `btleplug`)
//! - [`manager`] - connection lifecycle, command writes, notification pump

pub mod manager;
pub mod simulated;

#[cfg(feature = "btleplug")]
pub mod platform;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use mowerlink_core::protocol::CharacteristicProperties;
use mowerlink_core::DeviceFilter;

pub use manager::BleConnectionManager;
pub use simulated::{SimulatedAdapter, SimulatedConfig, SimulatedMower};

/// Bluetooth SIG base UUID, with the 16-bit slot zeroed
const BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit assigned number into a full 128-bit UUID.
pub fn uuid_from_u16(short: u16) -> Uuid {
    Uuid::from_u128(BASE_UUID | ((short as u128) << 96))
}

/// Errors reported by a BLE backend.
///
/// The manager maps these onto [`crate::LinkError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BleError {
    #[error("Bluetooth unavailable")]
    Unavailable,
    #[error("No matching device")]
    NoDevice,
    #[error("Selection cancelled")]
    Cancelled,
    #[error("GATT error: {0}")]
    Gatt(String),
    #[error("Service {0} not found")]
    ServiceNotFound(Uuid),
    #[error("Write rejected: {0}")]
    Write(String),
    #[error("Device disconnected")]
    Disconnected,
}

/// A characteristic as reported by service discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CharacteristicInfo {
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
}

/// Entry point of a BLE stack.
#[async_trait]
pub trait BleAdapter: Send + Sync {
    /// Does this system have a usable Bluetooth radio?
    async fn is_available(&self) -> bool;

    /// Pick a device whose advertised name passes `filter`.
    ///
    /// Fails with [`BleError::NoDevice`] when nothing matches within
    /// `timeout`, or [`BleError::Cancelled`] when selection was aborted.
    async fn request_device(
        &self,
        filter: &DeviceFilter,
        services: &[Uuid],
        timeout: Duration,
    ) -> Result<Arc<dyn BlePeripheral>, BleError>;
}

/// A selected device.
#[async_trait]
pub trait BlePeripheral: Send + Sync {
    fn name(&self) -> Option<String>;

    async fn connect(&self) -> Result<(), BleError>;

    async fn disconnect(&self) -> Result<(), BleError>;

    /// Discover the characteristics of `service`.
    async fn characteristics(&self, service: Uuid) -> Result<Vec<CharacteristicInfo>, BleError>;

    /// Enable notifications and return the value stream.
    ///
    /// The stream ends when the device disconnects.
    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>, BleError>;

    /// Write without response.
    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), BleError>;
}
