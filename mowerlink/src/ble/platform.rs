//! Platform Bluetooth through `btleplug` (BlueZ, CoreBluetooth, WinRT).

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::stream::{BoxStream, StreamExt};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use mowerlink_core::protocol::CharacteristicProperties;
use mowerlink_core::DeviceFilter;

use super::{BleAdapter, BleError, BlePeripheral, CharacteristicInfo};

const SCAN_POLL: Duration = Duration::from_millis(500);

fn gatt(e: btleplug::Error) -> BleError {
    BleError::Gatt(e.to_string())
}

/// First adapter reported by the platform, if any.
pub struct BtleplugAdapter {
    adapter: Option<Adapter>,
}

impl BtleplugAdapter {
    pub async fn new() -> Self {
        let adapter = match Manager::new().await {
            Ok(manager) => match manager.adapters().await {
                Ok(adapters) => adapters.into_iter().next(),
                Err(e) => {
                    debug!("Listing Bluetooth adapters failed: {}", e);
                    None
                }
            },
            Err(e) => {
                debug!("Bluetooth manager unavailable: {}", e);
                None
            }
        };
        BtleplugAdapter { adapter }
    }
}

#[async_trait]
impl BleAdapter for BtleplugAdapter {
    async fn is_available(&self) -> bool {
        self.adapter.is_some()
    }

    async fn request_device(
        &self,
        filter: &DeviceFilter,
        services: &[Uuid],
        timeout: Duration,
    ) -> Result<Arc<dyn BlePeripheral>, BleError> {
        let adapter = self.adapter.as_ref().ok_or(BleError::Unavailable)?;

        // Service UUIDs are only a hint; the GOAT does not always advertise them
        debug!("Scanning, optional services {:?}", services);
        adapter
            .start_scan(ScanFilter::default())
            .await
            .map_err(gatt)?;

        let deadline = Instant::now() + timeout;
        let found = loop {
            let mut hit = None;
            for peripheral in adapter.peripherals().await.map_err(gatt)? {
                let name = peripheral
                    .properties()
                    .await
                    .map_err(gatt)?
                    .and_then(|p| p.local_name);
                if filter.matches(name.as_deref()) {
                    hit = Some((peripheral, name));
                    break;
                }
            }
            if let Some(hit) = hit {
                break Some(hit);
            }
            if Instant::now() >= deadline {
                break None;
            }
            tokio::time::sleep(SCAN_POLL).await;
        };

        if let Err(e) = adapter.stop_scan().await {
            debug!("Stopping scan: {}", e);
        }

        match found {
            Some((peripheral, name)) => {
                info!("Found {}", name.as_deref().unwrap_or("<unnamed>"));
                Ok(Arc::new(BtleplugPeripheral {
                    adapter: adapter.clone(),
                    peripheral,
                    name,
                }))
            }
            None => Err(BleError::NoDevice),
        }
    }
}

pub struct BtleplugPeripheral {
    adapter: Adapter,
    peripheral: Peripheral,
    name: Option<String>,
}

impl BtleplugPeripheral {
    fn characteristic(&self, uuid: Uuid) -> Result<Characteristic, BleError> {
        self.peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == uuid)
            .ok_or_else(|| BleError::Gatt(format!("characteristic {} not discovered", uuid)))
    }
}

#[async_trait]
impl BlePeripheral for BtleplugPeripheral {
    fn name(&self) -> Option<String> {
        self.name.clone()
    }

    async fn connect(&self) -> Result<(), BleError> {
        self.peripheral.connect().await.map_err(gatt)
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.peripheral.disconnect().await.map_err(gatt)
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<CharacteristicInfo>, BleError> {
        self.peripheral.discover_services().await.map_err(gatt)?;
        let service = self
            .peripheral
            .services()
            .into_iter()
            .find(|s| s.uuid == service)
            .ok_or(BleError::ServiceNotFound(service))?;
        Ok(service
            .characteristics
            .iter()
            .map(|c| CharacteristicInfo {
                uuid: c.uuid,
                properties: CharacteristicProperties::from_bits_truncate(c.properties.bits()),
            })
            .collect())
    }

    /// The stream ends when the adapter reports this peripheral
    /// disconnected; the notification stream alone does not always end.
    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        let target = self.characteristic(characteristic)?;
        let mut events = self.adapter.events().await.map_err(gatt)?;
        self.peripheral.subscribe(&target).await.map_err(gatt)?;
        let notifications = self.peripheral.notifications().await.map_err(gatt)?;

        let id = self.peripheral.id();
        let disconnected = async move {
            while let Some(event) = events.next().await {
                if matches!(event, CentralEvent::DeviceDisconnected(ref gone) if *gone == id) {
                    debug!("Adapter reported {:?} disconnected", id);
                    break;
                }
            }
        };

        Ok(notifications
            .filter_map(move |n| async move { (n.uuid == characteristic).then_some(n.value) })
            .take_until(disconnected)
            .boxed())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), BleError> {
        let target = self.characteristic(characteristic)?;
        self.peripheral
            .write(&target, data, WriteType::WithoutResponse)
            .await
            .map_err(|e| BleError::Write(e.to_string()))
    }
}
