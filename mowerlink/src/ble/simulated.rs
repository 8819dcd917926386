//! In-process GOAT mower.
//!
//! Speaks the same wire protocol as the real device: command writes on
//! FF02 are answered with a telemetry frame on FF01, query probes get their
//! tagged responses, and telemetry can also be pushed periodically.
//! Every GATT call is counted and every write is logged with its time, so
//! tests can assert on exactly what went over the air.
//!
//! | Write        | Response                      |
//! |--------------|-------------------------------|
//! | command      | telemetry frame               |
//! | `10`         | telemetry frame               |
//! | `11`         | `20 <battery> 00 00`          |
//! | `12`         | `30 <x:be16> <y:be16> 00`     |
//! | `20`         | firmware version (ASCII)      |
//! | `00`, `21`   | nothing                       |

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mowerlink_core::protocol::{
    CharacteristicProperties, MowerStatus, Position, Telemetry, MOWER_SERVICE,
    NOTIFY_CHARACTERISTIC, WRITE_CHARACTERISTIC,
};
use mowerlink_core::{DeviceFilter, DeviceInfo};

use super::{uuid_from_u16, BleAdapter, BleError, BlePeripheral, CharacteristicInfo};

/// Behaviour knobs for the simulated mower.
#[derive(Debug, Clone)]
pub struct SimulatedConfig {
    /// Report a usable Bluetooth radio
    pub available: bool,
    /// Advertised name; `None` means nothing is in range
    pub device_name: Option<String>,
    /// Abort device selection as if the user dismissed the chooser
    pub cancel_selection: bool,
    pub fail_connect: bool,
    /// Hide the mower service during discovery
    pub omit_service: bool,
    /// Hide the FF02 write characteristic during discovery
    pub omit_write_characteristic: bool,
    /// Writes succeed this many times, then fail
    pub fail_writes_after: Option<usize>,
    /// Answer writes with notifications
    pub respond: bool,
    /// Delay between a write and its answer
    pub response_delay: Duration,
    /// Push telemetry on this period while subscribed
    pub telemetry_interval: Option<Duration>,
}

impl Default for SimulatedConfig {
    fn default() -> Self {
        SimulatedConfig {
            available: true,
            device_name: Some(mowerlink_core::protocol::DEVICE_NAME.to_string()),
            cancel_selection: false,
            fail_connect: false,
            omit_service: false,
            omit_write_characteristic: false,
            fail_writes_after: None,
            respond: true,
            response_delay: Duration::from_millis(20),
            telemetry_interval: None,
        }
    }
}

/// One logged write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub at: Instant,
    pub characteristic: Uuid,
    pub data: Vec<u8>,
}

struct Subscription {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    cancel: CancellationToken,
}

struct Inner {
    config: Mutex<SimulatedConfig>,
    state: Mutex<Telemetry>,
    writes: Mutex<Vec<WriteRecord>>,
    subscription: Mutex<Option<Subscription>>,
    gatt_calls: AtomicUsize,
    connected: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle on the simulated device. Cheap to clone.
#[derive(Clone)]
pub struct SimulatedMower {
    inner: Arc<Inner>,
}

impl SimulatedMower {
    pub fn new(config: SimulatedConfig) -> Self {
        SimulatedMower {
            inner: Arc::new(Inner {
                config: Mutex::new(config),
                state: Mutex::new(Telemetry {
                    battery: 85,
                    status: MowerStatus::Idle,
                    temperature: 23.5,
                    position: Position { x: 0, y: 0 },
                    timestamp: 0,
                }),
                writes: Mutex::new(Vec::new()),
                subscription: Mutex::new(None),
                gatt_calls: AtomicUsize::new(0),
                connected: AtomicBool::new(false),
            }),
        }
    }

    /// An adapter that finds this mower.
    pub fn adapter(&self) -> Arc<dyn BleAdapter> {
        Arc::new(SimulatedAdapter {
            mower: self.clone(),
        })
    }

    pub fn update_config(&self, f: impl FnOnce(&mut SimulatedConfig)) {
        f(&mut lock(&self.inner.config));
    }

    /// Number of GATT operations performed (selection, connect,
    /// discovery, subscribe, write).
    pub fn gatt_calls(&self) -> usize {
        self.inner.gatt_calls.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> Vec<WriteRecord> {
        lock(&self.inner.writes).clone()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn telemetry(&self) -> Telemetry {
        *lock(&self.inner.state)
    }

    pub fn set_battery(&self, battery: u8) {
        lock(&self.inner.state).battery = battery;
    }

    pub fn set_status(&self, status: MowerStatus) {
        lock(&self.inner.state).status = status;
    }

    /// Push arbitrary bytes on the notify characteristic.
    pub fn inject_notification(&self, data: Vec<u8>) -> bool {
        match lock(&self.inner.subscription).as_ref() {
            Some(sub) => sub.tx.send(data).is_ok(),
            None => false,
        }
    }

    /// Drop the link from the device side. The notification stream ends.
    pub fn simulate_disconnect(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(sub) = lock(&self.inner.subscription).take() {
            sub.cancel.cancel();
        }
    }

    fn count_call(&self) {
        self.inner.gatt_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn config(&self) -> SimulatedConfig {
        lock(&self.inner.config).clone()
    }

    fn telemetry_frame(&self) -> Vec<u8> {
        self.telemetry().encode().to_vec()
    }

    /// Apply a write to the mower state and build the answer, if any.
    fn respond_to(&self, data: &[u8]) -> Option<Vec<u8>> {
        let mut state = lock(&self.inner.state);
        match data {
            [0x01, 0x01, ..] => state.status = MowerStatus::Mowing,
            [0x01, 0x00, ..] => state.status = MowerStatus::Idle,
            [0x01, 0x02, ..] => state.status = MowerStatus::Paused,
            [0x02, 0x01, ..] => state.status = MowerStatus::Returning,
            [0xFF, 0x00, ..] => state.status = MowerStatus::Idle,
            [0x03, _, ..] | [0x04, ..] | [0x10] => {}
            [0x11] => return Some(vec![0x20, state.battery, 0x00, 0x00]),
            [0x12] => {
                let x = (state.position.x as u16).to_be_bytes();
                let y = (state.position.y as u16).to_be_bytes();
                return Some(vec![0x30, x[0], x[1], y[0], y[1], 0x00]);
            }
            [0x20] => return Some(DeviceInfo::default().firmware_version.into_bytes()),
            _ => return None,
        }
        Some(state.encode().to_vec())
    }

    fn spawn_periodic(&self, period: Duration, tx: mpsc::UnboundedSender<Vec<u8>>, cancel: CancellationToken) {
        let mower = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if tx.send(mower.telemetry_frame()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl BlePeripheral for SimulatedMower {
    fn name(&self) -> Option<String> {
        self.config().device_name
    }

    async fn connect(&self) -> Result<(), BleError> {
        self.count_call();
        if self.config().fail_connect {
            return Err(BleError::Gatt("connection refused".to_string()));
        }
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BleError> {
        self.simulate_disconnect();
        Ok(())
    }

    async fn characteristics(&self, service: Uuid) -> Result<Vec<CharacteristicInfo>, BleError> {
        self.count_call();
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        let config = self.config();
        if config.omit_service || service != uuid_from_u16(MOWER_SERVICE) {
            return Err(BleError::ServiceNotFound(service));
        }
        let mut chars = vec![CharacteristicInfo {
            uuid: uuid_from_u16(NOTIFY_CHARACTERISTIC),
            properties: CharacteristicProperties::NOTIFY | CharacteristicProperties::READ,
        }];
        if !config.omit_write_characteristic {
            chars.push(CharacteristicInfo {
                uuid: uuid_from_u16(WRITE_CHARACTERISTIC),
                properties: CharacteristicProperties::WRITE
                    | CharacteristicProperties::WRITE_WITHOUT_RESPONSE,
            });
        }
        Ok(chars)
    }

    async fn subscribe(&self, characteristic: Uuid) -> Result<BoxStream<'static, Vec<u8>>, BleError> {
        self.count_call();
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        if characteristic != uuid_from_u16(NOTIFY_CHARACTERISTIC) {
            return Err(BleError::Gatt(format!("{} does not notify", characteristic)));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        if let Some(period) = self.config().telemetry_interval {
            self.spawn_periodic(period, tx.clone(), cancel.clone());
        }
        if let Some(old) = lock(&self.inner.subscription).replace(Subscription {
            tx,
            cancel: cancel.clone(),
        }) {
            old.cancel.cancel();
        }

        let values = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|value| (value, rx))
        });
        Ok(values.take_until(cancel.cancelled_owned()).boxed())
    }

    async fn write(&self, characteristic: Uuid, data: &[u8]) -> Result<(), BleError> {
        self.count_call();
        if !self.is_connected() {
            return Err(BleError::Disconnected);
        }
        if characteristic != uuid_from_u16(WRITE_CHARACTERISTIC) {
            return Err(BleError::Write(format!("{} is not writable", characteristic)));
        }

        let config = self.config();
        {
            let mut writes = lock(&self.inner.writes);
            if config.fail_writes_after.is_some_and(|n| writes.len() >= n) {
                return Err(BleError::Write("write rejected by device".to_string()));
            }
            writes.push(WriteRecord {
                at: Instant::now(),
                characteristic,
                data: data.to_vec(),
            });
        }

        if !config.respond {
            return Ok(());
        }
        if let Some(answer) = self.respond_to(data) {
            let mower = self.clone();
            tokio::spawn(async move {
                tokio::time::sleep(config.response_delay).await;
                mower.inject_notification(answer);
            });
        }
        Ok(())
    }
}

/// Adapter that always "sees" one simulated mower.
pub struct SimulatedAdapter {
    mower: SimulatedMower,
}

impl SimulatedAdapter {
    pub fn new(mower: SimulatedMower) -> Self {
        SimulatedAdapter { mower }
    }
}

#[async_trait]
impl BleAdapter for SimulatedAdapter {
    async fn is_available(&self) -> bool {
        self.mower.config().available
    }

    async fn request_device(
        &self,
        filter: &DeviceFilter,
        _services: &[Uuid],
        timeout: Duration,
    ) -> Result<Arc<dyn BlePeripheral>, BleError> {
        self.mower.count_call();
        let config = self.mower.config();
        if !config.available {
            return Err(BleError::Unavailable);
        }
        if config.cancel_selection {
            return Err(BleError::Cancelled);
        }
        if filter.matches(config.device_name.as_deref()) {
            Ok(Arc::new(self.mower.clone()))
        } else {
            tokio::time::sleep(timeout).await;
            Err(BleError::NoDevice)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_command_answered_with_telemetry() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        mower.connect().await.unwrap();
        let mut values = mower
            .subscribe(uuid_from_u16(NOTIFY_CHARACTERISTIC))
            .await
            .unwrap();

        mower
            .write(uuid_from_u16(WRITE_CHARACTERISTIC), &[0x01, 0x01])
            .await
            .unwrap();
        let frame = values.next().await.unwrap();
        let telemetry = Telemetry::decode(&frame, 0).unwrap();
        assert_eq!(telemetry.status, MowerStatus::Mowing);
        assert_eq!(telemetry.battery, 85);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_answers() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        mower.connect().await.unwrap();
        let mut values = mower
            .subscribe(uuid_from_u16(NOTIFY_CHARACTERISTIC))
            .await
            .unwrap();
        let write = uuid_from_u16(WRITE_CHARACTERISTIC);

        mower.write(write, &[0x11]).await.unwrap();
        assert_eq!(values.next().await.unwrap(), vec![0x20, 85, 0, 0]);

        mower.write(write, &[0x20]).await.unwrap();
        assert_eq!(values.next().await.unwrap(), b"1.2.120".to_vec());

        mower.write(write, &[0x00]).await.unwrap();
        mower.write(write, &[0x21]).await.unwrap();
        mower.inject_notification(vec![0xAA]);
        assert_eq!(values.next().await.unwrap(), vec![0xAA]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_ends_stream() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        mower.connect().await.unwrap();
        let mut values = mower
            .subscribe(uuid_from_u16(NOTIFY_CHARACTERISTIC))
            .await
            .unwrap();
        mower.simulate_disconnect();
        assert_eq!(values.next().await, None);
        assert!(!mower.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_failure_injection() {
        let mower = SimulatedMower::new(SimulatedConfig {
            fail_writes_after: Some(1),
            ..Default::default()
        });
        mower.connect().await.unwrap();
        let write = uuid_from_u16(WRITE_CHARACTERISTIC);
        assert!(mower.write(write, &[0x01, 0x00]).await.is_ok());
        assert!(matches!(
            mower.write(write, &[0x01, 0x00]).await,
            Err(BleError::Write(_))
        ));
        assert_eq!(mower.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_selection() {
        let mower = SimulatedMower::new(SimulatedConfig {
            device_name: Some("Roomba".to_string()),
            ..Default::default()
        });
        let adapter = mower.adapter();
        let result = adapter
            .request_device(&DeviceFilter::default(), &[], Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(BleError::NoDevice)));
    }
}
