//! Connection lifecycle and command channel for one mower.
//!
//! One [`BleConnectionManager`] owns at most one GATT link. It drives the
//! [`ConnectionTracker`] state machine, serializes writes through a single
//! FIFO lock, and runs a notification pump that feeds every received
//! buffer to the [`ProtocolAnalyzer`] before fanning decoded values out on
//! broadcast channels.
//!
//! There is no reconnection logic. Any failure returns the link to
//! `Disconnected` and the caller decides whether to try again.

use futures::stream::{BoxStream, StreamExt};
use log::{debug, error, info, trace, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use mowerlink_core::analyzer::{Direction, Packet, ProtocolAnalyzer, SensorObservation};
use mowerlink_core::protocol::{
    short_uuid_label, JoystickInput, MowerCommand, Telemetry, MOWER_SERVICE,
    NOTIFY_CHARACTERISTIC, OPTIONAL_SERVICES, WRITE_CHARACTERISTIC,
};
use mowerlink_core::{hex_encode, ConnectionState, ConnectionStatus, ConnectionTracker, DeviceInfo};

use super::{uuid_from_u16, BleAdapter, BleError, BlePeripheral};
use crate::config::DeviceConfig;
use crate::error::LinkError;
use crate::{read_lock, write_lock};

const BROADCAST_CAPACITY: usize = 256;

struct ActiveLink {
    peripheral: Arc<dyn BlePeripheral>,
    write_characteristic: Uuid,
    /// Distinguishes this link from earlier ones, so a late pump exit
    /// cannot tear down a newer connection
    generation: u64,
    pump: CancellationToken,
}

pub struct BleConnectionManager {
    adapter: Arc<dyn BleAdapter>,
    config: DeviceConfig,
    link: Mutex<Option<ActiveLink>>,
    tracker: RwLock<ConnectionTracker>,
    /// Held for the duration of each GATT write; tokio's mutex is FIFO
    write_gate: Mutex<()>,
    analyzer: Arc<RwLock<ProtocolAnalyzer>>,
    telemetry_tx: broadcast::Sender<Telemetry>,
    observation_tx: broadcast::Sender<SensorObservation>,
    packet_tx: broadcast::Sender<Packet>,
    latest: RwLock<Option<Telemetry>>,
    device_name: RwLock<Option<String>>,
    generation: AtomicU64,
    start_time: Instant,
}

impl BleConnectionManager {
    pub fn new(
        adapter: Arc<dyn BleAdapter>,
        config: DeviceConfig,
        analyzer: Arc<RwLock<ProtocolAnalyzer>>,
    ) -> Arc<Self> {
        let (telemetry_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (observation_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let (packet_tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        Arc::new(BleConnectionManager {
            adapter,
            config,
            link: Mutex::new(None),
            tracker: RwLock::new(ConnectionTracker::new()),
            write_gate: Mutex::new(()),
            analyzer,
            telemetry_tx,
            observation_tx,
            packet_tx,
            latest: RwLock::new(None),
            device_name: RwLock::new(None),
            generation: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    /// Milliseconds since the manager was created.
    pub fn now_ms(&self) -> u64 {
        self.start_time.elapsed().as_millis() as u64
    }

    // =========================================================================
    // Connection
    // =========================================================================

    /// Select, connect and subscribe to the mower.
    ///
    /// On success the link is `Ready` and the notification pump is running.
    /// On failure the link is back in `Disconnected` with the error recorded.
    pub async fn connect(self: &Arc<Self>) -> Result<(), LinkError> {
        if read_lock(&self.tracker).state() != ConnectionState::Disconnected {
            return Err(LinkError::AlreadyConnected);
        }

        if !self.adapter.is_available().await {
            return Err(self.fail(LinkError::CapabilityUnavailable));
        }

        if !write_lock(&self.tracker).start_scanning(self.now_ms()) {
            return Err(LinkError::AlreadyConnected);
        }
        info!(
            "Scanning for '{}' or '{}*'",
            self.config.filter.name, self.config.filter.name_prefix
        );

        let services: Vec<Uuid> = OPTIONAL_SERVICES.iter().map(|s| uuid_from_u16(*s)).collect();
        let peripheral = match self
            .adapter
            .request_device(&self.config.filter, &services, self.config.scan_timeout())
            .await
        {
            Ok(p) => p,
            Err(e) => return Err(self.fail(selection_error(e))),
        };

        let name = peripheral.name();
        info!("Selected {}", name.as_deref().unwrap_or("<unnamed>"));
        *write_lock(&self.device_name) = name;
        write_lock(&self.tracker).device_selected(self.now_ms());

        if let Err(e) = peripheral.connect().await {
            return Err(self.fail(LinkError::ConnectionFailed(e.to_string())));
        }
        write_lock(&self.tracker).gatt_connected(self.now_ms());

        let (notify, write, values) = match self.open_channels(&peripheral).await {
            Ok(channels) => channels,
            Err(e) => {
                if let Err(de) = peripheral.disconnect().await {
                    debug!("Disconnect after failed discovery: {}", de);
                }
                return Err(self.fail(e));
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let pump = CancellationToken::new();
        *self.link.lock().await = Some(ActiveLink {
            peripheral,
            write_characteristic: write,
            generation,
            pump: pump.clone(),
        });
        write_lock(&self.tracker).ready(self.now_ms());
        info!(
            "Connected, notifications on {} and commands on {}",
            notify, write
        );

        tokio::spawn(self.clone().run_pump(values, generation, pump));
        Ok(())
    }

    /// Find the mower service and both characteristics, then subscribe.
    async fn open_channels(
        &self,
        peripheral: &Arc<dyn BlePeripheral>,
    ) -> Result<(Uuid, Uuid, BoxStream<'static, Vec<u8>>), LinkError> {
        let service = uuid_from_u16(MOWER_SERVICE);
        let characteristics = peripheral
            .characteristics(service)
            .await
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;

        let notify_uuid = uuid_from_u16(NOTIFY_CHARACTERISTIC);
        let write_uuid = uuid_from_u16(WRITE_CHARACTERISTIC);

        let notify = characteristics
            .iter()
            .find(|c| c.uuid == notify_uuid && c.properties.can_notify())
            .ok_or_else(|| {
                LinkError::ConnectionFailed(format!(
                    "notify characteristic {} missing",
                    short_uuid_label(NOTIFY_CHARACTERISTIC)
                ))
            })?;
        let write = characteristics
            .iter()
            .find(|c| c.uuid == write_uuid && c.properties.can_write())
            .ok_or_else(|| {
                LinkError::ConnectionFailed(format!(
                    "write characteristic {} missing",
                    short_uuid_label(WRITE_CHARACTERISTIC)
                ))
            })?;

        let values = peripheral
            .subscribe(notify.uuid)
            .await
            .map_err(|e| LinkError::ConnectionFailed(e.to_string()))?;
        Ok((notify.uuid, write.uuid, values))
    }

    fn fail(&self, err: LinkError) -> LinkError {
        error!("Connection failed: {}", err);
        write_lock(&self.tracker).failed(err.to_string(), self.now_ms());
        err
    }

    /// Close the link. Does nothing when already disconnected.
    pub async fn disconnect(&self) -> Result<(), LinkError> {
        let link = self.link.lock().await.take();
        if let Some(link) = link {
            link.pump.cancel();
            if let Err(e) = link.peripheral.disconnect().await {
                warn!("GATT disconnect reported: {}", e);
            }
            info!("Disconnected");
        }
        write_lock(&self.tracker).disconnected(self.now_ms());
        Ok(())
    }

    // =========================================================================
    // Notification pump
    // =========================================================================

    async fn run_pump(
        self: Arc<Self>,
        mut values: BoxStream<'static, Vec<u8>>,
        generation: u64,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    trace!("Notification pump {} stopped", generation);
                    break;
                }
                value = values.next() => match value {
                    Some(data) => self.handle_notification(data),
                    None => {
                        self.link_lost(generation).await;
                        break;
                    }
                }
            }
        }
    }

    fn handle_notification(&self, data: Vec<u8>) {
        let now = self.now_ms();
        write_lock(&self.tracker).data_received(now);

        let telemetry = match Telemetry::decode(&data, now) {
            Ok(t) => Some(t),
            Err(e) => {
                debug!("Not a telemetry frame [{}]: {}", hex_encode(&data), e);
                None
            }
        };

        let mut packet = Packet::new(
            now,
            Direction::Received,
            short_uuid_label(NOTIFY_CHARACTERISTIC),
            data,
        );
        if let Some(t) = telemetry {
            packet = packet.with_parsed(t);
        }
        trace!("RX [{}]", packet.hex);

        let classification = {
            let mut analyzer = write_lock(&self.analyzer);
            analyzer.decay(now);
            analyzer.add_packet(packet.clone())
        };
        for m in &classification.matches {
            debug!("Matched {} ({:.2})", m.name, m.confidence);
        }
        for observation in classification.observations {
            debug!("Observed {}: {:?}", observation.label(), observation);
            let _ = self.observation_tx.send(observation);
        }
        let _ = self.packet_tx.send(packet);

        if let Some(t) = telemetry {
            *write_lock(&self.latest) = Some(t);
            let _ = self.telemetry_tx.send(t);
        }
    }

    async fn link_lost(&self, generation: u64) {
        let mut link = self.link.lock().await;
        if link.as_ref().is_some_and(|l| l.generation == generation) {
            link.take();
            warn!("Mower disconnected");
            write_lock(&self.tracker).disconnected(self.now_ms());
        }
    }

    // =========================================================================
    // Commands
    // =========================================================================

    /// Send a named command. Fire-and-forget at the GATT layer.
    pub async fn send_command(&self, name: &str, payload: Option<&[u8]>) -> Result<(), LinkError> {
        let command =
            MowerCommand::from_name(name).map_err(|_| LinkError::UnknownCommand(name.to_string()))?;
        self.send(command, payload).await
    }

    pub async fn send(&self, command: MowerCommand, payload: Option<&[u8]>) -> Result<(), LinkError> {
        let data = command.encode(payload);
        self.write_frame(command.name(), &data).await
    }

    /// Send a command and wait for the next telemetry frame as its
    /// acknowledgement, retrying up to `retries` more times.
    pub async fn send_command_acked(
        &self,
        command: MowerCommand,
        payload: Option<&[u8]>,
        ack_timeout: Duration,
        retries: u32,
    ) -> Result<Telemetry, LinkError> {
        let attempts = retries + 1;
        for attempt in 1..=attempts {
            let mut rx = self.telemetry_tx.subscribe();
            self.send(command, payload).await?;
            match tokio::time::timeout(ack_timeout, next_telemetry(&mut rx)).await {
                Ok(Some(t)) => return Ok(t),
                Ok(None) => return Err(LinkError::NotConnected),
                Err(_) => warn!(
                    "No acknowledgement for {} (attempt {}/{})",
                    command, attempt, attempts
                ),
            }
        }
        Err(LinkError::AckTimeout { attempts })
    }

    /// Drive with joystick percentages.
    pub async fn send_joystick(&self, x: f64, y: f64, speed: f64) -> Result<(), LinkError> {
        let frame = JoystickInput::new(x, y, speed).encode();
        self.send(MowerCommand::ManualControl, Some(&frame)).await
    }

    /// Write arbitrary bytes through `manual_control`.
    pub async fn send_raw(&self, data: &[u8]) -> Result<(), LinkError> {
        self.send(MowerCommand::ManualControl, Some(data)).await
    }

    async fn write_frame(&self, label: &str, data: &[u8]) -> Result<(), LinkError> {
        let _gate = self.write_gate.lock().await;

        let (peripheral, characteristic) = {
            let link = self.link.lock().await;
            match link.as_ref() {
                Some(l) if read_lock(&self.tracker).can_send() => {
                    (l.peripheral.clone(), l.write_characteristic)
                }
                _ => return Err(LinkError::NotConnected),
            }
        };

        if let Err(e) = peripheral.write(characteristic, data).await {
            warn!("Write of {} failed: {}", label, e);
            return Err(LinkError::WriteFailed(e.to_string()));
        }

        let packet = Packet::new(
            self.now_ms(),
            Direction::Sent,
            short_uuid_label(WRITE_CHARACTERISTIC),
            data.to_vec(),
        );
        debug!("Sent {} [{}]", label, packet.hex);
        write_lock(&self.analyzer).record(packet);
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub fn state(&self) -> ConnectionState {
        read_lock(&self.tracker).state()
    }

    pub fn status(&self) -> ConnectionStatus {
        read_lock(&self.tracker).status()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Known identity of the mower, with the live connection flag.
    pub fn device_info(&self) -> DeviceInfo {
        let mut info = DeviceInfo::default();
        if let Some(name) = read_lock(&self.device_name).clone() {
            info.name = name;
        }
        info.connected = self.is_connected();
        info
    }

    pub fn latest_telemetry(&self) -> Option<Telemetry> {
        *read_lock(&self.latest)
    }

    pub fn analyzer(&self) -> &Arc<RwLock<ProtocolAnalyzer>> {
        &self.analyzer
    }

    /// Packets received since start (not bounded by the history size).
    pub fn received_total(&self) -> u64 {
        read_lock(&self.analyzer).received_total()
    }

    pub fn subscribe_telemetry(&self) -> broadcast::Receiver<Telemetry> {
        self.telemetry_tx.subscribe()
    }

    pub fn subscribe_observations(&self) -> broadcast::Receiver<SensorObservation> {
        self.observation_tx.subscribe()
    }

    pub fn subscribe_packets(&self) -> broadcast::Receiver<Packet> {
        self.packet_tx.subscribe()
    }
}

fn selection_error(e: BleError) -> LinkError {
    match e {
        BleError::Unavailable => LinkError::CapabilityUnavailable,
        BleError::NoDevice => LinkError::DeviceNotFound,
        BleError::Cancelled => LinkError::UserCancelled,
        other => LinkError::ConnectionFailed(other.to_string()),
    }
}

async fn next_telemetry(rx: &mut broadcast::Receiver<Telemetry>) -> Option<Telemetry> {
    loop {
        match rx.recv().await {
            Ok(t) => return Some(t),
            Err(broadcast::error::RecvError::Lagged(n)) => {
                debug!("Telemetry receiver lagged, skipped {}", n);
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
