//! # MowerLink
//!
//! BLE link, command automation and protocol capture for GOAT robotic
//! mowers, hosted on tokio.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         mowerlink                            │
//! │  ┌────────────┐   ┌─────────────────┐   ┌─────────────────┐  │
//! │  │ Cli / main │──►│ Session         │──►│ AutomationEngine│  │
//! │  └────────────┘   │  - config       │   └────────┬────────┘  │
//! │                   │  - analyzer     │            ▼           │
//! │                   │  - lidar        │   ┌─────────────────┐  │
//! │                   └───────┬─────────┘   │ CommandSequencer│  │
//! │                           ▼             └────────┬────────┘  │
//! │  ┌──────────────────────────────────────────────────────────┐│
//! │  │ BleConnectionManager (state machine, FIFO writes, pump)  ││
//! │  └───────────────────────────┬──────────────────────────────┘│
//! │                              ▼                               │
//! │        BleAdapter: SimulatedAdapter | BtleplugAdapter        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Decoding, classification and rule evaluation live in
//! [`mowerlink_core`]; this crate adds the radio, timing and the CLI.
//!
//! ## Example: Driving the Simulated Mower
//!
//! ```rust,no_run
//! use mowerlink::{config::Config, Session};
//! use mowerlink::ble::{SimulatedConfig, SimulatedMower};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), mowerlink::LinkError> {
//!     let mower = SimulatedMower::new(SimulatedConfig::default());
//!     let session = Session::new(Config::default(), mower.adapter());
//!     session.link.connect().await?;
//!     session
//!         .sequencer
//!         .execute_sequence("emergency-stop", &CancellationToken::new())
//!         .await?;
//!     Ok(())
//! }
//! ```

use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_graceful_shutdown::{SubsystemBuilder, SubsystemHandle};
use tokio_util::sync::CancellationToken;

use mowerlink_core::analyzer::ProtocolAnalyzer;
use mowerlink_core::lidar::frame::RECORD_LEN;
use mowerlink_core::lidar::LidarProcessor;
use mowerlink_core::{hex_decode, MowerCommand, NewRule};

pub mod analysis;
pub mod automation;
pub mod ble;
pub mod config;
pub mod error;
pub mod sequencer;

pub use automation::AutomationEngine;
pub use ble::BleConnectionManager;
pub use error::LinkError;
pub use sequencer::CommandSequencer;

use analysis::OfflineAnalyzer;
use ble::{BleAdapter, SimulatedConfig, SimulatedMower};
use config::Config;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// Command line
// =============================================================================

#[derive(Parser, Clone, Debug)]
#[command(name = "mowerlink", version, about)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Talk to the built-in simulated mower instead of Bluetooth
    #[arg(long, global = true, default_value_t = false)]
    pub simulate: bool,

    /// Configuration file (JSON)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Write the packet capture and detected patterns to this file on exit
    #[arg(long, global = true)]
    pub capture: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug, PartialEq)]
pub enum Command {
    /// Connect and print telemetry until interrupted
    Monitor {
        /// Stop after this many seconds
        #[arg(long)]
        duration: Option<u64>,
        /// Evaluate automation rules from this JSON file while monitoring
        #[arg(long)]
        rules: Option<PathBuf>,
    },
    /// Run a command sequence
    Run { sequence: String },
    /// Probe for undocumented commands
    Discover,
    /// Send a single command
    Send {
        command: String,
        /// Payload for manual_control, as hex ("04 00 7f ff")
        #[arg(long)]
        payload: Option<String>,
        /// Wait for the next telemetry frame as acknowledgement
        #[arg(long, default_value_t = false)]
        ack: bool,
        #[arg(long, default_value_t = 1000)]
        ack_timeout_ms: u64,
        #[arg(long, default_value_t = 2)]
        retries: u32,
    },
    /// Send one manual drive frame
    Joystick {
        #[arg(allow_hyphen_values = true)]
        x: f64,
        #[arg(allow_hyphen_values = true)]
        y: f64,
        speed: f64,
    },
    /// List known command sequences
    Sequences,
    /// Process a raw LIDAR capture and print the detected obstacles
    Lidar {
        file: PathBuf,
        /// Split the file into scans of this many bytes
        #[arg(long)]
        chunk: Option<usize>,
    },
    /// Capture traffic for a while, then print an analysis
    Analyze {
        /// Seconds to listen before analysing
        #[arg(long, default_value_t = 10)]
        listen: u64,
        /// Also print generated command helpers
        #[arg(long, default_value_t = false)]
        generate: bool,
    },
}

// =============================================================================
// Session
// =============================================================================

/// Everything one run of the program shares.
pub struct Session {
    pub config: Config,
    pub analyzer: Arc<RwLock<ProtocolAnalyzer>>,
    pub lidar: Arc<RwLock<LidarProcessor>>,
    pub link: Arc<BleConnectionManager>,
    pub sequencer: Arc<CommandSequencer>,
    pub automation: Arc<AutomationEngine>,
}

impl Session {
    pub fn new(config: Config, adapter: Arc<dyn BleAdapter>) -> Self {
        let analyzer = Arc::new(RwLock::new(ProtocolAnalyzer::new(config.classifier.clone())));
        let lidar = Arc::new(RwLock::new(LidarProcessor::new(config.lidar.clone())));
        let link = BleConnectionManager::new(adapter, config.device.clone(), analyzer.clone());
        let sequencer = Arc::new(CommandSequencer::new(link.clone(), config.discovery.clone()));
        let automation = AutomationEngine::new(
            link.clone(),
            sequencer.clone(),
            Duration::from_millis(config.automation.interval_ms),
        );
        Session {
            config,
            analyzer,
            lidar,
            link,
            sequencer,
            automation,
        }
    }

    /// Build a session for the command line: load the config and pick the
    /// Bluetooth backend.
    pub async fn from_cli(cli: &Cli) -> Result<Self, LinkError> {
        let config = Config::load(cli.config.as_deref())?;
        let adapter = if cli.simulate {
            info!("Using simulated mower");
            SimulatedMower::new(SimulatedConfig {
                telemetry_interval: Some(Duration::from_secs(1)),
                ..Default::default()
            })
            .adapter()
        } else {
            platform_adapter().await?
        };
        Ok(Session::new(config, adapter))
    }

    /// Write the analysis export as pretty JSON.
    pub fn export_capture(&self, path: &Path) -> Result<(), LinkError> {
        let export = read_lock(&self.analyzer).export();
        let json = serde_json::to_string_pretty(&export).map_err(|e| LinkError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        info!(
            "Wrote {} packets to {}",
            export.summary.total_packets,
            path.display()
        );
        Ok(())
    }
}

#[cfg(feature = "btleplug")]
async fn platform_adapter() -> Result<Arc<dyn BleAdapter>, LinkError> {
    Ok(Arc::new(ble::platform::BtleplugAdapter::new().await))
}

#[cfg(not(feature = "btleplug"))]
async fn platform_adapter() -> Result<Arc<dyn BleAdapter>, LinkError> {
    warn!("Built without the btleplug feature, only --simulate is available");
    Err(LinkError::CapabilityUnavailable)
}

// =============================================================================
// Running commands
// =============================================================================

/// Top-level subsystem: run the requested command, write the capture,
/// then shut everything down.
pub async fn run(cli: Cli, subsys: SubsystemHandle) -> Result<(), LinkError> {
    let session = Arc::new(Session::from_cli(&cli).await?);
    let result = run_command(&session, &cli.command, &subsys).await;

    if let Some(path) = &cli.capture {
        if let Err(e) = session.export_capture(path) {
            error!("Capture not written: {}", e);
        }
    }
    session.automation.stop();
    if let Err(e) = session.link.disconnect().await {
        warn!("Disconnect: {}", e);
    }
    subsys.request_shutdown();
    result
}

pub async fn run_command(
    session: &Arc<Session>,
    command: &Command,
    subsys: &SubsystemHandle,
) -> Result<(), LinkError> {
    let cancel = subsys.create_cancellation_token();
    match command {
        Command::Sequences => {
            for sequence in session.sequencer.sequences() {
                let steps = sequence
                    .steps
                    .iter()
                    .map(|s| s.command.name())
                    .collect::<Vec<_>>()
                    .join(" → ");
                println!("{:<16} {}: {}", sequence.id, sequence.name, steps);
            }
            Ok(())
        }
        Command::Lidar { file, chunk } => process_lidar(session, file, *chunk),
        Command::Monitor { duration, rules } => {
            session.link.connect().await?;
            if let Some(path) = rules {
                for rule in load_rules(path)? {
                    session.automation.add_rule(rule);
                }
                let engine = session.automation.clone();
                subsys.start(SubsystemBuilder::new("automation", |s| engine.run(s)));
            }
            monitor(session, duration.map(Duration::from_secs), cancel).await;
            Ok(())
        }
        Command::Run { sequence } => {
            session.link.connect().await?;
            let report = session.sequencer.execute_sequence(sequence, &cancel).await?;
            print_json(&report);
            Ok(())
        }
        Command::Discover => {
            session.link.connect().await?;
            let found = session.sequencer.discover_commands(&cancel).await?;
            if found.is_empty() {
                println!("No probe drew a response");
            }
            for name in found {
                println!("{}", name);
            }
            Ok(())
        }
        Command::Send {
            command,
            payload,
            ack,
            ack_timeout_ms,
            retries,
        } => {
            let payload = payload.as_deref().map(hex_decode).transpose()?;
            session.link.connect().await?;
            if *ack {
                let cmd = MowerCommand::from_name(command)
                    .map_err(|_| LinkError::UnknownCommand(command.clone()))?;
                let telemetry = session
                    .link
                    .send_command_acked(
                        cmd,
                        payload.as_deref(),
                        Duration::from_millis(*ack_timeout_ms),
                        *retries,
                    )
                    .await?;
                print_json(&telemetry);
            } else {
                session.link.send_command(command, payload.as_deref()).await?;
            }
            Ok(())
        }
        Command::Joystick { x, y, speed } => {
            session.link.connect().await?;
            session.link.send_joystick(*x, *y, *speed).await
        }
        Command::Analyze { listen, generate } => {
            session.link.connect().await?;
            monitor(session, Some(Duration::from_secs(*listen)), cancel).await;
            let analysis = session
                .sequencer
                .analyze_response_patterns(&OfflineAnalyzer)
                .await;
            print_json(&analysis);
            if *generate {
                println!("{}", read_lock(&session.analyzer).generate_commands());
            }
            Ok(())
        }
    }
}

fn print_json<T: serde::Serialize>(value: &T) {
    match serde_json::to_string_pretty(value) {
        Ok(json) => println!("{}", json),
        Err(e) => error!("Cannot render output: {}", e),
    }
}

fn load_rules(path: &Path) -> Result<Vec<NewRule>, LinkError> {
    let file = std::fs::File::open(path)?;
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|e| LinkError::Config(format!("{}: {}", path.display(), e)))
}

/// Print telemetry and sensor observations until cancelled, the link
/// drops, or `duration` elapses.
async fn monitor(session: &Session, duration: Option<Duration>, cancel: CancellationToken) {
    let mut telemetry = session.link.subscribe_telemetry();
    let mut observations = session.link.subscribe_observations();
    let deadline = async {
        match duration {
            Some(d) => tokio::time::sleep(d).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut deadline => break,
            r = telemetry.recv() => match r {
                Ok(t) => println!(
                    "{:>8} ms  battery {:>3}%  {:<10} {:>6.2} °C  ({}, {})",
                    t.timestamp, t.battery, t.status.to_string(), t.temperature, t.position.x, t.position.y
                ),
                Err(RecvError::Lagged(n)) => warn!("Monitor lagged, skipped {} frames", n),
                Err(RecvError::Closed) => break,
            },
            r = observations.recv() => match r {
                Ok(o) => println!("           {:<11} {:?}", o.label(), o),
                Err(RecvError::Lagged(n)) => warn!("Monitor lagged, skipped {} observations", n),
                Err(RecvError::Closed) => break,
            },
        }
        if !session.link.is_connected() {
            warn!("Link lost");
            break;
        }
    }
}

fn process_lidar(session: &Session, file: &Path, chunk: Option<usize>) -> Result<(), LinkError> {
    let data = std::fs::read(file)?;
    // Whole records only, so no record straddles two scans
    let chunk = (chunk.unwrap_or(data.len()) / RECORD_LEN).max(1) * RECORD_LEN;
    let mut lidar = write_lock(&session.lidar);
    for (index, part) in data.chunks(chunk).enumerate() {
        let scan = lidar.process(part, index as u64 * 100);
        println!("{}: {} points", scan.scan_id, scan.points.len());
    }
    print_json(&lidar.obstacles());
    println!(
        "{} occupied map cells",
        lidar.map().occupied_cells()
    );
    Ok(())
}
