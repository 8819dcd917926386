//! # MowerLink Core
//!
//! Platform-independent protocol analysis and LIDAR processing for the
//! GOAT robotic mower.
//!
//! This crate contains pure decoding, classification and state logic with
//! **no I/O and no async runtime**. The `mowerlink` crate hosts it on tokio
//! and connects it to a BLE adapter.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  mowerlink-core (no tokio, no BLE stack)                     │
//! │  ├── codec/       (hex / ascii rendering)                    │
//! │  ├── protocol/    (GATT layout, commands, telemetry frames)  │
//! │  ├── analyzer/    (packet history, pattern classifier)       │
//! │  ├── lidar/       (scan frames, obstacles, occupancy map)    │
//! │  ├── connection/  (link state machine)                       │
//! │  ├── sequence/    (command sequences, discovery probes)      │
//! │  └── automation/  (rule model and evaluation)                │
//! └──────────────────────────────────────────────────────────────┘
//!                              ▲
//!                 ┌────────────┴────────────┐
//!                 │  mowerlink (tokio host) │
//!                 └─────────────────────────┘
//! ```
//!
//! ## Key Modules
//!
//! - [`protocol`] - Command vocabulary, joystick frames, telemetry decoding
//! - [`analyzer`] - Packet capture history and pattern classification
//! - [`lidar`] - Scan parsing, obstacle clustering, occupancy grid
//! - [`connection`] - Connection state machine
//! - [`sequence`] - Command sequences and discovery probes
//! - [`automation`] - Automation rules
//!
//! ## Example: Classifying Traffic
//!
//! ```rust
//! use mowerlink_core::analyzer::{Direction, Packet, ProtocolAnalyzer};
//!
//! let mut analyzer = ProtocolAnalyzer::default();
//! let result = analyzer.add_packet(Packet::new(0, Direction::Received, "FF01", vec![0x01, 0x00]));
//! assert_eq!(result.matches[0].name, "Stop Command");
//! ```
//!
//! ## Example: Encoding a Drive Command
//!
//! ```rust
//! use mowerlink_core::protocol::JoystickInput;
//!
//! let frame = JoystickInput::new(0.0, 100.0, 100.0).encode();
//! assert_eq!(frame, [0x04, 0x00, 0x7F, 0xFF]);
//! ```

pub mod analyzer;
pub mod automation;
pub mod codec;
pub mod connection;
pub mod error;
pub mod lidar;
pub mod protocol;
pub mod sequence;

// Re-export commonly used types
pub use analyzer::{
    Classification, Direction, Packet, PacketHistory, ProtocolAnalyzer, ProtocolPattern,
    SensorObservation,
};
pub use automation::{AutomationRule, NewRule, RuleAction, RuleCondition, RuleSet, Trigger};
pub use codec::{ascii_encode, hex_decode, hex_encode};
pub use connection::{ConnectionState, ConnectionStatus, ConnectionTracker};
pub use error::ParseError;
pub use lidar::{LidarPoint, LidarProcessor, LidarScan, Obstacle, ObstacleKind};
pub use protocol::{DeviceFilter, DeviceInfo, JoystickInput, MowerCommand, MowerStatus, Telemetry};
pub use sequence::{CommandSequence, SequenceLibrary, SequenceStep};
