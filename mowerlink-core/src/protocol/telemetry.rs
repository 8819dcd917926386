//! Status stream decoding (characteristic 0xFF01).
//!
//! Every notification carries an 8-byte little-endian frame:
//!
//! ```text
//! [battery:u8][status:u8][temp:i16 /100][pos_x:i16][pos_y:i16]
//! ```
//!
//! The mower gives no sequencing or retransmission, so consumers must
//! tolerate gaps.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ParseError;

/// Length of a telemetry frame in bytes
pub const TELEMETRY_FRAME_LEN: usize = 8;

/// Operating status reported by the mower.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MowerStatus {
    Idle,
    Mowing,
    Returning,
    Charging,
    Error,
    Paused,
    /// Any code outside the known enum
    Unknown(u8),
}

impl From<u8> for MowerStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => MowerStatus::Idle,
            1 => MowerStatus::Mowing,
            2 => MowerStatus::Returning,
            3 => MowerStatus::Charging,
            4 => MowerStatus::Error,
            5 => MowerStatus::Paused,
            other => MowerStatus::Unknown(other),
        }
    }
}

impl MowerStatus {
    /// Raw status code as it appears on the wire.
    pub fn code(&self) -> u8 {
        match self {
            MowerStatus::Idle => 0,
            MowerStatus::Mowing => 1,
            MowerStatus::Returning => 2,
            MowerStatus::Charging => 3,
            MowerStatus::Error => 4,
            MowerStatus::Paused => 5,
            MowerStatus::Unknown(code) => *code,
        }
    }
}

impl fmt::Display for MowerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MowerStatus::Idle => write!(f, "Idle"),
            MowerStatus::Mowing => write!(f, "Mowing"),
            MowerStatus::Returning => write!(f, "Returning"),
            MowerStatus::Charging => write!(f, "Charging"),
            MowerStatus::Error => write!(f, "Error"),
            MowerStatus::Paused => write!(f, "Paused"),
            MowerStatus::Unknown(code) => write!(f, "Unknown ({})", code),
        }
    }
}

/// Position in the mower's own frame (units as reported, not yet known).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    pub x: i16,
    pub y: i16,
}

/// One decoded status frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Telemetry {
    /// Battery level in percent
    pub battery: u8,
    pub status: MowerStatus,
    /// Temperature in degrees Celsius
    pub temperature: f64,
    pub position: Position,
    /// Receive time in milliseconds
    pub timestamp: u64,
}

impl Telemetry {
    /// Decode a notification buffer.
    ///
    /// Bytes beyond the first eight are ignored. Shorter buffers return
    /// [`ParseError::TooShort`]; callers drop those frames.
    pub fn decode(data: &[u8], timestamp: u64) -> Result<Telemetry, ParseError> {
        if data.len() < TELEMETRY_FRAME_LEN {
            return Err(ParseError::TooShort {
                expected: TELEMETRY_FRAME_LEN,
                actual: data.len(),
            });
        }

        Ok(Telemetry {
            battery: data[0],
            status: MowerStatus::from(data[1]),
            temperature: i16::from_le_bytes([data[2], data[3]]) as f64 / 100.0,
            position: Position {
                x: i16::from_le_bytes([data[4], data[5]]),
                y: i16::from_le_bytes([data[6], data[7]]),
            },
            timestamp,
        })
    }

    /// Encode back into a frame. Temperature is rounded to 0.01 °C.
    pub fn encode(&self) -> [u8; TELEMETRY_FRAME_LEN] {
        let temp = (self.temperature * 100.0).round() as i16;
        let mut frame = [0u8; TELEMETRY_FRAME_LEN];
        frame[0] = self.battery;
        frame[1] = self.status.code();
        frame[2..4].copy_from_slice(&temp.to_le_bytes());
        frame[4..6].copy_from_slice(&self.position.x.to_le_bytes());
        frame[6..8].copy_from_slice(&self.position.y.to_le_bytes());
        frame
    }
}
