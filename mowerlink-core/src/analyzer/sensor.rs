//! Structural decoders for tagged sensor packets.
//!
//! Some packets on the status stream carry a one-byte tag followed by a
//! value at a fixed offset. A tag plus a plausible value is strong enough
//! evidence to surface the value directly, without building a pattern.
//!
//! | Tag  | Min len | Payload                          |
//! |------|---------|----------------------------------|
//! | 0x20 | 4       | battery % at byte 1 (<= 100)     |
//! | 0x21 | 4       | status enum at byte 1            |
//! | 0x30 | 6       | x, y as big-endian u16           |
//! | 0x40 | 8       | temperature, big-endian i16 /100 |
//! | 0x50 | 8       | IMU x, y, z as big-endian i16    |

use serde::{Deserialize, Serialize};

use crate::protocol::MowerStatus;

pub const TAG_BATTERY: u8 = 0x20;
pub const TAG_STATUS: u8 = 0x21;
pub const TAG_POSITION: u8 = 0x30;
pub const TAG_TEMPERATURE: u8 = 0x40;
pub const TAG_IMU: u8 = 0x50;

/// A sensor value recovered from a tagged packet.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SensorObservation {
    Battery { level: u8 },
    Status { status: MowerStatus },
    Position { x: u16, y: u16 },
    Temperature { celsius: f64 },
    Imu { x: i16, y: i16, z: i16 },
}

impl SensorObservation {
    /// Short label used in logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            SensorObservation::Battery { .. } => "battery",
            SensorObservation::Status { .. } => "status",
            SensorObservation::Position { .. } => "position",
            SensorObservation::Temperature { .. } => "temperature",
            SensorObservation::Imu { .. } => "imu",
        }
    }
}

fn be_u16(hi: u8, lo: u8) -> u16 {
    u16::from_be_bytes([hi, lo])
}

fn be_i16(hi: u8, lo: u8) -> i16 {
    i16::from_be_bytes([hi, lo])
}

/// Decode every structural template that matches `data`.
pub fn decode_observations(data: &[u8]) -> Vec<SensorObservation> {
    let mut observations = Vec::new();
    if data.len() < 4 {
        return observations;
    }

    match data[0] {
        TAG_BATTERY if data[1] <= 100 => {
            observations.push(SensorObservation::Battery { level: data[1] });
        }
        TAG_STATUS => {
            observations.push(SensorObservation::Status {
                status: MowerStatus::from(data[1]),
            });
        }
        TAG_POSITION if data.len() >= 6 => {
            observations.push(SensorObservation::Position {
                x: be_u16(data[1], data[2]),
                y: be_u16(data[3], data[4]),
            });
        }
        TAG_TEMPERATURE if data.len() >= 8 => {
            observations.push(SensorObservation::Temperature {
                celsius: be_i16(data[1], data[2]) as f64 / 100.0,
            });
        }
        TAG_IMU if data.len() >= 8 => {
            observations.push(SensorObservation::Imu {
                x: be_i16(data[1], data[2]),
                y: be_i16(data[3], data[4]),
                z: be_i16(data[5], data[6]),
            });
        }
        _ => {}
    }

    observations
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_battery() {
        assert_eq!(
            decode_observations(&[0x20, 77, 0, 0]),
            vec![SensorObservation::Battery { level: 77 }]
        );
        // implausible level
        assert!(decode_observations(&[0x20, 101, 0, 0]).is_empty());
        // too short
        assert!(decode_observations(&[0x20, 77, 0]).is_empty());
    }

    #[test]
    fn test_status() {
        assert_eq!(
            decode_observations(&[0x21, 2, 0, 0]),
            vec![SensorObservation::Status {
                status: MowerStatus::Returning
            }]
        );
    }

    #[test]
    fn test_position_needs_six_bytes() {
        assert!(decode_observations(&[0x30, 0, 1, 0, 2]).is_empty());
        assert_eq!(
            decode_observations(&[0x30, 0x01, 0x00, 0x00, 0x20, 0x00]),
            vec![SensorObservation::Position { x: 256, y: 32 }]
        );
    }

    #[test]
    fn test_temperature_and_imu() {
        let t = decode_observations(&[0x40, 0xF6, 0x3C, 0, 0, 0, 0, 0]);
        assert_eq!(t, vec![SensorObservation::Temperature { celsius: -25.0 }]);

        let imu = decode_observations(&[0x50, 0x00, 0x01, 0xFF, 0xFF, 0x00, 0x10, 0x00]);
        assert_eq!(
            imu,
            vec![SensorObservation::Imu { x: 1, y: -1, z: 16 }]
        );
        assert_eq!(imu[0].label(), "imu");

        // 0x40 with only 4 bytes is not a temperature
        assert!(decode_observations(&[0x40, 0x01, 0x02, 0x03]).is_empty());
    }
}
