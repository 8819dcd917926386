//! LIDAR scan frame decoding.
//!
//! A scan buffer is a run of 6-byte records:
//!
//! ```text
//! [angle_hi][angle_lo][distance_hi][distance_lo][intensity][reserved]
//! ```
//!
//! The angle is big-endian hundredths of a degree and the distance is
//! big-endian millimetres. Records outside the valid range are dropped.

use serde::{Deserialize, Serialize};

/// Bytes per scan record
pub const RECORD_LEN: usize = 6;

/// Upper bound (exclusive) of a valid range reading, in centimetres
pub const MAX_RANGE_CM: f64 = 800.0;

/// Angle field scale (hundredths of a degree)
pub const ANGLE_SCALE: f64 = 100.0;

/// Distance field scale (millimetres to centimetres)
pub const DISTANCE_SCALE: f64 = 10.0;

/// A single range sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LidarPoint {
    /// Bearing in degrees, as reported by the sensor
    pub angle: f64,
    /// Range in centimetres, always in (0, 800)
    pub distance: f64,
    pub intensity: u8,
    /// Capture time in milliseconds
    pub timestamp: u64,
}

impl LidarPoint {
    /// Cartesian position in centimetres, sensor at the origin.
    pub fn to_cartesian(&self) -> (f64, f64) {
        let rad = self.angle.to_radians();
        (self.distance * rad.cos(), self.distance * rad.sin())
    }
}

/// Decode every complete record in `buf`.
///
/// A trailing partial record is ignored, as are readings with no return
/// (distance 0) or beyond the sensor range. Neither is an error.
pub fn parse_frame(buf: &[u8], timestamp: u64) -> Vec<LidarPoint> {
    buf.chunks_exact(RECORD_LEN)
        .filter_map(|record| {
            let angle = u16::from_be_bytes([record[0], record[1]]) as f64 / ANGLE_SCALE;
            let distance = u16::from_be_bytes([record[2], record[3]]) as f64 / DISTANCE_SCALE;

            if distance > 0.0 && distance < MAX_RANGE_CM {
                Some(LidarPoint {
                    angle,
                    distance,
                    intensity: record[4],
                    timestamp,
                })
            } else {
                None
            }
        })
        .collect()
}

/// Build a scan buffer from `(angle_deg, distance_cm, intensity)` samples.
///
/// Values are rounded to the wire resolution and saturate at the field
/// limits. Used by the simulator and by tests.
pub fn encode_frame(samples: &[(f64, f64, u8)]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(samples.len() * RECORD_LEN);
    for &(angle, distance, intensity) in samples {
        let angle = (angle * ANGLE_SCALE).round().clamp(0.0, u16::MAX as f64) as u16;
        let distance = (distance * DISTANCE_SCALE)
            .round()
            .clamp(0.0, u16::MAX as f64) as u16;
        buf.extend_from_slice(&angle.to_be_bytes());
        buf.extend_from_slice(&distance.to_be_bytes());
        buf.push(intensity);
        buf.push(0);
    }
    buf
}
