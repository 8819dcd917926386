//! LIDAR Processing
//!
//! Scan buffers are decoded into points, kept in a bounded history,
//! accumulated into an occupancy grid and clustered into obstacles.
//!
//! ```text
//! bytes ──► parse_frame ──► LidarScan ──┬──► scan history (100)
//!                                       ├──► OccupancyMap
//!                                       └──► ObstacleClusterer
//! ```

pub mod frame;
pub mod obstacle;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub use frame::{encode_frame, parse_frame, LidarPoint, RECORD_LEN};
pub use obstacle::{
    cluster_points, ClusterSettings, Obstacle, ObstacleClusterer, ObstacleKind, ObstaclePosition,
    ObstacleSize,
};

/// Scans kept in history
pub const MAX_SCANS: usize = 100;

/// One decoded scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LidarScan {
    pub scan_id: String,
    pub timestamp: u64,
    pub points: Vec<LidarPoint>,
}

// =============================================================================
// Occupancy Map
// =============================================================================

/// Hit-count grid centred on the sensor.
///
/// Cells saturate at 255. Points that fall outside the grid are ignored.
#[derive(Debug, Clone)]
pub struct OccupancyMap {
    width: usize,
    height: usize,
    /// Cell edge length in centimetres
    resolution_cm: f64,
    cells: Vec<u8>,
}

impl Default for OccupancyMap {
    fn default() -> Self {
        Self::new(1000, 1000, 5.0)
    }
}

impl OccupancyMap {
    pub fn new(width: usize, height: usize, resolution_cm: f64) -> Self {
        OccupancyMap {
            width,
            height,
            resolution_cm,
            cells: vec![0; width * height],
        }
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn resolution_cm(&self) -> f64 {
        self.resolution_cm
    }

    /// Grid cell for a point, if it lies inside the map.
    pub fn cell_for(&self, point: &LidarPoint) -> Option<(usize, usize)> {
        let (x, y) = point.to_cartesian();
        let cx = (self.width / 2) as f64 + (x / self.resolution_cm).round();
        let cy = (self.height / 2) as f64 + (y / self.resolution_cm).round();

        if cx < 0.0 || cy < 0.0 {
            return None;
        }
        let (cx, cy) = (cx as usize, cy as usize);
        if cx < self.width && cy < self.height {
            Some((cx, cy))
        } else {
            None
        }
    }

    /// Record one return per point.
    pub fn mark(&mut self, points: &[LidarPoint]) {
        for point in points {
            if let Some((x, y)) = self.cell_for(point) {
                let cell = &mut self.cells[y * self.width + x];
                *cell = cell.saturating_add(1);
            }
        }
    }

    pub fn get(&self, x: usize, y: usize) -> Option<u8> {
        if x < self.width && y < self.height {
            Some(self.cells[y * self.width + x])
        } else {
            None
        }
    }

    /// Number of cells with at least one hit.
    pub fn occupied_cells(&self) -> usize {
        self.cells.iter().filter(|&&c| c > 0).count()
    }

    /// Row-major cell data.
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    pub fn clear(&mut self) {
        self.cells.iter_mut().for_each(|c| *c = 0);
    }
}

// =============================================================================
// Processor
// =============================================================================

/// Scan pipeline: parse, record, map, cluster.
#[derive(Debug, Default)]
pub struct LidarProcessor {
    scans: VecDeque<LidarScan>,
    map: OccupancyMap,
    clusterer: ObstacleClusterer,
    next_scan: u64,
}

impl LidarProcessor {
    pub fn new(settings: ClusterSettings) -> Self {
        LidarProcessor {
            scans: VecDeque::with_capacity(MAX_SCANS),
            map: OccupancyMap::default(),
            clusterer: ObstacleClusterer::new(settings),
            next_scan: 0,
        }
    }

    /// Decode a raw scan buffer and fold it into the processor state.
    pub fn process(&mut self, raw: &[u8], now: u64) -> LidarScan {
        self.next_scan += 1;
        let scan = LidarScan {
            scan_id: format!("scan_{}", self.next_scan),
            timestamp: now,
            points: parse_frame(raw, now),
        };

        if self.scans.len() >= MAX_SCANS {
            self.scans.pop_front();
        }
        self.scans.push_back(scan.clone());

        self.map.mark(&scan.points);
        self.clusterer.update(&scan.points, now);

        scan
    }

    pub fn latest_scan(&self) -> Option<&LidarScan> {
        self.scans.back()
    }

    pub fn scans(&self) -> impl Iterator<Item = &LidarScan> {
        self.scans.iter()
    }

    pub fn scan_count(&self) -> usize {
        self.scans.len()
    }

    pub fn obstacles(&self) -> Vec<Obstacle> {
        self.clusterer.obstacles().to_vec()
    }

    pub fn map(&self) -> &OccupancyMap {
        &self.map
    }

    pub fn clear(&mut self) {
        self.scans.clear();
        self.map.clear();
        self.clusterer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wall(distance: f64) -> Vec<u8> {
        let samples: Vec<(f64, f64, u8)> = (0..8)
            .map(|i| (80.0 + i as f64 * 0.5, distance + i as f64, 150))
            .collect();
        encode_frame(&samples)
    }

    #[test]
    fn test_process_builds_scan_and_obstacle() {
        let mut processor = LidarProcessor::default();
        let scan = processor.process(&wall(300.0), 1000);
        assert_eq!(scan.points.len(), 8);
        assert_eq!(scan.scan_id, "scan_1");
        assert_eq!(processor.latest_scan().map(|s| s.timestamp), Some(1000));
        assert_eq!(processor.obstacles().len(), 1);
        assert!(processor.map().occupied_cells() > 0);
    }

    #[test]
    fn test_scan_history_bound() {
        let mut processor = LidarProcessor::default();
        for i in 0..150u64 {
            processor.process(&[], i);
        }
        assert_eq!(processor.scan_count(), MAX_SCANS);
        assert_eq!(processor.scans().next().map(|s| s.timestamp), Some(50));
        assert_eq!(
            processor.latest_scan().map(|s| s.scan_id.as_str()),
            Some("scan_150")
        );
    }

    #[test]
    fn test_empty_scan_is_valid() {
        let mut processor = LidarProcessor::default();
        let scan = processor.process(&encode_frame(&[(10.0, 0.0, 0)]), 0);
        assert!(scan.points.is_empty());
        assert!(processor.obstacles().is_empty());
    }

    #[test]
    fn test_map_cell_and_saturation() {
        let mut map = OccupancyMap::new(100, 100, 5.0);
        let p = LidarPoint {
            angle: 0.0,
            distance: 50.0,
            intensity: 0,
            timestamp: 0,
        };
        assert_eq!(map.cell_for(&p), Some((60, 50)));
        for _ in 0..300 {
            map.mark(&[p]);
        }
        assert_eq!(map.get(60, 50), Some(255));

        let far = LidarPoint {
            distance: 400.0,
            ..p
        };
        assert_eq!(map.cell_for(&far), None);
    }
}
