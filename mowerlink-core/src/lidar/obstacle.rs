//! Obstacle Detection
//!
//! Groups LIDAR samples into obstacle candidates and keeps a running set of
//! obstacles that are refreshed on re-detection and dropped when stale.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

use super::frame::LidarPoint;

/// Obstacle type, from a size/range heuristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObstacleKind {
    Static,
    Dynamic,
    Unknown,
}

/// Obstacle centroid in centimetres, sensor at the origin
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObstaclePosition {
    pub x: f64,
    pub y: f64,
}

/// Rough footprint in centimetres
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ObstacleSize {
    /// Radial extent (max - min range)
    pub width: f64,
    /// Arc length at the nearest range over the angular span
    pub height: f64,
}

/// A tracked obstacle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Obstacle {
    pub id: String,
    pub kind: ObstacleKind,
    pub position: ObstaclePosition,
    pub size: ObstacleSize,
    /// Cluster-size based confidence in [0, 1]
    pub confidence: f64,
    pub first_seen: u64,
    pub last_seen: u64,
    /// Number of scans that detected this obstacle
    pub hits: u32,
}

/// Clustering and tracking thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClusterSettings {
    /// Maximum bearing difference from the seed point (degrees, exclusive)
    pub angle_threshold_deg: f64,
    /// Maximum range difference from the seed point (cm, exclusive)
    pub distance_threshold_cm: f64,
    /// Clusters smaller than this are discarded
    pub min_cluster_points: usize,
    /// Clusters smaller than this never become obstacles
    pub min_obstacle_points: usize,
    /// Mean range below which an obstacle is classified dynamic (cm)
    pub dynamic_range_cm: f64,
    /// Clusters with more points than this are classified static
    pub static_min_points: usize,
    /// Obstacles unseen for longer than this are dropped (ms)
    pub stale_after_ms: u64,
    /// Re-detections within this radius refresh the existing obstacle (cm)
    pub match_radius_cm: f64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        ClusterSettings {
            angle_threshold_deg: 5.0,
            distance_threshold_cm: 20.0,
            min_cluster_points: 2,
            min_obstacle_points: 4,
            dynamic_range_cm: 50.0,
            static_min_points: 10,
            stale_after_ms: 5000,
            match_radius_cm: 30.0,
        }
    }
}

/// Signed bearing difference `b - a`, normalised to (-180, 180]
fn bearing_offset(a: f64, b: f64) -> f64 {
    let mut diff = (b - a) % 360.0;
    if diff > 180.0 {
        diff -= 360.0;
    } else if diff <= -180.0 {
        diff += 360.0;
    }
    diff
}

/// Greedy seed clustering.
///
/// Each unclustered point seeds a new cluster and absorbs every remaining
/// unclustered point close to the seed (not to the growing cluster).
pub fn cluster_points(points: &[LidarPoint], settings: &ClusterSettings) -> Vec<Vec<LidarPoint>> {
    let mut clusters = Vec::new();
    let mut used = vec![false; points.len()];

    for (i, seed) in points.iter().enumerate() {
        if used[i] {
            continue;
        }
        used[i] = true;
        let mut cluster = vec![*seed];

        for (j, other) in points.iter().enumerate() {
            if used[j] {
                continue;
            }
            let angle_diff = bearing_offset(seed.angle, other.angle).abs();
            let distance_diff = (seed.distance - other.distance).abs();
            if angle_diff < settings.angle_threshold_deg
                && distance_diff < settings.distance_threshold_cm
            {
                cluster.push(*other);
                used[j] = true;
            }
        }

        if cluster.len() >= settings.min_cluster_points {
            clusters.push(cluster);
        }
    }

    clusters
}

/// Obstacle measurements derived from one cluster
#[derive(Debug, Clone, Copy)]
struct Candidate {
    kind: ObstacleKind,
    centroid: Vector2<f64>,
    size: ObstacleSize,
    confidence: f64,
}

/// Running obstacle set
#[derive(Debug, Default)]
pub struct ObstacleClusterer {
    settings: ClusterSettings,
    obstacles: Vec<Obstacle>,
    next_id: u64,
}

impl ObstacleClusterer {
    pub fn new(settings: ClusterSettings) -> Self {
        ObstacleClusterer {
            settings,
            obstacles: Vec::new(),
            next_id: 0,
        }
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Fold one scan into the obstacle set.
    ///
    /// Stale obstacles are dropped first, so a re-detection after the
    /// staleness window starts a new obstacle. Returns the obstacles
    /// created or refreshed by this scan.
    pub fn update(&mut self, points: &[LidarPoint], now: u64) -> Vec<Obstacle> {
        self.sweep(now);
        let mut touched: Vec<usize> = Vec::new();

        for cluster in cluster_points(points, &self.settings) {
            if cluster.len() < self.settings.min_obstacle_points {
                continue;
            }
            let candidate = self.measure(&cluster);

            match self.find_match(&candidate, &touched) {
                Some(index) => {
                    let obstacle = &mut self.obstacles[index];
                    obstacle.kind = candidate.kind;
                    obstacle.position = ObstaclePosition {
                        x: candidate.centroid.x,
                        y: candidate.centroid.y,
                    };
                    obstacle.size = candidate.size;
                    obstacle.confidence = candidate.confidence;
                    obstacle.last_seen = obstacle.last_seen.max(now);
                    obstacle.hits = obstacle.hits.saturating_add(1);
                    touched.push(index);
                }
                None => {
                    self.next_id += 1;
                    self.obstacles.push(Obstacle {
                        id: format!("obs_{}", self.next_id),
                        kind: candidate.kind,
                        position: ObstaclePosition {
                            x: candidate.centroid.x,
                            y: candidate.centroid.y,
                        },
                        size: candidate.size,
                        confidence: candidate.confidence,
                        first_seen: now,
                        last_seen: now,
                        hits: 1,
                    });
                    touched.push(self.obstacles.len() - 1);
                }
            }
        }

        touched.iter().map(|&i| self.obstacles[i].clone()).collect()
    }

    /// Drop obstacles not seen for more than `stale_after_ms`.
    pub fn sweep(&mut self, now: u64) {
        let stale_after = self.settings.stale_after_ms;
        self.obstacles
            .retain(|o| now.saturating_sub(o.last_seen) <= stale_after);
    }

    pub fn obstacles(&self) -> &[Obstacle] {
        &self.obstacles
    }

    pub fn clear(&mut self) {
        self.obstacles.clear();
    }

    fn measure(&self, cluster: &[LidarPoint]) -> Candidate {
        let n = cluster.len() as f64;

        let centroid = cluster
            .iter()
            .map(|p| {
                let (x, y) = p.to_cartesian();
                Vector2::new(x, y)
            })
            .fold(Vector2::zeros(), |acc, v| acc + v)
            / n;

        let mean_distance = cluster.iter().map(|p| p.distance).sum::<f64>() / n;
        let kind = if mean_distance < self.settings.dynamic_range_cm {
            ObstacleKind::Dynamic
        } else if cluster.len() > self.settings.static_min_points {
            ObstacleKind::Static
        } else {
            ObstacleKind::Unknown
        };

        let min_distance = cluster.iter().map(|p| p.distance).fold(f64::INFINITY, f64::min);
        let max_distance = cluster.iter().map(|p| p.distance).fold(f64::NEG_INFINITY, f64::max);

        // Offsets relative to the seed so spans across 0/360 stay small
        let seed = cluster[0].angle;
        let (lo, hi) = cluster.iter().fold((0.0f64, 0.0f64), |(lo, hi), p| {
            let offset = bearing_offset(seed, p.angle);
            (lo.min(offset), hi.max(offset))
        });
        let angle_span = hi - lo;

        Candidate {
            kind,
            centroid,
            size: ObstacleSize {
                width: max_distance - min_distance,
                height: angle_span * PI * min_distance / 180.0,
            },
            confidence: (n / 10.0).min(1.0),
        }
    }

    /// Nearest live obstacle within `match_radius_cm` not already refreshed
    /// by this scan.
    fn find_match(&self, candidate: &Candidate, touched: &[usize]) -> Option<usize> {
        let radius = self.settings.match_radius_cm;
        self.obstacles
            .iter()
            .enumerate()
            .filter(|(i, _)| !touched.contains(i))
            .map(|(i, o)| {
                let position = Vector2::new(o.position.x, o.position.y);
                (i, (position - candidate.centroid).norm())
            })
            .filter(|(_, d)| *d <= radius)
            .min_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(i, _)| i)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(angle: f64, distance: f64) -> LidarPoint {
        LidarPoint {
            angle,
            distance,
            intensity: 100,
            timestamp: 0,
        }
    }

    /// `n` points spread over 2 degrees at roughly `distance`
    fn blob(center: f64, distance: f64, n: usize) -> Vec<LidarPoint> {
        (0..n)
            .map(|i| point(center + i as f64 * 2.0 / n as f64, distance + i as f64))
            .collect()
    }

    #[test]
    fn test_single_point_never_clusters() {
        let clusters = cluster_points(&[point(10.0, 100.0)], &ClusterSettings::default());
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_seed_comparison() {
        // Third point is within 5 deg of the second but not of the seed
        let points = [point(0.0, 100.0), point(4.0, 100.0), point(8.0, 100.0)];
        let clusters = cluster_points(&points, &ClusterSettings::default());
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].len(), 2);
    }

    #[test]
    fn test_wraparound_clusters() {
        let points = [point(358.0, 200.0), point(1.0, 205.0)];
        let clusters = cluster_points(&points, &ClusterSettings::default());
        assert_eq!(clusters.len(), 1);
    }

    #[test]
    fn test_three_points_not_an_obstacle() {
        let mut clusterer = ObstacleClusterer::default();
        assert!(clusterer.update(&blob(45.0, 200.0, 3), 0).is_empty());
        assert_eq!(clusterer.update(&blob(45.0, 200.0, 4), 0).len(), 1);
    }

    #[test]
    fn test_classification() {
        let mut clusterer = ObstacleClusterer::default();
        let mut points = blob(10.0, 30.0, 5);
        points.extend(blob(100.0, 300.0, 12));
        points.extend(blob(200.0, 300.0, 6));

        let detected = clusterer.update(&points, 0);
        assert_eq!(detected.len(), 3);
        assert_eq!(detected[0].kind, ObstacleKind::Dynamic);
        assert_eq!(detected[1].kind, ObstacleKind::Static);
        assert_eq!(detected[2].kind, ObstacleKind::Unknown);
        assert!((detected[0].confidence - 0.5).abs() < 1e-9);
        assert_eq!(detected[1].confidence, 1.0);
    }

    #[test]
    fn test_size_and_centroid() {
        let mut clusterer = ObstacleClusterer::default();
        let points = [
            point(0.0, 100.0),
            point(2.0, 110.0),
            point(4.0, 105.0),
            point(1.0, 102.0),
        ];
        let detected = clusterer.update(&points, 0);
        let o = &detected[0];
        assert!((o.size.width - 10.0).abs() < 1e-9);
        assert!((o.size.height - 4.0 * PI * 100.0 / 180.0).abs() < 1e-9);
        assert!(o.position.x > 100.0 && o.position.x < 110.0);
        assert!(o.position.y > 0.0);
    }

    #[test]
    fn test_deterministic_on_fresh_tracker() {
        let mut points = blob(30.0, 150.0, 8);
        points.extend(blob(270.0, 400.0, 15));

        let a = ObstacleClusterer::default().update(&points, 1000);
        let b = ObstacleClusterer::default().update(&points, 1000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_redetection_refreshes_in_place() {
        let mut clusterer = ObstacleClusterer::default();
        let first = clusterer.update(&blob(60.0, 250.0, 6), 0);
        let second = clusterer.update(&blob(60.5, 252.0, 6), 1000);

        assert_eq!(clusterer.obstacles().len(), 1);
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(second[0].hits, 2);
        assert_eq!(second[0].first_seen, 0);
        assert_eq!(second[0].last_seen, 1000);
    }

    #[test]
    fn test_distant_detection_creates_new() {
        let mut clusterer = ObstacleClusterer::default();
        clusterer.update(&blob(60.0, 250.0, 6), 0);
        clusterer.update(&blob(120.0, 250.0, 6), 100);
        let ids: Vec<&str> = clusterer.obstacles().iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["obs_1", "obs_2"]);
    }

    #[test]
    fn test_staleness_boundary() {
        let mut clusterer = ObstacleClusterer::default();
        clusterer.update(&blob(60.0, 250.0, 6), 10_000);

        clusterer.update(&[], 10_000 + 4999);
        assert_eq!(clusterer.obstacles().len(), 1);

        clusterer.update(&[], 10_000 + 5000);
        assert_eq!(clusterer.obstacles().len(), 1);

        clusterer.update(&[], 10_000 + 5001);
        assert!(clusterer.obstacles().is_empty());
    }

    #[test]
    fn test_stale_obstacle_not_revived() {
        let mut clusterer = ObstacleClusterer::default();
        let first = clusterer.update(&blob(60.0, 250.0, 6), 0);
        let again = clusterer.update(&blob(60.0, 250.0, 6), 10_000);

        assert_eq!(clusterer.obstacles().len(), 1);
        assert_ne!(again[0].id, first[0].id);
        assert_eq!(again[0].hits, 1);
        assert_eq!(again[0].first_seen, 10_000);
    }
}
