//! Pattern classification of observed packets.
//!
//! Each packet is compared against a fixed set of command templates. A
//! template matches when all of its bytes equal the packet's bytes at the
//! same offsets; longer packets still match. Several templates can match
//! the same packet and all of them are reported.
//!
//! Confidence is accumulated per template name across the capture: the
//! first sighting creates the pattern at `initial_likelihood`, later
//! sightings add `increment`, capped at 1.0. Nothing ever lowers the score
//! unless [`ProtocolClassifier::decay`] is called with a non-zero
//! `decay_per_minute`.

use serde::{Deserialize, Serialize};

use super::sensor::{decode_observations, SensorObservation};
use super::Packet;

/// A known command shape.
#[derive(Debug, Clone, Copy)]
pub struct PatternTemplate {
    pub name: &'static str,
    pub prefix: &'static [u8],
    pub description: &'static str,
}

/// Command templates observed in vendor app traffic.
pub const COMMAND_TEMPLATES: &[PatternTemplate] = &[
    PatternTemplate {
        name: "Start Command",
        prefix: &[0x01, 0x01],
        description: "Likely start mowing",
    },
    PatternTemplate {
        name: "Stop Command",
        prefix: &[0x01, 0x00],
        description: "Likely stop mowing",
    },
    PatternTemplate {
        name: "Pause Command",
        prefix: &[0x01, 0x02],
        description: "Likely pause mowing",
    },
    PatternTemplate {
        name: "Home Command",
        prefix: &[0x02, 0x01],
        description: "Return to dock",
    },
    PatternTemplate {
        name: "Emergency Stop",
        prefix: &[0xFF, 0x00],
        description: "Emergency stop",
    },
    PatternTemplate {
        name: "Blade Control",
        prefix: &[0x03],
        description: "Blade on/off control",
    },
    PatternTemplate {
        name: "Manual Control",
        prefix: &[0x04],
        description: "Manual movement",
    },
    PatternTemplate {
        name: "Status Request",
        prefix: &[0x10],
        description: "Status query",
    },
    PatternTemplate {
        name: "Battery Request",
        prefix: &[0x11],
        description: "Battery level query",
    },
];

/// Classifier tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClassifierConfig {
    /// Likelihood given to a pattern on first sighting
    pub initial_likelihood: f64,
    /// Likelihood added on every later sighting
    pub increment: f64,
    /// Likelihood removed per minute without a sighting (0 disables decay)
    pub decay_per_minute: f64,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        ClassifierConfig {
            initial_likelihood: 0.8,
            increment: 0.1,
            decay_per_minute: 0.0,
        }
    }
}

/// A named byte-sequence template and the evidence collected for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolPattern {
    pub name: String,
    pub pattern: Vec<u8>,
    /// Reserved for wildcard matching, not consulted yet
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mask: Option<Vec<u8>>,
    pub description: String,
    /// Confidence in [0, 1]
    pub likelihood: f64,
    /// Number of packets that matched
    pub hits: u32,
    /// Timestamp of the most recent match
    pub last_seen: u64,
    #[serde(skip)]
    decayed_to: u64,
}

/// One template hit for a single packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternMatch {
    pub name: String,
    pub confidence: f64,
}

/// Result of classifying one packet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    /// Matching patterns, highest confidence first
    pub matches: Vec<PatternMatch>,
    /// Values recovered from tagged sensor packets
    pub observations: Vec<SensorObservation>,
}

impl Classification {
    pub fn is_empty(&self) -> bool {
        self.matches.is_empty() && self.observations.is_empty()
    }
}

/// Check whether `data` starts with `prefix`.
pub fn matches_prefix(data: &[u8], prefix: &[u8]) -> bool {
    data.len() >= prefix.len() && data[..prefix.len()] == *prefix
}

/// Scores packets against [`COMMAND_TEMPLATES`].
#[derive(Debug, Clone, Default)]
pub struct ProtocolClassifier {
    config: ClassifierConfig,
    patterns: Vec<ProtocolPattern>,
}

impl ProtocolClassifier {
    pub fn new(config: ClassifierConfig) -> Self {
        ProtocolClassifier {
            config,
            patterns: Vec::new(),
        }
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    /// Classify a packet, updating accumulated pattern confidence.
    pub fn classify(&mut self, packet: &Packet) -> Classification {
        let mut matches = Vec::new();

        for template in COMMAND_TEMPLATES {
            if matches_prefix(&packet.data, template.prefix) {
                let confidence = self.record(template, packet.timestamp);
                matches.push(PatternMatch {
                    name: template.name.to_string(),
                    confidence,
                });
            }
        }

        // Stable sort keeps template order between equal scores
        matches.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        Classification {
            matches,
            observations: decode_observations(&packet.data),
        }
    }

    fn record(&mut self, template: &PatternTemplate, timestamp: u64) -> f64 {
        if let Some(existing) = self.patterns.iter_mut().find(|p| p.name == template.name) {
            existing.likelihood = (existing.likelihood + self.config.increment).min(1.0);
            existing.hits = existing.hits.saturating_add(1);
            existing.last_seen = existing.last_seen.max(timestamp);
            existing.decayed_to = existing.decayed_to.max(timestamp);
            return existing.likelihood;
        }

        let likelihood = self.config.initial_likelihood.clamp(0.0, 1.0);
        self.patterns.push(ProtocolPattern {
            name: template.name.to_string(),
            pattern: template.prefix.to_vec(),
            mask: None,
            description: template.description.to_string(),
            likelihood,
            hits: 1,
            last_seen: timestamp,
            decayed_to: timestamp,
        });
        likelihood
    }

    /// Lower the likelihood of patterns that have not been seen recently.
    ///
    /// Decay accrues from the later of the last sighting and the previous
    /// call, so calling this repeatedly does not compound.
    pub fn decay(&mut self, now: u64) {
        let rate = self.config.decay_per_minute;
        if rate <= 0.0 {
            return;
        }
        for pattern in &mut self.patterns {
            let elapsed = now.saturating_sub(pattern.decayed_to);
            if elapsed == 0 {
                continue;
            }
            let loss = rate * elapsed as f64 / 60_000.0;
            pattern.likelihood = (pattern.likelihood - loss).max(0.0);
            pattern.decayed_to = now;
        }
    }

    /// Patterns sorted by likelihood, highest first.
    pub fn patterns(&self) -> Vec<ProtocolPattern> {
        let mut patterns = self.patterns.clone();
        patterns.sort_by(|a, b| b.likelihood.total_cmp(&a.likelihood));
        patterns
    }

    /// Current likelihood of a named pattern.
    pub fn likelihood(&self, name: &str) -> Option<f64> {
        self.patterns
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.likelihood)
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::Direction;

    fn packet(data: &[u8], timestamp: u64) -> Packet {
        Packet::new(timestamp, Direction::Received, "FF01", data.to_vec())
    }

    #[test]
    fn test_prefix_match() {
        assert!(matches_prefix(&[0x01, 0x01, 0x55], &[0x01, 0x01]));
        assert!(!matches_prefix(&[0x01], &[0x01, 0x01]));
        assert!(!matches_prefix(&[0x01, 0x02], &[0x01, 0x01]));
        assert!(matches_prefix(&[0x03], &[0x03]));
    }

    #[test]
    fn test_first_sighting() {
        let mut classifier = ProtocolClassifier::default();
        let result = classifier.classify(&packet(&[0xFF, 0x00], 0));
        assert_eq!(result.matches.len(), 1);
        assert_eq!(result.matches[0].name, "Emergency Stop");
        assert!((result.matches[0].confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_repeat_sighting_increments_and_saturates() {
        let mut classifier = ProtocolClassifier::default();
        let p = packet(&[0x01, 0x00], 0);

        let mut previous = 0.0;
        let expected = [0.8, 0.9, 1.0, 1.0, 1.0];
        for want in expected {
            let result = classifier.classify(&p);
            let got = result.matches[0].confidence;
            assert!((got - want).abs() < 1e-9, "got {} want {}", got, want);
            assert!(got >= previous);
            previous = got;
        }
        assert!(classifier.likelihood("Stop Command").unwrap() <= 1.0);
    }

    #[test]
    fn test_multiple_templates_reported() {
        let mut classifier = ProtocolClassifier::default();
        // Blade Control seen twice first so it outranks Manual Control
        classifier.classify(&packet(&[0x03, 0x01], 0));
        classifier.classify(&packet(&[0x03, 0x00], 1));
        classifier.classify(&packet(&[0x04, 0x00, 0x00], 2));

        let patterns = classifier.patterns();
        assert_eq!(patterns[0].name, "Blade Control");
        assert_eq!(patterns[0].hits, 2);
        assert_eq!(patterns[1].name, "Manual Control");
        assert!(patterns[0].likelihood >= patterns[1].likelihood);
    }

    #[test]
    fn test_no_match_still_decodes_sensors() {
        let mut classifier = ProtocolClassifier::default();
        let result = classifier.classify(&packet(&[0x20, 55, 0, 0], 0));
        assert!(result.matches.is_empty());
        assert_eq!(
            result.observations,
            vec![SensorObservation::Battery { level: 55 }]
        );
        assert!(classifier.patterns().is_empty());
    }

    #[test]
    fn test_decay_disabled_by_default() {
        let mut classifier = ProtocolClassifier::default();
        classifier.classify(&packet(&[0x10], 0));
        classifier.decay(10 * 60_000);
        assert!((classifier.likelihood("Status Request").unwrap() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_decay_does_not_compound() {
        let mut classifier = ProtocolClassifier::new(ClassifierConfig {
            decay_per_minute: 0.1,
            ..Default::default()
        });
        classifier.classify(&packet(&[0x11], 0));
        classifier.decay(60_000);
        classifier.decay(60_000);
        assert!((classifier.likelihood("Battery Request").unwrap() - 0.7).abs() < 1e-9);
        classifier.decay(20 * 60_000);
        assert_eq!(classifier.likelihood("Battery Request"), Some(0.0));

        // a new sighting restarts accumulation from the decayed value
        classifier.classify(&packet(&[0x11], 21 * 60_000));
        assert!((classifier.likelihood("Battery Request").unwrap() - 0.1).abs() < 1e-9);
    }
}
