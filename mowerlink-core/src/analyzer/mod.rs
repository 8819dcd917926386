//! Packet capture and protocol analysis.
//!
//! ```text
//! raw bytes ──► Packet (hex/ascii) ──► PacketHistory (ring, 1000)
//!                    │
//!                    └──► ProtocolClassifier ──► patterns + sensor observations
//! ```
//!
//! The analyzer owns no I/O. The link layer feeds it every packet it sends
//! or receives and fans the returned [`Classification`] out to subscribers.

pub mod classifier;
pub mod sensor;

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::codec::{ascii_encode, hex_encode};
use crate::protocol::Telemetry;

pub use classifier::{
    matches_prefix, Classification, ClassifierConfig, PatternMatch, PatternTemplate,
    ProtocolClassifier, ProtocolPattern, COMMAND_TEMPLATES,
};
pub use sensor::{decode_observations, SensorObservation};

/// Packets kept in the capture history
pub const MAX_PACKETS: usize = 1000;

/// Likelihood above which a pattern counts as high-confidence
pub const HIGH_CONFIDENCE: f64 = 0.7;

/// Likelihood above which a pattern gets a generated command
pub const GENERATE_THRESHOLD: f64 = 0.5;

// =============================================================================
// Packet
// =============================================================================

/// Direction of a captured packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Sent,
    Received,
}

/// One observed byte sequence on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Packet {
    /// Capture time in milliseconds
    pub timestamp: u64,
    pub direction: Direction,
    /// Characteristic the bytes travelled on ("FF01")
    pub characteristic: String,
    pub data: Vec<u8>,
    pub hex: String,
    pub ascii: String,
    /// Telemetry decoded from this packet, if it was a status frame
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parsed: Option<Telemetry>,
}

impl Packet {
    pub fn new(
        timestamp: u64,
        direction: Direction,
        characteristic: impl Into<String>,
        data: Vec<u8>,
    ) -> Self {
        Packet {
            timestamp,
            direction,
            characteristic: characteristic.into(),
            hex: hex_encode(&data),
            ascii: ascii_encode(&data),
            data,
            parsed: None,
        }
    }

    /// Attach decoded telemetry.
    pub fn with_parsed(mut self, telemetry: Telemetry) -> Self {
        self.parsed = Some(telemetry);
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

// =============================================================================
// Packet History
// =============================================================================

/// Bounded capture history (ring buffer, oldest evicted first).
///
/// Alongside the buffer it keeps lifetime counters per direction. Those keep
/// growing after the buffer is full, which makes them the right thing to
/// compare when asking "did anything arrive since?".
#[derive(Debug, Clone)]
pub struct PacketHistory {
    packets: VecDeque<Packet>,
    capacity: usize,
    received_total: u64,
    sent_total: u64,
}

impl Default for PacketHistory {
    fn default() -> Self {
        Self::with_capacity(MAX_PACKETS)
    }
}

impl PacketHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        PacketHistory {
            packets: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            received_total: 0,
            sent_total: 0,
        }
    }

    pub fn push(&mut self, packet: Packet) {
        match packet.direction {
            Direction::Received => self.received_total += 1,
            Direction::Sent => self.sent_total += 1,
        }
        while self.packets.len() >= self.capacity {
            self.packets.pop_front();
        }
        self.packets.push_back(packet);
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &Packet> {
        self.packets.iter()
    }

    /// The most recent `n` packets, oldest first.
    pub fn latest(&self, n: usize) -> Vec<Packet> {
        let skip = self.packets.len().saturating_sub(n);
        self.packets.iter().skip(skip).cloned().collect()
    }

    /// Packets received since the history was created (not bounded).
    pub fn received_total(&self) -> u64 {
        self.received_total
    }

    /// Packets sent since the history was created (not bounded).
    pub fn sent_total(&self) -> u64 {
        self.sent_total
    }

    pub fn clear(&mut self) {
        self.packets.clear();
    }
}

// =============================================================================
// Protocol Analyzer
// =============================================================================

/// Summary numbers for an analysis export.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisSummary {
    pub total_packets: usize,
    pub detected_patterns: usize,
    pub high_confidence_patterns: usize,
}

/// Full capture dump, written as JSON by the CLI.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisExport {
    pub packets: Vec<Packet>,
    pub patterns: Vec<ProtocolPattern>,
    pub summary: AnalysisSummary,
}

/// Capture history plus classifier.
#[derive(Debug, Clone, Default)]
pub struct ProtocolAnalyzer {
    history: PacketHistory,
    classifier: ProtocolClassifier,
}

impl ProtocolAnalyzer {
    pub fn new(config: ClassifierConfig) -> Self {
        ProtocolAnalyzer {
            history: PacketHistory::default(),
            classifier: ProtocolClassifier::new(config),
        }
    }

    /// Record a packet and classify it.
    pub fn add_packet(&mut self, packet: Packet) -> Classification {
        let classification = self.classifier.classify(&packet);
        self.history.push(packet);
        classification
    }

    /// Record a packet without classifying it.
    ///
    /// Used for our own writes, which would otherwise reinforce the very
    /// templates they were built from.
    pub fn record(&mut self, packet: Packet) {
        self.history.push(packet);
    }

    pub fn history(&self) -> &PacketHistory {
        &self.history
    }

    pub fn packets(&self) -> Vec<Packet> {
        self.history.iter().cloned().collect()
    }

    pub fn latest(&self, n: usize) -> Vec<Packet> {
        self.history.latest(n)
    }

    pub fn received_total(&self) -> u64 {
        self.history.received_total()
    }

    pub fn patterns(&self) -> Vec<ProtocolPattern> {
        self.classifier.patterns()
    }

    pub fn classifier(&self) -> &ProtocolClassifier {
        &self.classifier
    }

    /// Apply confidence decay up to `now`.
    pub fn decay(&mut self, now: u64) {
        self.classifier.decay(now);
    }

    pub fn summary(&self) -> AnalysisSummary {
        let patterns = self.classifier.patterns();
        AnalysisSummary {
            total_packets: self.history.len(),
            detected_patterns: patterns.len(),
            high_confidence_patterns: patterns
                .iter()
                .filter(|p| p.likelihood > HIGH_CONFIDENCE)
                .count(),
        }
    }

    pub fn export(&self) -> AnalysisExport {
        AnalysisExport {
            packets: self.packets(),
            patterns: self.patterns(),
            summary: self.summary(),
        }
    }

    /// Generate Rust helpers for every pattern above [`GENERATE_THRESHOLD`].
    ///
    /// The output targets `mowerlink::ble::BleConnectionManager::send_raw`.
    pub fn generate_commands(&self) -> String {
        let mut out = String::from("// Auto-generated commands based on protocol analysis\n");
        for pattern in self
            .classifier
            .patterns()
            .iter()
            .filter(|p| p.likelihood > GENERATE_THRESHOLD)
        {
            let bytes = pattern
                .pattern
                .iter()
                .map(|b| format!("0x{:02x}", b))
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!(
                "\n/// {}\npub async fn send_{}(link: &BleConnectionManager) -> Result<(), LinkError> {{\n    link.send_raw(&[{}]).await\n}}\n",
                pattern.description,
                snake_case(&pattern.name),
                bytes
            ));
        }
        out
    }

    pub fn clear(&mut self) {
        self.history.clear();
        self.classifier.clear();
    }
}

fn snake_case(name: &str) -> String {
    name.split_whitespace()
        .map(|w| w.to_ascii_lowercase())
        .collect::<Vec<_>>()
        .join("_")
}
