//! Command sequences, discovery probes and analysis recommendations.
//!
//! Sequences are plain data: the host executes them against a live link.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::analyzer::{ProtocolPattern, HIGH_CONFIDENCE};
use crate::protocol::MowerCommand;

pub const MORNING_ROUTINE: &str = "morning-routine";
pub const EMERGENCY_STOP: &str = "emergency-stop";
pub const RETURN_HOME: &str = "return-home";

// =============================================================================
// Sequences
// =============================================================================

/// One command of a sequence, followed by an optional pause.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceStep {
    pub command: MowerCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Vec<u8>>,
    /// Pause after the command, in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_ms: Option<u64>,
}

impl SequenceStep {
    pub fn new(command: MowerCommand) -> Self {
        SequenceStep {
            command,
            payload: None,
            delay_ms: None,
        }
    }

    pub fn with_delay(mut self, delay_ms: u64) -> Self {
        self.delay_ms = Some(delay_ms);
        self
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }

    /// Bytes this step writes.
    pub fn encode(&self) -> Vec<u8> {
        self.command.encode(self.payload.as_deref())
    }
}

/// Named, ordered list of steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSequence {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<SequenceStep>,
}

impl CommandSequence {
    /// Sum of all step delays.
    pub fn total_delay(&self) -> Duration {
        self.steps.iter().filter_map(|s| s.delay()).sum()
    }
}

/// Built-in sequences.
pub fn default_sequences() -> Vec<CommandSequence> {
    vec![
        CommandSequence {
            id: MORNING_ROUTINE.to_string(),
            name: "Morning Mowing Routine".to_string(),
            description: "Start mowing with safety checks".to_string(),
            steps: vec![
                SequenceStep::new(MowerCommand::StatusCheck).with_delay(1000),
                SequenceStep::new(MowerCommand::BatteryCheck).with_delay(1000),
                SequenceStep::new(MowerCommand::BladeOn).with_delay(2000),
                SequenceStep::new(MowerCommand::Start).with_delay(1000),
            ],
        },
        CommandSequence {
            id: EMERGENCY_STOP.to_string(),
            name: "Emergency Stop Sequence".to_string(),
            description: "Immediate stop with blade shutdown".to_string(),
            // The 500 ms pause separates the two writes
            steps: vec![
                SequenceStep::new(MowerCommand::EmergencyStop).with_delay(500),
                SequenceStep::new(MowerCommand::BladeOff),
            ],
        },
        CommandSequence {
            id: RETURN_HOME.to_string(),
            name: "Return Home Sequence".to_string(),
            description: "Safe return to charging dock".to_string(),
            steps: vec![
                SequenceStep::new(MowerCommand::BladeOff).with_delay(2000),
                SequenceStep::new(MowerCommand::ReturnHome).with_delay(1000),
            ],
        },
    ]
}

/// Sequence store, seeded with [`default_sequences`].
#[derive(Debug, Clone)]
pub struct SequenceLibrary {
    sequences: Vec<CommandSequence>,
    next_id: u64,
}

impl Default for SequenceLibrary {
    fn default() -> Self {
        SequenceLibrary {
            sequences: default_sequences(),
            next_id: 0,
        }
    }
}

impl SequenceLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sequence and return its generated id (`seq_<n>`).
    pub fn add_sequence(
        &mut self,
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<SequenceStep>,
    ) -> String {
        self.next_id += 1;
        let id = format!("seq_{}", self.next_id);
        self.sequences.push(CommandSequence {
            id: id.clone(),
            name: name.into(),
            description: description.into(),
            steps,
        });
        id
    }

    pub fn get(&self, id: &str) -> Option<&CommandSequence> {
        self.sequences.iter().find(|s| s.id == id)
    }

    pub fn sequences(&self) -> &[CommandSequence] {
        &self.sequences
    }
}

// =============================================================================
// Discovery
// =============================================================================

/// Candidate command sent during discovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoveryProbe {
    pub name: &'static str,
    pub payload: &'static [u8],
}

/// Probes tried by command discovery, in order.
pub const DISCOVERY_PROBES: &[DiscoveryProbe] = &[
    DiscoveryProbe {
        name: "status_request",
        payload: &[0x10],
    },
    DiscoveryProbe {
        name: "battery_request",
        payload: &[0x11],
    },
    DiscoveryProbe {
        name: "position_request",
        payload: &[0x12],
    },
    DiscoveryProbe {
        name: "ping",
        payload: &[0x00],
    },
    DiscoveryProbe {
        name: "version_request",
        payload: &[0x20],
    },
    DiscoveryProbe {
        name: "capabilities_request",
        payload: &[0x21],
    },
];

/// Local advice derived from detected pattern names.
pub fn recommendations(patterns: &[ProtocolPattern]) -> Vec<String> {
    let mut out = Vec::new();

    let high = patterns
        .iter()
        .filter(|p| p.likelihood > HIGH_CONFIDENCE)
        .count();
    if high > 0 {
        out.push(format!("Found {} high-confidence command patterns", high));
    }

    let has = |word: &str| patterns.iter().any(|p| p.name.contains(word));
    if has("Battery") {
        out.push("Battery monitoring commands detected - implement battery alerts".to_string());
    }
    if has("Position") {
        out.push("Position tracking available - implement real-time mapping".to_string());
    }
    if has("Emergency") {
        out.push("Emergency stop protocol identified - ensure safety implementation".to_string());
    }

    out
}
