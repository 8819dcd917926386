//! Automation rule model and evaluation.
//!
//! A rule has a trigger kind, a list of conditions that must all hold, and
//! a list of actions. Evaluation is pure: the caller supplies the clock and
//! the latest mower state, and gets back the actions to run.
//!
//! Firing policy:
//! - `Time` rules fire at most once per calendar day, in the minute named
//!   by their `TimeOfDay` condition.
//! - `Condition` and `Event` rules fire on the rising edge, when their
//!   conditions go from not-holding to holding. They re-arm once the
//!   conditions stop holding.
//!
//! A rule with no conditions never fires.

use serde::{Deserialize, Serialize};

use crate::analyzer::ProtocolPattern;
use crate::protocol::{MowerCommand, MowerStatus, Telemetry};

/// What kind of situation a rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trigger {
    Time,
    Condition,
    Event,
}

/// A single predicate on the clock, telemetry or analysis state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleCondition {
    /// Local wall-clock minute
    TimeOfDay { hour: u8, minute: u8 },
    BatteryBelow { percent: u8 },
    BatteryAbove { percent: u8 },
    StatusIs { status: MowerStatus },
    /// A classifier pattern reached the given likelihood
    #[serde(rename_all = "camelCase")]
    PatternSeen { name: String, min_likelihood: f64 },
}

/// Something to do when a rule fires.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RuleAction {
    Command {
        command: MowerCommand,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<Vec<u8>>,
    },
    #[serde(rename_all = "camelCase")]
    Sequence { sequence_id: String },
    Notification { message: String },
}

/// Rule definition without an id, as supplied by callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub name: String,
    pub trigger: Trigger,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutomationRule {
    pub id: String,
    pub name: String,
    pub trigger: Trigger,
    pub conditions: Vec<RuleCondition>,
    pub actions: Vec<RuleAction>,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_executed: Option<u64>,
    /// Day number of the last time-triggered firing
    #[serde(skip)]
    fired_day: Option<u64>,
    /// Whether the conditions held on the previous pass
    #[serde(skip)]
    was_holding: bool,
}

/// Inputs to one evaluation pass.
#[derive(Debug, Clone, Copy)]
pub struct RuleContext<'a> {
    /// Monotonic clock, ms
    pub now_ms: u64,
    /// Local calendar day number
    pub day: u64,
    /// Local minutes since midnight
    pub minute_of_day: u16,
    pub telemetry: Option<&'a Telemetry>,
    pub patterns: &'a [ProtocolPattern],
}

impl RuleCondition {
    pub fn holds(&self, ctx: &RuleContext<'_>) -> bool {
        match self {
            RuleCondition::TimeOfDay { hour, minute } => {
                ctx.minute_of_day == *hour as u16 * 60 + *minute as u16
            }
            RuleCondition::BatteryBelow { percent } => {
                ctx.telemetry.is_some_and(|t| t.battery < *percent)
            }
            RuleCondition::BatteryAbove { percent } => {
                ctx.telemetry.is_some_and(|t| t.battery > *percent)
            }
            RuleCondition::StatusIs { status } => {
                ctx.telemetry.is_some_and(|t| t.status == *status)
            }
            RuleCondition::PatternSeen {
                name,
                min_likelihood,
            } => ctx
                .patterns
                .iter()
                .any(|p| p.name == *name && p.likelihood >= *min_likelihood),
        }
    }
}

/// A rule that fired in an evaluation pass.
#[derive(Debug, Clone, PartialEq)]
pub struct FiredRule {
    pub rule_id: String,
    pub name: String,
    pub actions: Vec<RuleAction>,
}

/// The set of automation rules.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<AutomationRule>,
    next_id: u64,
}

impl RuleSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule and return its generated id (`rule_<n>`).
    pub fn add_rule(&mut self, rule: NewRule) -> String {
        self.next_id += 1;
        let id = format!("rule_{}", self.next_id);
        self.rules.push(AutomationRule {
            id: id.clone(),
            name: rule.name,
            trigger: rule.trigger,
            conditions: rule.conditions,
            actions: rule.actions,
            enabled: rule.enabled,
            last_executed: None,
            fired_day: None,
            was_holding: false,
        });
        id
    }

    pub fn remove_rule(&mut self, id: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|r| r.id != id);
        self.rules.len() != before
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> bool {
        match self.rules.iter_mut().find(|r| r.id == id) {
            Some(rule) => {
                rule.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn rules(&self) -> &[AutomationRule] {
        &self.rules
    }

    /// Evaluate every enabled rule and return the ones that fire.
    ///
    /// Fired rules get `last_executed = now_ms`.
    pub fn evaluate(&mut self, ctx: &RuleContext<'_>) -> Vec<FiredRule> {
        let mut fired = Vec::new();

        for rule in self.rules.iter_mut().filter(|r| r.enabled) {
            let holding =
                !rule.conditions.is_empty() && rule.conditions.iter().all(|c| c.holds(ctx));

            let fire = match rule.trigger {
                Trigger::Time => holding && rule.fired_day != Some(ctx.day),
                Trigger::Condition | Trigger::Event => holding && !rule.was_holding,
            };
            rule.was_holding = holding;

            if fire {
                if rule.trigger == Trigger::Time {
                    rule.fired_day = Some(ctx.day);
                }
                rule.last_executed = Some(ctx.now_ms);
                fired.push(FiredRule {
                    rule_id: rule.id.clone(),
                    name: rule.name.clone(),
                    actions: rule.actions.clone(),
                });
            }
        }

        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Position;

    fn telemetry(battery: u8, status: MowerStatus) -> Telemetry {
        Telemetry {
            battery,
            status,
            temperature: 20.0,
            position: Position::default(),
            timestamp: 0,
        }
    }

    fn ctx<'a>(
        now_ms: u64,
        day: u64,
        minute_of_day: u16,
        telemetry: Option<&'a Telemetry>,
    ) -> RuleContext<'a> {
        RuleContext {
            now_ms,
            day,
            minute_of_day,
            telemetry,
            patterns: &[],
        }
    }

    fn low_battery_rule() -> NewRule {
        NewRule {
            name: "Low battery".to_string(),
            trigger: Trigger::Condition,
            conditions: vec![RuleCondition::BatteryBelow { percent: 20 }],
            actions: vec![RuleAction::Sequence {
                sequence_id: "return-home".to_string(),
            }],
            enabled: true,
        }
    }

    #[test]
    fn test_add_remove() {
        let mut rules = RuleSet::new();
        let id = rules.add_rule(low_battery_rule());
        assert_eq!(id, "rule_1");
        assert_eq!(rules.rules().len(), 1);
        assert!(rules.remove_rule(&id));
        assert!(!rules.remove_rule(&id));
    }

    #[test]
    fn test_condition_fires_on_rising_edge() {
        let mut rules = RuleSet::new();
        rules.add_rule(low_battery_rule());

        let ok = telemetry(50, MowerStatus::Mowing);
        let low = telemetry(15, MowerStatus::Mowing);

        assert!(rules.evaluate(&ctx(0, 0, 0, Some(&ok))).is_empty());
        let fired = rules.evaluate(&ctx(5000, 0, 0, Some(&low)));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].name, "Low battery");
        assert_eq!(rules.rules()[0].last_executed, Some(5000));

        // still low, no repeat
        assert!(rules.evaluate(&ctx(10_000, 0, 0, Some(&low))).is_empty());
        // recovers, then drops again
        assert!(rules.evaluate(&ctx(15_000, 0, 0, Some(&ok))).is_empty());
        assert_eq!(rules.evaluate(&ctx(20_000, 0, 0, Some(&low))).len(), 1);
    }

    #[test]
    fn test_no_telemetry_never_holds() {
        let mut rules = RuleSet::new();
        rules.add_rule(low_battery_rule());
        assert!(rules.evaluate(&ctx(0, 0, 0, None)).is_empty());
    }

    #[test]
    fn test_time_fires_once_per_day() {
        let mut rules = RuleSet::new();
        rules.add_rule(NewRule {
            name: "Morning".to_string(),
            trigger: Trigger::Time,
            conditions: vec![RuleCondition::TimeOfDay { hour: 7, minute: 30 }],
            actions: vec![RuleAction::Notification {
                message: "good morning".to_string(),
            }],
            enabled: true,
        });

        assert!(rules.evaluate(&ctx(0, 1, 7 * 60 + 29, None)).is_empty());
        assert_eq!(rules.evaluate(&ctx(1, 1, 7 * 60 + 30, None)).len(), 1);
        assert!(rules.evaluate(&ctx(2, 1, 7 * 60 + 30, None)).is_empty());
        assert_eq!(rules.evaluate(&ctx(3, 2, 7 * 60 + 30, None)).len(), 1);
    }

    #[test]
    fn test_disabled_and_empty_rules() {
        let mut rules = RuleSet::new();
        let id = rules.add_rule(low_battery_rule());
        rules.set_enabled(&id, false);
        rules.add_rule(NewRule {
            conditions: vec![],
            ..low_battery_rule()
        });
        let low = telemetry(5, MowerStatus::Idle);
        assert!(rules.evaluate(&ctx(0, 0, 0, Some(&low))).is_empty());
    }

    #[test]
    fn test_event_pattern_rule() {
        let mut analyzer = crate::analyzer::ProtocolAnalyzer::default();
        analyzer.add_packet(crate::analyzer::Packet::new(
            0,
            crate::analyzer::Direction::Received,
            "FF01",
            vec![0xFF, 0x00],
        ));
        let patterns = analyzer.patterns();

        let mut rules = RuleSet::new();
        rules.add_rule(NewRule {
            name: "E-stop seen".to_string(),
            trigger: Trigger::Event,
            conditions: vec![RuleCondition::PatternSeen {
                name: "Emergency Stop".to_string(),
                min_likelihood: 0.75,
            }],
            actions: vec![RuleAction::Command {
                command: MowerCommand::BladeOff,
                payload: None,
            }],
            enabled: true,
        });

        let fired = rules.evaluate(&RuleContext {
            now_ms: 0,
            day: 0,
            minute_of_day: 0,
            telemetry: None,
            patterns: &patterns,
        });
        assert_eq!(fired.len(), 1);
    }

    #[test]
    fn test_rule_json() {
        let json = r#"{
            "name": "Dock when charged",
            "trigger": "condition",
            "conditions": [{"type": "batteryAbove", "percent": 95}, {"type": "statusIs", "status": "charging"}],
            "actions": [{"type": "notification", "message": "charged"}]
        }"#;
        let rule: NewRule = serde_json::from_str(json).unwrap();
        assert!(rule.enabled);
        assert_eq!(rule.conditions.len(), 2);
    }
}
