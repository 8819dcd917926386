//! Periodic rule evaluation against live mower state.
//!
//! The rule model and firing policy live in `mowerlink_core::automation`;
//! this module supplies the clock and telemetry, and carries out whatever
//! the rules ask for.

use chrono::{DateTime, Datelike, Local, Timelike};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tokio_graceful_shutdown::SubsystemHandle;
use tokio_util::sync::CancellationToken;

use mowerlink_core::automation::{FiredRule, RuleContext};
use mowerlink_core::{AutomationRule, NewRule, RuleAction, RuleSet};

use crate::ble::BleConnectionManager;
use crate::error::LinkError;
use crate::sequencer::CommandSequencer;
use crate::{lock, read_lock, write_lock};

pub struct AutomationEngine {
    rules: RwLock<RuleSet>,
    link: Arc<BleConnectionManager>,
    sequencer: Arc<CommandSequencer>,
    interval: Duration,
    notification_tx: broadcast::Sender<String>,
    running: Mutex<Option<CancellationToken>>,
}

impl AutomationEngine {
    pub fn new(
        link: Arc<BleConnectionManager>,
        sequencer: Arc<CommandSequencer>,
        interval: Duration,
    ) -> Arc<Self> {
        let (notification_tx, _) = broadcast::channel(32);
        Arc::new(AutomationEngine {
            rules: RwLock::new(RuleSet::new()),
            link,
            sequencer,
            interval,
            notification_tx,
            running: Mutex::new(None),
        })
    }

    pub fn add_rule(&self, rule: NewRule) -> String {
        let name = rule.name.clone();
        let id = write_lock(&self.rules).add_rule(rule);
        info!("Added rule {} '{}'", id, name);
        id
    }

    pub fn remove_rule(&self, id: &str) -> bool {
        write_lock(&self.rules).remove_rule(id)
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        write_lock(&self.rules).set_enabled(id, enabled)
    }

    pub fn rules(&self) -> Vec<AutomationRule> {
        read_lock(&self.rules).rules().to_vec()
    }

    /// Messages from `notification` actions.
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<String> {
        self.notification_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        lock(&self.running).is_some()
    }

    /// Start the evaluation loop on a background task.
    ///
    /// Returns `false` if it was already running.
    pub fn start(self: &Arc<Self>) -> bool {
        let token = CancellationToken::new();
        if !self.claim(&token) {
            return false;
        }
        tokio::spawn(self.clone().run_until(token));
        info!("Automation started, every {:?}", self.interval);
        true
    }

    pub fn stop(&self) {
        if let Some(token) = lock(&self.running).take() {
            token.cancel();
            info!("Automation stopped");
        }
    }

    /// Run as a subsystem until shutdown is requested.
    pub async fn run(self: Arc<Self>, subsys: SubsystemHandle) -> Result<(), LinkError> {
        let token = subsys.create_cancellation_token();
        if !self.claim(&token) {
            warn!("Automation already running");
            return Ok(());
        }
        info!("Automation running, every {:?}", self.interval);
        self.run_until(token).await;
        Ok(())
    }

    fn claim(&self, token: &CancellationToken) -> bool {
        let mut running = lock(&self.running);
        if running.is_some() {
            return false;
        }
        *running = Some(token.clone());
        true
    }

    async fn run_until(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let fired = self.process_rules(Local::now(), &cancel).await;
                    if !fired.is_empty() {
                        debug!("{} rule(s) fired", fired.len());
                    }
                }
            }
        }

        // A token that is still live belongs to a newer loop
        let mut running = lock(&self.running);
        if running.as_ref().is_some_and(|t| t.is_cancelled()) {
            running.take();
        }
    }

    /// Evaluate every rule once at wall-clock time `now` and execute the
    /// actions of those that fire. Sequences started by a rule stop when
    /// `cancel` fires.
    pub async fn process_rules(
        &self,
        now: DateTime<Local>,
        cancel: &CancellationToken,
    ) -> Vec<FiredRule> {
        let now_ms = self.link.now_ms();
        let patterns = {
            let mut analyzer = write_lock(self.link.analyzer());
            analyzer.decay(now_ms);
            analyzer.patterns()
        };
        let telemetry = self.link.latest_telemetry();
        let ctx = RuleContext {
            now_ms,
            day: now.num_days_from_ce().max(0) as u64,
            minute_of_day: (now.hour() * 60 + now.minute()) as u16,
            telemetry: telemetry.as_ref(),
            patterns: &patterns,
        };
        let fired = write_lock(&self.rules).evaluate(&ctx);

        for rule in &fired {
            if cancel.is_cancelled() {
                break;
            }
            info!("Rule '{}' fired", rule.name);
            for action in &rule.actions {
                if let Err(e) = self.execute_action(action, cancel).await {
                    error!("Rule '{}' action failed: {}", rule.name, e);
                }
            }
        }
        fired
    }

    async fn execute_action(
        &self,
        action: &RuleAction,
        cancel: &CancellationToken,
    ) -> Result<(), LinkError> {
        match action {
            RuleAction::Command { command, payload } => {
                self.link.send(*command, payload.as_deref()).await
            }
            RuleAction::Sequence { sequence_id } => {
                self.sequencer
                    .execute_sequence(sequence_id, cancel)
                    .await
                    .map(|_| ())
            }
            RuleAction::Notification { message } => {
                info!("Automation: {}", message);
                if self.notification_tx.send(message.clone()).is_err() {
                    warn!("No listener for automation notification");
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::{SimulatedConfig, SimulatedMower};
    use crate::config::{DeviceConfig, DiscoveryConfig};
    use chrono::TimeZone;
    use mowerlink_core::analyzer::ProtocolAnalyzer;
    use mowerlink_core::{MowerCommand, MowerStatus, RuleCondition, Trigger};
    use tokio_graceful_shutdown::{SubsystemBuilder, Toplevel};

    async fn engine(mower: &SimulatedMower) -> Arc<AutomationEngine> {
        let link = BleConnectionManager::new(
            mower.adapter(),
            DeviceConfig::default(),
            Arc::new(RwLock::new(ProtocolAnalyzer::default())),
        );
        link.connect().await.unwrap();
        let sequencer = Arc::new(CommandSequencer::new(link.clone(), DiscoveryConfig::default()));
        AutomationEngine::new(link, sequencer, Duration::from_secs(5))
    }

    fn at(hour: u32, minute: u32) -> DateTime<Local> {
        Local
            .with_ymd_and_hms(2026, 5, 4, hour, minute, 0)
            .single()
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_time_rule_sends_command() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        let engine = engine(&mower).await;
        let idle = CancellationToken::new();
        engine.add_rule(NewRule {
            name: "Morning start".to_string(),
            trigger: Trigger::Time,
            conditions: vec![RuleCondition::TimeOfDay { hour: 8, minute: 0 }],
            actions: vec![RuleAction::Command {
                command: MowerCommand::Start,
                payload: None,
            }],
            enabled: true,
        });

        assert!(engine.process_rules(at(7, 59), &idle).await.is_empty());
        assert_eq!(engine.process_rules(at(8, 0), &idle).await.len(), 1);
        // once per day
        assert!(engine.process_rules(at(8, 0), &idle).await.is_empty());

        let writes = mower.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].data, vec![0x01, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_battery_rule_notifies() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        let engine = engine(&mower).await;
        let mut notes = engine.subscribe_notifications();
        let idle = CancellationToken::new();
        engine.add_rule(NewRule {
            name: "Low battery".to_string(),
            trigger: Trigger::Condition,
            conditions: vec![RuleCondition::BatteryBelow { percent: 20 }],
            actions: vec![RuleAction::Notification {
                message: "Battery low".to_string(),
            }],
            enabled: true,
        });

        mower.set_battery(15);
        mower.inject_notification(mower.telemetry().encode().to_vec());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.process_rules(at(12, 0), &idle).await.len(), 1);
        assert_eq!(notes.try_recv().unwrap(), "Battery low");
        // still low, no rising edge
        assert!(engine.process_rules(at(12, 1), &idle).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_rule_sends_home() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        let engine = engine(&mower).await;
        let idle = CancellationToken::new();
        engine.add_rule(NewRule {
            name: "Fault recovery".to_string(),
            trigger: Trigger::Condition,
            conditions: vec![RuleCondition::StatusIs {
                status: MowerStatus::Error,
            }],
            actions: vec![RuleAction::Command {
                command: MowerCommand::ReturnHome,
                payload: None,
            }],
            enabled: true,
        });

        assert!(engine.process_rules(at(9, 0), &idle).await.is_empty());

        mower.set_status(MowerStatus::Error);
        mower.inject_notification(mower.telemetry().encode().to_vec());
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(engine.process_rules(at(9, 1), &idle).await.len(), 1);
        assert_eq!(mower.writes()[0].data, vec![0x02, 0x01]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_rule_sequence() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        let engine = engine(&mower).await;
        engine.add_rule(NewRule {
            name: "Morning routine".to_string(),
            trigger: Trigger::Time,
            conditions: vec![RuleCondition::TimeOfDay { hour: 8, minute: 0 }],
            actions: vec![RuleAction::Sequence {
                sequence_id: "morning-routine".to_string(),
            }],
            enabled: true,
        });

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let fired = engine.process_rules(at(8, 0), &cancel).await;

        assert_eq!(fired.len(), 1);
        // only status_check went out before the cancel
        assert_eq!(mower.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subsystem_claims_loop() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        let engine = engine(&mower).await;

        let subsystem = engine.clone();
        let toplevel = tokio::spawn(async move {
            Toplevel::new(move |s| async move {
                s.start(SubsystemBuilder::new("automation", move |h| subsystem.run(h)));
                s.start(SubsystemBuilder::new("stopper", |h: SubsystemHandle| async move {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    h.request_shutdown();
                    Ok::<(), LinkError>(())
                }));
            })
            .handle_shutdown_requests(Duration::from_secs(1))
            .await
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(engine.is_running());
        assert!(!engine.start());

        toplevel.await.unwrap().unwrap();
        assert!(!engine.is_running());
        assert!(engine.start());
        engine.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop() {
        let mower = SimulatedMower::new(SimulatedConfig::default());
        let engine = engine(&mower).await;
        assert!(engine.start());
        assert!(!engine.start());
        assert!(engine.is_running());
        engine.stop();
        assert!(!engine.is_running());

        let id = engine.add_rule(NewRule {
            name: "x".to_string(),
            trigger: Trigger::Event,
            conditions: vec![],
            actions: vec![],
            enabled: true,
        });
        assert_eq!(engine.rules().len(), 1);
        assert!(engine.remove_rule(&id));
        assert!(engine.rules().is_empty());
    }
}
