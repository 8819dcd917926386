//! Multi-step command execution and protocol probing.

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use mowerlink_core::sequence::{recommendations, DISCOVERY_PROBES};
use mowerlink_core::{CommandSequence, SequenceLibrary, SequenceStep};

use crate::analysis::{AnalysisRequest, TextAnalysisProvider};
use crate::ble::BleConnectionManager;
use crate::config::DiscoveryConfig;
use crate::error::LinkError;
use crate::{read_lock, write_lock};

/// Packets handed to the analysis provider
pub const ANALYSIS_WINDOW: usize = 50;

/// Outcome of a completed sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceReport {
    pub sequence_id: String,
    pub name: String,
    pub steps_completed: usize,
    pub elapsed_ms: u64,
}

/// Result of [`CommandSequencer::analyze_response_patterns`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseAnalysis {
    pub total_packets: usize,
    pub detected_patterns: usize,
    pub high_confidence_patterns: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analysis: Option<String>,
    /// Provider failure, if any
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub recommendations: Vec<String>,
}

pub struct CommandSequencer {
    link: Arc<BleConnectionManager>,
    library: RwLock<SequenceLibrary>,
    discovery: DiscoveryConfig,
}

impl CommandSequencer {
    pub fn new(link: Arc<BleConnectionManager>, discovery: DiscoveryConfig) -> Self {
        CommandSequencer {
            link,
            library: RwLock::new(SequenceLibrary::default()),
            discovery,
        }
    }

    pub fn sequences(&self) -> Vec<CommandSequence> {
        read_lock(&self.library).sequences().to_vec()
    }

    pub fn get(&self, id: &str) -> Option<CommandSequence> {
        read_lock(&self.library).get(id).cloned()
    }

    /// Register a sequence, returning its generated id.
    pub fn add_sequence(
        &self,
        name: impl Into<String>,
        description: impl Into<String>,
        steps: Vec<SequenceStep>,
    ) -> String {
        write_lock(&self.library).add_sequence(name, description, steps)
    }

    /// Run a sequence step by step.
    ///
    /// Stops at the first failing step with [`LinkError::SequenceStepFailed`];
    /// steps already sent are not undone. `cancel` is checked before each
    /// step and interrupts delays.
    pub async fn execute_sequence(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<SequenceReport, LinkError> {
        let sequence = self
            .get(id)
            .ok_or_else(|| LinkError::SequenceNotFound(id.to_string()))?;
        info!("Running '{}' ({} steps)", sequence.name, sequence.steps.len());

        let started = Instant::now();
        for (index, step) in sequence.steps.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!("'{}' cancelled before step {}", sequence.name, index);
                return Err(LinkError::Cancelled);
            }

            if let Err(e) = self.link.send(step.command, step.payload.as_deref()).await {
                error!("'{}' step {} ({}) failed: {}", sequence.name, index, step.command, e);
                return Err(LinkError::SequenceStepFailed {
                    sequence: sequence.id.clone(),
                    step: index,
                    command: step.command.name().to_string(),
                    reason: e.to_string(),
                });
            }
            debug!("'{}' step {} sent {}", sequence.name, index, step.command);

            if let Some(delay) = step.delay() {
                pause(delay, cancel).await?;
            }
        }

        let report = SequenceReport {
            sequence_id: sequence.id.clone(),
            name: sequence.name.clone(),
            steps_completed: sequence.steps.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        info!("'{}' completed in {} ms", report.name, report.elapsed_ms);
        Ok(report)
    }

    /// Send each probe and keep the ones followed by incoming traffic.
    ///
    /// Correlation only: any packet arriving inside the observation window
    /// counts, whether or not the probe caused it.
    pub async fn discover_commands(&self, cancel: &CancellationToken) -> Result<Vec<String>, LinkError> {
        if !self.link.is_connected() {
            return Err(LinkError::NotConnected);
        }

        let window = Duration::from_millis(self.discovery.observation_window_ms);
        let cooldown = Duration::from_millis(self.discovery.cooldown_ms);
        let mut found = Vec::new();

        for (index, probe) in DISCOVERY_PROBES.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(LinkError::Cancelled);
            }

            let before = self.link.received_total();
            match self.link.send_raw(probe.payload).await {
                Ok(()) => {
                    pause(window, cancel).await?;
                    if self.link.received_total() > before {
                        info!("Probe {} drew a response", probe.name);
                        found.push(probe.name.to_string());
                    } else {
                        debug!("Probe {}: no response", probe.name);
                    }
                }
                Err(e) => warn!("Probe {} not sent: {}", probe.name, e),
            }

            if index + 1 < DISCOVERY_PROBES.len() {
                pause(cooldown, cancel).await?;
            }
        }
        Ok(found)
    }

    /// Summarise the capture, ask `provider` for a reading of the most
    /// recent packets, and add local recommendations.
    pub async fn analyze_response_patterns(
        &self,
        provider: &dyn TextAnalysisProvider,
    ) -> ResponseAnalysis {
        let request = {
            let analyzer = read_lock(self.link.analyzer());
            AnalysisRequest {
                device_info: self.link.device_info(),
                summary: analyzer.summary(),
                packets: analyzer.latest(ANALYSIS_WINDOW),
                patterns: analyzer.patterns(),
            }
        };

        let (analysis, error) = match provider.analyze(&request).await {
            Ok(text) => (Some(text), None),
            Err(e) => {
                warn!("Analysis provider failed: {}", e);
                (None, Some(e.to_string()))
            }
        };

        ResponseAnalysis {
            total_packets: request.summary.total_packets,
            detected_patterns: request.summary.detected_patterns,
            high_confidence_patterns: request.summary.high_confidence_patterns,
            analysis,
            error,
            recommendations: recommendations(&request.patterns),
        }
    }
}

/// Sleep unless cancelled first.
async fn pause(duration: Duration, cancel: &CancellationToken) -> Result<(), LinkError> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LinkError::Cancelled),
        _ = tokio::time::sleep(duration) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::AnalysisError;
    use crate::ble::{SimulatedConfig, SimulatedMower};
    use crate::config::DeviceConfig;
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use mowerlink_core::analyzer::ProtocolAnalyzer;
    use mowerlink_core::MowerCommand;

    async fn connected(config: SimulatedConfig) -> (SimulatedMower, CommandSequencer) {
        let mower = SimulatedMower::new(config);
        let link = BleConnectionManager::new(
            mower.adapter(),
            DeviceConfig::default(),
            Arc::new(RwLock::new(ProtocolAnalyzer::default())),
        );
        link.connect().await.unwrap();
        (mower, CommandSequencer::new(link, DiscoveryConfig::default()))
    }

    struct FailingProvider;

    #[async_trait]
    impl TextAnalysisProvider for FailingProvider {
        async fn analyze(&self, _request: &AnalysisRequest) -> Result<String, AnalysisError> {
            Err(AnalysisError::Unavailable("offline".to_string()))
        }

        fn stream_analyze(
            &self,
            _request: AnalysisRequest,
        ) -> BoxStream<'static, Result<String, AnalysisError>> {
            Box::pin(futures::stream::empty())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_sequence() {
        let (_, sequencer) = connected(SimulatedConfig::default()).await;
        let result = sequencer
            .execute_sequence("nope", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LinkError::SequenceNotFound(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_return_home_timing() {
        let (mower, sequencer) = connected(SimulatedConfig::default()).await;
        let report = sequencer
            .execute_sequence("return-home", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(report.steps_completed, 2);
        assert!(report.elapsed_ms >= 3000);

        let writes = mower.writes();
        assert_eq!(writes[0].data, vec![0x03, 0x00]);
        assert_eq!(writes[1].data, vec![0x02, 0x01]);
        assert!(writes[1].at - writes[0].at >= Duration::from_millis(2000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborts_at_first_failure() {
        let (mower, sequencer) = connected(SimulatedConfig {
            fail_writes_after: Some(2),
            ..Default::default()
        })
        .await;
        let err = sequencer
            .execute_sequence("morning-routine", &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            LinkError::SequenceStepFailed { step, command, .. } => {
                assert_eq!(step, 2);
                assert_eq!(command, "blade_on");
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(mower.writes().len(), 2);
        // sequence failure leaves the link up
        assert!(sequencer.link.is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_delay() {
        let (mower, sequencer) = connected(SimulatedConfig::default()).await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(500)).await;
            trigger.cancel();
        });
        let result = sequencer.execute_sequence("morning-routine", &cancel).await;
        assert!(matches!(result, Err(LinkError::Cancelled)));
        assert_eq!(mower.writes().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_sequence() {
        let (mower, sequencer) = connected(SimulatedConfig::default()).await;
        let id = sequencer.add_sequence(
            "Nudge",
            "Short forward pulse",
            vec![
                SequenceStep::new(MowerCommand::ManualControl)
                    .with_payload(vec![0x04, 0x00, 0x40, 0x80])
                    .with_delay(100),
                SequenceStep::new(MowerCommand::Stop),
            ],
        );
        assert!(sequencer.sequences().iter().any(|s| s.id == id));
        sequencer
            .execute_sequence(&id, &CancellationToken::new())
            .await
            .unwrap();
        let data: Vec<Vec<u8>> = mower.writes().into_iter().map(|w| w.data).collect();
        assert_eq!(data, vec![vec![0x04, 0x00, 0x40, 0x80], vec![0x01, 0x00]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_failure_captured() {
        let (_, sequencer) = connected(SimulatedConfig::default()).await;
        sequencer.link.send_command("start", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let result = sequencer.analyze_response_patterns(&FailingProvider).await;
        assert_eq!(result.total_packets, 2);
        assert_eq!(result.analysis, None);
        assert_eq!(
            result.error.as_deref(),
            Some("Analysis provider unavailable: offline")
        );
    }
}
