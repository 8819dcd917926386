//! Text analysis of captured traffic.
//!
//! The sequencer hands a snapshot of recent packets to a
//! [`TextAnalysisProvider`] and reports whatever text comes back. Providers
//! may be remote services; the [`OfflineAnalyzer`] here works from the
//! snapshot alone.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use mowerlink_core::analyzer::{AnalysisSummary, Direction, Packet, ProtocolPattern};
use mowerlink_core::DeviceInfo;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnalysisError {
    #[error("Analysis provider unavailable: {0}")]
    Unavailable(String),
    #[error("Analysis failed: {0}")]
    Failed(String),
}

/// Snapshot sent to a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRequest {
    pub device_info: DeviceInfo,
    pub summary: AnalysisSummary,
    /// Most recent packets, oldest first
    pub packets: Vec<Packet>,
    pub patterns: Vec<ProtocolPattern>,
}

#[async_trait]
pub trait TextAnalysisProvider: Send + Sync {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError>;

    /// Same as [`analyze`](Self::analyze), delivered in chunks.
    fn stream_analyze(
        &self,
        request: AnalysisRequest,
    ) -> BoxStream<'static, Result<String, AnalysisError>>;
}

/// Local, deterministic summary of a capture.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineAnalyzer;

impl OfflineAnalyzer {
    fn report_lines(request: &AnalysisRequest) -> Vec<String> {
        let mut lines = Vec::new();
        lines.push(format!(
            "Device {} (firmware {}), {}",
            request.device_info.name,
            request.device_info.firmware_version,
            if request.device_info.connected {
                "connected"
            } else {
                "not connected"
            }
        ));

        let sent = request
            .packets
            .iter()
            .filter(|p| p.direction == Direction::Sent)
            .count();
        lines.push(format!(
            "{} packets captured, {} in this window ({} sent, {} received)",
            request.summary.total_packets,
            request.packets.len(),
            sent,
            request.packets.len() - sent
        ));

        // Leading byte is the best opcode guess we have
        let mut leading: BTreeMap<u8, usize> = BTreeMap::new();
        for packet in request.packets.iter().filter(|p| p.direction == Direction::Received) {
            if let Some(first) = packet.data.first() {
                *leading.entry(*first).or_default() += 1;
            }
        }
        if !leading.is_empty() {
            let mut by_count: Vec<(u8, usize)> = leading.into_iter().collect();
            by_count.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            let top = by_count
                .iter()
                .take(5)
                .map(|(byte, n)| format!("0x{:02x}×{}", byte, n))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("Most frequent leading bytes: {}", top));
        }

        let parsed = request.packets.iter().filter(|p| p.parsed.is_some()).count();
        if parsed > 0 {
            lines.push(format!("{} packets decoded as telemetry frames", parsed));
        }

        for pattern in &request.patterns {
            lines.push(format!(
                "Pattern '{}' [{}] likelihood {:.2} over {} hit(s)",
                pattern.name,
                mowerlink_core::hex_encode(&pattern.pattern),
                pattern.likelihood,
                pattern.hits
            ));
        }
        lines
    }
}

#[async_trait]
impl TextAnalysisProvider for OfflineAnalyzer {
    async fn analyze(&self, request: &AnalysisRequest) -> Result<String, AnalysisError> {
        Ok(Self::report_lines(request).join("\n"))
    }

    fn stream_analyze(
        &self,
        request: AnalysisRequest,
    ) -> BoxStream<'static, Result<String, AnalysisError>> {
        let lines = Self::report_lines(&request);
        stream::iter(lines.into_iter().map(|line| Ok(line + "\n"))).boxed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mowerlink_core::analyzer::ProtocolAnalyzer;

    fn request() -> AnalysisRequest {
        let mut analyzer = ProtocolAnalyzer::default();
        analyzer.add_packet(Packet::new(0, Direction::Received, "FF01", vec![0x20, 50, 0, 0]));
        analyzer.add_packet(Packet::new(1, Direction::Received, "FF01", vec![0x01, 0x01]));
        analyzer.record(Packet::new(2, Direction::Sent, "FF02", vec![0x01, 0x01]));
        AnalysisRequest {
            device_info: DeviceInfo::default(),
            summary: analyzer.summary(),
            packets: analyzer.latest(50),
            patterns: analyzer.patterns(),
        }
    }

    #[tokio::test]
    async fn test_offline_report() {
        let text = OfflineAnalyzer.analyze(&request()).await.unwrap();
        assert!(text.starts_with("Device GOAT-0050 (firmware 1.2.120), not connected"));
        assert!(text.contains("3 packets captured, 3 in this window (1 sent, 2 received)"));
        assert!(text.contains("Pattern 'Start Command' [01 01]"));
    }

    #[tokio::test]
    async fn test_stream_matches_analyze() {
        let req = request();
        let whole = OfflineAnalyzer.analyze(&req).await.unwrap();
        let chunks: Vec<String> = OfflineAnalyzer
            .stream_analyze(req)
            .map(|c| c.unwrap())
            .collect()
            .await;
        assert_eq!(chunks.concat().trim_end(), whole);
    }
}
