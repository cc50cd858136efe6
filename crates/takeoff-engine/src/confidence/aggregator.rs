//! Post-hoc confidence scoring over a run's debug artifacts

use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::auditor::{AuditContext, AuditorOracle};
use crate::config::AuditorConfig;
use crate::types::{DebugArtifact, StageKind};

/// Decimal places kept in the aggregate score
pub const CONFIDENCE_PRECISION: i32 = 2;

pub fn round_confidence(value: f64) -> f64 {
    let factor = 10f64.powi(CONFIDENCE_PRECISION);
    (value * factor).round() / factor
}

/// Oracle score for one artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactScore {
    /// Position in the run's artifact list
    pub index: usize,
    pub stage: StageKind,
    pub label: String,
    pub score: f64,
}

/// Artifact left out of the mean
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExcludedArtifact {
    pub index: usize,
    pub stage: StageKind,
    pub label: String,
    pub reason: String,
}

/// Aggregate confidence plus the per-artifact breakdown
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfidenceReport {
    pub confidence: f64,
    pub scores: Vec<ArtifactScore>,
    pub excluded: Vec<ExcludedArtifact>,
}

impl ConfidenceReport {
    pub fn score_for(&self, index: usize) -> Option<f64> {
        self.scores.iter().find(|s| s.index == index).map(|s| s.score)
    }
}

/// Scores every artifact through the oracle and averages the successes
pub struct ConfidenceAggregator {
    oracle: Arc<dyn AuditorOracle>,
    max_concurrency: usize,
    call_timeout: Duration,
}

impl ConfidenceAggregator {
    pub fn new(oracle: Arc<dyn AuditorOracle>, config: &AuditorConfig) -> Self {
        Self {
            oracle,
            max_concurrency: config.max_concurrency.max(1),
            call_timeout: config.timeout(),
        }
    }

    /// Mean oracle score, or 0.0 when nothing could be scored. Never fails.
    pub async fn aggregate(&self, artifacts: &[DebugArtifact]) -> ConfidenceReport {
        if artifacts.is_empty() {
            tracing::info!("No debug artifacts produced, confidence is 0.0");
            return ConfidenceReport::default();
        }

        let call_timeout = self.call_timeout;

        let outcomes: Vec<(usize, DebugArtifact, Result<f64, String>)> =
            stream::iter(artifacts.iter().cloned().enumerate())
                .map(|(index, artifact)| {
                    let oracle = Arc::clone(&self.oracle);
                    async move {
                        let context = AuditContext {
                            stage: artifact.stage,
                            claim: artifact.claim.clone(),
                        };
                        let call = oracle.score(&artifact.evidence, &artifact.label, &context);
                        let outcome = match tokio::time::timeout(call_timeout, call).await {
                            Ok(Ok(score)) => Ok(score),
                            Ok(Err(e)) => Err(e.to_string()),
                            Err(_) => Err(format!("timed out after {}s", call_timeout.as_secs())),
                        };
                        (index, artifact, outcome)
                    }
                })
                .buffered(self.max_concurrency)
                .collect()
                .await;

        let mut report = ConfidenceReport::default();
        for (index, artifact, outcome) in outcomes {
            match outcome {
                Ok(score) => report.scores.push(ArtifactScore {
                    index,
                    stage: artifact.stage,
                    label: artifact.label,
                    score,
                }),
                Err(reason) => {
                    tracing::warn!(
                        stage = %artifact.stage,
                        "Excluding artifact '{}' from confidence: {}",
                        artifact.label,
                        reason
                    );
                    report.excluded.push(ExcludedArtifact {
                        index,
                        stage: artifact.stage,
                        label: artifact.label,
                        reason,
                    });
                }
            }
        }

        if !report.scores.is_empty() {
            let sum: f64 = report.scores.iter().map(|s| s.score).sum();
            report.confidence = round_confidence(sum / report.scores.len() as f64);
        }

        tracing::info!(
            "Confidence {} from {} scored artifacts ({} excluded, oracle: {})",
            report.confidence,
            report.scores.len(),
            report.excluded.len(),
            self.oracle.name()
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{text_artifact, ScriptedOracle};

    fn aggregator(oracle: ScriptedOracle) -> ConfidenceAggregator {
        ConfidenceAggregator::new(Arc::new(oracle), &AuditorConfig::default())
    }

    #[tokio::test]
    async fn test_zero_artifacts_is_zero_confidence() {
        let report = aggregator(ScriptedOracle::scores(&[])).aggregate(&[]).await;
        assert_eq!(report.confidence, 0.0);
        assert!(report.scores.is_empty());
    }

    #[tokio::test]
    async fn test_mean_of_scores() {
        let artifacts: Vec<_> = (0..3).map(|i| text_artifact(&format!("a{}", i))).collect();
        let report = aggregator(ScriptedOracle::scores(&[0.9, 0.6, 0.3]))
            .aggregate(&artifacts)
            .await;

        assert_eq!(report.confidence, 0.6);
        assert_eq!(report.scores.len(), 3);
        assert_eq!(report.score_for(1), Some(0.6));
    }

    #[tokio::test]
    async fn test_aggregate_runs_on_spawned_task() {
        let aggregator = Arc::new(aggregator(ScriptedOracle::scores(&[0.4, 0.8])));
        let artifacts: Vec<_> = (0..2).map(|i| text_artifact(&format!("a{}", i))).collect();

        let handle = tokio::spawn(async move { aggregator.aggregate(&artifacts).await });
        let report = handle.await.unwrap();
        assert_eq!(report.confidence, 0.6);
    }

    #[tokio::test]
    async fn test_failed_call_is_excluded_from_mean() {
        let artifacts: Vec<_> = (0..4).map(|i| text_artifact(&format!("a{}", i))).collect();
        let oracle = ScriptedOracle::scripted(vec![Ok(0.8), Err("model offline"), Ok(0.4), Ok(0.9)]);

        let report = aggregator(oracle).aggregate(&artifacts).await;

        assert_eq!(report.confidence, 0.7);
        assert_eq!(report.excluded.len(), 1);
        assert_eq!(report.excluded[0].label, "a1");
    }

    #[tokio::test]
    async fn test_all_calls_failing_is_zero() {
        let artifacts: Vec<_> = (0..2).map(|i| text_artifact(&format!("a{}", i))).collect();
        let oracle = ScriptedOracle::scripted(vec![Err("down"), Err("down")]);

        let report = aggregator(oracle).aggregate(&artifacts).await;
        assert_eq!(report.confidence, 0.0);
        assert_eq!(report.excluded.len(), 2);
    }

    /// Answers 0.5 except for one label, which never returns in time
    struct SlowOracle;

    #[async_trait::async_trait]
    impl AuditorOracle for SlowOracle {
        async fn score(
            &self,
            _evidence: &crate::types::Evidence,
            label: &str,
            _context: &AuditContext,
        ) -> crate::Result<f64> {
            if label == "a1" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok(0.5)
        }

        fn name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_timed_out_call_is_excluded() {
        let config = AuditorConfig {
            timeout_secs: 1,
            ..AuditorConfig::default()
        };
        let aggregator = ConfidenceAggregator::new(Arc::new(SlowOracle), &config);
        let artifacts: Vec<_> = (0..3).map(|i| text_artifact(&format!("a{}", i))).collect();

        let report = aggregator.aggregate(&artifacts).await;
        assert_eq!(report.confidence, 0.5);
        assert_eq!(report.scores.len(), 2);
        assert_eq!(report.excluded[0].label, "a1");
        assert!(report.excluded[0].reason.contains("timed out"));
    }

    #[test]
    fn test_rounding() {
        assert_eq!(round_confidence(0.666_666), 0.67);
        assert_eq!(round_confidence((0.9 + 0.6 + 0.3) / 3.0), 0.6);
        assert_eq!(round_confidence(0.0), 0.0);
    }
}
