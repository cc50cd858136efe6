//! Artifact store for result bundles and local failure records
//!
//! Exports happen after a run is COMPLETED; their failure is recorded on the run's upload status
//! and never changes the run's status.

mod local;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::confidence::ConfidenceReport;
use crate::error::{Error, Result};
use crate::types::{DebugArtifact, ExportReceipt, RunId, RunLogs, RunResult, StageKind};

pub use local::LocalArtifactStore;

/// Local record of a failed run, written before the terminal registry write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub run_id: RunId,
    pub input_ref: String,
    pub failed_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    pub message: String,
    /// Error followed by each underlying source
    pub causes: Vec<String>,
    /// Run log up to the failure
    #[serde(default)]
    pub logs: RunLogs,
}

impl FailureRecord {
    pub fn new(run_id: &RunId, input_ref: &str, err: &Error, failed_at: DateTime<Utc>) -> Self {
        let mut causes = Vec::new();
        let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
        while let Some(current) = source {
            causes.push(current.to_string());
            source = current.source();
        }

        Self {
            run_id: run_id.clone(),
            input_ref: input_ref.to_string(),
            failed_at,
            stage: err.failed_stage(),
            message: err.to_string(),
            causes,
            logs: RunLogs::default(),
        }
    }

    pub fn with_logs(mut self, logs: RunLogs) -> Self {
        self.logs = logs;
        self
    }
}

/// Destination for run outputs
///
/// Implementations:
/// - `LocalArtifactStore`: result JSON, line-item CSV and debug bundle on the local filesystem
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Write the result bundle of a COMPLETED run
    async fn export(
        &self,
        run_id: &RunId,
        result: &RunResult,
        report: &ConfidenceReport,
        artifacts: &[DebugArtifact],
    ) -> Result<ExportReceipt>;

    /// Persist a failure record, returning where it was written
    async fn record_failure(&self, record: &FailureRecord) -> Result<PathBuf>;

    /// Store name for logging
    fn name(&self) -> &str;
}
