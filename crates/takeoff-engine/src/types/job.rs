//! Run records and the partial updates applied to them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::error::Error;

use super::stage::StageKind;
use super::takeoff::{LineItem, ScaleData, SpecLibrary, SurveyData};

/// Opaque run identifier, immutable once assigned
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Run status. RUNNING is initial; COMPLETED and FAILED are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "RUNNING",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(RunStatus::Running),
            "COMPLETED" => Some(RunStatus::Completed),
            "FAILED" => Some(RunStatus::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What created the run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    #[default]
    Api,
    Intake,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Api => "api",
            Trigger::Intake => "intake",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "intake" => Trigger::Intake,
            _ => Trigger::Api,
        }
    }
}

/// Why a run ended in FAILED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    StageFailure,
    Timeout,
    CrashRecovery,
}

/// Structured failure description stored on FAILED records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub cause: FailureCause,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageKind>,
    /// Total runtime when the failure was declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_secs: Option<i64>,
    /// Time since the last heartbeat when the failure was declared
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idle_secs: Option<i64>,
}

impl FailureDetail {
    pub fn stage_failure(err: &Error) -> Self {
        Self {
            cause: FailureCause::StageFailure,
            message: err.to_string(),
            stage: err.failed_stage(),
            elapsed_secs: None,
            idle_secs: None,
        }
    }

    pub fn timeout(record: &JobRecord, now: DateTime<Utc>) -> Self {
        let elapsed = record.elapsed(now).num_seconds();
        let idle = record.idle_for(now).num_seconds();
        Self {
            cause: FailureCause::Timeout,
            message: format!(
                "No heartbeat for {}s after {} retries (total runtime {}s)",
                idle, record.retry_count, elapsed
            ),
            stage: None,
            elapsed_secs: Some(elapsed),
            idle_secs: Some(idle),
        }
    }

    pub fn crash_recovery(record: &JobRecord, now: DateTime<Utc>) -> Self {
        Self {
            cause: FailureCause::CrashRecovery,
            message: "Run was in flight when the previous process stopped".to_string(),
            stage: None,
            elapsed_secs: Some(record.elapsed(now).num_seconds()),
            idle_secs: Some(record.idle_for(now).num_seconds()),
        }
    }
}

/// Wall time spent in one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTiming {
    pub stage: StageKind,
    pub duration_ms: u64,
}

/// One captured log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// Log lines of one run, bucketed by stage. Lines outside any stage go to `general`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunLogs {
    #[serde(default)]
    pub stages: BTreeMap<StageKind, Vec<LogEntry>>,
    #[serde(default)]
    pub general: Vec<LogEntry>,
}

impl RunLogs {
    pub fn stage(&self, stage: StageKind) -> &[LogEntry] {
        self.stages.get(&stage).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn total(&self) -> usize {
        self.general.len() + self.stages.values().map(Vec::len).sum::<usize>()
    }
}

/// Structured executor output, present only on COMPLETED records
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
    pub elevation_pages: Vec<u32>,
    pub project_specs: SpecLibrary,
    pub survey_data: SurveyData,
    pub scale_data: ScaleData,
    pub line_items: Vec<LineItem>,
    pub grand_total: f64,
    #[serde(default)]
    pub stage_timings: Vec<StageTiming>,
    #[serde(default)]
    pub artifact_count: usize,
    #[serde(default)]
    pub logs: RunLogs,
}

/// A file written by the artifact store
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportedFile {
    pub kind: String,
    pub path: String,
    #[serde(default)]
    pub content_type: Option<String>,
}

/// Where a run's outputs were written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExportReceipt {
    pub location: String,
    pub files: Vec<ExportedFile>,
}

/// Export state of a COMPLETED run. Never affects the run status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum UploadStatus {
    Exported { receipt: ExportReceipt },
    Failed { message: String },
}

/// One record per run; the single source of truth for run status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub run_id: RunId,
    pub status: RunStatus,
    pub input_ref: String,
    #[serde(default)]
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub retry_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload: Option<UploadStatus>,
}

impl JobRecord {
    /// New RUNNING record
    pub fn new(run_id: RunId, input_ref: String, trigger: Trigger, now: DateTime<Utc>) -> Self {
        Self {
            run_id,
            status: RunStatus::Running,
            input_ref,
            trigger,
            started_at: now,
            last_heartbeat: now,
            retry_count: 0,
            result: None,
            confidence: None,
            error: None,
            ended_at: None,
            upload: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn elapsed(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.started_at
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat
    }
}

/// Partial update keyed by run id, applied atomically by the registry
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub status: Option<RunStatus>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Applied in storage as `retry_count = retry_count + 1`
    pub increment_retry: bool,
    pub result: Option<RunResult>,
    pub confidence: Option<f64>,
    pub error: Option<FailureDetail>,
    pub ended_at: Option<DateTime<Utc>>,
    pub upload: Option<UploadStatus>,
}

impl RecordPatch {
    /// RUNNING -> COMPLETED with the executor output
    pub fn complete(result: RunResult, confidence: f64, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Completed),
            result: Some(result),
            confidence: Some(confidence),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    /// RUNNING -> FAILED
    pub fn fail(detail: FailureDetail, at: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Failed),
            error: Some(detail),
            ended_at: Some(at),
            ..Default::default()
        }
    }

    /// Monitor grace period: refresh the heartbeat and count the retry
    pub fn retry(at: DateTime<Utc>) -> Self {
        Self {
            last_heartbeat: Some(at),
            increment_retry: true,
            ..Default::default()
        }
    }

    pub fn upload(status: UploadStatus) -> Self {
        Self {
            upload: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.last_heartbeat.is_none()
            && !self.increment_retry
            && self.result.is_none()
            && self.confidence.is_none()
            && self.error.is_none()
            && self.ended_at.is_none()
            && self.upload.is_none()
    }

    /// Only the upload status is written after completion
    pub fn is_upload_only(&self) -> bool {
        self.upload.is_some()
            && Self {
                upload: None,
                ..self.clone()
            }
            .is_empty()
    }

    /// Terminal records are frozen apart from the upload status of a COMPLETED run
    pub fn check_transition(&self, expected: RunStatus) -> crate::Result<()> {
        if !expected.is_terminal() {
            return Ok(());
        }
        if expected == RunStatus::Completed && self.is_upload_only() {
            return Ok(());
        }
        Err(Error::InvalidTransition(match self.status {
            Some(next) => format!("{} is terminal, cannot move to {}", expected, next),
            None => format!("{} is terminal, record cannot change", expected),
        }))
    }
}
