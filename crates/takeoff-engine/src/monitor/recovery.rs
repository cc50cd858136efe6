//! Startup reconciliation of runs orphaned by a previous process

use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;

use crate::storage::{RunRegistry, ScanFilter, DEFAULT_SCAN_PAGE_SIZE};
use crate::types::{FailureDetail, RecordPatch, RunId, RunStatus};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Runs moved to FAILED/crash_recovery
    pub recovered: Vec<RunId>,
    /// Runs that left RUNNING before the sweep reached them
    pub skipped: usize,
    /// Runs still RUNNING because their FAILED write errored
    pub write_errors: Vec<RunId>,
    /// Set when the registry scan itself broke off
    pub scan_error: Option<String>,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.write_errors.is_empty() && self.scan_error.is_none()
    }
}

/// Fails every RUNNING record at process start.
///
/// Must run before any executor is spawned: at that point no record can have a live executor, so
/// no heartbeat threshold is checked.
pub struct RecoverySweep {
    registry: Arc<dyn RunRegistry>,
    page_size: usize,
}

impl RecoverySweep {
    pub fn new(registry: Arc<dyn RunRegistry>) -> Self {
        Self {
            registry,
            page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Never fails: registry errors are logged and reported, and the sweep moves on
    pub fn run(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();

        for record in self
            .registry
            .scan_paged(ScanFilter::running(), self.page_size)
        {
            let record = match record {
                Ok(record) => record,
                Err(e) => {
                    tracing::error!("Recovery scan aborted: {}", e);
                    report.scan_error = Some(e.to_string());
                    break;
                }
            };
            let now = Utc::now();
            let patch = RecordPatch::fail(FailureDetail::crash_recovery(&record, now), now);

            match self
                .registry
                .update_if_status(&record.run_id, RunStatus::Running, &patch)
            {
                Ok(true) => {
                    tracing::warn!(
                        run_id = %record.run_id,
                        "Recovered orphaned run (started {}, last heartbeat {})",
                        record.started_at,
                        record.last_heartbeat
                    );
                    report.recovered.push(record.run_id);
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    tracing::error!(run_id = %record.run_id, "Could not fail orphaned run: {}", e);
                    report.write_errors.push(record.run_id);
                }
            }
        }

        tracing::info!(
            "Recovery sweep failed {} orphaned runs ({} write errors)",
            report.recovered.len(),
            report.write_errors.len()
        );
        report
    }
}
