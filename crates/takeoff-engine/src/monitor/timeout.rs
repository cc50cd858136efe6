//! Timeout & retry monitor
//!
//! Relabels runs that stopped heartbeating. It never signals or cancels the executor itself: a
//! hung stage keeps running until the process restarts, while clients see the run as FAILED.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::{MonitorConfig, MAX_INTERVAL_SECS};
use crate::error::Result;
use crate::storage::{RunRegistry, ScanFilter, DEFAULT_SCAN_PAGE_SIZE};
use crate::types::{FailureDetail, JobRecord, RecordPatch, RunStatus};

/// What one monitor wake did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MonitorTickReport {
    /// Stale records seen
    pub scanned: usize,
    /// Granted another timeout window
    pub retried: usize,
    /// Failed with cause timeout
    pub failed: usize,
    /// Record left RUNNING before our guarded write
    pub lost_races: usize,
    /// Guarded writes that errored
    pub write_errors: usize,
}

#[derive(Clone)]
pub struct TimeoutMonitor {
    registry: Arc<dyn RunRegistry>,
    timeout_window: chrono::Duration,
    max_retries: u32,
    interval: Duration,
    page_size: usize,
}

impl TimeoutMonitor {
    pub fn new(registry: Arc<dyn RunRegistry>, config: &MonitorConfig) -> Self {
        Self {
            registry,
            timeout_window: window(config),
            max_retries: config.max_retries,
            interval: config
                .monitor_interval()
                .min(Duration::from_secs(MAX_INTERVAL_SECS)),
            page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Override the wake cadence
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn tick(&self) -> Result<MonitorTickReport> {
        self.tick_at(Utc::now())
    }

    /// One sweep over RUNNING records whose heartbeat is older than `now - timeout_window`
    pub fn tick_at(&self, now: DateTime<Utc>) -> Result<MonitorTickReport> {
        let cutoff = now - self.timeout_window;
        let mut report = MonitorTickReport::default();

        for record in self
            .registry
            .scan_paged(ScanFilter::stale(cutoff), self.page_size)
        {
            let record = record?;
            report.scanned += 1;

            if record.retry_count < self.max_retries {
                self.retry(&record, now, &mut report);
            } else {
                self.fail(&record, now, &mut report);
            }
        }

        Ok(report)
    }

    fn retry(&self, record: &JobRecord, now: DateTime<Utc>, report: &mut MonitorTickReport) {
        let patch = RecordPatch::retry(now);
        match self
            .registry
            .update_if_status(&record.run_id, RunStatus::Running, &patch)
        {
            Ok(true) => {
                report.retried += 1;
                tracing::warn!(
                    run_id = %record.run_id,
                    "Run idle for {}s, granting retry {}/{}",
                    record.idle_for(now).num_seconds(),
                    record.retry_count + 1,
                    self.max_retries
                );
            }
            Ok(false) => report.lost_races += 1,
            Err(e) => {
                report.write_errors += 1;
                tracing::error!(run_id = %record.run_id, "Failed to record retry: {}", e);
            }
        }
    }

    fn fail(&self, record: &JobRecord, now: DateTime<Utc>, report: &mut MonitorTickReport) {
        let detail = FailureDetail::timeout(record, now);
        let patch = RecordPatch::fail(detail, now);
        match self
            .registry
            .update_if_status(&record.run_id, RunStatus::Running, &patch)
        {
            Ok(true) => {
                report.failed += 1;
                tracing::error!(
                    run_id = %record.run_id,
                    "Run timed out after {} retries (runtime {}s, idle {}s)",
                    record.retry_count,
                    record.elapsed(now).num_seconds(),
                    record.idle_for(now).num_seconds()
                );
            }
            Ok(false) => report.lost_races += 1,
            Err(e) => {
                report.write_errors += 1;
                tracing::error!(run_id = %record.run_id, "Failed to record timeout: {}", e);
            }
        }
    }

    /// Wake every interval until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Timeout monitor started: window {}s, {} retries, every {:?}",
            self.timeout_window.num_seconds(),
            self.max_retries,
            self.interval
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let monitor = self.clone();
                    match tokio::task::spawn_blocking(move || monitor.tick()).await {
                        Ok(Ok(report)) if report.scanned > 0 => {
                            tracing::info!(?report, "Monitor tick");
                        }
                        Ok(Ok(_)) => tracing::debug!("Monitor tick: no stale runs"),
                        Ok(Err(e)) => tracing::error!("Monitor tick failed: {}", e),
                        Err(e) => tracing::error!("Monitor tick task error: {}", e),
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Timeout monitor stopped");
    }
}

/// Staleness window, clamped so `now - window` stays representable
fn window(config: &MonitorConfig) -> chrono::Duration {
    let max = Duration::from_secs(MAX_INTERVAL_SECS);
    chrono::Duration::from_std(config.timeout_window().min(max))
        .unwrap_or_else(|_| chrono::Duration::seconds(MAX_INTERVAL_SECS as i64))
}
