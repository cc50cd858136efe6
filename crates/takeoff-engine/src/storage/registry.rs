//! Run registry contract and lazy scanning

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

use crate::error::Result;
use crate::types::{JobRecord, RecordPatch, RunId, RunStatus, Trigger};

/// Records fetched per page when no size is given
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

/// Durable store of run records.
///
/// Every mutation is a single-record partial update. Terminal transitions go through
/// [`RunRegistry::update_if_status`], so concurrent writers racing on the same record resolve to
/// exactly one winner.
pub trait RunRegistry: Send + Sync {
    /// Insert a new RUNNING record. Fails with `DuplicateRunId` if the id exists.
    fn create(&self, run_id: &RunId, input_ref: &str, trigger: Trigger) -> Result<JobRecord>;

    /// Fetch a record. Fails with `NotFound`.
    fn get(&self, run_id: &RunId) -> Result<JobRecord>;

    /// Apply `patch` only if the record's status is still `expected`.
    ///
    /// Returns `Ok(false)` when the precondition fails (including an unknown run id). A patch
    /// that would move a terminal record to another status is rejected with
    /// `InvalidTransition` before storage is touched.
    fn update_if_status(&self, run_id: &RunId, expected: RunStatus, patch: &RecordPatch)
        -> Result<bool>;

    /// Unguarded liveness write. Never moves `last_heartbeat` backwards.
    fn touch_heartbeat(&self, run_id: &RunId, at: DateTime<Utc>) -> Result<()>;

    /// One page of matching records ordered by run id, strictly after `after`
    fn scan_page(&self, filter: &ScanFilter, after: Option<&RunId>, limit: usize)
        -> Result<Vec<JobRecord>>;
}

impl dyn RunRegistry {
    /// Lazily iterate every matching record, one page in memory at a time
    pub fn scan(&self, filter: ScanFilter) -> RegistryScan<'_> {
        RegistryScan::new(self, filter, DEFAULT_SCAN_PAGE_SIZE)
    }

    pub fn scan_paged(&self, filter: ScanFilter, page_size: usize) -> RegistryScan<'_> {
        RegistryScan::new(self, filter, page_size)
    }
}

/// Record selection for scans
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanFilter {
    pub status: Option<RunStatus>,
    /// Only records whose heartbeat is strictly older than this
    pub heartbeat_before: Option<DateTime<Utc>>,
}

impl ScanFilter {
    pub fn running() -> Self {
        Self {
            status: Some(RunStatus::Running),
            heartbeat_before: None,
        }
    }

    /// RUNNING records with no heartbeat since `cutoff`
    pub fn stale(cutoff: DateTime<Utc>) -> Self {
        Self {
            status: Some(RunStatus::Running),
            heartbeat_before: Some(cutoff),
        }
    }

    pub fn matches(&self, record: &JobRecord) -> bool {
        self.status.map_or(true, |s| record.status == s)
            && self
                .heartbeat_before
                .map_or(true, |cutoff| record.last_heartbeat < cutoff)
    }
}

/// Keyset-paginated iterator over a registry.
///
/// Records mutated after being yielded do not shift the cursor, so a scan that fails records as
/// it goes still visits every match exactly once. Not resumable after an error.
pub struct RegistryScan<'a> {
    registry: &'a dyn RunRegistry,
    filter: ScanFilter,
    page_size: usize,
    cursor: Option<RunId>,
    buffer: VecDeque<JobRecord>,
    exhausted: bool,
}

impl<'a> RegistryScan<'a> {
    pub fn new(registry: &'a dyn RunRegistry, filter: ScanFilter, page_size: usize) -> Self {
        Self {
            registry,
            filter,
            page_size: page_size.max(1),
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }

    fn fill(&mut self) -> Result<()> {
        let page = self
            .registry
            .scan_page(&self.filter, self.cursor.as_ref(), self.page_size)?;

        if page.len() < self.page_size {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.cursor = Some(last.run_id.clone());
        }
        self.buffer.extend(page);
        Ok(())
    }
}

impl Iterator for RegistryScan<'_> {
    type Item = Result<JobRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
