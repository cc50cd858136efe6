//! In-process fakes shared by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use crate::confidence::{AuditContext, AuditorOracle, ConfidenceReport};
use crate::error::{Error, Result};
use crate::export::{ArtifactStore, FailureRecord};
use crate::pipeline::{
    AreaTakeoff, PageClassifier, ScaleCalibrator, SpecExtractor, StageContext, TagSurveyor,
};
use crate::storage::{RunRegistry, ScanFilter, SqliteRunRegistry};
use crate::types::{
    DebugArtifact, Evidence, ExportReceipt, JobRecord, LineItem, OpeningSpec, PageClassification,
    PageKind, RecordPatch, RunId, RunResult, RunStatus, ScaleData, SpecLibrary, StageKind,
    StageResult, SurveyData, TakeoffOutput, Trigger,
};

pub fn text_artifact(label: &str) -> DebugArtifact {
    DebugArtifact::text(StageKind::Classification, label, format!("evidence for {}", label))
}

/// Poll until the run leaves RUNNING
pub async fn wait_for_terminal(registry: &dyn RunRegistry, run_id: &RunId) -> JobRecord {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let record = registry.get(run_id).unwrap();
        if record.is_terminal() {
            return record;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {} never reached a terminal status",
            run_id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Order in which fake stages were entered
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<StageKind>>>);

impl CallLog {
    pub fn snapshot(&self) -> Vec<StageKind> {
        self.0.lock().clone()
    }

    fn record(&self, stage: StageKind) {
        self.0.lock().push(stage);
    }
}

/// Holds a stage until the test releases it
#[derive(Clone, Default)]
pub struct StageGate {
    entered: Arc<Notify>,
    released: Arc<Notify>,
}

impl StageGate {
    pub async fn wait_entered(&self) {
        self.entered.notified().await;
    }

    pub fn release(&self) {
        self.released.notify_one();
    }

    async fn pass(&self) {
        self.entered.notify_one();
        self.released.notified().await;
    }
}

/// Deterministic five-stage pipeline over a small three-page drawing set
#[derive(Default)]
pub struct FakeStages {
    artifact_labels: Vec<String>,
    fail_at: Option<StageKind>,
    panic_at: Option<StageKind>,
    calls: CallLog,
    gates: Mutex<HashMap<StageKind, StageGate>>,
}

impl FakeStages {
    /// Classification emits one text artifact per label
    pub fn with_artifacts(mut self, labels: &[&str]) -> Self {
        self.artifact_labels = labels.iter().map(|l| l.to_string()).collect();
        self
    }

    pub fn failing_at(mut self, stage: StageKind) -> Self {
        self.fail_at = Some(stage);
        self
    }

    pub fn panicking_at(mut self, stage: StageKind) -> Self {
        self.panic_at = Some(stage);
        self
    }

    pub fn calls(&self) -> CallLog {
        self.calls.clone()
    }

    pub fn gate(&self, stage: StageKind) -> StageGate {
        self.gates.lock().entry(stage).or_default().clone()
    }

    async fn enter(&self, stage: StageKind) -> Result<()> {
        self.calls.record(stage);

        let gate = self.gates.lock().get(&stage).cloned();
        if let Some(gate) = gate {
            gate.pass().await;
        }

        if self.panic_at == Some(stage) {
            panic!("simulated crash in {}", stage);
        }
        if self.fail_at == Some(stage) {
            return Err(Error::stage(stage, "simulated failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl PageClassifier for FakeStages {
    async fn execute(&self, _ctx: &StageContext) -> Result<StageResult<Vec<PageClassification>>> {
        self.enter(StageKind::Classification).await?;

        let page = |page, kind| PageClassification {
            page,
            kind,
            reason: "Title Block Match".to_string(),
        };
        let pages = vec![
            page(1, PageKind::Schedule),
            page(2, PageKind::ExteriorElevation),
            page(3, PageKind::ExteriorElevation),
        ];
        let artifacts = self.artifact_labels.iter().map(|l| text_artifact(l)).collect();
        Ok(StageResult::with_artifacts(pages, artifacts))
    }
}

#[async_trait]
impl SpecExtractor for FakeStages {
    async fn execute(
        &self,
        _ctx: &StageContext,
        _spec_pages: &[PageClassification],
    ) -> Result<StageResult<SpecLibrary>> {
        self.enter(StageKind::SpecExtraction).await?;

        let mut specs = SpecLibrary::default();
        specs.windows.insert(
            "W1".to_string(),
            OpeningSpec {
                width_ft: 4.0,
                height_ft: 5.0,
                raw_width: Some("4'-0\"".to_string()),
                raw_height: Some("5'-0\"".to_string()),
                category: Some("window".to_string()),
            },
        );
        Ok(StageResult::new(specs))
    }
}

#[async_trait]
impl TagSurveyor for FakeStages {
    async fn execute(
        &self,
        _ctx: &StageContext,
        elevation_pages: &[u32],
        _specs: &SpecLibrary,
    ) -> Result<StageResult<SurveyData>> {
        self.enter(StageKind::Survey).await?;

        let mut survey = SurveyData::new();
        for page in elevation_pages {
            survey
                .entry(*page)
                .or_default()
                .insert("North".to_string(), BTreeMap::from([("W1".to_string(), 2)]));
        }
        let logs = elevation_pages
            .iter()
            .map(|page| format!("P{}: - North: Found {{'W1': 2}}", page))
            .collect();
        Ok(StageResult::new(survey).with_logs(logs))
    }
}

#[async_trait]
impl ScaleCalibrator for FakeStages {
    async fn execute(
        &self,
        _ctx: &StageContext,
        elevation_pages: &[u32],
    ) -> Result<StageResult<ScaleData>> {
        self.enter(StageKind::Calibration).await?;

        let scales = elevation_pages
            .iter()
            .map(|page| (*page, BTreeMap::from([("North".to_string(), 48.0)])))
            .collect();
        let logs = elevation_pages
            .iter()
            .map(|page| format!("P{}: - North: SUCCESS. Scale = 48.0 pts/ft", page))
            .collect();
        Ok(StageResult::new(scales).with_logs(logs))
    }
}

#[async_trait]
impl AreaTakeoff for FakeStages {
    async fn execute(
        &self,
        _ctx: &StageContext,
        _survey: &SurveyData,
        _scales: &ScaleData,
        _specs: &SpecLibrary,
    ) -> Result<StageResult<TakeoffOutput>> {
        self.enter(StageKind::Takeoff).await?;

        let line_items = vec![
            LineItem {
                page: 2,
                view: "North".to_string(),
                category: "EIFS Wall".to_string(),
                description: "Gross Facade Area (Vector)".to_string(),
                dimensions: None,
                count: 1,
                unit_sf: 1200.0,
                total_sf: 1200.0,
            },
            LineItem {
                page: 2,
                view: "North".to_string(),
                category: "Deduction".to_string(),
                description: "W1 window".to_string(),
                dimensions: Some("4' x 5'".to_string()),
                count: 4,
                unit_sf: 20.0,
                total_sf: -80.0,
            },
        ];
        Ok(StageResult::new(TakeoffOutput {
            line_items,
            grand_total: 1120.0,
        }))
    }
}

/// Auditor answering from a table keyed by artifact label ("a0", "a1", ...)
pub struct ScriptedOracle {
    answers: HashMap<String, std::result::Result<f64, String>>,
}

impl ScriptedOracle {
    pub fn scores(scores: &[f64]) -> Self {
        Self::scripted(scores.iter().map(|s| Ok(*s)).collect())
    }

    pub fn scripted(answers: Vec<std::result::Result<f64, &'static str>>) -> Self {
        Self {
            answers: answers
                .into_iter()
                .enumerate()
                .map(|(i, answer)| (format!("a{}", i), answer.map_err(str::to_string)))
                .collect(),
        }
    }
}

#[async_trait]
impl AuditorOracle for ScriptedOracle {
    async fn score(&self, _evidence: &Evidence, label: &str, _context: &AuditContext) -> Result<f64> {
        match self.answers.get(label) {
            Some(Ok(score)) => Ok(*score),
            Some(Err(message)) => Err(Error::auditor(message.clone())),
            None => Err(Error::auditor(format!("no scripted score for {}", label))),
        }
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

/// Keeps exports and failure records in memory
#[derive(Default)]
pub struct MemoryStore {
    exported: Mutex<Vec<RunId>>,
    failures: Mutex<Vec<FailureRecord>>,
}

impl MemoryStore {
    pub fn exported(&self) -> Vec<RunId> {
        self.exported.lock().clone()
    }

    pub fn failures(&self) -> Vec<FailureRecord> {
        self.failures.lock().clone()
    }
}

#[async_trait]
impl ArtifactStore for MemoryStore {
    async fn export(
        &self,
        run_id: &RunId,
        _result: &RunResult,
        _report: &ConfidenceReport,
        _artifacts: &[DebugArtifact],
    ) -> Result<ExportReceipt> {
        self.exported.lock().push(run_id.clone());
        Ok(ExportReceipt {
            location: format!("memory://{}", run_id),
            files: Vec::new(),
        })
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<PathBuf> {
        self.failures.lock().push(record.clone());
        Ok(PathBuf::from(format!("memory://errors/{}", record.run_id)))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Store whose every write fails
pub struct FailingStore;

#[async_trait]
impl ArtifactStore for FailingStore {
    async fn export(
        &self,
        _run_id: &RunId,
        _result: &RunResult,
        _report: &ConfidenceReport,
        _artifacts: &[DebugArtifact],
    ) -> Result<ExportReceipt> {
        Err(Error::export("bucket unavailable"))
    }

    async fn record_failure(&self, _record: &FailureRecord) -> Result<PathBuf> {
        Err(Error::export("disk full"))
    }

    fn name(&self) -> &str {
        "failing"
    }
}

/// SQLite registry with switchable write failures and call counters
pub struct FlakyRegistry {
    inner: SqliteRunRegistry,
    fail_heartbeats: AtomicBool,
    fail_creates: AtomicBool,
    fail_terminal_writes: AtomicBool,
    failing_runs: Mutex<HashSet<RunId>>,
    heartbeat_attempts: AtomicUsize,
    terminal_attempts: AtomicUsize,
}

impl FlakyRegistry {
    pub fn new() -> Self {
        Self {
            inner: SqliteRunRegistry::in_memory().unwrap(),
            fail_heartbeats: AtomicBool::new(false),
            fail_creates: AtomicBool::new(false),
            fail_terminal_writes: AtomicBool::new(false),
            failing_runs: Mutex::new(HashSet::new()),
            heartbeat_attempts: AtomicUsize::new(0),
            terminal_attempts: AtomicUsize::new(0),
        }
    }

    pub fn fail_heartbeats(&self, fail: bool) {
        self.fail_heartbeats.store(fail, Ordering::SeqCst);
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    /// Fail every guarded write that sets a status
    pub fn fail_terminal_writes(&self, fail: bool) {
        self.fail_terminal_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail status writes for one run only
    pub fn fail_status_writes_for(&self, run_id: &RunId) {
        self.failing_runs.lock().insert(run_id.clone());
    }

    pub fn heartbeat_attempts(&self) -> usize {
        self.heartbeat_attempts.load(Ordering::SeqCst)
    }

    pub fn terminal_attempts(&self) -> usize {
        self.terminal_attempts.load(Ordering::SeqCst)
    }
}

impl RunRegistry for FlakyRegistry {
    fn create(&self, run_id: &RunId, input_ref: &str, trigger: Trigger) -> Result<JobRecord> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(Error::storage("connection refused"));
        }
        self.inner.create(run_id, input_ref, trigger)
    }

    fn get(&self, run_id: &RunId) -> Result<JobRecord> {
        self.inner.get(run_id)
    }

    fn update_if_status(
        &self,
        run_id: &RunId,
        expected: RunStatus,
        patch: &RecordPatch,
    ) -> Result<bool> {
        if patch.status.is_some() {
            self.terminal_attempts.fetch_add(1, Ordering::SeqCst);
            if self.fail_terminal_writes.load(Ordering::SeqCst)
                || self.failing_runs.lock().contains(run_id)
            {
                return Err(Error::storage("write timed out"));
            }
        }
        self.inner.update_if_status(run_id, expected, patch)
    }

    fn touch_heartbeat(&self, run_id: &RunId, at: DateTime<Utc>) -> Result<()> {
        self.heartbeat_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_heartbeats.load(Ordering::SeqCst) {
            return Err(Error::storage("write timed out"));
        }
        self.inner.touch_heartbeat(run_id, at)
    }

    fn scan_page(
        &self,
        filter: &ScanFilter,
        after: Option<&RunId>,
        limit: usize,
    ) -> Result<Vec<JobRecord>> {
        self.inner.scan_page(filter, after, limit)
    }
}
