//! Runs the five-stage pipeline for one run and performs its terminal write

use chrono::Utc;
use dashmap::DashMap;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;

use super::heartbeat::HeartbeatEmitter;
use super::run_log::LogCollector;
use super::stages::{StageContext, StageSet};
use crate::confidence::{ConfidenceAggregator, ConfidenceReport};
use crate::error::{Error, Result};
use crate::export::{ArtifactStore, FailureRecord};
use crate::storage::RunRegistry;
use crate::types::takeoff::{elevation_pages, spec_pages};
use crate::types::{
    DebugArtifact, FailureDetail, RecordPatch, RunId, RunResult, RunStatus, StageKind,
    StageResult, StageTiming, UploadStatus,
};

/// How an executor invocation ended
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// COMPLETED was committed
    Completed { confidence: f64 },
    /// FAILED was committed
    Failed { stage: Option<StageKind> },
    /// Another writer made the record terminal first
    Superseded,
    /// The terminal write itself failed; the monitor will time the run out
    Unrecorded,
    /// An executor for this run id was already active
    AlreadyActive,
}

/// Executes runs. One instance is shared by every run of the process.
pub struct PipelineExecutor {
    registry: Arc<dyn RunRegistry>,
    stages: StageSet,
    aggregator: Arc<ConfidenceAggregator>,
    store: Arc<dyn ArtifactStore>,
    heartbeat: HeartbeatEmitter,
    active: DashMap<RunId, Instant>,
}

/// Removes the run from the active set when the executor finishes, even by panic
struct ActiveGuard<'a> {
    active: &'a DashMap<RunId, Instant>,
    run_id: RunId,
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.active.remove(&self.run_id);
    }
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<dyn RunRegistry>,
        stages: StageSet,
        aggregator: Arc<ConfidenceAggregator>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        Self {
            heartbeat: HeartbeatEmitter::new(registry.clone()),
            registry,
            stages,
            aggregator,
            store,
            active: DashMap::new(),
        }
    }

    /// Number of runs currently executing
    pub fn in_flight(&self) -> usize {
        self.active.len()
    }

    pub fn is_active(&self, run_id: &RunId) -> bool {
        self.active.contains_key(run_id)
    }

    /// Run the pipeline to a terminal write. Never returns an error.
    pub async fn run(&self, run_id: RunId, input_ref: String) -> RunOutcome {
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_guarded(run_id, input_ref).instrument(span).await
    }

    async fn run_guarded(&self, run_id: RunId, input_ref: String) -> RunOutcome {
        let _guard = match self.active.entry(run_id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                tracing::warn!("Executor already active for this run, refusing re-entry");
                return RunOutcome::AlreadyActive;
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(Instant::now());
                ActiveGuard {
                    active: &self.active,
                    run_id: run_id.clone(),
                }
            }
        };

        let log = LogCollector::new();
        log.info(None, format!("Starting pipeline for {}", input_ref));
        let ctx = StageContext { run_id, input_ref };
        let started = Instant::now();

        match self.execute_stages(&ctx, &log).await {
            Ok((result, artifacts)) => {
                log.info(
                    None,
                    format!(
                        "All stages finished in {:.1}s with {} artifacts",
                        started.elapsed().as_secs_f64(),
                        artifacts.len()
                    ),
                );
                self.finish_success(&ctx, &log, result, artifacts).await
            }
            Err(err) => self.finish_failure(&ctx, &log, err).await,
        }
    }

    /// Stages 1 -> 2 -> {3, 4} -> 5
    async fn execute_stages(
        &self,
        ctx: &StageContext,
        log: &LogCollector,
    ) -> Result<(RunResult, Vec<DebugArtifact>)> {
        let mut artifacts = Vec::new();
        let mut timings = Vec::with_capacity(StageKind::ALL.len());

        let (classified, timing) = self
            .stage(ctx, log, StageKind::Classification, self.stages.classifier.execute(ctx))
            .await?;
        timings.push(timing);
        artifacts.extend(classified.artifacts);

        let pages = classified.payload;
        let elevations = elevation_pages(&pages);
        let spec_input = spec_pages(&pages);
        log.info(
            Some(StageKind::Classification),
            format!(
                "Classified {} pages: {} elevations, {} spec sheets",
                pages.len(),
                elevations.len(),
                spec_input.len()
            ),
        );

        let (specs, timing) = self
            .stage(
                ctx,
                log,
                StageKind::SpecExtraction,
                self.stages.spec_extractor.execute(ctx, &spec_input),
            )
            .await?;
        timings.push(timing);
        artifacts.extend(specs.artifacts);
        let specs = specs.payload;
        if specs.is_empty() {
            log.warn(
                Some(StageKind::SpecExtraction),
                "No window or door types found; deductions will be empty",
            );
        }

        let ((survey, survey_timing), (scales, scale_timing)) = tokio::try_join!(
            self.stage(
                ctx,
                log,
                StageKind::Survey,
                self.stages.surveyor.execute(ctx, &elevations, &specs),
            ),
            self.stage(
                ctx,
                log,
                StageKind::Calibration,
                self.stages.calibrator.execute(ctx, &elevations),
            ),
        )?;
        timings.push(survey_timing);
        timings.push(scale_timing);
        artifacts.extend(survey.artifacts);
        artifacts.extend(scales.artifacts);
        let (survey, scales) = (survey.payload, scales.payload);

        let (takeoff, timing) = self
            .stage(
                ctx,
                log,
                StageKind::Takeoff,
                self.stages.takeoff.execute(ctx, &survey, &scales, &specs),
            )
            .await?;
        timings.push(timing);
        artifacts.extend(takeoff.artifacts);

        let result = RunResult {
            elevation_pages: elevations,
            project_specs: specs,
            survey_data: survey,
            scale_data: scales,
            grand_total: takeoff.payload.grand_total,
            line_items: takeoff.payload.line_items,
            stage_timings: timings,
            artifact_count: artifacts.len(),
            logs: Default::default(),
        };
        Ok((result, artifacts))
    }

    /// Heartbeat, then run one stage future, converting errors and panics into a stage failure
    async fn stage<T, F>(
        &self,
        ctx: &StageContext,
        log: &LogCollector,
        kind: StageKind,
        fut: F,
    ) -> Result<(StageResult<T>, StageTiming)>
    where
        F: Future<Output = Result<StageResult<T>>>,
    {
        self.heartbeat.beat(&ctx.run_id, kind);
        log.info(Some(kind), format!("Stage {} starting", kind.ordinal()));
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(fut).catch_unwind().await {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e @ Error::Stage { .. })) => Err(e),
            Ok(Err(e)) => Err(Error::stage(kind, e.to_string())),
            Err(panic) => Err(Error::stage(kind, format!("stage panicked: {}", panic_message(&*panic)))),
        };

        let timing = StageTiming {
            stage: kind,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        match outcome {
            Ok(mut output) => {
                log.extend_stage(kind, std::mem::take(&mut output.logs));
                log.info(
                    Some(kind),
                    format!(
                        "Stage {} finished in {}ms ({} artifacts)",
                        kind.ordinal(),
                        timing.duration_ms,
                        output.artifacts.len()
                    ),
                );
                Ok((output, timing))
            }
            Err(e) => {
                log.error(Some(kind), format!("Stage {} failed: {}", kind.ordinal(), e));
                Err(e)
            }
        }
    }

    async fn finish_success(
        &self,
        ctx: &StageContext,
        log: &LogCollector,
        mut result: RunResult,
        artifacts: Vec<DebugArtifact>,
    ) -> RunOutcome {
        let report = self.aggregator.aggregate(&artifacts).await;
        log.info(
            None,
            format!(
                "Confidence {} ({} scored, {} excluded)",
                report.confidence,
                report.scores.len(),
                report.excluded.len()
            ),
        );
        for excluded in &report.excluded {
            log.warn(
                Some(excluded.stage),
                format!("Artifact '{}' not scored: {}", excluded.label, excluded.reason),
            );
        }
        result.logs = log.snapshot();
        let patch = RecordPatch::complete(result.clone(), report.confidence, Utc::now());

        match self
            .registry
            .update_if_status(&ctx.run_id, RunStatus::Running, &patch)
        {
            Ok(true) => {
                tracing::info!("Run COMPLETED with confidence {}", report.confidence);
            }
            Ok(false) => {
                tracing::warn!("Run was already terminal, dropping COMPLETED result");
                return RunOutcome::Superseded;
            }
            Err(e) => {
                tracing::error!("Failed to record COMPLETED: {}", e);
                return RunOutcome::Unrecorded;
            }
        }

        self.export(ctx, &result, &report, &artifacts).await;
        RunOutcome::Completed {
            confidence: report.confidence,
        }
    }

    /// Export never changes the run status; its outcome lands in the upload field
    async fn export(
        &self,
        ctx: &StageContext,
        result: &RunResult,
        report: &ConfidenceReport,
        artifacts: &[DebugArtifact],
    ) {
        let upload = match self.store.export(&ctx.run_id, result, report, artifacts).await {
            Ok(receipt) => UploadStatus::Exported { receipt },
            Err(e) => {
                tracing::warn!("Export to {} failed: {}", self.store.name(), e);
                UploadStatus::Failed {
                    message: e.to_string(),
                }
            }
        };

        let patch = RecordPatch::upload(upload);
        if let Err(e) = self
            .registry
            .update_if_status(&ctx.run_id, RunStatus::Completed, &patch)
        {
            tracing::warn!("Failed to record upload status: {}", e);
        }
    }

    async fn finish_failure(&self, ctx: &StageContext, log: &LogCollector, err: Error) -> RunOutcome {
        let now = Utc::now();
        let stage = err.failed_stage();

        let record =
            FailureRecord::new(&ctx.run_id, &ctx.input_ref, &err, now).with_logs(log.snapshot());
        match self.store.record_failure(&record).await {
            Ok(path) => tracing::info!("Failure record written to {}", path.display()),
            Err(e) => tracing::warn!("Failed to write failure record: {}", e),
        }

        let patch = RecordPatch::fail(FailureDetail::stage_failure(&err), now);
        match self
            .registry
            .update_if_status(&ctx.run_id, RunStatus::Running, &patch)
        {
            Ok(true) => {
                tracing::info!("Run FAILED: {}", err);
                RunOutcome::Failed { stage }
            }
            Ok(false) => {
                tracing::warn!("Run was already terminal, dropping stage failure: {}", err);
                RunOutcome::Superseded
            }
            Err(e) => {
                tracing::error!("Failed to record FAILED ({}): {}", err, e);
                RunOutcome::Unrecorded
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuditorConfig;
    use crate::storage::SqliteRunRegistry;
    use crate::testing::{FailingStore, FakeStages, FlakyRegistry, MemoryStore, ScriptedOracle};
    use crate::types::{FailureCause, LogLevel, Trigger};

    struct Harness {
        registry: Arc<dyn RunRegistry>,
        store: Arc<MemoryStore>,
        executor: Arc<PipelineExecutor>,
    }

    fn harness_with(
        registry: Arc<dyn RunRegistry>,
        stages: FakeStages,
        oracle: ScriptedOracle,
    ) -> Harness {
        let store = Arc::new(MemoryStore::default());
        let aggregator = Arc::new(ConfidenceAggregator::new(
            Arc::new(oracle),
            &AuditorConfig::default(),
        ));
        let executor = Arc::new(PipelineExecutor::new(
            registry.clone(),
            StageSet::from_single(Arc::new(stages)),
            aggregator,
            store.clone(),
        ));
        Harness {
            registry,
            store,
            executor,
        }
    }

    fn harness(stages: FakeStages, oracle: ScriptedOracle) -> Harness {
        harness_with(
            Arc::new(SqliteRunRegistry::in_memory().unwrap()),
            stages,
            oracle,
        )
    }

    fn submit(h: &Harness, id: &str) -> RunId {
        let run_id = RunId::from(id);
        h.registry.create(&run_id, "set.pdf", Trigger::Api).unwrap();
        run_id
    }

    #[tokio::test]
    async fn test_r2_all_stages_succeed() {
        let h = harness(
            FakeStages::default().with_artifacts(&["a0", "a1", "a2"]),
            ScriptedOracle::scores(&[0.9, 0.6, 0.3]),
        );
        let run_id = submit(&h, "r2");

        let outcome = h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(outcome, RunOutcome::Completed { confidence: 0.6 });

        let record = h.registry.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.confidence, Some(0.6));
        assert!(record.error.is_none());

        let result = record.result.unwrap();
        assert_eq!(result.artifact_count, 3);
        assert_eq!(result.stage_timings.len(), 5);
        assert_eq!(result.grand_total, 1120.0);
        assert!(matches!(record.upload, Some(UploadStatus::Exported { .. })));
        assert_eq!(h.store.exported(), vec![run_id]);
        assert_eq!(h.executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_run_log_is_kept_per_stage() {
        let h = harness(
            FakeStages::default().with_artifacts(&["a0", "a1"]),
            ScriptedOracle::scripted(vec![Ok(0.8), Err("model offline")]),
        );
        let run_id = submit(&h, "logged");

        h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        let logs = h.registry.get(&run_id).unwrap().result.unwrap().logs;

        for stage in StageKind::ALL {
            assert!(
                logs.stage(stage)
                    .iter()
                    .any(|e| e.message == format!("Stage {} starting", stage.ordinal())),
                "no start line for {}",
                stage
            );
        }
        let calibration: Vec<&str> = logs
            .stage(StageKind::Calibration)
            .iter()
            .map(|e| e.message.as_str())
            .collect();
        assert!(calibration.contains(&"P2: - North: SUCCESS. Scale = 48.0 pts/ft"));
        assert!(calibration.contains(&"P3: - North: SUCCESS. Scale = 48.0 pts/ft"));

        assert!(logs.general[0].message.starts_with("Starting pipeline"));
        assert!(logs.general.iter().any(|e| e.message.starts_with("Confidence 0.8")));
        assert!(logs
            .stage(StageKind::Classification)
            .iter()
            .any(|e| e.level == LogLevel::Warn && e.message.contains("model offline")));
    }

    #[tokio::test]
    async fn test_failure_record_carries_run_log() {
        let h = harness(
            FakeStages::default().failing_at(StageKind::Takeoff),
            ScriptedOracle::scores(&[]),
        );
        let run_id = submit(&h, "logged-failure");

        h.executor.run(run_id, "set.pdf".to_string()).await;

        let logs = &h.store.failures()[0].logs;
        assert_eq!(logs.stage(StageKind::Survey).len(), 4);
        let takeoff = logs.stage(StageKind::Takeoff);
        assert_eq!(takeoff.last().map(|e| e.level), Some(LogLevel::Error));
        assert!(takeoff
            .last()
            .is_some_and(|e| e.message.contains("simulated failure")));
    }

    #[tokio::test]
    async fn test_r1_takeoff_failure() {
        let h = harness(
            FakeStages::default().failing_at(StageKind::Takeoff),
            ScriptedOracle::scores(&[]),
        );
        let run_id = submit(&h, "r1");

        let outcome = h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                stage: Some(StageKind::Takeoff)
            }
        );

        let record = h.registry.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        let error = record.error.unwrap();
        assert_eq!(error.cause, FailureCause::StageFailure);
        assert_eq!(error.stage, Some(StageKind::Takeoff));
        assert!(record.result.is_none());
        assert!(record.confidence.is_none());
        assert!(record.ended_at.is_some());

        // Stages 1-4 ran, 5 raised
        assert_eq!(h.store.failures().len(), 1);
        assert_eq!(h.store.failures()[0].input_ref, "set.pdf");
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_stages() {
        let stages = FakeStages::default().failing_at(StageKind::SpecExtraction);
        let calls = stages.calls();
        let h = harness(stages, ScriptedOracle::scores(&[]));
        let run_id = submit(&h, "r3");

        h.executor.run(run_id, "set.pdf".to_string()).await;

        assert_eq!(
            calls.snapshot(),
            vec![StageKind::Classification, StageKind::SpecExtraction]
        );
    }

    #[tokio::test]
    async fn test_panicking_stage_is_a_stage_failure() {
        let h = harness(
            FakeStages::default().panicking_at(StageKind::Calibration),
            ScriptedOracle::scores(&[]),
        );
        let run_id = submit(&h, "r4");

        let outcome = h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(
            outcome,
            RunOutcome::Failed {
                stage: Some(StageKind::Calibration)
            }
        );

        let error = h.registry.get(&run_id).unwrap().error.unwrap();
        assert!(error.message.contains("stage panicked"));
        assert_eq!(h.executor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_before_every_stage() {
        let registry = Arc::new(FlakyRegistry::new());
        let h = harness_with(registry.clone(), FakeStages::default(), ScriptedOracle::scores(&[]));
        let run_id = submit(&h, "r5");

        h.executor.run(run_id, "set.pdf".to_string()).await;
        assert_eq!(registry.heartbeat_attempts(), 5);
    }

    #[tokio::test]
    async fn test_heartbeat_failures_do_not_abort() {
        let registry = Arc::new(FlakyRegistry::new());
        registry.fail_heartbeats(true);
        let h = harness_with(registry.clone(), FakeStages::default(), ScriptedOracle::scores(&[]));
        let run_id = submit(&h, "r6");

        let outcome = h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(outcome, RunOutcome::Completed { confidence: 0.0 });
        assert_eq!(h.registry.get(&run_id).unwrap().status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_terminal_write_failure_is_swallowed() {
        let registry = Arc::new(FlakyRegistry::new());
        registry.fail_terminal_writes(true);
        let h = harness_with(
            registry.clone(),
            FakeStages::default().failing_at(StageKind::Survey),
            ScriptedOracle::scores(&[]),
        );
        let run_id = submit(&h, "r7");

        let outcome = h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(outcome, RunOutcome::Unrecorded);
        // Exactly one attempt, no retry loop
        assert_eq!(registry.terminal_attempts(), 1);
        assert_eq!(h.registry.get(&run_id).unwrap().status, RunStatus::Running);
    }

    #[tokio::test]
    async fn test_export_failure_keeps_completed() {
        let registry: Arc<dyn RunRegistry> = Arc::new(SqliteRunRegistry::in_memory().unwrap());
        let aggregator = Arc::new(ConfidenceAggregator::new(
            Arc::new(ScriptedOracle::scores(&[0.5])),
            &AuditorConfig::default(),
        ));
        let executor = PipelineExecutor::new(
            registry.clone(),
            StageSet::from_single(Arc::new(FakeStages::default().with_artifacts(&["a0"]))),
            aggregator,
            Arc::new(FailingStore),
        );
        let run_id = RunId::from("r8");
        registry.create(&run_id, "set.pdf", Trigger::Api).unwrap();

        let outcome = executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(outcome, RunOutcome::Completed { confidence: 0.5 });

        let record = registry.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert!(matches!(record.upload, Some(UploadStatus::Failed { .. })));
    }

    #[tokio::test]
    async fn test_completion_after_timeout_is_superseded() {
        let stages = FakeStages::default();
        let gate = stages.gate(StageKind::Takeoff);
        let h = harness(stages, ScriptedOracle::scores(&[]));
        let run_id = submit(&h, "r9");

        let executor = h.executor.clone();
        let id = run_id.clone();
        let task = tokio::spawn(async move { executor.run(id, "set.pdf".to_string()).await });

        // The monitor declares the run dead while stage 5 is blocked
        gate.wait_entered().await;
        let timeout = RecordPatch::fail(
            FailureDetail::timeout(&h.registry.get(&run_id).unwrap(), Utc::now()),
            Utc::now(),
        );
        assert!(h
            .registry
            .update_if_status(&run_id, RunStatus::Running, &timeout)
            .unwrap());
        gate.release();

        assert_eq!(task.await.unwrap(), RunOutcome::Superseded);
        let record = h.registry.get(&run_id).unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert!(record.result.is_none());
        assert!(h.store.exported().is_empty());
    }

    #[tokio::test]
    async fn test_reentry_refused() {
        let stages = FakeStages::default();
        let gate = stages.gate(StageKind::Classification);
        let h = harness(stages, ScriptedOracle::scores(&[]));
        let run_id = submit(&h, "r10");

        let executor = h.executor.clone();
        let id = run_id.clone();
        let first = tokio::spawn(async move { executor.run(id, "set.pdf".to_string()).await });

        gate.wait_entered().await;
        assert!(h.executor.is_active(&run_id));
        let second = h.executor.run(run_id.clone(), "set.pdf".to_string()).await;
        assert_eq!(second, RunOutcome::AlreadyActive);

        gate.release();
        assert!(matches!(first.await.unwrap(), RunOutcome::Completed { .. }));
    }
}
