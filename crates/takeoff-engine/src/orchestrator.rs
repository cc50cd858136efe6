//! Process-level entry point: submission, status, and background runtime
//!
//! Owns the registry handle and the shared executor. `start` reconciles orphaned runs and then
//! spawns the timeout monitor; `submit` creates a record and detaches one executor task per run.

use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::TakeoffConfig;
use crate::confidence::{AuditorOracle, ConfidenceAggregator, OllamaAuditor};
use crate::error::{Error, Result};
use crate::export::{ArtifactStore, LocalArtifactStore};
use crate::monitor::{RecoveryReport, RecoverySweep, TimeoutMonitor};
use crate::pipeline::{PipelineExecutor, StageSet};
use crate::providers::RemoteStageClient;
use crate::storage::{RunRegistry, SqliteRunRegistry};
use crate::types::{JobRecord, RunId, Trigger};

pub struct Orchestrator {
    config: Arc<TakeoffConfig>,
    registry: Arc<dyn RunRegistry>,
    executor: Arc<PipelineExecutor>,
}

impl Orchestrator {
    pub fn new(
        config: TakeoffConfig,
        registry: Arc<dyn RunRegistry>,
        stages: StageSet,
        oracle: Arc<dyn AuditorOracle>,
        store: Arc<dyn ArtifactStore>,
    ) -> Self {
        let aggregator = Arc::new(ConfidenceAggregator::new(oracle, &config.auditor));
        let executor = Arc::new(PipelineExecutor::new(
            registry.clone(),
            stages,
            aggregator,
            store,
        ));

        Self {
            config: Arc::new(config),
            registry,
            executor,
        }
    }

    /// Wire the default collaborators: SQLite registry, remote stages, Ollama auditor, local store
    pub fn from_config(config: TakeoffConfig) -> Result<Self> {
        config.validate()?;

        let registry: Arc<dyn RunRegistry> =
            Arc::new(SqliteRunRegistry::open(&config.storage.database_path)?);
        let stages = StageSet::from_single(Arc::new(RemoteStageClient::new(&config.stages)?));
        let oracle: Arc<dyn AuditorOracle> = Arc::new(OllamaAuditor::new(&config.auditor)?);
        let store: Arc<dyn ArtifactStore> =
            Arc::new(LocalArtifactStore::new(&config.storage.output_dir)?);

        tracing::info!(
            "Orchestrator configured: registry {}, stages {}, auditor {} ({})",
            config.storage.database_path.display(),
            config.stages.base_url,
            config.auditor.base_url,
            config.auditor.model
        );

        Ok(Self::new(config, registry, stages, oracle, store))
    }

    pub fn config(&self) -> &TakeoffConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<dyn RunRegistry> {
        &self.registry
    }

    /// Live executor tasks
    pub fn in_flight(&self) -> usize {
        self.executor.in_flight()
    }

    /// Create a run for `input_ref` and start it in the background
    pub fn submit(&self, input_ref: &str) -> Result<RunId> {
        self.submit_with_trigger(RunId::new(), input_ref, Trigger::Api)
    }

    /// Create the record, then spawn the executor. Nothing is spawned if the create fails.
    pub fn submit_with_trigger(
        &self,
        run_id: RunId,
        input_ref: &str,
        trigger: Trigger,
    ) -> Result<RunId> {
        self.registry.create(&run_id, input_ref, trigger)?;
        tracing::info!(%run_id, trigger = trigger.as_str(), "Submitted run for {}", input_ref);

        let executor = self.executor.clone();
        let id = run_id.clone();
        let input_ref = input_ref.to_string();
        tokio::spawn(async move {
            executor.run(id, input_ref).await;
        });

        Ok(run_id)
    }

    pub fn get_status(&self, run_id: &RunId) -> Result<JobRecord> {
        self.registry.get(run_id)
    }

    /// Run the recovery sweep to completion, then spawn the timeout monitor
    pub async fn start(&self) -> Result<RuntimeHandle> {
        let sweep = RecoverySweep::new(self.registry.clone())
            .with_page_size(self.config.storage.scan_page_size);
        let recovery = tokio::task::spawn_blocking(move || sweep.run())
            .await
            .map_err(|e| Error::internal(format!("Recovery sweep task failed: {}", e)))?;

        let (shutdown, rx) = watch::channel(false);
        let monitor = TimeoutMonitor::new(self.registry.clone(), &self.config.monitor)
            .with_page_size(self.config.storage.scan_page_size);
        let monitor = tokio::spawn(monitor.run(rx));

        Ok(RuntimeHandle {
            shutdown,
            monitor,
            recovery,
        })
    }
}

/// Background runtime started by [`Orchestrator::start`]
pub struct RuntimeHandle {
    shutdown: watch::Sender<bool>,
    monitor: JoinHandle<()>,
    recovery: RecoveryReport,
}

impl RuntimeHandle {
    /// What the startup sweep did
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    /// Stop the monitor and wait for it. In-flight executors are left to finish on their own.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        if let Err(e) = self.monitor.await {
            tracing::error!("Timeout monitor task ended abnormally: {}", e);
        }
    }
}
