//! Directory batch intake
//!
//! Picks up drawing sets dropped into `input_dir`, moves each into `archive_dir` under its run id
//! and submits it as an `intake` run. A file is only left in place when its run could not be
//! created.

use chrono::Utc;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use walkdir::WalkDir;

use crate::config::{IntakeConfig, MAX_INTERVAL_SECS};
use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::types::{RunId, Trigger};

pub struct Intake {
    orchestrator: Arc<Orchestrator>,
    input_dir: PathBuf,
    archive_dir: PathBuf,
    poll_interval: Duration,
}

impl Intake {
    pub fn new(orchestrator: Arc<Orchestrator>, config: &IntakeConfig) -> Result<Self> {
        fs::create_dir_all(&config.input_dir)?;
        fs::create_dir_all(&config.archive_dir)?;

        Ok(Self {
            orchestrator,
            input_dir: config.input_dir.clone(),
            archive_dir: config.archive_dir.clone(),
            poll_interval: Duration::from_secs(
                config.poll_interval_secs.clamp(1, MAX_INTERVAL_SECS),
            ),
        })
    }

    /// Run id for a file picked up now: `intake-<yyyymmddHHMMSS>-<filename>`
    pub fn run_id_for(filename: &str) -> RunId {
        RunId::from(format!(
            "intake-{}-{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            filename
        ))
    }

    /// PDFs directly inside `input_dir`, by file name
    fn pending(&self) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = WalkDir::new(&self.input_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .filter(|p| is_pdf(p))
            .collect();
        files.sort();
        files
    }

    /// Submit every pending PDF once. Per-file failures are logged and skipped.
    pub fn scan_once(&self) -> Vec<RunId> {
        let pending = self.pending();
        tracing::info!("Intake found {} PDFs in {}", pending.len(), self.input_dir.display());

        let mut submitted = Vec::new();
        for path in pending {
            match self.submit_file(&path) {
                Ok(run_id) => submitted.push(run_id),
                Err(e) => tracing::error!("Intake of {} failed: {}", path.display(), e),
            }
        }
        submitted
    }

    fn submit_file(&self, path: &Path) -> Result<RunId> {
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        // Archived files are the inputs of live runs and are never replaced
        let run_id = Self::run_id_for(&filename);
        let archived = self.archive_dir.join(run_id.as_str());
        if archived.exists() {
            return Err(Error::DuplicateRunId(run_id.to_string()));
        }

        fs::rename(path, &archived)?;

        let input_ref = archived.to_string_lossy().to_string();
        match self
            .orchestrator
            .submit_with_trigger(run_id, &input_ref, Trigger::Intake)
        {
            Ok(run_id) => {
                tracing::info!(%run_id, "Archived {} and started run", filename);
                Ok(run_id)
            }
            Err(e) => {
                // No record was created, so hand the file back for the next poll
                if let Err(restore) = fs::rename(&archived, path) {
                    tracing::error!(
                        "Could not return {} to {}: {}",
                        archived.display(),
                        path.display(),
                        restore
                    );
                }
                Err(e)
            }
        }
    }

    /// Poll until `shutdown` flips to true or its sender is dropped
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            "Intake polling {} every {:?}",
            self.input_dir.display(),
            self.poll_interval
        );

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let submitted = self.scan_once();
                    if !submitted.is_empty() {
                        tracing::info!("Intake submitted {} runs", submitted.len());
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Intake stopped");
    }
}

fn is_pdf(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case("pdf"))
        .unwrap_or(false)
}
