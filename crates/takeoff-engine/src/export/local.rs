//! Filesystem artifact store
//!
//! Layout under `output_dir`, where `<run>` is [`run_dir_name`] of the run id:
//! - `<run>/result.json`
//! - `<run>/line_items.csv`
//! - `<run>/logs.json`
//! - `<run>/debug/` one file per artifact plus `manifest.json`
//! - `errors/<run>.json`

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use super::{ArtifactStore, FailureRecord};
use crate::confidence::ConfidenceReport;
use crate::error::{Error, Result};
use crate::types::takeoff::total_deductions;
use crate::types::{
    DebugArtifact, Evidence, ExportReceipt, ExportedFile, RunId, RunLogs, RunResult, StageKind,
};

/// Local artifact store rooted at the configured output directory
pub struct LocalArtifactStore {
    output_dir: PathBuf,
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    file: String,
    stage: String,
    label: &'a str,
    bytes: usize,
    score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    excluded: Option<&'a str>,
}

impl LocalArtifactStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        std::fs::create_dir_all(&output_dir)?;
        Ok(Self { output_dir })
    }

    pub fn run_dir(&self, run_id: &RunId) -> PathBuf {
        self.output_dir.join(run_dir_name(run_id))
    }

    pub fn errors_dir(&self) -> PathBuf {
        self.output_dir.join("errors")
    }

    async fn write_file(
        &self,
        files: &mut Vec<ExportedFile>,
        kind: &str,
        path: &Path,
        contents: Vec<u8>,
    ) -> Result<()> {
        tokio::fs::write(path, contents)
            .await
            .map_err(|e| Error::export(format!("Failed to write {}: {}", path.display(), e)))?;

        files.push(ExportedFile {
            kind: kind.to_string(),
            path: path.display().to_string(),
            content_type: Some(content_type(path)),
        });
        Ok(())
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn export(
        &self,
        run_id: &RunId,
        result: &RunResult,
        report: &ConfidenceReport,
        artifacts: &[DebugArtifact],
    ) -> Result<ExportReceipt> {
        let run_dir = self.run_dir(run_id);
        let debug_dir = run_dir.join("debug");
        tokio::fs::create_dir_all(&debug_dir)
            .await
            .map_err(|e| Error::export(format!("Failed to create {}: {}", debug_dir.display(), e)))?;

        let mut files = Vec::new();

        let result_json = serde_json::to_vec_pretty(&json!({
            "run_id": run_id,
            "generated_at": Utc::now(),
            "confidence": report.confidence,
            "result": result,
            "audit": report,
        }))?;
        self.write_file(&mut files, "result", &run_dir.join("result.json"), result_json)
            .await?;

        let csv = line_items_csv(result, report.confidence)?;
        self.write_file(&mut files, "line_items", &run_dir.join("line_items.csv"), csv)
            .await?;

        let logs_json = serde_json::to_vec_pretty(&logs_document(run_id, &result.logs))?;
        self.write_file(&mut files, "logs", &run_dir.join("logs.json"), logs_json)
            .await?;

        let mut manifest = Vec::with_capacity(artifacts.len());
        for (index, artifact) in artifacts.iter().enumerate() {
            let name = format!(
                "{:03}_{}_{}.{}",
                index,
                artifact.stage,
                safe_name(&artifact.label),
                artifact.evidence.extension()
            );
            let bytes = match &artifact.evidence {
                Evidence::Image { data, .. } => data.clone(),
                Evidence::Text { content } => content.clone().into_bytes(),
            };
            self.write_file(&mut files, "debug", &debug_dir.join(&name), bytes)
                .await?;

            manifest.push(ManifestEntry {
                file: name,
                stage: artifact.stage.to_string(),
                label: &artifact.label,
                bytes: artifact.evidence.size_bytes(),
                score: report.score_for(index),
                excluded: report
                    .excluded
                    .iter()
                    .find(|e| e.index == index)
                    .map(|e| e.reason.as_str()),
            });
        }
        let manifest_json = serde_json::to_vec_pretty(&manifest)?;
        self.write_file(&mut files, "manifest", &debug_dir.join("manifest.json"), manifest_json)
            .await?;

        tracing::info!(%run_id, "Exported {} files to {}", files.len(), run_dir.display());

        Ok(ExportReceipt {
            location: run_dir.display().to_string(),
            files,
        })
    }

    async fn record_failure(&self, record: &FailureRecord) -> Result<PathBuf> {
        let dir = self.errors_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let path = dir.join(format!("{}.json", run_dir_name(&record.run_id)));
        tokio::fs::write(&path, serde_json::to_vec_pretty(record)?).await?;
        Ok(path)
    }

    fn name(&self) -> &str {
        "local"
    }
}

/// Summary rows, then deduction rows, then EIFS rows
fn line_items_csv(result: &RunResult, confidence: f64) -> Result<Vec<u8>> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    let csv_err = |e: csv::Error| Error::export(format!("Failed to write CSV: {}", e));

    writer
        .write_record(["Section", "Page", "View", "Description", "EA", "Unit_SF", "Total_SF"])
        .map_err(csv_err)?;

    let summary = [
        ("Grand Total SF", result.grand_total),
        ("Total Deductions SF", total_deductions(&result.line_items)),
        ("Confidence", confidence),
    ];
    for (metric, value) in summary {
        let value = value.to_string();
        writer
            .write_record(["Summary", "", "", metric, "", "", value.as_str()])
            .map_err(csv_err)?;
    }

    let sections = [
        ("Deductions", result.line_items.iter().filter(|i| i.is_deduction()).collect::<Vec<_>>()),
        ("EIFS", result.line_items.iter().filter(|i| i.is_eifs()).collect()),
    ];
    for (section, items) in sections {
        for item in items {
            let (page, count) = (item.page.to_string(), item.count.to_string());
            let (unit_sf, total_sf) = (item.unit_sf.to_string(), item.total_sf.to_string());
            writer
                .write_record([
                    section,
                    page.as_str(),
                    item.view.as_str(),
                    item.description.as_str(),
                    count.as_str(),
                    unit_sf.as_str(),
                    total_sf.as_str(),
                ])
                .map_err(csv_err)?;
        }
    }

    writer
        .into_inner()
        .map_err(|e| Error::export(format!("Failed to flush CSV: {}", e)))
}

/// Run log with per-stage line counts
fn logs_document(run_id: &RunId, logs: &RunLogs) -> serde_json::Value {
    let counts: serde_json::Map<String, serde_json::Value> = StageKind::ALL
        .iter()
        .map(|stage| (stage.to_string(), json!(logs.stage(*stage).len())))
        .collect();

    json!({
        "run_id": run_id,
        "generated_at": Utc::now(),
        "stages": logs.stages,
        "general": logs.general,
        "summary": {
            "stages": counts,
            "general": logs.general.len(),
            "total": logs.total(),
        },
    })
}

fn content_type(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Hex digest characters appended to run directory names
const RUN_HASH_LEN: usize = 12;

/// Readable prefix of the run id plus a digest of the full id, so distinct runs never share files
pub fn run_dir_name(run_id: &RunId) -> String {
    let mut hasher = Sha256::new();
    hasher.update(run_id.as_str().as_bytes());
    let digest = format!("{:x}", hasher.finalize());

    let prefix: String = safe_name(run_id.as_str()).chars().take(48).collect();
    format!("{}-{}", prefix, &digest[..RUN_HASH_LEN])
}

/// Filesystem-safe form of a label. Lossy.
fn safe_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .take(80)
        .collect();
    let trimmed = cleaned.trim_matches('.');
    if trimmed.is_empty() {
        "unnamed".to_string()
    } else {
        trimmed.to_string()
    }
}
