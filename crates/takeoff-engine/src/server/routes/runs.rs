//! Run submission and status endpoints

use axum::{
    extract::{Multipart, Path, State},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::server::state::AppState;
use crate::types::{JobRecord, RunId};

/// Multipart field carrying the drawing set
pub const PDF_FIELD: &str = "pdf";

#[derive(Debug, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
    pub status: String,
}

/// POST /api/runs - Save the uploaded drawing set and start a run for it
pub async fn start_run(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Json<StartRunResponse>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::BadRequest(format!("Failed to read multipart field: {}", e)))?
    {
        if field.name() != Some(PDF_FIELD) {
            continue;
        }

        let filename = upload_name(field.file_name());
        let data = field
            .bytes()
            .await
            .map_err(|e| Error::BadRequest(format!("Failed to read upload: {}", e)))?;
        if data.is_empty() {
            return Err(Error::BadRequest(format!("Upload '{}' is empty", filename)));
        }

        let upload_dir = &state.config().storage.upload_dir;
        tokio::fs::create_dir_all(upload_dir).await?;
        let path = upload_dir.join(format!("{}_{}", Uuid::new_v4(), filename));
        tokio::fs::write(&path, &data).await?;
        tracing::info!("Saved upload {} ({} bytes) to {}", filename, data.len(), path.display());

        let run_id = state.orchestrator().submit(&path.to_string_lossy())?;
        return Ok(Json(StartRunResponse {
            run_id,
            status: "started".to_string(),
        }));
    }

    Err(Error::BadRequest(format!("Missing '{}' file field", PDF_FIELD)))
}

/// GET /api/runs/:id - Current record of a run
pub async fn get_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobRecord>> {
    let record = state.orchestrator().get_status(&RunId::from(id))?;
    Ok(Json(record))
}

/// Client file name without any directory part
fn upload_name(raw: Option<&str>) -> String {
    raw.and_then(|name| std::path::Path::new(name).file_name())
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "upload.pdf".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upload_name_strips_directories() {
        assert_eq!(upload_name(Some("../../etc/plans.pdf")), "plans.pdf");
        assert_eq!(upload_name(Some("tower.pdf")), "tower.pdf");
        assert_eq!(upload_name(None), "upload.pdf");
    }
}
