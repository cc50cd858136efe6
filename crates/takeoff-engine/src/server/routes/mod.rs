//! API routes for the takeoff server

pub mod runs;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

use crate::server::state::AppState;

/// Build all API routes
pub fn api_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        // Drawing set upload starts a run
        .route(
            "/runs",
            post(runs::start_run).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/runs/:id", get(runs::get_run))
        .route("/info", get(info))
}

/// Legacy `/pipeline` paths, same handlers
pub fn pipeline_routes(max_upload_size: usize) -> Router<AppState> {
    Router::new()
        .route(
            "/run",
            post(runs::start_run).layer(DefaultBodyLimit::max(max_upload_size)),
        )
        .route("/:id", get(runs::get_run))
}

/// API info endpoint
async fn info() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "name": "takeoff-engine",
        "version": env!("CARGO_PKG_VERSION"),
        "description": "Background takeoff runs over architectural drawing sets",
        "endpoints": {
            "POST /api/runs": "Upload a drawing set (multipart field 'pdf') and start a run",
            "GET /api/runs/:id": "Run status, result and confidence",
            "POST /pipeline/run": "Alias of POST /api/runs",
            "GET /pipeline/:id": "Alias of GET /api/runs/:id",
            "GET /health": "Liveness",
            "GET /ready": "Recovery finished and monitor running"
        },
        "stages": crate::types::StageKind::ALL
    }))
}
