//! Error types for the takeoff engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::types::stage::StageKind;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Engine errors
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// A record with this run id already exists
    #[error("Run already exists: {0}")]
    DuplicateRunId(String),

    /// Run not found
    #[error("Run not found: {0}")]
    NotFound(String),

    /// Registry read/write failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Patch would move a record out of a terminal status
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// An extraction stage raised
    #[error("Stage '{stage}' failed: {message}")]
    Stage { stage: StageKind, message: String },

    /// Auditor oracle error
    #[error("Auditor error: {0}")]
    Auditor(String),

    /// Artifact export error
    #[error("Export error: {0}")]
    Export(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP request error
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    /// Malformed client request
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage(message.into())
    }

    /// Create a stage failure
    pub fn stage(stage: StageKind, message: impl Into<String>) -> Self {
        Self::Stage {
            stage,
            message: message.into(),
        }
    }

    /// Create an auditor error
    pub fn auditor(message: impl Into<String>) -> Self {
        Self::Auditor(message.into())
    }

    /// Create an export error
    pub fn export(message: impl Into<String>) -> Self {
        Self::Export(message.into())
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Stage this error is attributed to, if any
    pub fn failed_stage(&self) -> Option<StageKind> {
        match self {
            Error::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_type, message) = match &self {
            Error::Config(msg) => (StatusCode::BAD_REQUEST, "config_error", msg.clone()),
            Error::DuplicateRunId(id) => (
                StatusCode::CONFLICT,
                "duplicate_run",
                format!("Run already exists: {}", id),
            ),
            Error::NotFound(id) => (
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Run not found: {}", id),
            ),
            Error::Storage(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "storage_error", msg.clone())
            }
            Error::InvalidTransition(msg) => {
                (StatusCode::CONFLICT, "invalid_transition", msg.clone())
            }
            Error::Stage { .. } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "stage_error",
                self.to_string(),
            ),
            Error::Auditor(msg) => (StatusCode::BAD_GATEWAY, "auditor_error", msg.clone()),
            Error::Export(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "export_error", msg.clone())
            }
            Error::Io(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "io_error",
                err.to_string(),
            ),
            Error::Json(err) => (StatusCode::BAD_REQUEST, "json_error", err.to_string()),
            Error::Http(err) => (StatusCode::BAD_GATEWAY, "http_error", err.to_string()),
            Error::BadRequest(msg) => (StatusCode::BAD_REQUEST, "bad_request", msg.clone()),
            Error::Internal(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "internal_error", msg.clone())
            }
        };

        let body = Json(json!({
            "error": {
                "type": error_type,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}
