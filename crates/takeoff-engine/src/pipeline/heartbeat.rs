//! Liveness signal written before every stage

use chrono::Utc;
use std::sync::Arc;

use crate::storage::RunRegistry;
use crate::types::{RunId, StageKind};

/// Writes `last_heartbeat` for a run. Never fails the caller.
#[derive(Clone)]
pub struct HeartbeatEmitter {
    registry: Arc<dyn RunRegistry>,
}

impl HeartbeatEmitter {
    pub fn new(registry: Arc<dyn RunRegistry>) -> Self {
        Self { registry }
    }

    /// Record that `run_id` is about to start `stage`
    pub fn beat(&self, run_id: &RunId, stage: StageKind) {
        match self.registry.touch_heartbeat(run_id, Utc::now()) {
            Ok(()) => tracing::debug!(%run_id, %stage, "Heartbeat"),
            Err(e) => tracing::warn!(%run_id, %stage, "Heartbeat write failed: {}", e),
        }
    }
}
