//! Per-run log capture. Every line is also emitted through `tracing`.

use chrono::Utc;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::types::{LogEntry, LogLevel, RunLogs, StageKind};

/// Shared handle; clones append to the same log
#[derive(Debug, Clone, Default)]
pub struct LogCollector {
    logs: Arc<Mutex<RunLogs>>,
}

impl LogCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn info(&self, stage: Option<StageKind>, message: impl Into<String>) {
        let message = message.into();
        match stage {
            Some(stage) => tracing::info!(%stage, "{}", message),
            None => tracing::info!("{}", message),
        }
        self.push(stage, LogLevel::Info, message);
    }

    pub fn warn(&self, stage: Option<StageKind>, message: impl Into<String>) {
        let message = message.into();
        match stage {
            Some(stage) => tracing::warn!(%stage, "{}", message),
            None => tracing::warn!("{}", message),
        }
        self.push(stage, LogLevel::Warn, message);
    }

    pub fn error(&self, stage: Option<StageKind>, message: impl Into<String>) {
        let message = message.into();
        match stage {
            Some(stage) => tracing::error!(%stage, "{}", message),
            None => tracing::error!("{}", message),
        }
        self.push(stage, LogLevel::Error, message);
    }

    /// Lines a stage reported in its result. Blank lines are dropped.
    pub fn extend_stage(&self, stage: StageKind, lines: Vec<String>) {
        for line in lines {
            let line = line.trim();
            if !line.is_empty() {
                self.info(Some(stage), line);
            }
        }
    }

    pub fn snapshot(&self) -> RunLogs {
        self.logs.lock().clone()
    }

    fn push(&self, stage: Option<StageKind>, level: LogLevel, message: String) {
        let entry = LogEntry {
            timestamp: Utc::now(),
            level,
            message,
        };
        let mut logs = self.logs.lock();
        match stage {
            Some(stage) => logs.stages.entry(stage).or_default().push(entry),
            None => logs.general.push(entry),
        }
    }
}
