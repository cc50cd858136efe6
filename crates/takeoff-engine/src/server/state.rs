//! Application state for the takeoff server

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::TakeoffConfig;
use crate::orchestrator::Orchestrator;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Arc<Orchestrator>,
    /// Set once recovery has run and the monitor is up
    ready: AtomicBool,
}

impl AppState {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                ready: AtomicBool::new(false),
            }),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.inner.orchestrator
    }

    pub fn config(&self) -> &TakeoffConfig {
        self.inner.orchestrator.config()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    pub fn mark_ready(&self) {
        self.inner.ready.store(true, Ordering::SeqCst);
    }
}
