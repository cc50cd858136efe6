//! takeoff-engine: Background orchestration for multi-stage drawing takeoff runs
//!
//! A submitted drawing set becomes a durable run record and a detached executor task that
//! walks the five extraction stages, proves liveness with heartbeats, and finishes with an
//! audited confidence score. A background monitor relabels runs that stop heartbeating, and a
//! startup sweep fails runs orphaned by a previous process.

pub mod config;
pub mod confidence;
pub mod error;
pub mod export;
pub mod intake;
pub mod monitor;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod server;
pub mod storage;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use config::TakeoffConfig;
pub use error::{Error, Result};
pub use orchestrator::{Orchestrator, RuntimeHandle};
pub use types::{
    job::{FailureCause, FailureDetail, JobRecord, RecordPatch, RunId, RunStatus, Trigger, UploadStatus},
    stage::{DebugArtifact, Evidence, StageKind},
};
