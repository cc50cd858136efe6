//! Stage pipeline: stage contracts, heartbeats, run logs and the per-run executor

mod executor;
mod heartbeat;
mod run_log;
mod stages;

pub use executor::{PipelineExecutor, RunOutcome};
pub use heartbeat::HeartbeatEmitter;
pub use run_log::LogCollector;
pub use stages::{
    AreaTakeoff, PageClassifier, ScaleCalibrator, SpecExtractor, StageContext, StageSet,
    TagSurveyor,
};
