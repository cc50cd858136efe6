//! Core data types for takeoff runs

pub mod job;
pub mod stage;
pub mod takeoff;

pub use job::{
    ExportReceipt, ExportedFile, FailureCause, FailureDetail, JobRecord, LogEntry, LogLevel,
    RecordPatch, RunId, RunLogs, RunResult, RunStatus, StageTiming, Trigger, UploadStatus,
};
pub use stage::{DebugArtifact, Evidence, StageKind, StageResult};
pub use takeoff::{
    LineItem, OpeningSpec, PageClassification, PageKind, ScaleData, SpecLibrary, SurveyData,
    TakeoffOutput,
};
