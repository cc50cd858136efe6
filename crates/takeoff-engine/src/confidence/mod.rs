//! Confidence scoring
//!
//! Every debug artifact a run produces is shown to an external auditor oracle; the run's
//! confidence is the rounded mean of the scores that came back.

mod aggregator;
mod auditor;

pub use aggregator::{
    round_confidence, ArtifactScore, ConfidenceAggregator, ConfidenceReport, ExcludedArtifact,
    CONFIDENCE_PRECISION,
};
pub use auditor::{normalize_score, AuditContext, AuditVerdict, AuditorOracle, OllamaAuditor};
