//! Stage identity, stage output contract, and debug evidence

use serde::{Deserialize, Serialize};
use std::fmt;

/// One of the five ordered extraction stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Classification,
    SpecExtraction,
    Survey,
    Calibration,
    Takeoff,
}

impl StageKind {
    /// All stages in dependency order
    pub const ALL: [StageKind; 5] = [
        StageKind::Classification,
        StageKind::SpecExtraction,
        StageKind::Survey,
        StageKind::Calibration,
        StageKind::Takeoff,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Classification => "classification",
            StageKind::SpecExtraction => "spec_extraction",
            StageKind::Survey => "survey",
            StageKind::Calibration => "calibration",
            StageKind::Takeoff => "takeoff",
        }
    }

    /// 1-based position in the pipeline
    pub fn ordinal(&self) -> u8 {
        match self {
            StageKind::Classification => 1,
            StageKind::SpecExtraction => 2,
            StageKind::Survey => 3,
            StageKind::Calibration => 4,
            StageKind::Takeoff => 5,
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Visual or textual proof backing a stage's claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Evidence {
    /// Rendered page or crop
    Image {
        media_type: String,
        #[serde(with = "base64_bytes")]
        data: Vec<u8>,
    },
    /// Extracted text (table rows, OCR output)
    Text { content: String },
}

impl Evidence {
    /// File extension used when the evidence is written to disk
    pub fn extension(&self) -> &'static str {
        match self {
            Evidence::Image { media_type, .. } => match media_type.as_str() {
                "image/jpeg" => "jpg",
                "image/webp" => "webp",
                _ => "png",
            },
            Evidence::Text { .. } => "txt",
        }
    }

    /// Raw size: image bytes or UTF-8 text length
    pub fn size_bytes(&self) -> usize {
        match self {
            Evidence::Image { data, .. } => data.len(),
            Evidence::Text { content } => content.len(),
        }
    }
}

/// Evidence plus the label of the claim it supports.
///
/// Produced by a stage, consumed by the confidence aggregator, then discarded apart from
/// the exported debug bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DebugArtifact {
    pub stage: StageKind,
    pub label: String,
    pub evidence: Evidence,
    /// Candidate data the stage derived from this evidence, shown to the auditor
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim: Option<serde_json::Value>,
}

impl DebugArtifact {
    /// PNG image evidence
    pub fn image(stage: StageKind, label: impl Into<String>, png: Vec<u8>) -> Self {
        Self {
            stage,
            label: label.into(),
            evidence: Evidence::Image {
                media_type: "image/png".to_string(),
                data: png,
            },
            claim: None,
        }
    }

    /// Text evidence
    pub fn text(stage: StageKind, label: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            stage,
            label: label.into(),
            evidence: Evidence::Text {
                content: content.into(),
            },
            claim: None,
        }
    }

    pub fn with_claim(mut self, claim: serde_json::Value) -> Self {
        self.claim = Some(claim);
        self
    }
}

/// Output of one stage: the payload for downstream stages plus evidence for the auditor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult<T> {
    pub payload: T,
    #[serde(default)]
    pub artifacts: Vec<DebugArtifact>,
    /// Progress lines reported by the stage, kept in the run's log
    #[serde(default)]
    pub logs: Vec<String>,
}

impl<T> StageResult<T> {
    pub fn new(payload: T) -> Self {
        Self {
            payload,
            artifacts: Vec::new(),
            logs: Vec::new(),
        }
    }

    pub fn with_artifacts(payload: T, artifacts: Vec<DebugArtifact>) -> Self {
        Self {
            payload,
            artifacts,
            logs: Vec::new(),
        }
    }

    pub fn with_logs(mut self, logs: Vec<String>) -> Self {
        self.logs = logs;
        self
    }
}

mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
