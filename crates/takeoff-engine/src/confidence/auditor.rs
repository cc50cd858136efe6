//! Auditor oracle contract and the Ollama vision-model auditor

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::AuditorConfig;
use crate::error::{Error, Result};
use crate::types::{Evidence, StageKind};

/// What the auditor is validating
#[derive(Debug, Clone)]
pub struct AuditContext {
    pub stage: StageKind,
    /// Data the stage derived from the evidence
    pub claim: Option<serde_json::Value>,
}

impl AuditContext {
    /// Human-readable phase description used in prompts
    pub fn phase(&self) -> &'static str {
        match self.stage {
            StageKind::Classification => "Sheet Classification",
            StageKind::SpecExtraction => "Window/Door Specification Extraction",
            StageKind::Survey => "Geofenced Tag Survey",
            StageKind::Calibration => "Scale Calibration",
            StageKind::Takeoff => "Vector Area Takeoff",
        }
    }
}

/// Scores one piece of evidence in [0, 1]
///
/// Implementations:
/// - `OllamaAuditor`: local vision model via Ollama `/api/chat`
#[async_trait]
pub trait AuditorOracle: Send + Sync {
    async fn score(&self, evidence: &Evidence, label: &str, context: &AuditContext) -> Result<f64>;

    /// Oracle name for logging
    fn name(&self) -> &str;
}

/// Accept a raw oracle score. Non-finite values are errors; the rest are clamped to [0, 1].
pub fn normalize_score(raw: f64) -> Result<f64> {
    if !raw.is_finite() {
        return Err(Error::auditor(format!("Non-finite confidence score: {}", raw)));
    }
    Ok(raw.clamp(0.0, 1.0))
}

/// Structured verdict returned by the auditor model
#[derive(Debug, Clone, Deserialize)]
pub struct AuditVerdict {
    pub confidence_score: f64,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub hallucination_detected: Option<bool>,
    #[serde(default)]
    pub critique: Option<String>,
}

impl AuditVerdict {
    pub fn parse(content: &str) -> Result<Self> {
        serde_json::from_str(content.trim())
            .map_err(|e| Error::auditor(format!("Unparseable audit verdict: {}", e)))
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    format: &'static str,
    stream: bool,
    options: ChatOptions,
}

#[derive(Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    images: Vec<String>,
}

#[derive(Serialize)]
struct ChatOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Ollama-backed auditor acting as a senior estimation reviewer
pub struct OllamaAuditor {
    client: Client,
    config: AuditorConfig,
}

impl OllamaAuditor {
    pub fn new(config: &AuditorConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .pool_max_idle_per_host(config.max_concurrency)
            .build()
            .map_err(|e| Error::auditor(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Check if Ollama is reachable
    pub async fn health_check(&self) -> Result<bool> {
        let url = format!("{}/api/tags", self.config.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => Ok(response.status().is_success()),
            Err(_) => Ok(false),
        }
    }

    fn build_prompt(evidence: &Evidence, label: &str, context: &AuditContext) -> String {
        let claim = context
            .claim
            .as_ref()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "{}".to_string());

        let evidence_block = match evidence {
            Evidence::Image { .. } => "Inspect the provided image.".to_string(),
            Evidence::Text { content } => format!("[EVIDENCE TEXT]:\n{}", content),
        };

        format!(
            r#"You are a Senior Estimation Auditor.

[AUDIT CONTEXT]: Validating {phase} ({label})
[CANDIDATE DATA]: {claim}

{evidence_block}

TASK: Compare the evidence with the candidate data and check for hallucination.

CRITERIA:
1. Visual Evidence: Is there actual proof in the evidence for the candidate data?
2. Logical Consistency: Are dimensions or classifications realistic for the project?
3. Hallucination Check: Does the candidate data mention things not present in the evidence?

OUTPUT JSON FORMAT (STRICT):
{{
    "confidence_score": 0.0 to 1.0,
    "status": "VALIDATED" or "WARNING" or "REJECTED",
    "hallucination_detected": true/false,
    "critique": "Explanation of discrepancies."
}}"#,
            phase = context.phase(),
        )
    }
}

#[async_trait]
impl AuditorOracle for OllamaAuditor {
    async fn score(&self, evidence: &Evidence, label: &str, context: &AuditContext) -> Result<f64> {
        let url = format!("{}/api/chat", self.config.base_url);

        let images = match evidence {
            Evidence::Image { data, .. } => vec![STANDARD.encode(data)],
            Evidence::Text { .. } => Vec::new(),
        };

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: Self::build_prompt(evidence, label, context),
                images,
            }],
            format: "json",
            stream: false,
            options: ChatOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| Error::auditor(format!("Audit request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::auditor(format!("Audit failed: HTTP {} - {}", status, body)));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| Error::auditor(format!("Failed to parse audit response: {}", e)))?;

        let verdict = AuditVerdict::parse(&chat.message.content)?;
        if verdict.hallucination_detected == Some(true) {
            tracing::debug!(
                label,
                critique = verdict.critique.as_deref().unwrap_or(""),
                "Auditor flagged hallucination"
            );
        }
        normalize_score(verdict.confidence_score)
    }

    fn name(&self) -> &str {
        "ollama"
    }
}
