//! HTTP client for an external extraction service hosting the five stages
//!
//! Every stage is a `POST <base_url>/stages/<stage>` with a JSON body naming the run, the input,
//! and the upstream payloads the stage reads. The service answers with
//! `{"payload": ..., "artifacts": [...], "logs": [...]}`. Both lists are optional.

use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Serialize};
use serde_json::json;
use std::time::Duration;

use crate::config::StageServiceConfig;
use crate::error::{Error, Result};
use crate::pipeline::{
    AreaTakeoff, PageClassifier, ScaleCalibrator, SpecExtractor, StageContext, TagSurveyor,
};
use crate::types::{
    PageClassification, ScaleData, SpecLibrary, StageKind, StageResult, SurveyData, TakeoffOutput,
};

pub struct RemoteStageClient {
    client: Client,
    base_url: String,
}

impl RemoteStageClient {
    pub fn new(config: &StageServiceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create stage client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn stage_url(&self, stage: StageKind) -> String {
        format!("{}/stages/{}", self.base_url, stage)
    }

    async fn call<B, T>(&self, stage: StageKind, body: &B) -> Result<StageResult<T>>
    where
        B: Serialize + Sync,
        T: DeserializeOwned + Send,
    {
        let url = self.stage_url(stage);
        tracing::debug!(%stage, "POST {}", url);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| Error::stage(stage, format!("request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::stage(stage, format!("HTTP {} - {}", status, body)));
        }

        response
            .json::<StageResult<T>>()
            .await
            .map_err(|e| Error::stage(stage, format!("invalid response: {}", e)))
    }
}

#[async_trait]
impl PageClassifier for RemoteStageClient {
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult<Vec<PageClassification>>> {
        let body = json!({
            "run_id": ctx.run_id,
            "input_ref": ctx.input_ref,
        });
        self.call(StageKind::Classification, &body).await
    }
}

#[async_trait]
impl SpecExtractor for RemoteStageClient {
    async fn execute(
        &self,
        ctx: &StageContext,
        spec_pages: &[PageClassification],
    ) -> Result<StageResult<SpecLibrary>> {
        let body = json!({
            "run_id": ctx.run_id,
            "input_ref": ctx.input_ref,
            "pages": spec_pages,
        });
        self.call(StageKind::SpecExtraction, &body).await
    }
}

#[async_trait]
impl TagSurveyor for RemoteStageClient {
    async fn execute(
        &self,
        ctx: &StageContext,
        elevation_pages: &[u32],
        specs: &SpecLibrary,
    ) -> Result<StageResult<SurveyData>> {
        let body = json!({
            "run_id": ctx.run_id,
            "input_ref": ctx.input_ref,
            "elevation_pages": elevation_pages,
            "specs": specs,
        });
        self.call(StageKind::Survey, &body).await
    }
}

#[async_trait]
impl ScaleCalibrator for RemoteStageClient {
    async fn execute(
        &self,
        ctx: &StageContext,
        elevation_pages: &[u32],
    ) -> Result<StageResult<ScaleData>> {
        let body = json!({
            "run_id": ctx.run_id,
            "input_ref": ctx.input_ref,
            "elevation_pages": elevation_pages,
        });
        self.call(StageKind::Calibration, &body).await
    }
}

#[async_trait]
impl AreaTakeoff for RemoteStageClient {
    async fn execute(
        &self,
        ctx: &StageContext,
        survey: &SurveyData,
        scales: &ScaleData,
        specs: &SpecLibrary,
    ) -> Result<StageResult<TakeoffOutput>> {
        let body = json!({
            "run_id": ctx.run_id,
            "input_ref": ctx.input_ref,
            "survey": survey,
            "scales": scales,
            "specs": specs,
        });
        self.call(StageKind::Takeoff, &body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{PageKind, RunId};

    #[test]
    fn test_stage_urls() {
        let client = RemoteStageClient::new(&StageServiceConfig {
            base_url: "http://extract:9000/".to_string(),
            timeout_secs: 30,
        })
        .unwrap();

        assert_eq!(
            client.stage_url(StageKind::SpecExtraction),
            "http://extract:9000/stages/spec_extraction"
        );
        assert_eq!(client.stage_url(StageKind::Takeoff), "http://extract:9000/stages/takeoff");
    }

    #[test]
    fn test_stage_response_shape() {
        let raw = r#"{
            "payload": [{"page": 3, "kind": "exterior_elevation", "reason": "Title Block Match"}],
            "artifacts": [{"stage": "classification", "label": "P3 title block",
                           "evidence": {"kind": "text", "content": "EXTERIOR ELEVATIONS"}}],
            "logs": ["P3: [exterior_elevation] (Title Block Match)"]
        }"#;
        let parsed: StageResult<Vec<PageClassification>> = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.payload[0].kind, PageKind::ExteriorElevation);
        assert_eq!(parsed.artifacts.len(), 1);
        assert_eq!(parsed.logs.len(), 1);

        let bare: StageResult<ScaleData> = serde_json::from_str(r#"{"payload": {}}"#).unwrap();
        assert!(bare.artifacts.is_empty() && bare.logs.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_service_is_stage_failure() {
        // Port 9 (discard) is closed on test hosts; the connect fails fast
        let client = RemoteStageClient::new(&StageServiceConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 5,
        })
        .unwrap();
        let ctx = StageContext {
            run_id: RunId::from("r1"),
            input_ref: "set.pdf".to_string(),
        };

        let err = ScaleCalibrator::execute(&client, &ctx, &[2, 4]).await.unwrap_err();
        assert_eq!(err.failed_stage(), Some(StageKind::Calibration));
    }
}
