//! Stage contracts for the five extraction stages
//!
//! Each stage receives read-only views of upstream payloads and returns a fresh payload plus the
//! debug evidence backing it. Implementations:
//! - `RemoteStageClient`: HTTP extraction service (see `providers::remote`)
//! - in-process implementations supplied by the embedding application

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::Result;
use crate::types::{
    PageClassification, RunId, ScaleData, SpecLibrary, StageResult, SurveyData, TakeoffOutput,
};

/// Identity of the run a stage is working on
#[derive(Debug, Clone)]
pub struct StageContext {
    pub run_id: RunId,
    /// Location of the drawing set (path or object key)
    pub input_ref: String,
}

/// Stage 1: classify every page of the drawing set
#[async_trait]
pub trait PageClassifier: Send + Sync {
    async fn execute(&self, ctx: &StageContext) -> Result<StageResult<Vec<PageClassification>>>;
}

/// Stage 2: build the window/door type library from schedule and type pages
#[async_trait]
pub trait SpecExtractor: Send + Sync {
    async fn execute(
        &self,
        ctx: &StageContext,
        spec_pages: &[PageClassification],
    ) -> Result<StageResult<SpecLibrary>>;
}

/// Stage 3: count opening tags per elevation view
#[async_trait]
pub trait TagSurveyor: Send + Sync {
    async fn execute(
        &self,
        ctx: &StageContext,
        elevation_pages: &[u32],
        specs: &SpecLibrary,
    ) -> Result<StageResult<SurveyData>>;
}

/// Stage 4: derive pixels-per-foot for each elevation view
#[async_trait]
pub trait ScaleCalibrator: Send + Sync {
    async fn execute(
        &self,
        ctx: &StageContext,
        elevation_pages: &[u32],
    ) -> Result<StageResult<ScaleData>>;
}

/// Stage 5: measure facade area and apply opening deductions
#[async_trait]
pub trait AreaTakeoff: Send + Sync {
    async fn execute(
        &self,
        ctx: &StageContext,
        survey: &SurveyData,
        scales: &ScaleData,
        specs: &SpecLibrary,
    ) -> Result<StageResult<TakeoffOutput>>;
}

/// The fixed five-stage pipeline
#[derive(Clone)]
pub struct StageSet {
    pub classifier: Arc<dyn PageClassifier>,
    pub spec_extractor: Arc<dyn SpecExtractor>,
    pub surveyor: Arc<dyn TagSurveyor>,
    pub calibrator: Arc<dyn ScaleCalibrator>,
    pub takeoff: Arc<dyn AreaTakeoff>,
}

impl StageSet {
    /// Use one implementation for every stage
    pub fn from_single<T>(stages: Arc<T>) -> Self
    where
        T: PageClassifier + SpecExtractor + TagSurveyor + ScaleCalibrator + AreaTakeoff + 'static,
    {
        Self {
            classifier: stages.clone(),
            spec_extractor: stages.clone(),
            surveyor: stages.clone(),
            calibrator: stages.clone(),
            takeoff: stages,
        }
    }
}
