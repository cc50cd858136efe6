//! Payloads exchanged between the extraction stages

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Sheet category assigned by the classification stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    ExteriorElevation,
    Schedule,
    TypeDefinition,
    FloorPlan,
    Irrelevant,
}

impl PageKind {
    /// Sheets the specification extractor reads
    pub fn carries_specs(&self) -> bool {
        matches!(self, PageKind::Schedule | PageKind::TypeDefinition)
    }
}

/// Classification of a single page
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageClassification {
    /// 1-based page number
    pub page: u32,
    pub kind: PageKind,
    pub reason: String,
}

/// Pages classified as exterior elevations, in page order
pub fn elevation_pages(pages: &[PageClassification]) -> Vec<u32> {
    let mut out: Vec<u32> = pages
        .iter()
        .filter(|p| p.kind == PageKind::ExteriorElevation)
        .map(|p| p.page)
        .collect();
    out.sort_unstable();
    out.dedup();
    out
}

/// Pages the specification extractor should read
pub fn spec_pages(pages: &[PageClassification]) -> Vec<PageClassification> {
    pages
        .iter()
        .filter(|p| p.kind.carries_specs())
        .cloned()
        .collect()
}

/// Dimensions of one window or door type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningSpec {
    pub width_ft: f64,
    pub height_ft: f64,
    #[serde(default)]
    pub raw_width: Option<String>,
    #[serde(default)]
    pub raw_height: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
}

impl OpeningSpec {
    pub fn area_sf(&self) -> f64 {
        self.width_ft * self.height_ft
    }
}

/// Window and door types keyed by their drawing mark
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecLibrary {
    #[serde(default)]
    pub windows: BTreeMap<String, OpeningSpec>,
    #[serde(default)]
    pub doors: BTreeMap<String, OpeningSpec>,
}

impl SpecLibrary {
    pub fn is_empty(&self) -> bool {
        self.windows.is_empty() && self.doors.is_empty()
    }
}

/// page -> view label -> tag mark -> count
pub type SurveyData = BTreeMap<u32, BTreeMap<String, BTreeMap<String, u32>>>;

/// page -> view label -> pixels per foot
pub type ScaleData = BTreeMap<u32, BTreeMap<String, f64>>;

/// One row of the quantity takeoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineItem {
    pub page: u32,
    pub view: String,
    pub category: String,
    pub description: String,
    #[serde(default)]
    pub dimensions: Option<String>,
    pub count: u32,
    pub unit_sf: f64,
    pub total_sf: f64,
}

impl LineItem {
    pub fn is_deduction(&self) -> bool {
        self.category.trim().eq_ignore_ascii_case("deduction")
    }

    pub fn is_eifs(&self) -> bool {
        self.category.to_uppercase().contains("EIFS")
    }
}

/// Output of the takeoff stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TakeoffOutput {
    pub line_items: Vec<LineItem>,
    pub grand_total: f64,
}

/// Sum of deduction rows (negative square footage)
pub fn total_deductions(line_items: &[LineItem]) -> f64 {
    line_items
        .iter()
        .filter(|item| item.is_deduction())
        .map(|item| item.total_sf)
        .sum()
}
