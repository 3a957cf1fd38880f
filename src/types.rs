use crate::grading::LetterGrade;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

// Raw client payload: field names may be API aliases or canonical column
// names, values may be numbers or categorical strings. Unknown extra keys are
// ignored; missing keys receive schema defaults during feature extraction.
pub type StudentRecord = HashMap<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Svr,
    Ridge,
    Heuristic,
}

impl ModelKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelKind::Svr => "svr",
            ModelKind::Ridge => "ridge",
            ModelKind::Heuristic => "heuristic",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct PredictionResult {
    pub score_100: f64,
    pub score_20: f64,
    pub letter_grade: LetterGrade,
    pub model_used: ModelKind,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchPredictRequest {
    pub students: Vec<StudentRecord>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PredictResponse {
    pub score_100: f64,
    pub score_20: f64,
    pub letter_grade: LetterGrade,
    pub model_used: ModelKind,
    pub processing_time: f64,
    pub cached: bool,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RowResult {
    pub row: usize,
    pub score_100: f64,
    pub score_20: f64,
    pub letter_grade: LetterGrade,
    pub model_used: ModelKind,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GradeCounts {
    #[serde(rename = "AD")]
    pub ad: u64,
    #[serde(rename = "A")]
    pub a: u64,
    #[serde(rename = "B")]
    pub b: u64,
    #[serde(rename = "C")]
    pub c: u64,
}

impl GradeCounts {
    pub fn record(&mut self, grade: LetterGrade) {
        match grade {
            LetterGrade::AD => self.ad += 1,
            LetterGrade::A => self.a += 1,
            LetterGrade::B => self.b += 1,
            LetterGrade::C => self.c += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.ad + self.a + self.b + self.c
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct GradePercentages {
    #[serde(rename = "AD")]
    pub ad: f64,
    #[serde(rename = "A")]
    pub a: f64,
    #[serde(rename = "B")]
    pub b: f64,
    #[serde(rename = "C")]
    pub c: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GradeDistribution {
    pub counts: GradeCounts,
    pub percentages: GradePercentages,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchStatistics {
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub std: f64,
    pub grade_distribution: GradeDistribution,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchPredictResponse {
    pub total_students: usize,
    pub results: Vec<RowResult>,
    pub statistics: BatchStatistics,
    pub model_used: ModelKind,
    pub processing_time: f64,
    pub timestamp: DateTime<Utc>,
}

// Bookkeeping counters surfaced on /metrics and /api/v1/predictions/model-info
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct EngineCounters {
    pub predictions_count: u64,
    pub batch_predictions_count: u64,
    pub cache_hits: u64,
    pub errors_count: u64,
    pub model_switches: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelAvailability {
    pub svr: bool,
    pub ridge: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelInfoResponse {
    pub current_model: ModelKind,
    pub available_models: ModelAvailability,
    pub metadata: Option<crate::model::ModelMetadata>,
    pub statistics: EngineCounters,
    pub cache_size: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsResponse {
    pub statistics: EngineCounters,
    pub cache_size: usize,
    pub uptime_seconds: u64,
}
