use crate::{
    config::Config,
    error::AppError,
    features::FeatureVectorBuilder,
    grading,
    model::{ModelBundle, ModelMetadata},
    schema::spec_by_alias,
    types::{EngineCounters, ModelKind, PredictionResult, StudentRecord},
};
use parking_lot::Mutex;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::{
    collections::HashMap,
    time::{Duration, Instant},
};
use tokio::sync::RwLock;
use tracing::{info, warn};

// Fixed fallback weights, ordered by importance in the trained model
const HEURISTIC_WEIGHTS: [(&str, f64); 8] = [
    ("previous_scores", 0.25),
    ("study_hours", 0.20),
    ("attendance", 0.20),
    ("motivation_level", 0.10),
    ("parental_involvement", 0.08),
    ("access_to_resources", 0.07),
    ("tutoring_sessions", 0.05),
    ("teacher_quality", 0.05),
];

#[derive(Debug, Default)]
struct PredictionCache {
    entries: HashMap<String, CachedPrediction>,
}

#[derive(Debug, Clone, Copy)]
struct CachedPrediction {
    result: PredictionResult,
    timestamp: Instant,
    ttl: Duration,
}

// Owns the loaded model/scaler bundles and produces one calibrated score per
// feature vector, degrading SVR -> ridge -> heuristic. Read-only after load;
// shared across request handlers and batch workers.
pub struct PredictionEngine {
    builder: FeatureVectorBuilder,
    svr: Option<ModelBundle>,
    ridge: Option<ModelBundle>,
    active: ModelKind,
    metadata: Option<ModelMetadata>,
    cache: RwLock<PredictionCache>,
    counters: Mutex<EngineCounters>,
    cache_ttl: Duration,
    cache_max_entries: usize,
    start_time: Instant,
}

impl PredictionEngine {
    pub fn new(config: &Config) -> Self {
        Self {
            builder: FeatureVectorBuilder::new(config.on_schema_drift),
            svr: None,
            ridge: None,
            active: ModelKind::Heuristic,
            metadata: None,
            cache: RwLock::new(PredictionCache::default()),
            counters: Mutex::new(EngineCounters::default()),
            cache_ttl: Duration::from_secs(config.cache_ttl_seconds),
            cache_max_entries: config.cache_max_entries,
            start_time: Instant::now(),
        }
    }

    // Attempts to deserialize the primary model and its paired scaler, then
    // the secondary. Never throws: a failed load leaves the engine in a
    // well-defined degraded state and every downgrade is logged.
    pub fn load(&mut self, config: &Config) -> bool {
        match ModelMetadata::load(&config.metadata_path) {
            Ok(metadata) => {
                if let Err(e) = metadata.validate_features() {
                    // Artifacts from a different schema generation; a
                    // permuted feature order silently corrupts predictions
                    warn!("model metadata does not match schema, running degraded: {}", e);
                    self.counters.lock().model_switches += 1;
                    self.active = ModelKind::Heuristic;
                    return false;
                }
                self.metadata = Some(metadata);
            }
            Err(e) => {
                // Metadata is advisory when absent; bundles still self-validate
                warn!("model metadata unavailable: {}", e);
            }
        }

        match ModelBundle::load_svr(&config.svr_model_path, &config.svr_scaler_path) {
            Ok(bundle) => self.svr = Some(bundle),
            Err(e) => {
                warn!("SVR model unavailable, trying ridge fallback: {}", e);
                self.counters.lock().model_switches += 1;
            }
        }

        match ModelBundle::load_ridge(&config.ridge_model_path, &config.ridge_scaler_path) {
            Ok(bundle) => self.ridge = Some(bundle),
            Err(e) => {
                warn!("ridge model unavailable: {}", e);
                if self.svr.is_none() {
                    self.counters.lock().model_switches += 1;
                }
            }
        }

        self.active = if self.svr.is_some() {
            ModelKind::Svr
        } else if self.ridge.is_some() {
            ModelKind::Ridge
        } else {
            ModelKind::Heuristic
        };

        match self.active {
            ModelKind::Heuristic => warn!("no trained model loaded, serving heuristic predictions"),
            kind => info!("prediction engine ready with {} model", kind.as_str()),
        }

        self.svr.is_some() || self.ridge.is_some()
    }

    pub fn is_loaded(&self) -> bool {
        self.svr.is_some() || self.ridge.is_some()
    }

    pub fn active_model(&self) -> ModelKind {
        self.active
    }

    pub fn availability(&self) -> (bool, bool) {
        (self.svr.is_some(), self.ridge.is_some())
    }

    pub fn metadata(&self) -> Option<&ModelMetadata> {
        self.metadata.as_ref()
    }

    pub fn counters(&self) -> EngineCounters {
        *self.counters.lock()
    }

    pub fn record_batch(&self) {
        self.counters.lock().batch_predictions_count += 1;
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub async fn cache_size(&self) -> usize {
        self.cache.read().await.entries.len()
    }

    // Single-record hot path: cache lookup keyed by a canonical hash of the
    // normalized feature vector, inline predict, tolerant cache insert.
    pub async fn predict_one(&self, record: &StudentRecord) -> Result<(PredictionResult, bool), AppError> {
        let vector = self.builder.build(record)?;
        let key = cache_key(&vector);

        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.entries.get(&key) {
                if entry.timestamp.elapsed() < entry.ttl {
                    self.counters.lock().cache_hits += 1;
                    return Ok((entry.result, true));
                }
            }
        }

        let result = match self.predict_vectors(std::slice::from_ref(&vector)) {
            Ok((scores, kind)) => match scores.first() {
                Some(raw) => result_from(*raw, kind),
                None => self.heuristic_result(record),
            },
            Err(e) => {
                warn!("degrading single prediction to heuristic: {}", e);
                self.heuristic_result(record)
            }
        };

        self.cache_insert(key, result).await;
        self.counters.lock().predictions_count += 1;
        Ok((result, false))
    }

    // Batch path: one vectorized scale+predict per chunk. A record the
    // feature pipeline rejects, or a model failure for the whole chunk,
    // degrades to the heuristic; rows are never dropped or reordered.
    pub fn predict_chunk(&self, records: &[StudentRecord]) -> Vec<PredictionResult> {
        let mut built: Vec<(usize, Vec<f64>)> = Vec::with_capacity(records.len());
        for (i, record) in records.iter().enumerate() {
            match self.builder.build(record) {
                Ok(vector) => built.push((i, vector)),
                Err(e) => {
                    warn!(row = i, "record rejected by feature pipeline: {}", e);
                    self.counters.lock().errors_count += 1;
                }
            }
        }

        let mut out: Vec<Option<PredictionResult>> = vec![None; records.len()];
        if !built.is_empty() {
            let rows: Vec<Vec<f64>> = built.iter().map(|(_, v)| v.clone()).collect();
            match self.predict_vectors(&rows) {
                Ok((scores, kind)) => {
                    for ((index, _), raw) in built.iter().zip(scores) {
                        out[*index] = Some(result_from(raw, kind));
                    }
                }
                Err(e) => {
                    warn!("model path failed for chunk, degrading to heuristic: {}", e);
                    self.counters.lock().errors_count += 1;
                }
            }
        }

        out.into_iter()
            .enumerate()
            .map(|(i, slot)| slot.unwrap_or_else(|| self.heuristic_result(&records[i])))
            .collect()
    }

    // Deterministic, pure weighted sum over the raw record, bounded to the
    // same output range as the trained models so grading stays uniform.
    pub fn predict_basic(&self, record: &StudentRecord) -> f64 {
        let mut score = 0.0;
        let mut total_weight = 0.0;

        for (alias, weight) in HEURISTIC_WEIGHTS {
            let value = record
                .get(alias)
                .or_else(|| spec_by_alias(alias).and_then(|spec| record.get(spec.name)));
            let Some(value) = value else { continue };
            let Some(normalized) = heuristic_normalize(alias, value) else {
                continue;
            };
            score += normalized * weight;
            total_weight += weight;
        }

        if total_weight > 0.0 {
            (score / total_weight).clamp(20.0, 95.0)
        } else {
            60.0
        }
    }

    pub fn heuristic_result(&self, record: &StudentRecord) -> PredictionResult {
        result_from(self.predict_basic(record), ModelKind::Heuristic)
    }

    fn predict_vectors(&self, rows: &[Vec<f64>]) -> Result<(Vec<f64>, ModelKind), AppError> {
        let (primary, secondary) = match self.active {
            ModelKind::Svr => (self.svr.as_ref(), self.ridge.as_ref()),
            ModelKind::Ridge => (self.ridge.as_ref(), None),
            ModelKind::Heuristic => (None, None),
        };

        if let Some(bundle) = primary {
            match bundle.predict(rows) {
                Ok(scores) => return Ok((clamp_all(scores), bundle.kind)),
                Err(e) => {
                    warn!("{} prediction failed: {}", bundle.kind.as_str(), e);
                    self.counters.lock().model_switches += 1;
                }
            }
        }

        if let Some(bundle) = secondary {
            match bundle.predict(rows) {
                Ok(scores) => return Ok((clamp_all(scores), bundle.kind)),
                Err(e) => {
                    warn!("{} prediction failed: {}", bundle.kind.as_str(), e);
                    self.counters.lock().model_switches += 1;
                }
            }
        }

        Err(AppError::ModelInference("no trained model available".to_string()))
    }

    async fn cache_insert(&self, key: String, result: PredictionResult) {
        let mut cache = self.cache.write().await;
        cache.entries.insert(
            key,
            CachedPrediction {
                result,
                timestamp: Instant::now(),
                ttl: self.cache_ttl,
            },
        );

        // Clean up old entries
        if cache.entries.len() > self.cache_max_entries {
            if let Some(cutoff) = Instant::now().checked_sub(self.cache_ttl) {
                cache.entries.retain(|_, entry| entry.timestamp > cutoff);
            }
        }
    }

    #[cfg(test)]
    fn with_bundles(svr: Option<ModelBundle>, ridge: Option<ModelBundle>) -> Self {
        let active = if svr.is_some() {
            ModelKind::Svr
        } else if ridge.is_some() {
            ModelKind::Ridge
        } else {
            ModelKind::Heuristic
        };
        Self {
            builder: FeatureVectorBuilder::new(crate::config::SchemaDriftPolicy::Reject),
            svr,
            ridge,
            active,
            metadata: None,
            cache: RwLock::new(PredictionCache::default()),
            counters: Mutex::new(EngineCounters::default()),
            cache_ttl: Duration::from_secs(3600),
            cache_max_entries: 5000,
            start_time: Instant::now(),
        }
    }
}

fn result_from(raw: f64, kind: ModelKind) -> PredictionResult {
    let graded = grading::grade(raw);
    PredictionResult {
        score_100: graded.score_100,
        score_20: graded.score_20,
        letter_grade: graded.grade,
        model_used: kind,
    }
}

fn clamp_all(scores: Vec<f64>) -> Vec<f64> {
    scores.into_iter().map(grading::clamp_score).collect()
}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn heuristic_normalize(feature: &str, value: &Value) -> Option<f64> {
    match feature {
        "previous_scores" | "attendance" => numeric_value(value).map(|v| v.min(100.0)),
        "study_hours" => numeric_value(value).map(|v| (v * 8.0).min(100.0)),
        "tutoring_sessions" => numeric_value(value).map(|v| (v * 20.0).min(100.0)),
        _ => {
            if let Value::String(s) = value {
                return Some(match s.trim() {
                    "Low" | "Poor" => 25.0,
                    "Medium" | "Average" => 50.0,
                    "High" | "Good" => 75.0,
                    other => match other.parse::<f64>() {
                        Ok(v) => (v * 25.0).min(100.0),
                        Err(_) => 50.0,
                    },
                });
            }
            numeric_value(value).map(|v| (v * 25.0).min(100.0))
        }
    }
}

// Canonical cache key: hash of the normalized feature vector, so alias and
// canonical spellings of the same record collide on purpose.
fn cache_key(vector: &[f64]) -> String {
    let mut hasher = Sha256::new();
    for value in vector {
        hasher.update(value.to_le_bytes());
    }
    hex::encode(hasher.finalize())
}
