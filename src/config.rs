use std::env;
use tracing::warn;

// What the feature pipeline does when an assembled vector does not match the
// canonical feature count. `Reject` surfaces the record as a schema-drift
// error; `Pad` deterministically fills/truncates with the neutral value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaDriftPolicy {
    Pad,
    Reject,
}

impl SchemaDriftPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaDriftPolicy::Pad => "pad",
            SchemaDriftPolicy::Reject => "reject",
        }
    }

    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "pad" => SchemaDriftPolicy::Pad,
            "reject" => SchemaDriftPolicy::Reject,
            other => {
                warn!("unknown schema drift policy '{}', using 'reject'", other);
                SchemaDriftPolicy::Reject
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub svr_model_path: String,
    pub svr_scaler_path: String,
    pub ridge_model_path: String,
    pub ridge_scaler_path: String,
    pub metadata_path: String,
    pub chunk_size: usize,
    pub max_workers: usize,
    pub max_batch_rows: usize,
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: usize,
    pub on_schema_drift: SchemaDriftPolicy,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env::var("PREDICTSCORE_BIND")
                .unwrap_or_else(|_| "0.0.0.0:8001".to_string()),
            svr_model_path: env::var("PREDICTSCORE_SVR_MODEL")
                .unwrap_or_else(|_| "models/svr_model.json".to_string()),
            svr_scaler_path: env::var("PREDICTSCORE_SVR_SCALER")
                .unwrap_or_else(|_| "models/scaler_svr.json".to_string()),
            ridge_model_path: env::var("PREDICTSCORE_RIDGE_MODEL")
                .unwrap_or_else(|_| "models/ridge_model.json".to_string()),
            ridge_scaler_path: env::var("PREDICTSCORE_RIDGE_SCALER")
                .unwrap_or_else(|_| "models/scaler_ridge.json".to_string()),
            metadata_path: env::var("PREDICTSCORE_METADATA")
                .unwrap_or_else(|_| "models/metadata.json".to_string()),
            chunk_size: parse_env("PREDICTSCORE_CHUNK_SIZE", 500),
            max_workers: parse_env("PREDICTSCORE_MAX_WORKERS", 4),
            max_batch_rows: parse_env("PREDICTSCORE_MAX_BATCH_ROWS", 5000),
            cache_ttl_seconds: parse_env("PREDICTSCORE_CACHE_TTL_SECONDS", 3600),
            cache_max_entries: parse_env("PREDICTSCORE_CACHE_MAX_ENTRIES", 5000),
            on_schema_drift: SchemaDriftPolicy::parse(
                &env::var("PREDICTSCORE_ON_SCHEMA_DRIFT").unwrap_or_else(|_| "reject".to_string()),
            ),
        }
    }
}

fn parse_env<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drift_policy_parse() {
        assert_eq!(SchemaDriftPolicy::parse("pad"), SchemaDriftPolicy::Pad);
        assert_eq!(SchemaDriftPolicy::parse("REJECT"), SchemaDriftPolicy::Reject);
        assert_eq!(SchemaDriftPolicy::parse("bogus"), SchemaDriftPolicy::Reject);
    }
}
