use axum::{
    extract::State,
    response::Json,
    routing::{get, post},
    Router,
};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::signal;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod batch;
mod config;
mod engine;
mod error;
mod features;
mod grading;
mod model;
mod schema;
mod types;

use batch::BatchScheduler;
use config::Config;
use engine::PredictionEngine;
use error::AppError;
use types::*;

#[derive(Clone)]
struct AppState {
    engine: Arc<PredictionEngine>,
    scheduler: Arc<BatchScheduler>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "predictscore_engine=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env();
    info!("Loaded configuration: {:?}", config);

    // Initialize prediction engine; a failed model load leaves it serving
    // heuristic predictions rather than refusing to start
    let mut engine = PredictionEngine::new(&config);
    if engine.load(&config) {
        info!("System ready with {} model", engine.active_model().as_str());
    } else {
        warn!("System degraded, heuristic predictions only");
    }
    let engine = Arc::new(engine);

    let scheduler = Arc::new(BatchScheduler::new(
        Arc::clone(&engine),
        config.chunk_size,
        config.max_workers,
        config.max_batch_rows,
    ));

    let app_state = AppState {
        engine,
        scheduler,
    };

    // Initialize metrics exporter
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .install()
        .expect("Failed to install Prometheus exporter");

    // Build router
    let app = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/v1/predictions/predict", post(predict_handler))
        .route("/api/v1/predictions/predict-batch", post(predict_batch_handler))
        .route("/api/v1/predictions/predict-csv", post(predict_csv_handler))
        .route("/api/v1/predictions/csv-format", get(csv_format_handler))
        .route("/api/v1/predictions/model-info", get(model_info_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    // Start server
    let addr: SocketAddr = config.bind_addr.parse()?;
    info!("Starting PredictScore engine on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn predict_handler(
    State(state): State<AppState>,
    Json(record): Json<StudentRecord>,
) -> Result<Json<PredictResponse>, AppError> {
    let start = Instant::now();

    metrics::counter!("predict_requests_total").increment(1);

    let (result, cached) = state.engine.predict_one(&record).await?;

    let latency = start.elapsed().as_secs_f64();
    metrics::histogram!("predict_duration_ms").record(latency * 1000.0);

    Ok(Json(PredictResponse {
        score_100: result.score_100,
        score_20: result.score_20,
        letter_grade: result.letter_grade,
        model_used: result.model_used,
        processing_time: round3(latency),
        cached,
        request_id: uuid::Uuid::new_v4().to_string(),
        timestamp: chrono::Utc::now(),
    }))
}

async fn predict_batch_handler(
    State(state): State<AppState>,
    Json(request): Json<BatchPredictRequest>,
) -> Result<Json<BatchPredictResponse>, AppError> {
    let start = Instant::now();

    metrics::counter!("batch_requests_total").increment(1);

    let outcome = state.scheduler.predict_records(request.students).await?;

    let latency = start.elapsed().as_secs_f64();
    metrics::histogram!("batch_duration_ms").record(latency * 1000.0);

    Ok(Json(batch_response(outcome, &state, latency)))
}

async fn predict_csv_handler(
    State(state): State<AppState>,
    body: String,
) -> Result<Json<BatchPredictResponse>, AppError> {
    let start = Instant::now();

    metrics::counter!("csv_requests_total").increment(1);

    if body.trim().is_empty() {
        return Err(error::validation_error("CSV body is empty"));
    }

    let outcome = state.scheduler.predict_csv(&body).await?;

    let latency = start.elapsed().as_secs_f64();
    metrics::histogram!("batch_duration_ms").record(latency * 1000.0);

    info!(
        "CSV batch processed: {} students in {:.2}s",
        outcome.results.len(),
        latency
    );

    Ok(Json(batch_response(outcome, &state, latency)))
}

fn batch_response(outcome: batch::BatchOutcome, state: &AppState, latency: f64) -> BatchPredictResponse {
    let results: Vec<RowResult> = outcome
        .results
        .iter()
        .enumerate()
        .map(|(i, result)| RowResult {
            row: i,
            score_100: result.score_100,
            score_20: result.score_20,
            letter_grade: result.letter_grade,
            model_used: result.model_used,
        })
        .collect();

    BatchPredictResponse {
        total_students: results.len(),
        results,
        statistics: outcome.statistics,
        model_used: state.engine.active_model(),
        processing_time: round3(latency),
        timestamp: chrono::Utc::now(),
    }
}

async fn csv_format_handler() -> Json<serde_json::Value> {
    let columns: Vec<&str> = schema::FEATURE_SPECS
        .iter()
        .filter(|spec| !matches!(spec.kind, schema::FeatureKind::Derived))
        .map(|spec| spec.name)
        .collect();

    Json(serde_json::json!({
        "description": "Expected format for batch prediction CSV uploads",
        "required_columns": schema::REQUIRED_COLUMNS,
        "accepted_columns": columns,
        "notes": [
            "Column names may be canonical (Hours_Studied) or API aliases (study_hours)",
            "An Exam_Score column is dropped before prediction",
            "Missing optional columns fall back to documented defaults",
            "Derived columns (Study_Efficiency, High_Support, Family_Education_Support) are always computed server-side",
            "First row must contain column names"
        ],
    }))
}

async fn model_info_handler(State(state): State<AppState>) -> Json<ModelInfoResponse> {
    let (svr, ridge) = state.engine.availability();
    Json(ModelInfoResponse {
        current_model: state.engine.active_model(),
        available_models: ModelAvailability { svr, ridge },
        metadata: state.engine.metadata().cloned(),
        statistics: state.engine.counters(),
        cache_size: state.engine.cache_size().await,
    })
}

async fn metrics_handler(State(state): State<AppState>) -> Json<MetricsResponse> {
    Json(MetricsResponse {
        statistics: state.engine.counters(),
        cache_size: state.engine.cache_size().await,
        uptime_seconds: state.engine.uptime_seconds(),
    })
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "model_loaded": state.engine.is_loaded(),
        "current_model": state.engine.active_model().as_str(),
        "features_count": schema::FEATURE_COUNT,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn root_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "service": "PredictScore Engine",
        "description": "Exam score prediction API",
        "version": env!("CARGO_PKG_VERSION"),
        "status": if state.engine.is_loaded() { "operational" } else { "degraded" },
        "endpoints": {
            "predict": "/api/v1/predictions/predict",
            "predict_batch": "/api/v1/predictions/predict-batch",
            "predict_csv": "/api/v1/predictions/predict-csv",
            "csv_format": "/api/v1/predictions/csv-format",
            "model_info": "/api/v1/predictions/model-info",
            "health": "/health",
            "metrics": "/metrics"
        },
    }))
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    warn!("Shutdown signal received, starting graceful shutdown");
}
