use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Model artifact error: {0}")]
    ModelArtifact(String),

    #[error("Model inference error: {0}")]
    ModelInference(String),

    #[error("Feature schema drift: {0}")]
    SchemaDrift(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Empty batch: no rows to predict")]
    EmptyBatch,

    #[error("Batch too large: {size} rows (limit {limit})")]
    BatchTooLarge { size: usize, limit: usize },

    #[error("Missing required columns: {}", .0.join(", "))]
    MissingColumns(Vec<String>),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::InvalidInput(_)
            | AppError::EmptyBatch
            | AppError::BatchTooLarge { .. }
            | AppError::MissingColumns(_)
            | AppError::Csv(_) => (StatusCode::BAD_REQUEST, self.to_string()),
            _ => {
                tracing::error!("Internal server error: {}", self);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let mut body = json!({
            "error": error_message,
            "status": status.as_u16(),
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });

        // Callers need the enumerated column list to fix their upload
        if let AppError::MissingColumns(columns) = &self {
            body["missing_columns"] = json!(columns);
        }

        (status, Json(body)).into_response()
    }
}

// Helper function for creating validation errors
pub fn validation_error(msg: &str) -> AppError {
    AppError::InvalidInput(msg.to_string())
}
