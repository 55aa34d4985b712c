use axum::{http::StatusCode, response::IntoResponse, Json};
use thiserror::Error;

use crate::fetch::{FetchError, TransportError};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("Upstream returned HTTP {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("Upstream request failed: {0}")]
    Transport(TransportError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Upstream non-2xx keeps its status in the message.
impl From<TransportError> for AppError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Status { status, body } => AppError::Upstream { status, body },
            other => AppError::Transport(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, error) = match &self {
            AppError::Unsupported(_) => (StatusCode::BAD_REQUEST, "Invalid request"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch data from upstream"),
        };
        let body = serde_json::json!({
            "error": error,
            "details": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}
