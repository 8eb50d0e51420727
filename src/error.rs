use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Fetch transport error: {0}")]
    FetchTransport(String),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Malformed product data: {0}")]
    FetchData(String),

    #[error("Notification delivery error: {0}")]
    Delivery(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Whether a bounded retry can help. Transport-level failures are
    /// transient; data, database, and configuration failures are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, AppError::FetchTransport(_) | AppError::Delivery(_))
    }

    /// Short stable tag persisted into run_errors.error_kind.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Http(_) => "http",
            AppError::FetchTransport(_) => "fetch_transport",
            AppError::Json(_) => "json",
            AppError::Database(_) => "persistence",
            AppError::Migration(_) => "migration",
            AppError::FetchData(_) => "fetch_data",
            AppError::Delivery(_) => "delivery",
            AppError::Config(_) => "config",
            AppError::Io(_) => "io",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            AppError::Config(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::FetchData(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}
