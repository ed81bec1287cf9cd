//! Error handling
//!
//! `CoreError` is the typed error for the detection/dataset engines;
//! `AppError` maps it onto HTTP responses at the handler boundary.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;
pub type CoreResult<T> = Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// Threshold ordering on the merged rule would be violated.
    #[error(
        "invalid rule thresholds: require critical ({critical}) >= high ({high}) >= medium ({medium}) >= 0"
    )]
    RuleValidation {
        critical: i64,
        high: i64,
        medium: i64,
    },

    /// A default rule every resolution depends on is absent. This is a
    /// deployment problem, not a per-request one.
    #[error("missing default detection rule for resource type '{0}'")]
    MissingDefaultRule(String),

    #[error("no detection history for resource hash '{0}'")]
    UnknownResource(String),

    /// The per-(account, month) aggregation lock could not be acquired
    /// within the bounded wait. The run must be retried, never forced.
    #[error("aggregation already in progress for account {account} month {month}")]
    AggregationRace { account: String, month: String },

    #[error("malformed metrics for resource: {0}")]
    BadMetrics(String),

    #[error("unknown dataset '{0}'")]
    UnknownDataset(String),

    #[error("invalid month '{0}', expected YYYY-MM")]
    InvalidMonth(String),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Conflict(String),
    Unauthorized,
    DatabaseError(String),
    InternalError(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match &self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.as_str()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.as_str()),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.as_str()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "x-user-id header required"),
            AppError::DatabaseError(msg) => {
                tracing::error!("Database error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error occurred")
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::RuleValidation { .. }
            | CoreError::BadMetrics(_)
            | CoreError::UnknownDataset(_)
            | CoreError::InvalidMonth(_) => AppError::BadRequest(err.to_string()),
            CoreError::UnknownResource(_) => AppError::NotFound(err.to_string()),
            CoreError::AggregationRace { .. } => AppError::Conflict(err.to_string()),
            CoreError::Database(e) => AppError::DatabaseError(e.to_string()),
            CoreError::MissingDefaultRule(_) | CoreError::Io(_) | CoreError::Serialization(_) => {
                AppError::InternalError(err.to_string())
            }
        }
    }
}
