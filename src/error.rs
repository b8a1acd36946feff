use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Invalid webhook signature: {0}")]
    Auth(String),

    #[error("Stale webhook request: {0}")]
    StaleRequest(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Bulk registration rolled back at the membership-list or relational layer.
    #[error("Conflict: {message}")]
    BulkConflict {
        message: String,
        failed: Vec<String>,
        skipped: Vec<String>,
        rolled_back: Vec<String>,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Persistence error: {0}")]
    Persistence(String),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Auth(_) | AppError::StaleRequest(_) => StatusCode::UNAUTHORIZED,
            AppError::MalformedPayload(_) | AppError::Persistence(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) | AppError::BulkConflict { .. } => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, AppError::Conflict(_) | AppError::BulkConflict { .. })
    }
}

impl From<tokio_postgres::Error> for AppError {
    fn from(err: tokio_postgres::Error) -> Self {
        if err.code() == Some(&tokio_postgres::error::SqlState::UNIQUE_VIOLATION) {
            return AppError::Conflict(err.to_string());
        }
        if err.is_closed() {
            return AppError::UpstreamUnavailable(format!("Postgres connection closed: {}", err));
        }
        AppError::Persistence(err.to_string())
    }
}

impl From<redis::RedisError> for AppError {
    fn from(err: redis::RedisError) -> Self {
        AppError::UpstreamUnavailable(format!("Membership store error: {}", err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        let body = match &self {
            AppError::BulkConflict {
                failed,
                skipped,
                rolled_back,
                ..
            } => json!({
                "success": false,
                "error": self.to_string(),
                "failed": failed,
                "skipped": skipped,
                "rolledBack": rolled_back,
            }),
            // storage internals stay in the logs
            AppError::Persistence(_) => {
                tracing::error!("{}", self);
                json!({ "success": false, "error": "Internal server error" })
            }
            _ => json!({ "success": false, "error": self.to_string() }),
        };

        (status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
