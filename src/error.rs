//! The error taxonomy described in spec §7.
//!
//! Validation and auth errors never reach storage. Storage errors never
//! escape the worker except as a decision to retry or give up; at the HTTP
//! boundary they collapse to transient (503) or permanent (500).

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("authentication failed")]
    Auth,

    #[error("no coverage")]
    NoCoverage,

    #[error("storage unavailable: {0}")]
    TransientStorage(#[source] sqlx::Error),

    #[error("storage error: {0}")]
    PermanentStorage(#[source] sqlx::Error),

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl AppError {
    /// Classify a storage-layer error the way the worker's retry/give-up
    /// decision is described in spec §7: connection loss and serialization
    /// failures are transient, everything else is treated as permanent.
    pub fn from_storage(err: sqlx::Error) -> Self {
        if is_transient(&err) {
            AppError::TransientStorage(err)
        } else {
            AppError::PermanentStorage(err)
        }
    }
}

/// SQLSTATE class `08` (connection exception) and `40` (transaction
/// rollback, includes serialization_failure `40001`) are retryable.
fn is_transient(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| code.starts_with("08") || code.starts_with("40"))
            .unwrap_or(false),
        _ => false,
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::from_storage(err)
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Auth => StatusCode::UNAUTHORIZED,
            AppError::NoCoverage => StatusCode::NOT_FOUND,
            AppError::TransientStorage(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::PermanentStorage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Internal(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn error_response(&self) -> HttpResponse {
        match self {
            AppError::Auth => HttpResponse::build(self.status_code()).finish(),
            AppError::NoCoverage => {
                HttpResponse::build(self.status_code()).json(json!({ "error": "no_coverage" }))
            }
            AppError::TransientStorage(_) => HttpResponse::build(self.status_code())
                .insert_header(("Retry-After", "1"))
                .json(json!({ "error": "storage_unavailable" })),
            AppError::Validation(msg) => {
                tracing::debug!(%msg, "validation rejected request");
                HttpResponse::build(self.status_code()).json(json!({ "error": "validation", "message": msg }))
            }
            AppError::PermanentStorage(err) => {
                tracing::error!(error = %err, "permanent storage error");
                HttpResponse::build(self.status_code()).finish()
            }
            AppError::Internal(msg) => {
                tracing::error!(%msg, "internal invariant violated, failing closed");
                HttpResponse::build(self.status_code()).finish()
            }
        }
    }
}
