//! Error types for the notification fan-out pipeline.
//!
//! Two layers:
//! - [`NotificationError`]: store, validation and lookup failures surfaced to callers.
//! - [`DeliveryError`]: per-recipient failures, aggregated by the executor and
//!   never propagated past it.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use crate::models::JobId;

/// Result type for notification operations.
pub type NotificationResult<T> = Result<T, NotificationError>;

/// Errors that can occur in the notifications domain.
#[derive(Debug, Error)]
pub enum NotificationError {
    /// Job identifier unknown to the job store or dead-letter set.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// Optimistic update rejected: the stored state is not the one the caller observed.
    #[error("Conflict on job {job_id}: expected {expected}, found {actual}")]
    Conflict {
        job_id: JobId,
        expected: String,
        actual: String,
    },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Job already exists: {0}")]
    DuplicateJob(JobId),

    /// Backend unavailable or command failure.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl NotificationError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, NotificationError::Conflict { .. })
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, NotificationError::NotFound(_))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            NotificationError::NotFound(_) => StatusCode::NOT_FOUND,
            NotificationError::Conflict { .. } | NotificationError::DuplicateJob(_) => {
                StatusCode::CONFLICT
            }
            NotificationError::Validation(_) => StatusCode::BAD_REQUEST,
            NotificationError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
            NotificationError::Serialization(_)
            | NotificationError::Config(_)
            | NotificationError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            NotificationError::NotFound(_) => "not_found",
            NotificationError::Conflict { .. } => "conflict",
            NotificationError::Validation(_) => "validation_error",
            NotificationError::DuplicateJob(_) => "duplicate_job",
            NotificationError::Store(_) => "store_unavailable",
            NotificationError::Serialization(_) => "serialization_error",
            NotificationError::Config(_) => "config_error",
            NotificationError::Internal(_) => "internal_error",
        }
    }
}

impl From<redis::RedisError> for NotificationError {
    fn from(err: redis::RedisError) -> Self {
        NotificationError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for NotificationError {
    fn from(err: serde_json::Error) -> Self {
        NotificationError::Serialization(err.to_string())
    }
}

impl From<validator::ValidationErrors> for NotificationError {
    fn from(err: validator::ValidationErrors) -> Self {
        NotificationError::Validation(err.to_string())
    }
}

impl From<core_config::ConfigError> for NotificationError {
    fn from(err: core_config::ConfigError) -> Self {
        NotificationError::Config(err.to_string())
    }
}

impl IntoResponse for NotificationError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": self.kind(),
            "message": self.to_string(),
        }));

        (status, body).into_response()
    }
}

/// Category of a recipient delivery failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCategory {
    /// Worth another pass.
    Transient,
    /// Retrying will not help (bad address, rejected payload).
    Permanent,
}

/// Failure of a single recipient delivery.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("transient delivery failure: {0}")]
    Transient(String),

    #[error("permanent delivery failure: {0}")]
    Permanent(String),

    #[error("delivery timed out after {0}ms")]
    Timeout(u64),
}

impl DeliveryError {
    pub fn transient(message: impl Into<String>) -> Self {
        DeliveryError::Transient(message.into())
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        DeliveryError::Permanent(message.into())
    }

    /// Timeouts are transient: the channel may simply have been slow.
    pub fn category(&self) -> ErrorCategory {
        match self {
            DeliveryError::Transient(_) | DeliveryError::Timeout(_) => ErrorCategory::Transient,
            DeliveryError::Permanent(_) => ErrorCategory::Permanent,
        }
    }
}
