//! Error types for certaudio-gen
//!
//! Four families, matching where a failure is allowed to propagate:
//! - [`ExternalError`]: one collaborator call (catalog, search, narration, speech, storage)
//! - [`DiscoveryError`]: aborts a whole discovery run
//! - [`UnitFailure`]: scoped to a single episode unit, never aborts a batch
//! - [`ApiError`]: HTTP responses of the read API

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use thiserror::Error;

/// Failure of a single call to an external collaborator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExternalError {
    /// HTTP 429 or equivalent quota signal
    #[error("Rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// Network hiccup, connection reset, 5xx without a better classification
    #[error("Transient error: {0}")]
    Transient(String),

    /// Per-call timeout elapsed
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Newly granted credentials that have not propagated yet (401/403)
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Service reported itself unavailable (503 and friends)
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// Generation or synthesis refused this specific content
    #[error("Content policy rejection: {0}")]
    ContentPolicy(String),

    /// Speech service rejected the markup itself
    #[error("Invalid markup: {0}")]
    InvalidMarkup(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Anything else that will not get better by retrying
    #[error("Permanent error: {0}")]
    Permanent(String),
}

impl ExternalError {
    /// Retryable-error predicate used by the retry policy
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ExternalError::RateLimited { .. }
                | ExternalError::Transient(_)
                | ExternalError::Timeout(_)
                | ExternalError::Unauthorized(_)
                | ExternalError::ServiceUnavailable(_)
        )
    }

    /// Classify an HTTP status returned by a collaborator
    pub fn from_status(status: u16, retry_after: Option<Duration>, body: &str) -> Self {
        let detail = format!("HTTP {}: {}", status, truncate(body, 300));
        match status {
            429 => ExternalError::RateLimited { retry_after },
            401 | 403 => ExternalError::Unauthorized(detail),
            404 => ExternalError::NotFound(detail),
            408 => ExternalError::Transient(detail),
            502..=504 => ExternalError::ServiceUnavailable(detail),
            500..=599 => ExternalError::Transient(detail),
            _ => ExternalError::Permanent(detail),
        }
    }
}

impl From<reqwest::Error> for ExternalError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            ExternalError::Transient(err.to_string())
        } else if err.is_decode() {
            ExternalError::Permanent(format!("Malformed response: {}", err))
        } else {
            ExternalError::Transient(err.to_string())
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Errors that abort a discovery run; no partial result is published
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// A catalog or outline fetch failed after retries
    #[error("Catalog fetch failed ({operation}): {source}")]
    Fetch {
        operation: String,
        #[source]
        source: ExternalError,
    },

    /// Two topics share an id within one subject
    #[error("Duplicate topic id in discovery result: {0}")]
    DuplicateTopicId(String),

    /// A topic has no parent grouping
    #[error("Topic {0} has no grouping")]
    MissingGrouping(String),

    #[error(transparent)]
    Storage(#[from] certaudio_common::Error),
}

/// Why a single episode unit ended in `Failed`
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum UnitFailure {
    #[error("content policy rejection during {step}: {message}")]
    ContentPolicy { step: String, message: String },

    #[error("invalid speech markup: {message}")]
    InvalidMarkup { message: String },

    #[error("{step} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        step: String,
        attempts: u32,
        last_error: String,
    },

    #[error("{step} failed: {message}")]
    Permanent { step: String, message: String },

    #[error("storage error during {step}: {message}")]
    Storage { step: String, message: String },

    #[error("topic {topic_id} is missing from the discovery result")]
    MissingTopic { topic_id: String },
}

impl UnitFailure {
    /// Map the final error of a retried external call onto a unit failure reason
    pub fn from_retry(step: &str, err: &crate::utils::RetryError) -> Self {
        match &err.error {
            ExternalError::ContentPolicy(message) => UnitFailure::ContentPolicy {
                step: step.to_string(),
                message: message.clone(),
            },
            ExternalError::InvalidMarkup(message) => UnitFailure::InvalidMarkup {
                message: message.clone(),
            },
            e if e.is_transient() => UnitFailure::RetriesExhausted {
                step: step.to_string(),
                attempts: err.attempts,
                last_error: e.to_string(),
            },
            e => UnitFailure::Permanent {
                step: step.to_string(),
                message: e.to_string(),
            },
        }
    }

    pub fn storage(step: &str, err: impl std::fmt::Display) -> Self {
        UnitFailure::Storage {
            step: step.to_string(),
            message: err.to_string(),
        }
    }
}

/// API error type
#[derive(Debug, Error)]
pub enum ApiError {
    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),

    /// certaudio-common error
    #[error("Common error: {0}")]
    Common(#[from] certaudio_common::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
            ApiError::Common(certaudio_common::Error::NotFound(msg)) => {
                (StatusCode::NOT_FOUND, "NOT_FOUND", msg)
            }
            ApiError::Common(ref err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "COMMON_ERROR",
                err.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": error_code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

/// Result type for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
