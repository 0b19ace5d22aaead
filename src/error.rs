use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use uuid::Uuid;

use crate::models::platform::Platform;

/// Errors surfaced by the HTTP trigger API and the Postgres models.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized")]
    Unauthorized,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Database(e) => {
                tracing::error!("Database error: {e}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, "Unauthorized".to_string()),
        };

        let body = axum::Json(json!({ "error": message }));
        (status, body).into_response()
    }
}

/// How the retry executor treats a failed collector call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Provider asked us to slow down; wait for the rate-limit window to reset.
    RateLimit,
    /// Timeouts, connection failures and 5xx; retry with exponential backoff.
    Transient,
    /// Everything else; fail fast.
    Permanent,
}

impl ErrorKind {
    /// Classify a free-text upstream error message.
    ///
    /// Compatibility shim for collaborators that only hand back a message.
    /// Structured [`CollectError`] variants classify from their own data.
    pub fn from_message(message: &str) -> ErrorKind {
        let msg = message.to_lowercase();
        if ["rate limit", "too many requests", "429"]
            .iter()
            .any(|needle| msg.contains(needle))
        {
            ErrorKind::RateLimit
        } else if ["timeout", "network", "503", "502", "500"]
            .iter()
            .any(|needle| msg.contains(needle))
        {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }

    fn from_status(status: u16) -> ErrorKind {
        match status {
            429 => ErrorKind::RateLimit,
            408 | 500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Permanent,
        }
    }
}

/// Errors produced while collecting from a platform.
#[derive(Debug, thiserror::Error)]
pub enum CollectError {
    #[error("No collector available for platform: {0}")]
    NoCollector(Platform),

    #[error("Account {0} has invalid or expired token")]
    InvalidToken(Uuid),

    #[error("Rate limit hit on {platform}: {message}")]
    RateLimited { platform: Platform, message: String },

    #[error("Rate limit exceeded after {retries} retries")]
    RateLimitExhausted { retries: u32 },

    #[error("{platform} API returned {status}: {message}")]
    Api {
        platform: Platform,
        status: u16,
        message: String,
    },

    #[error("Network error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Failed to decode {context}: {source}")]
    Deserialize {
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Store error: {0}")]
    Store(String),

    #[error("collection cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl CollectError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CollectError::RateLimited { .. } | CollectError::RateLimitExhausted { .. } => {
                ErrorKind::RateLimit
            }
            CollectError::Api { status, .. } => ErrorKind::from_status(*status),
            CollectError::Http(e) => match e.status() {
                Some(status) => ErrorKind::from_status(status.as_u16()),
                None if e.is_decode() || e.is_builder() => ErrorKind::Permanent,
                None => ErrorKind::Transient,
            },
            CollectError::Other(message) => ErrorKind::from_message(message),
            CollectError::NoCollector(_)
            | CollectError::InvalidToken(_)
            | CollectError::Deserialize { .. }
            | CollectError::Store(_)
            | CollectError::Cancelled => ErrorKind::Permanent,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        self.kind() == ErrorKind::RateLimit
    }
}

impl From<AppError> for CollectError {
    fn from(err: AppError) -> Self {
        CollectError::Store(err.to_string())
    }
}
