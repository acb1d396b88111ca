//! # Error Handling
//!
//! Custom error types for the detection backend and their conversion to HTTP
//! responses. The WebSocket layer never lets these propagate out of the
//! per-connection loop: protocol, decode, and detection failures are turned
//! into `error` envelopes at the dispatcher boundary, while the HTTP surface
//! relies on the `ResponseError` implementation below.
//!
//! ## Error Taxonomy:
//! - **Transport errors**: handled by the WebSocket actor directly (the
//!   connection is closed and the session cleaned up), never represented here
//! - **Protocol / decode errors**: recoverable, reported to the client,
//!   connection stays open
//! - **Detection errors**: recoverable at the dispatcher level, not retried
//! - **Duplicate sessions**: rejected deterministically instead of silently
//!   replacing the existing session

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
///
/// ## Error Categories:
/// - **Internal**: Server-side problems (500 errors)
/// - **BadRequest**: Client sent invalid data (400 errors)
/// - **ConfigError**: Configuration problems (500 errors)
/// - **AudioFormat**: Audio payload could not be decoded (400 errors)
/// - **Detection**: The classifier call failed (500 errors)
/// - **DuplicateSession**: Client id is already registered (409 errors)
#[derive(Debug)]
pub enum AppError {
    /// Internal server errors (task panics, poisoned locks, etc.)
    Internal(String),

    /// Client sent invalid or malformed data
    BadRequest(String),

    /// Configuration file or environment variable problems
    ConfigError(String),

    /// Audio payload failed to decode (bad base64, wrong byte length,
    /// non-numeric JSON array, unsupported encoding)
    AudioFormat(String),

    /// The detector rejected the window or failed while classifying it
    Detection(String),

    /// A session with the same client id is already active
    DuplicateSession(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::AudioFormat(msg) => write!(f, "Audio format error: {}", msg),
            AppError::Detection(msg) => write!(f, "Detection error: {}", msg),
            AppError::DuplicateSession(id) => write!(f, "Session '{}' already exists", id),
        }
    }
}

/// Converts application errors into JSON HTTP responses.
///
/// ## JSON Response Format:
/// ```json
/// {
///   "error": {
///     "type": "audio_format_error",
///     "message": "base64 payload is not a multiple of 4 bytes",
///     "timestamp": "2025-01-01T12:00:00Z"
///   }
/// }
/// ```
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::AudioFormat(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "audio_format_error",
                msg.clone(),
            ),
            AppError::Detection(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "detection_error",
                msg.clone(),
            ),
            AppError::DuplicateSession(id) => (
                actix_web::http::StatusCode::CONFLICT,
                "duplicate_session",
                format!("Session '{}' already exists", id),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl std::error::Error for AppError {}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

/// JSON parsing failures are client mistakes, not server faults.
impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = AppError::AudioFormat("payload length is not a multiple of 4".to_string());
        assert_eq!(
            err.to_string(),
            "Audio format error: payload length is not a multiple of 4"
        );

        let err = AppError::DuplicateSession("client-1".to_string());
        assert_eq!(err.to_string(), "Session 'client-1' already exists");
    }

    #[test]
    fn test_converts_into_anyhow_error() {
        // Startup code propagates AppError through anyhow::Result with `?`
        let result: anyhow::Result<()> =
            Err(AppError::ConfigError("unknown detector model".to_string()).into());
        let err = result.unwrap_err();
        assert!(err.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_http_status_mapping() {
        use actix_web::http::StatusCode;

        assert_eq!(
            AppError::AudioFormat("bad".into()).error_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::DuplicateSession("x".into())
                .error_response()
                .status(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError::Detection("failed".into()).error_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
