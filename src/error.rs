//! Domain-specific error types for the question/answer session server

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Main error type for the session manager and its HTTP surface
#[derive(Error, Debug)]
pub enum QnaError {
    #[error("Validation error: {message}")]
    Validation { message: String },

    #[error("Not found: {message}")]
    NotFound { message: String },

    #[error("Delegate error: {message}")]
    Delegate { message: String },

    #[error("Timeout error: delegate {verb} timed out after {timeout_ms}ms")]
    DelegateTimeout { verb: String, timeout_ms: u64 },

    #[error("Unexpected delegate output for {verb}: {message}")]
    UnexpectedOutput { verb: String, message: String },

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl QnaError {
    pub fn validation(message: impl Into<String>) -> Self {
        QnaError::Validation {
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        QnaError::NotFound {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        QnaError::Persistence {
            message: message.into(),
        }
    }

    /// HTTP status the error surfaces as
    pub fn status_code(&self) -> StatusCode {
        match self {
            QnaError::Validation { .. } => StatusCode::BAD_REQUEST,
            QnaError::NotFound { .. } => StatusCode::NOT_FOUND,
            QnaError::Delegate { .. }
            | QnaError::DelegateTimeout { .. }
            | QnaError::UnexpectedOutput { .. }
            | QnaError::Persistence { .. }
            | QnaError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message placed in the `{"error": ...}` body.
    ///
    /// Delegate failures relay the delegate's own text untouched.
    pub fn public_message(&self) -> String {
        match self {
            QnaError::Validation { message }
            | QnaError::NotFound { message }
            | QnaError::Delegate { message }
            | QnaError::Persistence { message }
            | QnaError::Internal { message } => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for QnaError {
    fn from(err: std::io::Error) -> Self {
        QnaError::Persistence {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for QnaError {
    fn from(err: serde_json::Error) -> Self {
        QnaError::Persistence {
            message: format!("JSON error: {}", err),
        }
    }
}

impl From<anyhow::Error> for QnaError {
    fn from(err: anyhow::Error) -> Self {
        QnaError::Internal {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for QnaError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("request failed: {}", self);
        }
        (status, Json(json!({ "error": self.public_message() }))).into_response()
    }
}

/// Result type alias for session operations
pub type Result<T> = std::result::Result<T, QnaError>;
