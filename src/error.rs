//! Error types for Marketvault
//!
//! Errors are split by tier. Layer errors (`SigningError`, `UploadError`,
//! `SourceError`, `NotifyError`) describe a single operation; the backup jobs
//! fold them into history records instead of propagating them. `AppError` is
//! what reaches the HTTP surface and implements `IntoResponse`.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type
///
/// Maps every failure that can escape a handler to an HTTP status code
/// and a JSON error body.
#[derive(Debug, Error)]
pub enum AppError {
    /// Authentication required (401)
    #[error("Authentication required")]
    Unauthorized,

    /// Access denied (403)
    #[error("Access denied")]
    Forbidden,

    /// Validation error (400)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Database error (500)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Signature verification failed (401)
    #[error("Invalid signature")]
    InvalidSignature,

    /// Configuration error (500)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Encryption/decryption error (500)
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// Internal server error (500)
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl IntoResponse for AppError {
    /// Convert error to HTTP response
    ///
    /// Maps each error variant to appropriate HTTP status code
    /// and JSON error body.
    fn into_response(self) -> Response {
        use axum::Json;

        let (status, error_message, error_type) = match &self {
            AppError::Unauthorized => (StatusCode::UNAUTHORIZED, self.to_string(), "unauthorized"),
            AppError::InvalidSignature => (
                StatusCode::UNAUTHORIZED,
                self.to_string(),
                "invalid_signature",
            ),
            AppError::Forbidden => (StatusCode::FORBIDDEN, self.to_string(), "forbidden"),
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), "validation"),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Database error".to_string(),
                "database",
            ),
            AppError::Config(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "config"),
            AppError::Encryption(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg.clone(), "encryption")
            }
            AppError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
                "internal",
            ),
        };

        // Record error metric
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL
            .with_label_values(&[error_type, "unknown"])
            .inc();

        let body = Json(serde_json::json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Malformed input to the request signer.
///
/// Signing performs no I/O, so these are the only ways it can fail.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SigningError {
    #[error("signing field `{0}` must not be empty")]
    EmptyField(&'static str),

    #[error("invalid HTTP method: {0:?}")]
    InvalidMethod(String),

    #[error("canonical path must start with '/': {0:?}")]
    InvalidPath(String),

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: &'static str },
}

/// Failure of a single signed object PUT.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The destination answered with a non-2xx status.
    #[error("destination rejected upload: HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// The request never produced a response (connect, TLS, timeout).
    #[error("upload transport failure: {detail}")]
    Transport { detail: String, timed_out: bool },

    #[error("failed to sign upload request: {0}")]
    Signing(#[from] SigningError),

    #[error("destination `{0}` has no credentials configured")]
    MissingCredentials(String),

    #[error("invalid destination: {0}")]
    InvalidDestination(String),
}

impl UploadError {
    /// Whether the failure happened below HTTP (no status was received).
    pub fn is_transport(&self) -> bool {
        matches!(self, UploadError::Transport { .. })
    }

    /// HTTP status returned by the destination, if any.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            UploadError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Transport {
            timed_out: err.is_timeout(),
            detail: err.to_string(),
        }
    }
}

/// Failure reading from one of the external data sources.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("read denied for {collection}: {message}")]
    Denied { collection: String, message: String },

    #[error("query failed: {0}")]
    Query(String),

    #[error("source transport failure: {0}")]
    Transport(String),

    #[error("invalid source request: {0}")]
    Invalid(String),
}

/// Failure delivering an operator notification.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("mail transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("mail endpoint rejected message: HTTP {status}")]
    Rejected { status: u16 },
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;
