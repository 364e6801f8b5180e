// Error handling module for the LinkGuard node
//
// This module defines the node's error type and how each error category maps
// onto an HTTP response.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::io;
use std::result;
use thiserror::Error;
use tracing::{debug, error};

/// Result type for LinkGuard node operations
pub type Result<T> = result::Result<T, LinkGuardError>;

/// Error type for LinkGuard node operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkGuardError {
    /// Ciphertext or decrypted payload could not be decoded
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Request is missing something the ingest path requires
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Claim hash or operator token did not verify
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Caller origin is not on the allow-list
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Rate limit exceeded
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Resource not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Storage-related errors, including rejected cluster writes
    #[error("Storage error: {0}")]
    Storage(String),

    /// SQLite errors
    #[error("SQLite error: {0}")]
    Sqlite(String),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Key handling errors
    #[error("Encryption error: {0}")]
    Encryption(String),

    /// IO errors
    #[error("IO error: {0}")]
    IO(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LinkGuardError {
    /// HTTP status for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            LinkGuardError::InvalidPayload(_) | LinkGuardError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            LinkGuardError::Authentication(_) => StatusCode::UNAUTHORIZED,
            LinkGuardError::Forbidden(_) => StatusCode::FORBIDDEN,
            LinkGuardError::RateLimitExceeded(_) => StatusCode::TOO_MANY_REQUESTS,
            LinkGuardError::NotFound(_) => StatusCode::NOT_FOUND,
            LinkGuardError::Storage(_) | LinkGuardError::Sqlite(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            LinkGuardError::Timeout => StatusCode::REQUEST_TIMEOUT,
            LinkGuardError::Config(_)
            | LinkGuardError::Encryption(_)
            | LinkGuardError::IO(_)
            | LinkGuardError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to hand back to a caller. Never describes the payload or
    /// the cluster state.
    fn public_message(&self) -> String {
        match self {
            LinkGuardError::InvalidPayload(_) => "Invalid payload".to_string(),
            LinkGuardError::InvalidRequest(msg) => msg.clone(),
            LinkGuardError::Authentication(_) => "Authentication failed".to_string(),
            LinkGuardError::Forbidden(_) => "Origin not allowed".to_string(),
            LinkGuardError::RateLimitExceeded(_) => "Rate limit exceeded".to_string(),
            LinkGuardError::NotFound(msg) => msg.clone(),
            LinkGuardError::Storage(_) | LinkGuardError::Sqlite(_) => {
                "Storage temporarily unavailable".to_string()
            }
            LinkGuardError::Timeout => "Operation timed out".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

/// Implement IntoResponse for LinkGuardError so it can be returned directly from handlers
impl IntoResponse for LinkGuardError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            error!("Server error: {}", self);
        } else {
            debug!("Client error: {}", self);
        }

        let body = Json(serde_json::json!({
            "error": {
                "code": status.as_u16(),
                "message": self.public_message()
            }
        }));

        (status, body).into_response()
    }
}

// Implement conversion from rusqlite error to LinkGuardError
impl From<rusqlite::Error> for LinkGuardError {
    fn from(err: rusqlite::Error) -> Self {
        LinkGuardError::Sqlite(err.to_string())
    }
}

// Implement conversion from io::Error to LinkGuardError
impl From<io::Error> for LinkGuardError {
    fn from(err: io::Error) -> Self {
        LinkGuardError::IO(err.to_string())
    }
}

// Implement conversion from config loading errors to LinkGuardError
impl From<config::ConfigError> for LinkGuardError {
    fn from(err: config::ConfigError) -> Self {
        LinkGuardError::Config(err.to_string())
    }
}

// Implement conversion from toml serialization error to LinkGuardError
impl From<toml::ser::Error> for LinkGuardError {
    fn from(err: toml::ser::Error) -> Self {
        LinkGuardError::Config(err.to_string())
    }
}

// Blocking tasks only fail this way if they panicked or were cancelled
impl From<tokio::task::JoinError> for LinkGuardError {
    fn from(err: tokio::task::JoinError) -> Self {
        LinkGuardError::Internal(format!("Task failed: {}", err))
    }
}
