//! Error types for clinannot
//!
//! Core taxonomy (`Error`) for the consensus/storage layers plus the HTTP
//! mapping (`ApiError`) used by handlers.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed or missing required input
    #[error("Invalid input: {0}")]
    Validation(String),

    /// Consensus state-machine rule violation (max opinions, duplicate
    /// identical opinion)
    #[error("Consensus rule violation: {0}")]
    Consensus(String),

    /// Unknown fingerprint or record id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Mutation attempted by a reviewer who does not own the slot
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Filesystem I/O failure in the image store
    #[error("Storage error: {0}")]
    Storage(#[from] std::io::Error),

    /// Persistence failure (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// API error type returned by HTTP handlers
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request (400)
    #[error("Invalid request: {0}")]
    BadRequest(String),

    /// Forbidden (403)
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Resource not found (404)
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Internal server error (500)
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) => ApiError::BadRequest(msg),
            Error::Consensus(msg) => ApiError::BadRequest(msg),
            Error::NotFound(msg) => ApiError::NotFound(msg),
            Error::Forbidden(msg) => ApiError::Forbidden(msg),
            Error::Storage(e) => ApiError::Internal(format!("storage failure: {}", e)),
            Error::Database(e) => ApiError::Internal(format!("database failure: {}", e)),
            Error::Config(msg) => ApiError::Internal(msg),
            Error::Internal(msg) => ApiError::Internal(msg),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match self {
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, "NOT_FOUND", msg),
            ApiError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", msg),
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
pub type ApiResult<T> = std::result::Result<T, ApiError>;
