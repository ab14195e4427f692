//! Error types for the gangway gateway

use std::io;

use axum::http::StatusCode;
use thiserror::Error;

use crate::registry::BackendStatus;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, Error>;

/// Gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Startup configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed backend name or declaration
    #[error("Invalid declaration: {0}")]
    Declaration(String),

    /// Backend name already registered
    #[error("Backend already exists: {0}")]
    AlreadyExists(String),

    /// Backend not found in the registry
    #[error("Backend not found: {0}")]
    NotFound(String),

    /// Backend known but not currently running
    #[error("Backend '{name}' is not running (status: {status})")]
    NotRunning {
        /// Backend name
        name: String,
        /// Status observed at resolution time
        status: BackendStatus,
    },

    /// Backend Runtime failed to construct an instance
    #[error("Build error: {0}")]
    Build(String),

    /// Lifecycle enter/exit failure
    #[error("Lifecycle error: {0}")]
    Lifecycle(String),

    /// Config store persistence failure
    #[error("Store error: {0}")]
    Store(String),

    /// Request forwarding failure
    #[error("Forward error: {0}")]
    Forward(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status this error surfaces as on the management API
    #[must_use]
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Declaration(_) | Self::Config(_) => StatusCode::BAD_REQUEST,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::NotRunning { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Build(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
