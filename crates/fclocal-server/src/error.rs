//! Error types for fclocal-server.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type alias for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors surfaced by the server and the invoke command.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Invocation lifecycle failure (image pull, container create/exec, mounts)
    #[error(transparent)]
    Core(#[from] fclocal_core::CoreError),

    /// Invalid configuration
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    /// Manifest could not be parsed or describes an invalid function
    #[error("invalid manifest: {0}")]
    Manifest(String),

    /// Request signature does not match the one computed from credentials
    #[error("Signature doesn't match, request signature is {actual}, but server signature is {expected}")]
    SignatureMismatch {
        /// Signature computed by the server
        expected: String,
        /// Value of the `authorization` header
        actual: String,
    },

    /// Secret rejected by the MAC
    #[error("invalid signing key: {0}")]
    SigningKey(#[from] hmac::digest::InvalidLength),

    /// No function with this service and function name
    #[error("function not found: {service}/{function}")]
    FunctionNotFound { service: String, function: String },

    /// The HTTP trigger does not accept this method
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ServerError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::FunctionNotFound { .. } => StatusCode::NOT_FOUND,
            Self::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!(error = %self, "Request failed");
        }
        (status, self.to_string()).into_response()
    }
}
