//! Error handling for the inventory service.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Persistence failure; fatal to a running scan.
    #[error("Store error: {0}")]
    Store(String),

    #[error("Discovery failed: {0}")]
    Discovery(String),

    #[error("Probe failed for {ip}: {message}")]
    Probe { ip: String, message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::Store(e.to_string())
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let (status, error_code) = match &self {
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Validation(_) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR"),
            Error::Store(_) => (StatusCode::INTERNAL_SERVER_ERROR, "STORE_ERROR"),
            Error::Discovery(_) => (StatusCode::BAD_GATEWAY, "DISCOVERY_ERROR"),
            Error::Probe { .. } => (StatusCode::BAD_GATEWAY, "PROBE_ERROR"),
            Error::Serialization(_) => (StatusCode::INTERNAL_SERVER_ERROR, "SERIALIZATION_ERROR"),
            Error::Io(_) => (StatusCode::INTERNAL_SERVER_ERROR, "IO_ERROR"),
            Error::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        let message = self.to_string();

        if status.is_server_error() {
            tracing::error!(status = %status, error_code, message = %message, "Request error");
        } else {
            tracing::debug!(status = %status, error_code, message = %message, "Request rejected");
        }

        let body = Json(json!({
            "error_code": error_code,
            "message": message,
        }));

        (status, body).into_response()
    }
}
