//! Error types for the sandbox engine

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the sandbox engine
#[derive(Debug, Error)]
pub enum Error {
    // Not found
    #[error("sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("session not found")]
    SessionNotFound(String),

    #[error("template not found: {0}")]
    TemplateNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    // Conflict
    #[error("sandbox is already stopped: {0}")]
    SandboxStopped(String),

    #[error("session is not in ready state: {0}")]
    SessionNotReady(String),

    // Validation
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    InvalidRequest(String),

    // Auth
    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    PermissionDenied(String),

    // External I/O
    #[error("database error: {0}")]
    Database(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("service error: {0}")]
    Service(String),

    // Readiness
    #[error("not ready: {0}")]
    NotReady(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Machine-readable error code carried in the response envelope
    pub fn code(&self) -> &'static str {
        match self {
            Error::SandboxNotFound(_) | Error::SessionNotFound(_) | Error::NotFound(_) => {
                "not_found"
            }
            Error::TemplateNotFound(_) => "template_not_found",
            Error::SandboxStopped(_) => "invalid_request",
            Error::SessionNotReady(_) => "not_ready",
            Error::Validation(_) => "validation_error",
            Error::InvalidRequest(_) => "invalid_request",
            Error::Unauthorized(_) => "unauthorized",
            Error::PermissionDenied(_) => "permission_denied",
            Error::NotReady(_) => "not_ready",
            Error::Database(_) | Error::Runtime(_) | Error::Service(_) | Error::Internal(_) => {
                "internal_error"
            }
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::SandboxNotFound(_)
            | Error::SessionNotFound(_)
            | Error::NotFound(_)
            | Error::TemplateNotFound(_) => StatusCode::NOT_FOUND,

            Error::SandboxStopped(_) | Error::SessionNotReady(_) => StatusCode::CONFLICT,

            Error::Validation(_) | Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::PermissionDenied(_) => StatusCode::FORBIDDEN,

            Error::NotReady(_) => StatusCode::SERVICE_UNAVAILABLE,

            Error::Database(_) | Error::Runtime(_) | Error::Service(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to hand to clients. External I/O detail stays in the
    /// logs; the envelope only names the failing layer.
    fn public_message(&self) -> String {
        match self {
            Error::Database(_) | Error::Runtime(_) | Error::Service(_) | Error::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        }
    }
}

/// Error body inside the `{success, error}` envelope
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: &'static str,
    pub message: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, "request failed");
        }
        let body = json!({
            "success": false,
            "error": ErrorBody {
                code: self.code(),
                message: self.public_message(),
            },
        });
        (status, Json(body)).into_response()
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Database(err.to_string())
    }
}

impl From<bollard::errors::Error> for Error {
    fn from(err: bollard::errors::Error) -> Self {
        Error::Runtime(err.to_string())
    }
}

impl From<redis::RedisError> for Error {
    fn from(err: redis::RedisError) -> Self {
        Error::Service(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Internal(err.to_string())
    }
}
