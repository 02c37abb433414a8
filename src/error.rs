use std::path::PathBuf;
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::models::Envelope;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Startup-fatal failures while building the effective configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid merged configuration: {0}")]
    Merge(String),
}

/// Lifecycle failures of the HTTP server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("accept loop failed: {0}")]
    Serve(#[source] std::io::Error),

    #[error("in-flight requests still running after {0:?}, connections were force-closed")]
    ShutdownTimeout(Duration),
}

/// Per-request failures. Each maps to one status code and a short client-safe message.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("path escapes the work directory")]
    PathTraversal,

    #[error("file '{0}' already exists")]
    FileExists(String),

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("upload exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("client stalled for longer than {0:?}")]
    RequestTimeout(Duration),

    #[error("no route for this path")]
    RouteNotFound,

    #[error("method not allowed on this route")]
    MethodNotAllowed,

    #[error("server is shutting down")]
    ShuttingDown,

    /// `message` goes to the client, `source` only to the log.
    #[error("{message}")]
    Internal {
        message: &'static str,
        #[source]
        source: BoxError,
    },
}

impl AppError {
    pub fn internal(message: &'static str, source: impl Into<BoxError>) -> Self {
        AppError::Internal {
            message,
            source: source.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::PathTraversal | AppError::FileExists(_) | AppError::BadRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            AppError::NotFound(_) | AppError::RouteNotFound => StatusCode::NOT_FOUND,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            AppError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            AppError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            AppError::PathTraversal => "PathTraversal",
            AppError::FileExists(_) => "FileExists",
            AppError::NotFound(_) => "NotFound",
            AppError::BadRequest(_) => "BadRequest",
            AppError::PayloadTooLarge { .. } => "PayloadTooLarge",
            AppError::RequestTimeout(_) => "RequestTimeout",
            AppError::RouteNotFound => "RouteNotFound",
            AppError::MethodNotAllowed => "MethodNotAllowed",
            AppError::ShuttingDown => "ShuttingDown",
            AppError::Internal { .. } => "InternalError",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        match &self {
            AppError::Internal { message, source } => {
                tracing::error!(error = %source, "{}", message);
            }
            other => tracing::debug!(code = other.code(), "request rejected: {}", other),
        }

        let body = Envelope::<()>::error(status, self.code(), self.to_string());
        (status, Json(body)).into_response()
    }
}
