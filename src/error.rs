//! Error types for agent-relay

use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// Result type alias using [`RelayError`]
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type for agent-relay
#[derive(Debug, Error)]
pub enum RelayError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration parse error
    #[error("Failed to parse config at {path}: {message}")]
    ConfigParse { path: PathBuf, message: String },

    /// Configuration validation error
    #[error("Invalid configuration: {0}")]
    ConfigValidation(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Upstream answered with a non-success status
    #[error("Upstream returned {status}: {message}")]
    Upstream { status: u16, message: String },

    /// The downstream client went away
    #[error("Downstream client disconnected")]
    DownstreamClosed,

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl From<String> for RelayError {
    fn from(s: String) -> Self {
        RelayError::Other(s)
    }
}

impl From<&str> for RelayError {
    fn from(s: &str) -> Self {
        RelayError::Other(s.to_string())
    }
}

impl RelayError {
    /// HTTP status reported to a client when this error ends a request
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Upstream { status, .. } => match StatusCode::from_u16(*status) {
                Ok(code) if code.is_client_error() => code,
                _ => StatusCode::BAD_GATEWAY,
            },
            Self::Http(err) if err.is_timeout() => StatusCode::GATEWAY_TIMEOUT,
            Self::Http(_) => StatusCode::BAD_GATEWAY,
            Self::Json(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        tracing::warn!(%status, error = %self, "request failed before streaming");

        let public_message = match status {
            StatusCode::BAD_GATEWAY => "upstream request failed",
            StatusCode::GATEWAY_TIMEOUT => "upstream request timed out",
            StatusCode::BAD_REQUEST => "request body is not valid JSON",
            StatusCode::INTERNAL_SERVER_ERROR => "internal error",
            _ => "upstream rejected the request",
        };
        (status, public_message).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upstream_client_errors_pass_through() {
        let err = RelayError::Upstream {
            status: 404,
            message: "no such app".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_upstream_server_errors_become_bad_gateway() {
        let err = RelayError::Upstream {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RelayError::from("boom").status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
