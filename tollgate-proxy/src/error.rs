//! Error types for the Tollgate proxy.
//!
//! Every error renders as an OpenAI-style payload:
//! `{"error": {"message": ..., "type": ..., "code": <status>}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use tollgate_core::{AdmissionError, LimitKind, StoreError};
use tracing::error;

/// Proxy error types
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    /// Failed to reach the runtime at all
    #[error("Failed to connect to upstream: {0}")]
    UpstreamConnection(String),

    /// The runtime answered with a non-success status
    #[error("Upstream error ({status}): {message}")]
    Upstream { status: u16, message: String },

    /// The runtime does not know the requested model
    #[error("Model not found: {0}")]
    ModelNotFound(String),

    /// Request parsing or validation error
    #[error("{0}")]
    InvalidRequest(String),

    /// Referenced resource does not exist
    #[error("{0}")]
    NotFound(String),

    /// Missing or unknown API key
    #[error("{0}")]
    Auth(String),

    /// A token cap is already exhausted
    #[error("Rate limit exceeded: {reason} (limit: {limit}, used: {used})")]
    RateLimited { reason: LimitKind, limit: u64, used: u64 },

    /// Admission queue rejected or dropped the request
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    /// Ledger, policy store or user directory failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    /// HTTP status for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamConnection(_) | ProxyError::Upstream { .. } | ProxyError::Http(_) => {
                StatusCode::BAD_GATEWAY
            }
            ProxyError::ModelNotFound(_) | ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ProxyError::Auth(_) => StatusCode::UNAUTHORIZED,
            ProxyError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            ProxyError::Admission(AdmissionError::QueueFull(_)) => StatusCode::SERVICE_UNAVAILABLE,
            ProxyError::Store(StoreError::UnknownUser(_)) => StatusCode::NOT_FOUND,
            ProxyError::Admission(AdmissionError::Closed)
            | ProxyError::Store(_)
            | ProxyError::Serialization(_)
            | ProxyError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// OpenAI-style error type string
    pub fn error_type(&self) -> &'static str {
        match self {
            ProxyError::UpstreamConnection(_) | ProxyError::Upstream { .. } | ProxyError::Http(_) => {
                "upstream_error"
            }
            ProxyError::ModelNotFound(_) => "model_not_found",
            ProxyError::InvalidRequest(_) | ProxyError::NotFound(_) => "invalid_request",
            ProxyError::Store(StoreError::UnknownUser(_)) => "invalid_request",
            ProxyError::Auth(_) => "auth_error",
            ProxyError::RateLimited { .. } | ProxyError::Admission(AdmissionError::QueueFull(_)) => {
                "rate_limit_exceeded"
            }
            ProxyError::Admission(AdmissionError::Closed)
            | ProxyError::Store(_)
            | ProxyError::Serialization(_)
            | ProxyError::Internal(_) => "internal_error",
        }
    }

    /// Message safe to show a client; internal details stay in the logs
    fn public_message(&self) -> String {
        match self.status_code() {
            StatusCode::INTERNAL_SERVER_ERROR => "Internal server error".to_string(),
            _ => self.to_string(),
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(error = %self, "Request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.public_message(),
                "type": self.error_type(),
                "code": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}
