//! HTTP route handlers for the Tollgate gateway.
//!
//! This module organizes all route handlers:
//! - `openai`: OpenAI-compatible chat completions and model list
//! - `usage`: per-caller usage summary
//! - `admin`: user and rate-limit policy management, queue snapshot
//! - `health`: health checks and metrics endpoints

pub mod admin;
pub mod health;
pub mod openai;
pub mod usage;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::error::ProxyError;

pub use admin::{create_user, get_limits, queue_status, set_limits};
pub use health::{health, live, metrics, metrics_prometheus, ready};
pub use openai::{chat_completions, list_models, QUEUE_POSITION_HEADER};
pub use usage::usage;

/// Decode a JSON body, reporting failures in the gateway's error format
pub(crate) fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T, ProxyError> {
    serde_json::from_slice(body)
        .map_err(|e| ProxyError::InvalidRequest(format!("Invalid JSON body: {}", e)))
}
