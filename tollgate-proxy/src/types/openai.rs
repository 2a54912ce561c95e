//! OpenAI-compatible API types.
//!
//! Only the fields the gateway inspects are typed. Everything else in a
//! request (sampling parameters, tools, response format, ...) is kept in
//! `extra` and forwarded to the runtime untouched.
//!
//! Reference: https://platform.openai.com/docs/api-reference/chat

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tollgate_core::TokenUsage;

/// Request body for POST /v1/chat/completions
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Model ID (e.g., "llama3.2:3b", "mistral:7b")
    #[serde(default)]
    pub model: String,

    /// Messages in the conversation. Roles and content parts are the
    /// runtime's business, so each message is forwarded as sent.
    #[serde(default)]
    pub messages: Vec<Value>,

    /// Enable streaming; absent or null means a single JSON response
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,

    /// Streaming options; the gateway forces `include_usage` on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<StreamOptions>,

    /// Sampling parameters and anything else, passed through verbatim
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ChatCompletionRequest {
    /// Check the fields the gateway cannot do without
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.model.trim().is_empty() || self.messages.is_empty() {
            return Err("model and messages are required");
        }
        Ok(())
    }

    /// Whether the caller asked for server-sent events
    pub fn is_streaming(&self) -> bool {
        self.stream == Some(true)
    }

    /// Ask the runtime to append a usage chunk to the stream
    pub fn request_stream_usage(&mut self) {
        self.stream_options
            .get_or_insert_with(StreamOptions::default)
            .include_usage = true;
    }
}

/// `stream_options` object
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamOptions {
    #[serde(default)]
    pub include_usage: bool,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The only part of a completion or chunk the gateway reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UsageEnvelope {
    #[serde(default)]
    pub usage: Option<TokenUsage>,
}

impl UsageEnvelope {
    /// Extract usage from a completion body; absent or malformed is `None`
    pub fn from_value(body: &Value) -> Option<TokenUsage> {
        body.get("usage")
            .and_then(|usage| TokenUsage::deserialize(usage).ok())
    }
}
