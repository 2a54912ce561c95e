//! Upstream forwarding to the Ollama runtime.
//!
//! Handlers only see the [`Forwarder`] trait. [`OllamaForwarder`] talks to
//! Ollama's OpenAI-compatible endpoints over reqwest; tests plug in their
//! own implementation.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use tracing::{debug, error, info, instrument};

use crate::error::ProxyError;

/// Upstream response body as a byte stream
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

/// A request to relay to the runtime
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    /// Path relative to the upstream base URL, e.g. `/v1/chat/completions`
    pub path: String,
    pub body: Option<Value>,
    /// Return the body as a stream instead of parsing it
    pub stream: bool,
}

impl ForwardRequest {
    /// GET without a body
    pub fn get(path: impl Into<String>) -> Self {
        Self { method: Method::GET, path: path.into(), body: None, stream: false }
    }

    /// POST with a JSON body
    pub fn post(path: impl Into<String>, body: Value, stream: bool) -> Self {
        Self { method: Method::POST, path: path.into(), body: Some(body), stream }
    }
}

/// Successful upstream response
pub enum Forwarded {
    Json { status: u16, body: Value },
    Stream { status: u16, body: ByteStream },
}

impl std::fmt::Debug for Forwarded {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Forwarded::Json { status, body } => {
                f.debug_struct("Json").field("status", status).field("body", body).finish()
            }
            Forwarded::Stream { status, .. } => {
                f.debug_struct("Stream").field("status", status).finish_non_exhaustive()
            }
        }
    }
}

/// Relays requests to the model runtime
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Send `request` upstream. Non-success statuses and transport failures
    /// are errors; a streamed result always carries a body.
    async fn forward(&self, request: ForwardRequest) -> Result<Forwarded, ProxyError>;

    /// Check that the runtime is reachable
    async fn health_check(&self) -> Result<(), ProxyError>;
}

/// reqwest-backed forwarder for Ollama
#[derive(Clone)]
pub struct OllamaForwarder {
    client: Client,
    base_url: String,
}

impl OllamaForwarder {
    /// Create a forwarder for `base_url`. `timeout` bounds a whole upstream
    /// exchange, streamed bodies included.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, ProxyError> {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        info!(url = %base_url, timeout_secs = timeout.as_secs(), "Creating Ollama forwarder");

        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    /// Get the upstream base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.base_url, path)
        } else {
            format!("{}/{}", self.base_url, path)
        }
    }
}

#[async_trait]
impl Forwarder for OllamaForwarder {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path, stream = request.stream))]
    async fn forward(&self, request: ForwardRequest) -> Result<Forwarded, ProxyError> {
        let url = self.url(&request.path);
        debug!(url = %url, "Forwarding request");

        let mut builder = self.client.request(request.method, &url);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(transport_error)?;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, "Upstream returned error");
            return Err(status_error(status, &body));
        }

        if request.stream {
            let body = response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| io::Error::new(io::ErrorKind::Other, e)));
            return Ok(Forwarded::Stream { status: status.as_u16(), body: Box::pin(body) });
        }

        let body: Value = response.json().await?;
        Ok(Forwarded::Json { status: status.as_u16(), body })
    }

    #[instrument(skip(self))]
    async fn health_check(&self) -> Result<(), ProxyError> {
        let url = self.url("/api/tags");
        debug!(url = %url, "Checking upstream health");

        let response = self.client.get(&url).send().await.map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(status_error(status, &body))
        }
    }
}

fn transport_error(err: reqwest::Error) -> ProxyError {
    if err.is_connect() || err.is_timeout() {
        error!(error = %err, "Failed to reach upstream");
        ProxyError::UpstreamConnection(err.to_string())
    } else {
        ProxyError::Http(err)
    }
}

/// Map a non-success upstream answer onto a proxy error
pub(crate) fn status_error(status: StatusCode, body: &str) -> ProxyError {
    let message = upstream_message(body);
    if status == StatusCode::NOT_FOUND {
        ProxyError::ModelNotFound(message)
    } else {
        ProxyError::Upstream { status: status.as_u16(), message }
    }
}

// `{"error": {"message": ...}}`, `{"error": "..."}`, or the raw text
fn upstream_message(body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<Value>(body) {
        let error = &value["error"];
        if let Some(message) = error["message"].as_str().or_else(|| error.as_str()) {
            return message.to_string();
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        "no response body".to_string()
    } else {
        trimmed.chars().take(512).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forwarder_url_joining() {
        let forwarder =
            OllamaForwarder::new("http://localhost:11434/", Duration::from_secs(5)).unwrap();
        assert_eq!(forwarder.base_url(), "http://localhost:11434");
        assert_eq!(forwarder.url("/v1/models"), "http://localhost:11434/v1/models");
        assert_eq!(forwarder.url("api/tags"), "http://localhost:11434/api/tags");
    }

    #[test]
    fn test_upstream_message_extraction() {
        assert_eq!(
            upstream_message(r#"{"error":{"message":"model \"x\" not found","type":"api_error"}}"#),
            "model \"x\" not found"
        );
        assert_eq!(upstream_message(r#"{"error":"busy"}"#), "busy");
        assert_eq!(upstream_message("  plain failure \n"), "plain failure");
        assert_eq!(upstream_message(""), "no response body");
    }

    #[test]
    fn test_status_error_mapping() {
        let err = status_error(StatusCode::NOT_FOUND, r#"{"error":{"message":"no such model"}}"#);
        assert!(matches!(err, ProxyError::ModelNotFound(ref m) if m == "no such model"));

        let err = status_error(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, ProxyError::Upstream { status: 500, ref message } if message == "boom"));
    }

    #[tokio::test]
    async fn test_unreachable_upstream_is_connection_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let forwarder =
            OllamaForwarder::new(format!("http://{}", addr), Duration::from_secs(5)).unwrap();
        let err = forwarder.forward(ForwardRequest::get("/v1/models")).await.unwrap_err();
        assert!(matches!(err, ProxyError::UpstreamConnection(_)), "{err:?}");

        assert!(forwarder.health_check().await.is_err());
    }
}
