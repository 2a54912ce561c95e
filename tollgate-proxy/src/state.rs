//! Application state for the Tollgate gateway.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tollgate_core::{
    AdmissionConfig, AdmissionQueue, MemoryStore, PolicyStore, RateLimiter, SqliteStore,
    UsageLedger, UserDirectory,
};
use tracing::warn;

use crate::error::ProxyError;
use crate::forward::{Forwarder, OllamaForwarder};

/// Application state shared across all handlers
pub struct AppState {
    /// Upstream runtime client
    pub forwarder: Arc<dyn Forwarder>,

    /// Admission queue bounding upstream concurrency
    pub queue: AdmissionQueue,

    /// Token cap evaluation
    pub limiter: RateLimiter,

    /// API key resolution and user management
    pub users: Arc<dyn UserDirectory>,

    /// Per-user rate-limit policies
    pub policies: Arc<dyn PolicyStore>,

    /// Usage ledger
    pub ledger: Arc<dyn UsageLedger>,

    /// Runtime statistics
    pub stats: Mutex<ProxyStats>,

    /// Configuration
    pub config: ProxyConfig,
}

impl AppState {
    /// Create state backed by Ollama and the configured store: SQLite at
    /// `db_path`, or memory when no path is set
    pub async fn new(config: ProxyConfig) -> Result<Self, ProxyError> {
        let forwarder = Arc::new(OllamaForwarder::new(&config.ollama_url, config.upstream_timeout)?);

        match config.db_path.clone() {
            Some(path) => {
                let store = SqliteStore::open(&path).await?;
                Ok(Self::with_backends(config, forwarder, Arc::new(store)))
            }
            None => {
                warn!("No database path set; users and usage will not survive a restart");
                Ok(Self::with_backends(config, forwarder, Arc::new(MemoryStore::new())))
            }
        }
    }

    /// Create state from explicit collaborators
    pub fn with_backends<S>(config: ProxyConfig, forwarder: Arc<dyn Forwarder>, store: Arc<S>) -> Self
    where
        S: UserDirectory + PolicyStore + UsageLedger + 'static,
    {
        let policies: Arc<dyn PolicyStore> = store.clone();
        let ledger: Arc<dyn UsageLedger> = store.clone();
        let users: Arc<dyn UserDirectory> = store;

        Self {
            forwarder,
            queue: AdmissionQueue::new(config.admission.clone()),
            limiter: RateLimiter::new(policies.clone(), ledger.clone()),
            users,
            policies,
            ledger,
            stats: Mutex::new(ProxyStats::default()),
            config,
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to bind
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Ollama backend URL
    pub ollama_url: String,

    /// Upper bound on one upstream exchange
    pub upstream_timeout: Duration,

    /// Concurrency cap and queue depth
    pub admission: AdmissionConfig,

    /// SQLite database file; `None` keeps everything in memory
    pub db_path: Option<String>,

    /// Enable verbose logging
    pub verbose: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            ollama_url: "http://127.0.0.1:11434".to_string(),
            upstream_timeout: Duration::from_secs(300),
            admission: AdmissionConfig::default(),
            db_path: Some("tollgate.db".to_string()),
            verbose: false,
        }
    }
}

impl ProxyConfig {
    /// Create config from environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            host: std::env::var("TOLLGATE_HOST").unwrap_or(defaults.host),
            port: std::env::var("TOLLGATE_PORT")
                .or_else(|_| std::env::var("PORT"))
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            ollama_url: std::env::var("OLLAMA_BASE_URL")
                .or_else(|_| std::env::var("OLLAMA_HOST"))
                .map(|url| normalize_base_url(&url))
                .unwrap_or(defaults.ollama_url),
            upstream_timeout: std::env::var("TOLLGATE_UPSTREAM_TIMEOUT_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.upstream_timeout),
            admission: AdmissionConfig::from_env(),
            db_path: match std::env::var("DB_PATH") {
                Ok(path) => parse_db_path(&path),
                Err(_) => defaults.db_path,
            },
            verbose: std::env::var("TOLLGATE_VERBOSE")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
        }
    }

    /// `host:port` to bind
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// An empty path or `:memory:` selects the in-memory store
pub fn parse_db_path(path: &str) -> Option<String> {
    match path.trim() {
        "" | ":memory:" => None,
        path => Some(path.to_string()),
    }
}

/// `OLLAMA_HOST` is often set without a scheme (`127.0.0.1:11434`)
pub fn normalize_base_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    if url.starts_with("http://") || url.starts_with("https://") {
        url.to_string()
    } else {
        format!("http://{}", url)
    }
}

/// Runtime statistics
#[derive(Debug, Default, Clone, Serialize)]
pub struct ProxyStats {
    /// Chat requests received past authentication
    pub requests_total: u64,

    /// Requests that got an upstream answer
    pub requests_success: u64,

    /// Requests that failed after admission or were rejected by the queue
    pub requests_failed: u64,

    /// Requests that had to wait for a slot
    pub requests_queued: u64,

    /// Requests shed because the queue was full
    pub requests_rejected: u64,

    /// Total tokens written to the ledger
    pub tokens_recorded: u64,
}

impl ProxyStats {
    /// Calculate success rate
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            1.0
        } else {
            self.requests_success as f64 / self.requests_total as f64
        }
    }
}
