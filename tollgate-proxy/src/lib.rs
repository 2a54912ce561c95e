//! Tollgate Proxy Library
//!
//! OpenAI-compatible gateway in front of a local Ollama runtime. Every
//! chat completion is authenticated by API key, checked against the
//! caller's token caps, admitted through a priority queue that bounds
//! upstream concurrency, and metered into a usage ledger.
//!
//! The router is exposed separately from the server loop so tests can
//! drive it in-process with their own [`forward::Forwarder`].

use std::sync::Arc;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

pub mod auth;
pub mod error;
pub mod forward;
pub mod metrics;
pub mod routes;
pub mod state;
pub mod tap;
pub mod types;

pub use error::ProxyError;
pub use forward::{ByteStream, ForwardRequest, Forwarded, Forwarder, OllamaForwarder};
pub use state::{AppState, ProxyConfig, ProxyStats};

/// Server configuration for the gateway
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Gateway configuration
    pub proxy: ProxyConfig,
    /// Whether to print the banner on startup
    pub print_banner: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { proxy: ProxyConfig::default(), print_banner: true }
    }
}

/// Initialize Prometheus metrics registry.
/// Should be called once before starting the server.
pub fn init_metrics() {
    if let Err(e) = metrics::register_metrics() {
        warn!("Failed to register Prometheus metrics: {}", e);
    }
}

/// Build the HTTP router over `state`.
///
/// `/v1` routes require a bearer API key; chat completions additionally
/// pass the caller's token caps before they can queue. Admin and health
/// routes are open.
pub fn build_router(state: Arc<AppState>) -> Router {
    let chat = Router::new()
        .route("/v1/chat/completions", post(routes::chat_completions))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::enforce_rate_limits));

    let api = Router::new()
        .merge(chat)
        .route("/v1/models", get(routes::list_models))
        .route("/v1/usage", get(routes::usage))
        .route_layer(middleware::from_fn_with_state(state.clone(), auth::authenticate));

    Router::new()
        // Health endpoints
        .route("/health", get(routes::health))
        .route("/ready", get(routes::ready))
        .route("/live", get(routes::live))
        .route("/metrics", get(routes::metrics))
        .route("/metrics/prometheus", get(routes::metrics_prometheus))
        // Admin endpoints
        .route("/admin/users", post(routes::create_user))
        .route("/admin/limits", post(routes::set_limits))
        .route("/admin/limits/:user_id", get(routes::get_limits))
        .route("/admin/queue", get(routes::queue_status))
        // OpenAI-compatible endpoints
        .merge(api)
        // Middleware
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the Tollgate server.
///
/// This function starts the HTTP server and blocks until it receives
/// Ctrl-C or SIGTERM.
///
/// # Example
/// ```no_run
/// use tollgate_proxy::{run_server, ProxyConfig, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> anyhow::Result<()> {
///     let config = ServerConfig {
///         proxy: ProxyConfig { port: 8000, ..ProxyConfig::from_env() },
///         ..Default::default()
///     };
///     run_server(config).await
/// }
/// ```
pub async fn run_server(config: ServerConfig) -> anyhow::Result<()> {
    init_metrics();

    let proxy_config = config.proxy.clone();
    info!(
        addr = %proxy_config.bind_addr(),
        ollama_url = %proxy_config.ollama_url,
        max_concurrency = proxy_config.admission.max_concurrency,
        max_queue_depth = proxy_config.admission.max_queue_depth,
        db_path = proxy_config.db_path.as_deref().unwrap_or(":memory:"),
        "Starting Tollgate v{}",
        env!("CARGO_PKG_VERSION")
    );

    let state = Arc::new(AppState::new(proxy_config.clone()).await?);
    metrics::observe_queue(&state.queue.status());

    // Check Ollama connectivity
    match state.forwarder.health_check().await {
        Ok(_) => {
            metrics::set_backend_healthy(true);
            info!("Connected to Ollama at {}", proxy_config.ollama_url);
        }
        Err(e) => {
            metrics::set_backend_healthy(false);
            warn!(
                "Could not connect to Ollama at {}: {}. \
                 Gateway will start anyway and retry on requests.",
                proxy_config.ollama_url, e
            );
        }
    }

    let app = build_router(state.clone());

    let addr = proxy_config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("Tollgate listening on http://{}", addr);
    info!("OpenAI API: http://{}/v1/chat/completions", addr);
    info!("Health:     http://{}/health", addr);

    if config.print_banner {
        print_banner(&proxy_config);
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Tollgate stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}

/// Print the startup banner
fn print_banner(config: &ProxyConfig) {
    println!();
    println!("==================================================");
    println!("  Tollgate v{}", env!("CARGO_PKG_VERSION"));
    println!("==================================================");
    println!("  Listening on: http://{}", config.bind_addr());
    println!("  Ollama backend: {}", config.ollama_url);
    println!("  Upstream timeout: {}s", config.upstream_timeout.as_secs());
    println!("  Database: {}", config.db_path.as_deref().unwrap_or("in-memory"));
    println!();
    println!("  Admission:");
    println!("    Max concurrency: {}", config.admission.max_concurrency);
    println!("    Max queue depth: {}", config.admission.max_queue_depth);
    println!();
    println!("  Endpoints:");
    println!("    OpenAI: POST /v1/chat/completions");
    println!("    Models: GET  /v1/models");
    println!("    Usage:  GET  /v1/usage");
    println!("    Admin:  POST /admin/users, POST /admin/limits");
    println!("            GET  /admin/limits/{{user_id}}, /admin/queue");
    println!("    Health: GET  /health, /ready, /live, /metrics");
    println!("    Prometheus: GET /metrics/prometheus");
    println!("==================================================");
    println!();
}
