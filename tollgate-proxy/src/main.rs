//! Tollgate - OpenAI-compatible gateway for a local Ollama runtime.
//!
//! ## Quick Start
//!
//! ```bash
//! # Start with defaults (port 8000, Ollama at 127.0.0.1:11434)
//! tollgate
//!
//! # Custom configuration
//! OLLAMA_BASE_URL=http://192.168.1.100:11434 MAX_CONCURRENCY=4 tollgate --port 9000
//! ```
//!
//! ## Usage with OpenAI clients
//!
//! ```python
//! from openai import OpenAI
//!
//! client = OpenAI(base_url="http://localhost:8000/v1", api_key="sk-...")
//!
//! response = client.chat.completions.create(
//!     model="llama3.2:3b",
//!     messages=[{"role": "user", "content": "Hello!"}]
//! )
//! ```

use std::time::Duration;

use clap::Parser;
use tollgate_proxy::{run_server, ProxyConfig, ServerConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command line overrides; anything not given falls back to the environment
#[derive(Parser, Debug)]
#[command(name = "tollgate")]
#[command(version)]
#[command(about = "Tollgate - fair admission and token rate limits for local LLM inference", long_about = None)]
struct Cli {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Ollama base URL
    #[arg(long)]
    ollama_url: Option<String>,

    /// Maximum concurrent upstream requests
    #[arg(long)]
    max_concurrency: Option<usize>,

    /// Maximum requests waiting for a slot
    #[arg(long)]
    max_queue_depth: Option<usize>,

    /// SQLite database file (":memory:" keeps everything in memory)
    #[arg(long)]
    db_path: Option<String>,

    /// Upstream request timeout in seconds
    #[arg(long)]
    upstream_timeout: Option<u64>,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,

    /// Do not print the startup banner
    #[arg(long)]
    no_banner: bool,
}

impl Cli {
    fn into_config(self) -> ProxyConfig {
        let mut config = ProxyConfig::from_env();

        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(url) = self.ollama_url {
            config.ollama_url = tollgate_proxy::state::normalize_base_url(&url);
        }
        if let Some(n) = self.max_concurrency {
            config.admission.max_concurrency = n;
        }
        if let Some(n) = self.max_queue_depth {
            config.admission.max_queue_depth = n;
        }
        if let Some(path) = self.db_path {
            config.db_path = tollgate_proxy::state::parse_db_path(&path);
        }
        if let Some(secs) = self.upstream_timeout {
            config.upstream_timeout = Duration::from_secs(secs);
        }
        config.verbose |= self.verbose;

        config
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let print_banner = !cli.no_banner;
    let config = cli.into_config();

    // Initialize logging
    let default_filter = if config.verbose {
        "tollgate_proxy=debug,tollgate_core=debug,tower_http=debug"
    } else {
        "tollgate_proxy=info,tower_http=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false))
        .with(filter)
        .init();

    run_server(ServerConfig { proxy: config, print_banner }).await
}
