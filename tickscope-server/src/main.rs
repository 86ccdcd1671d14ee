//! tickscope - capture playback and derivation server
//!
//! Serves the HTTP API and the `/ws` control channel on one listener.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Data: $XDG_DATA_HOME/tickscope/ (database, uploads, plugins, derived captures)
//! - Logs: $XDG_STATE_HOME/tickscope/tickscope.log
//! - Config: $XDG_CONFIG_HOME/tickscope/config.toml

mod routes;
mod ws;

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tickscope_core::{Config, Store};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "tickscope")]
#[command(about = "Serve simulation captures, live streams, and derivations")]
#[command(version)]
struct Args {
    /// Config file (defaults to the XDG config path)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, e.g. 127.0.0.1:8787
    #[arg(long)]
    addr: Option<String>,

    /// Data directory override
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Mirror logs to stdout
    #[arg(long)]
    stdout: bool,
}

impl Args {
    fn load_config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load_from(path),
            None => Config::load(),
        }
        .context("failed to load configuration")?;

        if let Some(addr) = &self.addr {
            config.server.addr = addr.clone();
        }
        if let Some(dir) = &self.data_dir {
            config.storage.data_dir = Some(dir.clone());
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        config.logging.stdout |= self.stdout;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.load_config()?;

    let _log_guard =
        tickscope_core::logging::init(&config.logging).context("failed to initialize logging")?;

    let addr: SocketAddr = config
        .server
        .addr
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.server.addr))?;

    tracing::info!(data_dir = %config.data_dir().display(), "tickscope starting");
    let store = Arc::new(Store::open(config).context("failed to open store")?);

    let shutdown = CancellationToken::new();
    let app = routes::router(routes::AppState {
        store: Arc::clone(&store),
        shutdown: shutdown.clone(),
    });

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    tracing::info!(addr = %addr, "Listening");
    println!("tickscope listening on http://{}", addr);
    println!("logs: {}", tickscope_core::logging::log_file_path().display());

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
            signal.cancel();
        })
        .await
        .context("server error")?;

    store.shutdown().await;
    tracing::info!("tickscope stopped");
    Ok(())
}
