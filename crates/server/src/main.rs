//! Quorum - room-scoped group chat backend
//!
//! Process bootstrap: logging, configuration, server start, and ctrl-c
//! shutdown. Everything stateful lives in `quorum-core` behind the
//! `quorum-net` transport; this binary only wires them together.

use std::path::Path;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quorum_net::Server;

mod config;

use config::Config;

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting Quorum");

    let config_path =
        std::env::var("QUORUM_CONFIG").unwrap_or_else(|_| "quorum.toml".to_string());
    let config = match Config::load_or_default(Path::new(&config_path)) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    let addr = match config.socket_addr() {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("{}", e);
            std::process::exit(1);
        }
    };

    let server = match Server::start(addr, Duration::from_secs(config.edit_window_secs)).await {
        Ok(server) => server,
        Err(e) => {
            tracing::error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(addr = %server.addr(), edit_window_secs = config.edit_window_secs, "Quorum listening");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    tracing::info!("Shutting down");
    server.shutdown();
}
