//! Standalone synchronization engine.
//!
//! Usage: `tandem-collab-server [config.toml]`. Log verbosity follows
//! `RUST_LOG` (default `info`).

mod config;
mod server;

use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::server::CollabServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match std::env::args().nth(1).map(PathBuf::from) {
        Some(path) => Config::load(&path)?,
        None => {
            info!("no config given; using defaults");
            Config::default()
        }
    };

    CollabServer::new(&config)?.run().await
}
