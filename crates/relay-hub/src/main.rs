mod cache;
mod config;
mod decoder;
mod events;
mod frontend;
mod playback_backend;
mod player;
mod playlist;
mod session;
mod session_backend;
mod startup;

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "relay-hub")]
pub(crate) struct Args {
    /// Client listen address, e.g. 127.0.0.1:6600
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Optional config file (TOML)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory for decoded audio (overrides config)
    #[arg(long)]
    cache_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,relay_hub=info")),
        )
        .init();

    startup::run(args).await
}
