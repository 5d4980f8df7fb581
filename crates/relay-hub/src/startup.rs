//! Daemon startup + wiring.
//!
//! Loads config, builds the cache, backend and player, then serves the
//! front end until interrupted.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::cache::DiskCache;
use crate::config::{self, ServerConfig};
use crate::decoder::SymphoniaDecoder;
use crate::events::EventBus;
use crate::frontend::Frontend;
use crate::playback_backend::PlaybackBackend;
use crate::player::Player;
use crate::session::TcpConnector;
use crate::session_backend::SessionBackend;

/// Build the daemon and run it until Ctrl-C.
pub(crate) async fn run(args: crate::Args) -> Result<()> {
    let cfg = ServerConfig::load_or_default(args.config.as_deref())?;
    let bind = resolve_bind(args.bind, &cfg)?;
    let cache_dir = args
        .cache_dir
        .unwrap_or_else(|| config::cache_dir_from_config(&cfg));
    let cache_max = config::cache_max_bytes_from_config(&cfg);
    tracing::info!(
        bind = %bind,
        cache_dir = %cache_dir.display(),
        cache_max_bytes = cache_max,
        "starting relay-hub"
    );

    let cache = Arc::new(
        DiskCache::open(cache_dir.clone(), cache_max)
            .with_context(|| format!("open cache {:?}", cache_dir))?,
    );
    let decoder = Arc::new(SymphoniaDecoder);
    let session_backend = build_backend(&cfg, cache.clone(), decoder.clone()).await?;
    let output_name = config::host_from_config(&cfg)?
        .map(|host| host.target)
        .unwrap_or_else(|| "none".to_string());

    let backend = session_backend
        .clone()
        .map(|b| b as Arc<dyn PlaybackBackend>);
    let player = Player::new(
        backend,
        cache,
        decoder,
        config::player_timings_from_config(&cfg),
    );
    let events = EventBus::new();
    let bus = events.clone();
    player.set_change_callback(move |name| bus.publish_named(name));

    let shutdown = CancellationToken::new();
    setup_shutdown(shutdown.clone());

    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(bind = %bind, "listening for clients");
    Frontend::new(player.clone(), events, output_name)
        .serve(listener, shutdown)
        .await?;

    tracing::info!("shutting down");
    player.stop().await;
    if let Some(backend) = session_backend {
        backend.shutdown().await;
    }
    Ok(())
}

fn resolve_bind(bind: Option<SocketAddr>, cfg: &ServerConfig) -> Result<SocketAddr> {
    if let Some(addr) = bind {
        return Ok(addr);
    }
    match config::bind_from_config(cfg)? {
        Some(addr) => Ok(addr),
        None => config::DEFAULT_BIND
            .parse()
            .with_context(|| format!("parse default bind {}", config::DEFAULT_BIND)),
    }
}

/// Session backend for the configured host, if any. The first connect is
/// attempted here so a misconfigured host shows up in the log early.
async fn build_backend(
    cfg: &ServerConfig,
    cache: Arc<DiskCache>,
    decoder: Arc<SymphoniaDecoder>,
) -> Result<Option<Arc<SessionBackend>>> {
    let Some(host) = config::host_from_config(cfg)? else {
        tracing::warn!("no host configured; playback commands will be rejected");
        return Ok(None);
    };
    let timeouts = config::session_timeouts_from_config(cfg);
    let connector = Arc::new(TcpConnector::new(
        host.addr,
        host.interface.clone(),
        timeouts.connect,
    ));
    let backend = Arc::new(SessionBackend::new(
        connector,
        timeouts,
        host.target.clone(),
        host.interface,
        cache,
        decoder,
    ));
    match backend.session().await {
        Ok(session) => tracing::info!(
            addr = %host.addr,
            target = %host.target,
            state = ?session.state(),
            "host session ready"
        ),
        Err(e) => tracing::warn!(
            addr = %host.addr,
            error = %e,
            "host unavailable; will retry on first playback"
        ),
    }
    Ok(Some(backend))
}

fn setup_shutdown(shutdown: CancellationToken) {
    if let Err(e) = ctrlc::set_handler(move || shutdown.cancel()) {
        tracing::warn!(error = %e, "failed to install ctrl-c handler");
    }
}
