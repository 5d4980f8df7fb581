//! Configuration loading and parsing.
//!
//! Defines the daemon config schema and resolves defaults.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::player::PlayerTimings;
use crate::session::SessionTimeouts;

/// Default front-end listen address.
pub const DEFAULT_BIND: &str = "127.0.0.1:6600";
/// Default cache size cap (4 GiB).
pub const DEFAULT_CACHE_MAX_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Top-level daemon configuration loaded from TOML.
#[derive(Debug, Default, Deserialize)]
pub struct ServerConfig {
    /// Front-end bind address (host:port).
    pub bind: Option<String>,
    /// Streaming host; absent means no playback backend.
    pub host: Option<HostConfig>,
    /// Decoded-audio cache settings.
    pub cache: Option<CacheConfig>,
    /// Player timings.
    pub player: Option<PlayerConfig>,
    /// Session timeouts.
    pub session: Option<SessionConfig>,
}

/// Streaming host config from TOML.
#[derive(Debug, Deserialize)]
pub struct HostConfig {
    /// Host address (host:port) accepting the session.
    pub addr: String,
    /// Optional network interface to bind to.
    pub interface: Option<String>,
    /// Target the host should stream to.
    pub target: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct CacheConfig {
    pub dir: Option<String>,
    pub max_bytes: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PlayerConfig {
    pub poll_interval_ms: Option<u64>,
    pub resume_timeout_ms: Option<u64>,
    pub transition_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionConfig {
    pub connect_timeout_ms: Option<u64>,
    pub status_timeout_ms: Option<u64>,
    pub time_timeout_ms: Option<u64>,
}

/// Resolved host config with parsed socket address.
#[derive(Debug, Clone)]
pub struct HostResolved {
    pub addr: SocketAddr,
    pub interface: Option<String>,
    pub target: String,
}

impl ServerConfig {
    /// Load configuration from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let raw =
            std::fs::read_to_string(path).with_context(|| format!("read config {:?}", path))?;
        let cfg = toml::from_str::<ServerConfig>(&raw)
            .with_context(|| format!("parse config {:?}", path))?;
        Ok(cfg)
    }

    /// Load `path`, else `config.toml` next to the executable, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let auto_path = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join("config.toml")));
        match auto_path {
            Some(path) if path.exists() => {
                tracing::info!(path = %path.display(), "using config next to executable");
                Self::load(&path)
            }
            _ => {
                tracing::info!("no config file found; using defaults");
                Ok(Self::default())
            }
        }
    }
}

/// Parse an optional bind address from config.
pub fn bind_from_config(cfg: &ServerConfig) -> Result<Option<SocketAddr>> {
    let Some(bind) = cfg.bind.as_deref() else {
        return Ok(None);
    };
    let addr = bind.parse().with_context(|| format!("parse bind {bind}"))?;
    Ok(Some(addr))
}

/// Resolve the host section, parsing its address.
pub fn host_from_config(cfg: &ServerConfig) -> Result<Option<HostResolved>> {
    let Some(host) = cfg.host.as_ref() else {
        return Ok(None);
    };
    let addr = host
        .addr
        .parse()
        .with_context(|| format!("parse host addr {}", host.addr))?;
    let interface = host
        .interface
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    Ok(Some(HostResolved {
        addr,
        interface,
        target: host.target.clone(),
    }))
}

/// Cache directory from config, falling back to a temp-dir location.
pub fn cache_dir_from_config(cfg: &ServerConfig) -> PathBuf {
    cfg.cache
        .as_ref()
        .and_then(|c| c.dir.as_deref())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join("relay-hub-cache"))
}

pub fn cache_max_bytes_from_config(cfg: &ServerConfig) -> u64 {
    cfg.cache
        .as_ref()
        .and_then(|c| c.max_bytes)
        .unwrap_or(DEFAULT_CACHE_MAX_BYTES)
}

pub fn player_timings_from_config(cfg: &ServerConfig) -> PlayerTimings {
    let defaults = PlayerTimings::default();
    let Some(player) = cfg.player.as_ref() else {
        return defaults;
    };
    PlayerTimings {
        poll_interval: player
            .poll_interval_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(defaults.poll_interval),
        resume_timeout: player
            .resume_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.resume_timeout),
        transition_timeout: player
            .transition_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.transition_timeout),
    }
}

pub fn session_timeouts_from_config(cfg: &ServerConfig) -> SessionTimeouts {
    let defaults = SessionTimeouts::default();
    let Some(session) = cfg.session.as_ref() else {
        return defaults;
    };
    SessionTimeouts {
        connect: session
            .connect_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.connect),
        status: session
            .status_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.status),
        time: session
            .time_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.time),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_from_config_parses_when_present() {
        let cfg = ServerConfig {
            bind: Some("127.0.0.1:9000".to_string()),
            ..Default::default()
        };
        let addr = bind_from_config(&cfg).unwrap().unwrap();
        assert_eq!(addr, "127.0.0.1:9000".parse().unwrap());
    }

    #[test]
    fn bind_from_config_rejects_garbage() {
        let cfg = ServerConfig {
            bind: Some("not an address".to_string()),
            ..Default::default()
        };
        assert!(bind_from_config(&cfg).is_err());
    }

    #[test]
    fn full_config_parses() {
        let raw = r#"
            bind = "0.0.0.0:6600"
            [host]
            addr = "[fe80::1]:19644"
            interface = "eth0"
            target = "[fe80::2]:19645"
            [cache]
            dir = "/var/cache/relay-hub"
            max_bytes = 1024
            [player]
            poll_interval_ms = 250
            [session]
            status_timeout_ms = 800
        "#;
        let cfg: ServerConfig = toml::from_str(raw).unwrap();

        let host = host_from_config(&cfg).unwrap().unwrap();
        assert_eq!(host.addr, "[fe80::1]:19644".parse().unwrap());
        assert_eq!(host.interface.as_deref(), Some("eth0"));
        assert_eq!(host.target, "[fe80::2]:19645");

        assert_eq!(cache_dir_from_config(&cfg), PathBuf::from("/var/cache/relay-hub"));
        assert_eq!(cache_max_bytes_from_config(&cfg), 1024);

        let timings = player_timings_from_config(&cfg);
        assert_eq!(timings.poll_interval, Duration::from_millis(250));
        assert_eq!(timings.resume_timeout, PlayerTimings::default().resume_timeout);

        let timeouts = session_timeouts_from_config(&cfg);
        assert_eq!(timeouts.status, Duration::from_millis(800));
        assert_eq!(timeouts.time, Duration::from_millis(1500));
    }

    #[test]
    fn missing_host_means_no_backend() {
        let cfg: ServerConfig = toml::from_str("bind = \"127.0.0.1:6600\"").unwrap();
        assert!(host_from_config(&cfg).unwrap().is_none());
        assert_eq!(cache_max_bytes_from_config(&cfg), DEFAULT_CACHE_MAX_BYTES);
    }

    #[test]
    fn blank_interface_is_ignored() {
        let cfg: ServerConfig = toml::from_str(
            "[host]\naddr = \"127.0.0.1:19644\"\ninterface = \"  \"\ntarget = \"t\"",
        )
        .unwrap();
        let host = host_from_config(&cfg).unwrap().unwrap();
        assert!(host.interface.is_none());
    }

    #[test]
    fn load_reports_path_on_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "bind = [").unwrap();
        let err = ServerConfig::load(&path).unwrap_err();
        assert!(format!("{err:#}").contains("parse config"));
    }
}
