//! Playback backend abstraction driven by the player.
//!
//! Implementations translate playback operations into commands for whatever
//! actually produces sound. The default is [`crate::session_backend::SessionBackend`].

use async_trait::async_trait;

use crate::cache::CacheError;
use crate::playlist::Track;
use crate::session::SessionError;

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("no track prepared")]
    NotPrepared,
}

impl BackendError {
    /// True when the failure came from a corrupt cached file.
    pub fn is_cache_corrupt(&self) -> bool {
        matches!(self, BackendError::Cache(CacheError::Corrupt { .. }))
    }
}

/// What the backend reports about the far end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Stopped,
    Playing,
    Paused,
}

#[async_trait]
pub trait PlaybackBackend: Send + Sync {
    /// Make `track` ready to start (decode, upload).
    async fn prepare_track(&self, track: &Track) -> Result<(), BackendError>;
    /// Start playing the prepared track.
    async fn start_playback(&self) -> Result<(), BackendError>;
    async fn play(&self) -> Result<(), BackendError>;
    async fn pause(&self) -> Result<(), BackendError>;
    async fn stop(&self) -> Result<(), BackendError>;
    async fn seek_absolute(&self, position_secs: u64) -> Result<(), BackendError>;
    async fn seek_relative(&self, offset_secs: i64) -> Result<(), BackendError>;
    /// Duration of the prepared track in seconds.
    async fn track_duration(&self) -> Result<f64, BackendError>;
    /// Elapsed seconds, or -1 when unknown or finished.
    async fn elapsed_time(&self) -> Result<i64, BackendError>;
    async fn is_track_complete(&self) -> Result<bool, BackendError>;
    async fn playback_status(&self) -> Result<BackendStatus, BackendError>;
    /// Point the far end at the configured target without starting anything.
    async fn select_target(&self) -> Result<(), BackendError>;

    async fn tags(&self) -> Result<Vec<String>, BackendError> {
        Ok(Vec::new())
    }
}
