//! Playback state machine and the cancellable playback loop.
//!
//! The player owns the live playlist, an optional pending playlist (only while
//! a transition is in progress), and at most one playback loop. Each loop is
//! bound to the playlist it was spawned with; swapping the live playlist never
//! affects a loop already in flight.
//!
//! Two signals reach a running loop:
//! - the playlist interrupt slot (skip/seek: restart the wait, keep playing)
//! - the loop's [`CancellationToken`] (stop: quit the target and exit)

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheError, TrackCache};
use crate::decoder::{self, Decoder};
use crate::playback_backend::{BackendError, BackendStatus, PlaybackBackend};
use crate::playlist::{Interrupt, META_DURATION, Playlist, PlaylistError, Track};

pub const SUBSYSTEM_PLAYER: &str = "player";
pub const SUBSYSTEM_PLAYLIST: &str = "playlist";

const RESUME_POLL: Duration = Duration::from_millis(100);

/// Invoked with a subsystem name whenever player or playlist state changes.
pub type ChangeCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    Stopped,
    Playing,
    Paused,
}

impl PlaybackState {
    pub fn as_str(self) -> &'static str {
        match self {
            PlaybackState::Stopped => "stop",
            PlaybackState::Playing => "play",
            PlaybackState::Paused => "pause",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlayerTimings {
    /// Completion polling interval of the playback loop.
    pub poll_interval: Duration,
    /// How long `resume` waits for the backend to confirm.
    pub resume_timeout: Duration,
    /// How long `complete_transition` waits for the lead track to be cached.
    pub transition_timeout: Duration,
}

impl Default for PlayerTimings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            resume_timeout: Duration::from_millis(2000),
            transition_timeout: Duration::from_secs(30),
        }
    }
}

/// Position within the current track, in seconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackTiming {
    pub elapsed: f64,
    pub duration: f64,
    pub remaining: f64,
}

#[derive(Debug, thiserror::Error)]
pub enum PlayerError {
    #[error(transparent)]
    Playlist(#[from] PlaylistError),
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
    #[error("no playback backend configured")]
    NoBackend,
    #[error("not playing")]
    NotPlaying,
    #[error("not paused")]
    NotPaused,
    #[error("playback is active; stop or start a transition first")]
    NotStopped,
    #[error("backend did not confirm resume")]
    ResumeTimeout,
    #[error("next playlist was not ready in time")]
    TransitionTimeout,
    #[error("no transition in progress")]
    NoTransition,
    #[error(transparent)]
    Cache(#[from] CacheError),
}

struct LoopHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

struct PlayerState {
    playback: PlaybackState,
    playlist: Arc<Playlist>,
    pending: Option<Arc<Playlist>>,
    loop_handle: Option<LoopHandle>,
    /// Bumped per spawned loop; a loop may only halt the player for its own generation.
    generation: u64,
    /// Last timing a query observed; answers status when the backend cannot.
    last_timing: Option<PlaybackTiming>,
}

struct Shared {
    state: Mutex<PlayerState>,
    backend: Option<Arc<dyn PlaybackBackend>>,
    cache: Arc<dyn TrackCache>,
    decoder: Arc<dyn Decoder>,
    on_change: Mutex<Option<ChangeCallback>>,
    active_loops: AtomicUsize,
    /// Serializes play/stop/transition so loops never overlap.
    lifecycle: tokio::sync::Mutex<()>,
    timings: PlayerTimings,
}

/// Why a playback loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Cancelled,
    NotPlaying,
    EndOfPlaylist,
    Interrupted,
    Failed,
}

/// Counts a running loop for as long as it is alive.
struct ActiveLoop<'a>(&'a AtomicUsize);

impl<'a> ActiveLoop<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveLoop<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Coordinates playback commands, the playlists and the playback loop.
#[derive(Clone)]
pub struct Player {
    shared: Arc<Shared>,
}

impl Player {
    pub fn new(
        backend: Option<Arc<dyn PlaybackBackend>>,
        cache: Arc<dyn TrackCache>,
        decoder: Arc<dyn Decoder>,
        timings: PlayerTimings,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(PlayerState {
                    playback: PlaybackState::Stopped,
                    playlist: Arc::new(Playlist::new()),
                    pending: None,
                    loop_handle: None,
                    generation: 0,
                    last_timing: None,
                }),
                backend,
                cache,
                decoder,
                on_change: Mutex::new(None),
                active_loops: AtomicUsize::new(0),
                lifecycle: tokio::sync::Mutex::new(()),
                timings,
            }),
        }
    }

    /// Register the single change-notification callback.
    pub fn set_change_callback(&self, callback: impl Fn(&str) + Send + Sync + 'static) {
        *self.shared.on_change.lock().unwrap() = Some(Arc::new(callback));
    }

    fn notify(&self, subsystem: &str) {
        let callback = self.shared.on_change.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(subsystem);
        }
    }

    fn backend(&self) -> Result<Arc<dyn PlaybackBackend>, PlayerError> {
        self.shared.backend.clone().ok_or(PlayerError::NoBackend)
    }

    pub fn get_state(&self) -> PlaybackState {
        self.shared.state.lock().unwrap().playback
    }

    /// The live playlist.
    pub fn get_playlist(&self) -> Arc<Playlist> {
        self.shared.state.lock().unwrap().playlist.clone()
    }

    pub fn pending_playlist(&self) -> Option<Arc<Playlist>> {
        self.shared.state.lock().unwrap().pending.clone()
    }

    pub fn has_pending_transition(&self) -> bool {
        self.shared.state.lock().unwrap().pending.is_some()
    }

    /// True while a playback loop task is running.
    pub fn loop_active(&self) -> bool {
        self.active_loops() > 0
    }

    pub fn active_loops(&self) -> usize {
        self.shared.active_loops.load(Ordering::SeqCst)
    }

    /// Remaining seconds seen by the last timing query.
    pub fn last_remaining(&self) -> Option<i64> {
        self.cached_timing().map(|t| t.remaining.round() as i64)
    }

    /// Timing from the last successful query, for when the backend cannot be
    /// asked. `None` once playback stopped or the track changed.
    pub fn cached_timing(&self) -> Option<PlaybackTiming> {
        let state = self.shared.state.lock().unwrap();
        if state.playback == PlaybackState::Stopped {
            return None;
        }
        state.last_timing
    }

    pub fn has_backend(&self) -> bool {
        self.shared.backend.is_some()
    }

    /// Tags the backend reports about its far end.
    pub async fn backend_tags(&self) -> Result<Vec<String>, PlayerError> {
        Ok(self.backend()?.tags().await?)
    }

    /// Fill in `duration` from the decoder when missing and the source is local.
    async fn with_duration(&self, mut track: Track) -> Track {
        if track.duration().is_some() {
            return track;
        }
        let decoder = self.shared.decoder.clone();
        let url = track.url.clone();
        let probed = tokio::task::spawn_blocking(move || {
            if !decoder::is_local_source(&url) {
                return Ok(None);
            }
            decoder.probe_duration(&url)
        })
        .await;
        match probed {
            Ok(Ok(Some(secs))) => {
                track
                    .metadata
                    .insert(META_DURATION.to_string(), format!("{secs:.3}"));
            }
            Ok(Ok(None)) => {}
            Ok(Err(e)) => tracing::debug!(url = %track.url, error = %e, "duration probe failed"),
            Err(e) => tracing::warn!(url = %track.url, error = %e, "duration probe task failed"),
        }
        track
    }

    /// Decode `url` in the background; failures are only logged.
    fn precache(&self, url: String) {
        let cache = self.shared.cache.clone();
        let decoder = self.shared.decoder.clone();
        tokio::spawn(async move {
            match cache.ensure_decoded(&url, decoder).await {
                Ok(_) => tracing::debug!(url, "pre-cached track"),
                Err(e) => tracing::warn!(url, error = %e, "pre-cache failed"),
            }
        });
    }

    /// Playlist that receives new tracks: the pending one during a transition.
    fn target_playlist(&self) -> (Arc<Playlist>, bool) {
        let state = self.shared.state.lock().unwrap();
        match state.pending.as_ref() {
            Some(pending) => (pending.clone(), true),
            None => (state.playlist.clone(), false),
        }
    }

    /// Append a track and return its position.
    pub async fn add_track(&self, track: Track) -> usize {
        let track = self.with_duration(track).await;
        let url = track.url.clone();
        let (playlist, pending) = self.target_playlist();
        let position = playlist.add(track);
        if pending {
            self.precache(url);
        }
        self.notify(SUBSYSTEM_PLAYLIST);
        position
    }

    pub async fn add_track_at(&self, track: Track, position: usize) -> Result<usize, PlayerError> {
        let track = self.with_duration(track).await;
        let url = track.url.clone();
        let (playlist, pending) = self.target_playlist();
        let position = playlist.add_at(track, position)?;
        if pending {
            self.precache(url);
        }
        self.notify(SUBSYSTEM_PLAYLIST);
        Ok(position)
    }

    /// Clear the live playlist. Only allowed while stopped.
    pub fn clear(&self) -> Result<(), PlayerError> {
        let playlist = {
            let state = self.shared.state.lock().unwrap();
            if state.playback != PlaybackState::Stopped {
                return Err(PlayerError::NotStopped);
            }
            state.playlist.clone()
        };
        playlist.clear();
        self.notify(SUBSYSTEM_PLAYLIST);
        Ok(())
    }

    /// Start playing the live playlist from its current track.
    pub async fn play(&self) -> Result<(), PlayerError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.play_locked().await
    }

    async fn play_locked(&self) -> Result<(), PlayerError> {
        self.backend()?;
        let (stale, playlist) = {
            let mut state = self.shared.state.lock().unwrap();
            match state.playback {
                PlaybackState::Playing => return Ok(()),
                PlaybackState::Paused => (None, None),
                PlaybackState::Stopped => {
                    if state.playlist.current_track().is_none() {
                        return Err(PlaylistError::Empty.into());
                    }
                    (state.loop_handle.take(), Some(state.playlist.clone()))
                }
            }
        };
        let Some(playlist) = playlist else {
            return self.resume().await;
        };
        if let Some(stale) = stale {
            finish_loop(stale).await;
        }
        self.spawn_loop(playlist);
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    /// Jump to `position` and play from there.
    pub async fn play_at(&self, position: usize) -> Result<(), PlayerError> {
        let _lifecycle = self.shared.lifecycle.lock().await;
        self.backend()?;
        let (playlist, running) = {
            let state = self.shared.state.lock().unwrap();
            (
                state.playlist.clone(),
                state.playback != PlaybackState::Stopped,
            )
        };
        playlist.seek(position)?;
        if running {
            self.skip_running(&playlist);
            return Ok(());
        }
        playlist.commit_staged()?;
        self.play_locked().await
    }

    fn spawn_loop(&self, playlist: Arc<Playlist>) {
        // A leftover signal belongs to an earlier loop.
        playlist.take_interrupt();
        let cancel = CancellationToken::new();
        let mut state = self.shared.state.lock().unwrap();
        state.generation += 1;
        state.playback = PlaybackState::Playing;
        state.last_timing = None;
        let generation = state.generation;
        let player = self.clone();
        let token = cancel.clone();
        let task = tokio::spawn(async move { player.run_loop(playlist, token, generation).await });
        state.loop_handle = Some(LoopHandle { cancel, task });
    }

    /// Wake a running loop so it picks up the staged position.
    fn skip_running(&self, playlist: &Playlist) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.playback == PlaybackState::Paused {
                state.playback = PlaybackState::Playing;
            }
        }
        playlist.signal_interrupt(true, false);
    }

    pub async fn pause(&self) -> Result<(), PlayerError> {
        let backend = self.backend()?;
        if self.get_state() != PlaybackState::Playing {
            return Err(PlayerError::NotPlaying);
        }
        backend.pause().await?;
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.playback == PlaybackState::Playing {
                state.playback = PlaybackState::Paused;
            }
        }
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    /// Resume from pause once the backend confirms it is playing again.
    pub async fn resume(&self) -> Result<(), PlayerError> {
        let backend = self.backend()?;
        if self.get_state() != PlaybackState::Paused {
            return Err(PlayerError::NotPaused);
        }
        backend.play().await?;

        let confirm = async {
            loop {
                if backend.playback_status().await? == BackendStatus::Playing {
                    return Ok::<(), BackendError>(());
                }
                tokio::time::sleep(RESUME_POLL).await;
            }
        };
        match tokio::time::timeout(self.shared.timings.resume_timeout, confirm).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                tracing::warn!("backend did not confirm resume; staying paused");
                return Err(PlayerError::ResumeTimeout);
            }
        }

        {
            let mut state = self.shared.state.lock().unwrap();
            if state.playback == PlaybackState::Paused {
                state.playback = PlaybackState::Playing;
            }
        }
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    /// Stop playback. Returns once no playback loop is running.
    pub async fn stop(&self) {
        let _lifecycle = self.shared.lifecycle.lock().await;
        let (handle, was) = {
            let mut state = self.shared.state.lock().unwrap();
            let was = state.playback;
            state.playback = PlaybackState::Stopped;
            state.last_timing = None;
            state.playlist.discard_staged();
            (state.loop_handle.take(), was)
        };
        match handle {
            Some(handle) => finish_loop(handle).await,
            None if was != PlaybackState::Stopped => {
                if let Some(backend) = self.shared.backend.as_ref() {
                    if let Err(e) = backend.stop().await {
                        tracing::warn!(error = %e, "backend stop failed");
                    }
                }
            }
            None => {}
        }
        if was != PlaybackState::Stopped {
            tracing::info!("playback stopped");
            self.notify(SUBSYSTEM_PLAYER);
        }
    }

    /// Skip forward. While a loop runs this restarts its wait on the next track;
    /// repeated skips before the loop catches up keep moving from the staged one.
    pub fn next(&self) -> Result<(), PlayerError> {
        let (playlist, running) = self.live();
        if running {
            let current = playlist
                .staged_index()
                .or(playlist.current_index())
                .ok_or(PlaylistError::Empty)?;
            if current + 1 >= playlist.len() {
                return Err(PlaylistError::EndOfPlaylist.into());
            }
            playlist.seek(current + 1)?;
            self.skip_running(&playlist);
        } else {
            playlist.next()?;
        }
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    pub fn previous(&self) -> Result<(), PlayerError> {
        let (playlist, running) = self.live();
        if running {
            let current = playlist
                .staged_index()
                .or(playlist.current_index())
                .ok_or(PlaylistError::Empty)?;
            if current == 0 {
                return Err(PlaylistError::StartOfPlaylist.into());
            }
            playlist.seek(current - 1)?;
            self.skip_running(&playlist);
        } else {
            playlist.previous()?;
        }
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    fn live(&self) -> (Arc<Playlist>, bool) {
        let state = self.shared.state.lock().unwrap();
        (
            state.playlist.clone(),
            state.playback != PlaybackState::Stopped,
        )
    }

    fn require_active(&self) -> Result<Arc<dyn PlaybackBackend>, PlayerError> {
        let backend = self.backend()?;
        if self.get_state() == PlaybackState::Stopped {
            return Err(PlayerError::NotPlaying);
        }
        Ok(backend)
    }

    /// Seek within the current track to an absolute position in seconds.
    pub async fn seek(&self, position_secs: u64) -> Result<(), PlayerError> {
        self.require_active()?.seek_absolute(position_secs).await?;
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    pub async fn seek_relative(&self, offset_secs: i64) -> Result<(), PlayerError> {
        self.require_active()?.seek_relative(offset_secs).await?;
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    /// Start collecting tracks into a fresh pending playlist.
    pub fn begin_transition(&self) {
        self.shared.state.lock().unwrap().pending = Some(Arc::new(Playlist::new()));
        tracing::info!("transition started");
    }

    pub fn cancel_transition(&self) -> Result<(), PlayerError> {
        let dropped = self.shared.state.lock().unwrap().pending.take();
        match dropped {
            Some(_) => {
                tracing::info!("transition cancelled");
                Ok(())
            }
            None => Err(PlayerError::NoTransition),
        }
    }

    /// Swap the pending playlist in and play it.
    ///
    /// The lead track must be cached first; on timeout or a cancel during that
    /// wait the live playlist is left alone. The old loop is fully stopped
    /// before the new one starts.
    pub async fn complete_transition(&self) -> Result<(), PlayerError> {
        self.backend()?;
        let pending = self
            .pending_playlist()
            .ok_or(PlayerError::NoTransition)?;
        let lead = pending.current_track().ok_or(PlaylistError::Empty)?;

        if !self.shared.cache.is_cached(&lead.url) {
            // Runs detached so a timeout does not abandon a half-written entry.
            let cache = self.shared.cache.clone();
            let decoder = self.shared.decoder.clone();
            let url = lead.url.clone();
            let ready = tokio::spawn(async move { cache.ensure_decoded(&url, decoder).await });
            match tokio::time::timeout(self.shared.timings.transition_timeout, ready).await {
                Ok(Ok(Ok(_))) => {}
                Ok(Ok(Err(e))) => return Err(e.into()),
                Ok(Err(e)) => {
                    return Err(CacheError::Decode(anyhow::anyhow!("cache task failed: {e}")).into());
                }
                Err(_) => {
                    tracing::warn!(url = %lead.url, "lead track not cached in time; transition aborted");
                    return Err(PlayerError::TransitionTimeout);
                }
            }
        }

        // The wait above runs unlocked; a stop or cancel may have happened meanwhile.
        let _lifecycle = self.shared.lifecycle.lock().await;
        let old = {
            let mut state = self.shared.state.lock().unwrap();
            match state.pending.as_ref() {
                Some(current) if Arc::ptr_eq(current, &pending) => {}
                _ => {
                    tracing::info!(url = %lead.url, "transition cancelled while caching lead track");
                    return Err(PlayerError::NoTransition);
                }
            }
            state.pending = None;
            state.loop_handle.take()
        };
        if let Some(old) = old {
            finish_loop(old).await;
        }
        self.shared.state.lock().unwrap().playlist = pending.clone();
        self.spawn_loop(pending);
        tracing::info!(url = %lead.url, "transition completed");
        self.notify(SUBSYSTEM_PLAYLIST);
        self.notify(SUBSYSTEM_PLAYER);
        Ok(())
    }

    /// Elapsed/duration/remaining of the current track, if known.
    pub async fn get_playback_timing(&self) -> Result<Option<PlaybackTiming>, PlayerError> {
        let backend = self.backend()?;
        let (playlist, playback) = {
            let state = self.shared.state.lock().unwrap();
            (state.playlist.clone(), state.playback)
        };
        if playback == PlaybackState::Stopped {
            return Ok(None);
        }

        let elapsed = backend.elapsed_time().await?;
        if elapsed < 0 {
            self.shared.state.lock().unwrap().last_timing = None;
            return Ok(None);
        }
        let duration = match backend.track_duration().await {
            Ok(secs) if secs > 0.0 => Some(secs),
            _ => playlist.current_track().and_then(|t| t.duration()),
        };
        let Some(duration) = duration else {
            return Ok(None);
        };

        let elapsed = elapsed as f64;
        let remaining = (duration - elapsed).max(0.0);
        let timing = PlaybackTiming {
            elapsed,
            duration,
            remaining,
        };
        self.shared.state.lock().unwrap().last_timing = Some(timing);
        Ok(Some(timing))
    }

    /// Mark the player stopped on behalf of a loop that ended on its own.
    fn halt_from_loop(&self, generation: u64) {
        let changed = {
            let mut state = self.shared.state.lock().unwrap();
            if state.generation == generation && state.playback != PlaybackState::Stopped {
                state.playback = PlaybackState::Stopped;
                state.last_timing = None;
                true
            } else {
                false
            }
        };
        if changed {
            self.notify(SUBSYSTEM_PLAYER);
        }
    }

    async fn run_loop(self, playlist: Arc<Playlist>, cancel: CancellationToken, generation: u64) {
        let _active = ActiveLoop::enter(&self.shared.active_loops);
        let Some(backend) = self.shared.backend.clone() else {
            self.halt_from_loop(generation);
            return;
        };
        tracing::info!(generation, "playback loop started");

        let exit = 'run: loop {
            if cancel.is_cancelled() {
                break LoopExit::Cancelled;
            }
            if self.get_state() == PlaybackState::Stopped {
                break LoopExit::NotPlaying;
            }
            let Some(track) = playlist.current_track() else {
                break LoopExit::EndOfPlaylist;
            };

            // A corrupt cache entry is dropped by the backend; one retry decodes it afresh.
            let mut prepared = Err(BackendError::NotPrepared);
            for attempt in 1..=2 {
                prepared = tokio::select! {
                    _ = cancel.cancelled() => break 'run LoopExit::Cancelled,
                    prepared = backend.prepare_track(&track) => prepared,
                };
                match &prepared {
                    Err(e) if attempt == 1 && e.is_cache_corrupt() => {
                        tracing::warn!(url = %track.url, "cached audio corrupt; decoding again");
                    }
                    _ => break,
                }
            }
            if let Err(e) = prepared {
                tracing::error!(url = %track.url, error = %e, "failed to prepare track");
                break LoopExit::Failed;
            }
            tracing::debug!(url = %track.url, "track prepared");
            if let Err(e) = backend.start_playback().await {
                tracing::error!(url = %track.url, error = %e, "failed to start playback");
                break LoopExit::Failed;
            }
            self.shared.state.lock().unwrap().last_timing = None;
            self.notify(SUBSYSTEM_PLAYER);

            let interrupt = match self.wait_for_completion(backend.as_ref(), &playlist, &cancel).await {
                Ok(interrupt) => interrupt,
                Err(e) => {
                    tracing::error!(url = %track.url, error = %e, "lost track of playback");
                    break LoopExit::Failed;
                }
            };
            if interrupt.notify {
                self.notify(SUBSYSTEM_PLAYER);
            }
            if interrupt.exit_loop {
                break if cancel.is_cancelled() {
                    LoopExit::Cancelled
                } else {
                    LoopExit::Interrupted
                };
            }

            match playlist.advance() {
                Ok(index) => tracing::debug!(index, "advanced playlist"),
                Err(e) => {
                    tracing::info!(reason = %e, "playlist finished");
                    break LoopExit::EndOfPlaylist;
                }
            }
        };

        if exit == LoopExit::Cancelled {
            if let Err(e) = backend.stop().await {
                tracing::warn!(error = %e, "backend quit failed during loop cleanup");
            }
        } else {
            self.halt_from_loop(generation);
        }
        tracing::info!(generation, reason = ?exit, "playback loop exited");
    }

    /// Wait for the track to finish, an interrupt, or cancellation.
    async fn wait_for_completion(
        &self,
        backend: &dyn PlaybackBackend,
        playlist: &Playlist,
        cancel: &CancellationToken,
    ) -> Result<Interrupt, BackendError> {
        let period = self.shared.timings.poll_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let cancelled = Interrupt {
            notify: false,
            exit_loop: true,
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(cancelled),
                interrupt = playlist.wait_interrupt() => return Ok(interrupt),
                _ = ticker.tick() => {}
            }
            let complete = tokio::select! {
                _ = cancel.cancelled() => return Ok(cancelled),
                complete = backend.is_track_complete() => complete?,
            };
            if complete {
                return Ok(Interrupt {
                    notify: true,
                    exit_loop: false,
                });
            }
        }
    }
}

/// Cancel a loop and wait for it to exit.
async fn finish_loop(handle: LoopHandle) {
    handle.cancel.cancel();
    if let Err(e) = handle.task.await {
        tracing::warn!(error = %e, "playback loop task failed");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use crate::cache::tests::FakeDecoder;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicI64};

    /// Records every call; completion, timing and status are set by the test.
    #[derive(Default)]
    pub(crate) struct FakeBackend {
        events: Mutex<Vec<String>>,
        pub(crate) complete: AtomicBool,
        pub(crate) elapsed: AtomicI64,
        pub(crate) duration: Mutex<f64>,
        pub(crate) fail_pause: AtomicBool,
        pub(crate) corrupt_once: AtomicBool,
        pub(crate) fail_timing: AtomicBool,
        pub(crate) status: Mutex<Option<BackendStatus>>,
    }

    impl FakeBackend {
        fn record(&self, event: impl Into<String>) {
            self.events.lock().unwrap().push(event.into());
        }

        pub(crate) fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        pub(crate) fn position(&self, event: &str) -> Option<usize> {
            self.events().iter().position(|e| e == event)
        }
    }

    #[async_trait]
    impl PlaybackBackend for FakeBackend {
        async fn prepare_track(&self, track: &Track) -> Result<(), BackendError> {
            if self.corrupt_once.swap(false, Ordering::SeqCst) {
                self.record(format!("corrupt {}", track.url));
                return Err(CacheError::Corrupt {
                    path: track.url.clone().into(),
                    reason: "bad magic",
                }
                .into());
            }
            self.record(format!("prepare {}", track.url));
            Ok(())
        }
        async fn start_playback(&self) -> Result<(), BackendError> {
            self.record("start");
            Ok(())
        }
        async fn play(&self) -> Result<(), BackendError> {
            self.record("play");
            Ok(())
        }
        async fn pause(&self) -> Result<(), BackendError> {
            if self.fail_pause.load(Ordering::SeqCst) {
                return Err(BackendError::NotPrepared);
            }
            self.record("pause");
            Ok(())
        }
        async fn stop(&self) -> Result<(), BackendError> {
            self.record("stop");
            Ok(())
        }
        async fn seek_absolute(&self, position_secs: u64) -> Result<(), BackendError> {
            self.record(format!("seek {position_secs}"));
            Ok(())
        }
        async fn seek_relative(&self, offset_secs: i64) -> Result<(), BackendError> {
            self.record(format!("seek {offset_secs:+}"));
            Ok(())
        }
        async fn track_duration(&self) -> Result<f64, BackendError> {
            Ok(*self.duration.lock().unwrap())
        }
        async fn elapsed_time(&self) -> Result<i64, BackendError> {
            if self.fail_timing.load(Ordering::SeqCst) {
                return Err(BackendError::NotPrepared);
            }
            Ok(self.elapsed.load(Ordering::SeqCst))
        }
        async fn is_track_complete(&self) -> Result<bool, BackendError> {
            Ok(self.complete.load(Ordering::SeqCst))
        }
        async fn playback_status(&self) -> Result<BackendStatus, BackendError> {
            Ok(self.status.lock().unwrap().unwrap_or(BackendStatus::Playing))
        }
        async fn select_target(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    struct Harness {
        player: Player,
        backend: Arc<FakeBackend>,
        changes: Arc<Mutex<Vec<String>>>,
        _dir: tempfile::TempDir,
    }

    fn timings() -> PlayerTimings {
        PlayerTimings {
            poll_interval: Duration::from_millis(20),
            resume_timeout: Duration::from_millis(200),
            transition_timeout: Duration::from_secs(2),
        }
    }

    fn harness_with(decoder: Arc<FakeDecoder>, timings: PlayerTimings) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1 << 20).unwrap());
        let backend = Arc::new(FakeBackend::default());
        let dyn_backend: Arc<dyn PlaybackBackend> = backend.clone();
        let player = Player::new(Some(dyn_backend), cache, decoder, timings);
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        player.set_change_callback(move |name| sink.lock().unwrap().push(name.to_string()));
        Harness {
            player,
            backend,
            changes,
            _dir: dir,
        }
    }

    fn harness() -> Harness {
        harness_with(FakeDecoder::new(64), timings())
    }

    pub(crate) async fn eventually(what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(3);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn add_all(player: &Player, urls: &[&str]) {
        for url in urls {
            player.add_track(Track::new(*url)).await;
        }
    }

    #[tokio::test]
    async fn transition_swaps_playlist_after_old_loop_stops() {
        let h = harness();
        add_all(&h.player, &["A", "B"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;

        h.player.begin_transition();
        h.player.add_track(Track::new("C")).await;
        assert_eq!(h.player.get_playlist().len(), 2);
        h.changes.lock().unwrap().clear();

        h.player.complete_transition().await.unwrap();
        eventually("C to be prepared", || h.backend.position("prepare C").is_some()).await;

        let urls: Vec<_> = h.player.get_playlist().tracks().into_iter().map(|t| t.url).collect();
        assert_eq!(urls, vec!["C"]);
        assert!(!h.player.has_pending_transition());
        assert_eq!(h.player.get_state(), PlaybackState::Playing);
        assert!(h.backend.position("stop").unwrap() < h.backend.position("prepare C").unwrap());
        assert_eq!(h.player.active_loops(), 1);
        assert!(h.changes.lock().unwrap().iter().any(|c| c == "player"));
    }

    #[tokio::test]
    async fn transition_timeout_leaves_live_playlist() {
        let h = harness_with(
            FakeDecoder::slow(64, Duration::from_millis(300)),
            PlayerTimings {
                transition_timeout: Duration::from_millis(50),
                ..timings()
            },
        );
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;

        h.player.begin_transition();
        h.player.add_track(Track::new("slow")).await;
        let err = h.player.complete_transition().await.unwrap_err();

        assert!(matches!(err, PlayerError::TransitionTimeout));
        assert_eq!(h.player.get_playlist().track(0).unwrap().url, "A");
        assert_eq!(h.player.get_state(), PlaybackState::Playing);
        assert!(h.backend.position("stop").is_none());
        h.player.stop().await;
    }

    #[tokio::test]
    async fn cancel_during_lead_caching_keeps_live_playlist() {
        let h = harness_with(FakeDecoder::slow(64, Duration::from_millis(800)), timings());
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;

        h.player.begin_transition();
        h.player.add_track(Track::new("slowlead")).await;
        let completing = h.player.clone();
        let completion = tokio::spawn(async move { completing.complete_transition().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.player.cancel_transition().unwrap();
        let started = Instant::now();
        h.player.stop().await;
        assert!(started.elapsed() < Duration::from_millis(400));

        let result = completion.await.unwrap();
        assert!(matches!(result, Err(PlayerError::NoTransition)));
        let urls: Vec<_> = h.player.get_playlist().tracks().into_iter().map(|t| t.url).collect();
        assert_eq!(urls, vec!["A"]);
        assert_eq!(h.player.get_state(), PlaybackState::Stopped);
        assert!(!h.player.loop_active());
        assert!(h.backend.position("prepare slowlead").is_none());
    }

    #[tokio::test]
    async fn complete_without_transition_fails() {
        let h = harness();
        assert!(matches!(
            h.player.complete_transition().await,
            Err(PlayerError::NoTransition)
        ));
        assert!(matches!(
            h.player.cancel_transition(),
            Err(PlayerError::NoTransition)
        ));
    }

    #[tokio::test]
    async fn cancelled_transition_keeps_adds_on_live_playlist() {
        let h = harness();
        h.player.begin_transition();
        h.player.add_track(Track::new("dropped")).await;
        h.player.cancel_transition().unwrap();
        h.player.add_track(Track::new("kept")).await;

        let urls: Vec<_> = h.player.get_playlist().tracks().into_iter().map(|t| t.url).collect();
        assert_eq!(urls, vec!["kept"]);
    }

    #[tokio::test]
    async fn stop_returns_after_loop_exits() {
        let h = harness();
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;
        assert!(h.player.loop_active());

        h.player.stop().await;

        assert!(!h.player.loop_active());
        assert_eq!(h.player.get_state(), PlaybackState::Stopped);
        assert_eq!(h.backend.events().last().map(String::as_str), Some("stop"));
    }

    #[tokio::test]
    async fn timing_reports_remaining() {
        let h = harness();
        *h.backend.duration.lock().unwrap() = 180.0;
        h.backend.elapsed.store(45, Ordering::SeqCst);
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        let timing = h.player.get_playback_timing().await.unwrap().unwrap();
        assert_eq!(
            timing,
            PlaybackTiming {
                elapsed: 45.0,
                duration: 180.0,
                remaining: 135.0
            }
        );
        assert_eq!(h.player.last_remaining(), Some(135));

        h.backend.elapsed.store(-1, Ordering::SeqCst);
        assert!(h.player.get_playback_timing().await.unwrap().is_none());
        assert_eq!(h.player.last_remaining(), None);
        h.player.stop().await;
    }

    #[tokio::test]
    async fn cached_timing_survives_failed_query() {
        let h = harness();
        *h.backend.duration.lock().unwrap() = 200.0;
        h.backend.elapsed.store(50, Ordering::SeqCst);
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        h.player.get_playback_timing().await.unwrap();

        h.backend.fail_timing.store(true, Ordering::SeqCst);
        assert!(h.player.get_playback_timing().await.is_err());
        let cached = h.player.cached_timing().unwrap();
        assert_eq!(cached.duration, 200.0);
        assert_eq!(cached.remaining, 150.0);
        assert_eq!(h.player.last_remaining(), Some(150));

        h.player.stop().await;
        assert!(h.player.cached_timing().is_none());
    }

    #[tokio::test]
    async fn timing_falls_back_to_metadata_duration() {
        let h = harness();
        h.backend.elapsed.store(10, Ordering::SeqCst);
        h.player
            .add_track(Track::new("A").with_meta(META_DURATION, "60.5"))
            .await;
        h.player.play().await.unwrap();

        let timing = h.player.get_playback_timing().await.unwrap().unwrap();
        assert_eq!(timing.duration, 60.5);
        assert_eq!(timing.remaining, 50.5);
        h.player.stop().await;
    }

    #[tokio::test]
    async fn pause_failure_does_not_change_state() {
        let h = harness();
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        h.backend.fail_pause.store(true, Ordering::SeqCst);

        assert!(matches!(h.player.pause().await, Err(PlayerError::Backend(_))));
        assert_eq!(h.player.get_state(), PlaybackState::Playing);
        h.player.stop().await;
    }

    #[tokio::test]
    async fn resume_waits_for_confirmation() {
        let h = harness();
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        h.player.pause().await.unwrap();
        assert_eq!(h.player.get_state(), PlaybackState::Paused);

        *h.backend.status.lock().unwrap() = Some(BackendStatus::Paused);
        assert!(matches!(
            h.player.resume().await,
            Err(PlayerError::ResumeTimeout)
        ));
        assert_eq!(h.player.get_state(), PlaybackState::Paused);

        *h.backend.status.lock().unwrap() = Some(BackendStatus::Playing);
        h.player.resume().await.unwrap();
        assert_eq!(h.player.get_state(), PlaybackState::Playing);
        h.player.stop().await;
    }

    #[tokio::test]
    async fn next_restarts_wait_without_stopping() {
        let h = harness();
        add_all(&h.player, &["A", "B", "C"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;

        h.player.next().unwrap();
        eventually("B to be prepared", || h.backend.position("prepare B").is_some()).await;

        assert_eq!(h.player.get_playlist().current_index(), Some(1));
        assert_eq!(h.player.get_state(), PlaybackState::Playing);
        assert!(h.backend.position("stop").is_none());
        assert_eq!(h.player.active_loops(), 1);
        h.player.stop().await;
    }

    #[tokio::test]
    async fn repeated_next_moves_from_staged_position() {
        let h = harness();
        add_all(&h.player, &["A", "B", "C"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;

        h.player.next().unwrap();
        h.player.next().unwrap();
        eventually("C to be prepared", || h.backend.position("prepare C").is_some()).await;

        assert_eq!(h.player.get_playlist().current_index(), Some(2));
        assert!(matches!(
            h.player.next(),
            Err(PlayerError::Playlist(PlaylistError::EndOfPlaylist))
        ));
        h.player.stop().await;
    }

    #[tokio::test]
    async fn play_at_jumps_while_playing() {
        let h = harness();
        add_all(&h.player, &["A", "B", "C"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;

        h.player.play_at(2).await.unwrap();
        eventually("C to be prepared", || h.backend.position("prepare C").is_some()).await;
        assert!(h.backend.position("prepare B").is_none());
        h.player.stop().await;
    }

    #[tokio::test]
    async fn natural_end_stops_player() {
        let h = harness();
        h.backend.complete.store(true, Ordering::SeqCst);
        add_all(&h.player, &["A", "B"]).await;
        h.player.play().await.unwrap();

        eventually("player to stop", || h.player.get_state() == PlaybackState::Stopped).await;
        eventually("loop to exit", || !h.player.loop_active()).await;

        let events = h.backend.events();
        assert!(events.contains(&"prepare B".to_string()));
        assert!(!events.contains(&"stop".to_string()));
    }

    #[tokio::test]
    async fn corrupt_cache_entry_is_prepared_again() {
        let h = harness();
        h.backend.corrupt_once.store(true, Ordering::SeqCst);
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();

        eventually("A to start", || h.backend.position("start").is_some()).await;
        let events = h.backend.events();
        assert_eq!(&events[..3], ["corrupt A", "prepare A", "start"]);
        assert_eq!(h.player.get_state(), PlaybackState::Playing);
        h.player.stop().await;
    }

    #[tokio::test]
    async fn stop_drops_staged_skip() {
        let h = harness();
        add_all(&h.player, &["A", "B"]).await;
        h.player.play().await.unwrap();
        eventually("A to start", || h.backend.position("start").is_some()).await;
        h.player.get_playlist().seek(1).unwrap();

        h.player.stop().await;

        assert_eq!(h.player.get_playlist().staged_index(), None);
        assert_eq!(h.player.get_playlist().current_index(), Some(0));
    }

    #[tokio::test]
    async fn next_while_stopped_moves_directly() {
        let h = harness();
        add_all(&h.player, &["A", "B"]).await;
        h.player.next().unwrap();
        assert_eq!(h.player.get_playlist().current_index(), Some(1));
        assert!(matches!(
            h.player.next(),
            Err(PlayerError::Playlist(PlaylistError::EndOfPlaylist))
        ));
        h.player.previous().unwrap();
        assert!(matches!(
            h.player.previous(),
            Err(PlayerError::Playlist(PlaylistError::StartOfPlaylist))
        ));
    }

    #[tokio::test]
    async fn clear_requires_stopped() {
        let h = harness();
        add_all(&h.player, &["A"]).await;
        h.player.play().await.unwrap();
        assert!(matches!(h.player.clear(), Err(PlayerError::NotStopped)));

        h.player.stop().await;
        h.player.clear().unwrap();
        assert!(h.player.get_playlist().is_empty());
    }

    #[tokio::test]
    async fn no_backend_still_accepts_tracks() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1 << 20).unwrap());
        let player = Player::new(None, cache, FakeDecoder::new(4), timings());

        assert_eq!(player.add_track(Track::new("A")).await, 0);
        assert!(matches!(player.play().await, Err(PlayerError::NoBackend)));
        assert!(matches!(player.pause().await, Err(PlayerError::NoBackend)));
        assert_eq!(player.get_state(), PlaybackState::Stopped);
    }

    #[tokio::test]
    async fn play_on_empty_playlist_fails() {
        let h = harness();
        assert!(matches!(
            h.player.play().await,
            Err(PlayerError::Playlist(PlaylistError::Empty))
        ));
        assert!(!h.player.loop_active());
    }

    #[tokio::test]
    async fn adds_emit_playlist_changes() {
        let h = harness();
        add_all(&h.player, &["A"]).await;
        h.player.add_track_at(Track::new("B"), 0).await.unwrap();
        assert_eq!(*h.changes.lock().unwrap(), vec!["playlist", "playlist"]);
    }
}
