//! Versioned playlist with staged seeks and a single-slot interrupt.
//!
//! Every add bumps `version` once and appends one [`Change`], so front ends can
//! sync incrementally via [`Playlist::changes_since`]. `clear` is a full reset:
//! version drops back to 0 and the change log is emptied. A caller still
//! holding a pre-clear version gets a [`ChangeOp::Clear`] marker first.

use std::collections::BTreeMap;
use std::sync::Mutex;

use tokio::sync::Notify;

/// Metadata key holding the track duration in (fractional) seconds.
pub const META_DURATION: &str = "duration";
pub const META_TITLE: &str = "title";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Track {
    pub url: String,
    pub metadata: BTreeMap<String, String>,
}

impl Track {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn title(&self) -> Option<&str> {
        self.metadata.get(META_TITLE).map(String::as_str)
    }

    /// Duration in seconds. Missing, unparsable, negative or non-finite values are unknown.
    pub fn duration(&self) -> Option<f64> {
        self.metadata
            .get(META_DURATION)
            .and_then(|raw| raw.trim().parse::<f64>().ok())
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Add,
    Clear,
}

/// One entry of the append-only change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub version: u64,
    pub op: ChangeOp,
    /// The added track; `None` for a clear.
    pub track: Option<Track>,
    pub position: usize,
}

/// Request delivered to a running playback loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interrupt {
    pub notify: bool,
    pub exit_loop: bool,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PlaylistError {
    #[error("end of playlist")]
    EndOfPlaylist,
    #[error("start of playlist")]
    StartOfPlaylist,
    #[error("position {index} out of range (length {len})")]
    OutOfBounds { index: usize, len: usize },
    #[error("playlist is empty")]
    Empty,
}

#[derive(Debug, Default)]
struct PlaylistInner {
    tracks: Vec<Track>,
    current: Option<usize>,
    staged: Option<usize>,
    version: u64,
    history: Vec<Change>,
}

impl PlaylistInner {
    fn record_add(&mut self, track: Track, position: usize) {
        self.version += 1;
        self.history.push(Change {
            version: self.version,
            op: ChangeOp::Add,
            track: Some(track),
            position,
        });
    }
}

#[derive(Debug, Default)]
pub struct Playlist {
    inner: Mutex<PlaylistInner>,
    interrupt: Mutex<Option<Interrupt>>,
    interrupt_notify: Notify,
}

impl Playlist {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a track and return its position.
    pub fn add(&self, track: Track) -> usize {
        let mut inner = self.inner.lock().unwrap();
        let position = inner.tracks.len();
        inner.tracks.push(track.clone());
        if inner.current.is_none() {
            inner.current = Some(0);
        }
        inner.record_add(track, position);
        position
    }

    /// Insert a track at `position`. Inserting at or before the current track
    /// shifts `current` (and any staged position) so the same track stays current.
    pub fn add_at(&self, track: Track, position: usize) -> Result<usize, PlaylistError> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.tracks.len();
        if position > len {
            return Err(PlaylistError::OutOfBounds { index: position, len });
        }
        inner.tracks.insert(position, track.clone());
        inner.current = match inner.current {
            Some(current) if position <= current => Some(current + 1),
            Some(current) => Some(current),
            None => Some(0),
        };
        if let Some(staged) = inner.staged {
            if position <= staged {
                inner.staged = Some(staged + 1);
            }
        }
        inner.record_add(track, position);
        Ok(position)
    }

    /// Full reset: no tracks, no current position, version 0, empty change log.
    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        *inner = PlaylistInner::default();
    }

    /// Move to the next track. Past the end nothing moves.
    pub fn next(&self) -> Result<usize, PlaylistError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current.ok_or(PlaylistError::Empty)?;
        let next = current + 1;
        if next >= inner.tracks.len() {
            return Err(PlaylistError::EndOfPlaylist);
        }
        inner.current = Some(next);
        inner.staged = None;
        Ok(next)
    }

    /// Move to the previous track. Before the start `current` is clamped to 0.
    pub fn previous(&self) -> Result<usize, PlaylistError> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner.current.ok_or(PlaylistError::Empty)?;
        inner.staged = None;
        if current == 0 {
            inner.current = Some(0);
            return Err(PlaylistError::StartOfPlaylist);
        }
        inner.current = Some(current - 1);
        Ok(current - 1)
    }

    /// Stage a position change without applying it.
    pub fn seek(&self, index: usize) -> Result<(), PlaylistError> {
        let mut inner = self.inner.lock().unwrap();
        let len = inner.tracks.len();
        if index >= len {
            return Err(PlaylistError::OutOfBounds { index, len });
        }
        inner.staged = Some(index);
        Ok(())
    }

    /// Apply the staged position, if any. Returns the new current index.
    pub fn commit_staged(&self) -> Result<Option<usize>, PlaylistError> {
        let mut inner = self.inner.lock().unwrap();
        let Some(index) = inner.staged.take() else {
            return Ok(None);
        };
        let len = inner.tracks.len();
        if index >= len {
            return Err(PlaylistError::OutOfBounds { index, len });
        }
        inner.current = Some(index);
        Ok(Some(index))
    }

    /// Commit the staged position, or advance by one if nothing is staged.
    pub fn advance(&self) -> Result<usize, PlaylistError> {
        match self.commit_staged()? {
            Some(index) => Ok(index),
            None => self.next(),
        }
    }

    pub fn discard_staged(&self) {
        self.inner.lock().unwrap().staged = None;
    }

    pub fn staged_index(&self) -> Option<usize> {
        self.inner.lock().unwrap().staged
    }

    pub fn current_index(&self) -> Option<usize> {
        self.inner.lock().unwrap().current
    }

    pub fn current_track(&self) -> Option<Track> {
        let inner = self.inner.lock().unwrap();
        inner.current.and_then(|i| inner.tracks.get(i).cloned())
    }

    pub fn track(&self, index: usize) -> Option<Track> {
        self.inner.lock().unwrap().tracks.get(index).cloned()
    }

    pub fn tracks(&self) -> Vec<Track> {
        self.inner.lock().unwrap().tracks.clone()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn version(&self) -> u64 {
        self.inner.lock().unwrap().version
    }

    /// Changes strictly newer than `version`, oldest first.
    ///
    /// A version above the current one predates a clear. The result then
    /// starts with a version-0 [`ChangeOp::Clear`] followed by the whole log,
    /// so replaying it rebuilds the list from scratch.
    pub fn changes_since(&self, version: u64) -> Vec<Change> {
        let inner = self.inner.lock().unwrap();
        if version > inner.version {
            let mut changes = Vec::with_capacity(inner.history.len() + 1);
            changes.push(Change {
                version: 0,
                op: ChangeOp::Clear,
                track: None,
                position: 0,
            });
            changes.extend(inner.history.iter().cloned());
            return changes;
        }
        let start = inner.history.partition_point(|c| c.version <= version);
        inner.history[start..].to_vec()
    }

    /// Overwrite the interrupt slot and wake the waiting loop, if any.
    pub fn signal_interrupt(&self, notify: bool, exit_loop: bool) {
        *self.interrupt.lock().unwrap() = Some(Interrupt { notify, exit_loop });
        self.interrupt_notify.notify_one();
    }

    /// Wait until an interrupt is available and consume it.
    pub async fn wait_interrupt(&self) -> Interrupt {
        loop {
            if let Some(interrupt) = self.take_interrupt() {
                return interrupt;
            }
            self.interrupt_notify.notified().await;
        }
    }

    /// Consume a pending interrupt without waiting.
    pub fn take_interrupt(&self) -> Option<Interrupt> {
        self.interrupt.lock().unwrap().take()
    }
}
