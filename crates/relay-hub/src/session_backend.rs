//! Playback backend on top of the streaming session.
//!
//! Tracks are materialized by the cache, uploaded as one Tag frame plus Data
//! frames, and started by asking the host to connect to the configured target.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_proto::FormatId;
use tokio::io::AsyncReadExt;

use crate::cache::{self, CACHE_HEADER_LEN, CacheError, TrackCache};
use crate::decoder::Decoder;
use crate::playback_backend::{BackendError, BackendStatus, PlaybackBackend};
use crate::playlist::Track;
use crate::session::{Connector, PlayStatus, Session, SessionTimeouts};

/// Upper bound on PCM bytes per Data frame.
pub const MAX_CHUNK_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
struct PreparedTrack {
    url: String,
    duration: f64,
}

pub struct SessionBackend {
    connector: Arc<dyn Connector>,
    timeouts: SessionTimeouts,
    target: String,
    interface: Option<String>,
    session: tokio::sync::Mutex<Option<Arc<Session>>>,
    cache: Arc<dyn TrackCache>,
    decoder: Arc<dyn Decoder>,
    prepared: Mutex<Option<PreparedTrack>>,
}

impl SessionBackend {
    pub fn new(
        connector: Arc<dyn Connector>,
        timeouts: SessionTimeouts,
        target: String,
        interface: Option<String>,
        cache: Arc<dyn TrackCache>,
        decoder: Arc<dyn Decoder>,
    ) -> Self {
        Self {
            connector,
            timeouts,
            target,
            interface,
            session: tokio::sync::Mutex::new(None),
            cache,
            decoder,
            prepared: Mutex::new(None),
        }
    }

    /// The session, created on first use.
    ///
    /// The slot is not locked while connecting. If two callers race, the
    /// first one stored wins and the other connection is closed.
    pub async fn session(&self) -> Result<Arc<Session>, BackendError> {
        if let Some(session) = self.existing_session().await {
            return Ok(session);
        }
        let created = Arc::new(Session::create(self.connector.clone(), self.timeouts).await?);
        let winner = {
            let mut slot = self.session.lock().await;
            match slot.as_ref() {
                Some(existing) => existing.clone(),
                None => {
                    *slot = Some(created.clone());
                    return Ok(created);
                }
            }
        };
        created.close().await;
        Ok(winner)
    }

    async fn existing_session(&self) -> Option<Arc<Session>> {
        self.session.lock().await.clone()
    }

    /// Close the session, if any.
    pub async fn shutdown(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.close().await;
        }
    }

    fn prepared_duration(&self) -> Result<f64, BackendError> {
        self.prepared
            .lock()
            .unwrap()
            .as_ref()
            .map(|p| p.duration)
            .ok_or(BackendError::NotPrepared)
    }

    async fn upload(
        &self,
        session: &Session,
        path: &Path,
        format: &FormatId,
    ) -> Result<u64, BackendError> {
        let mut file = tokio::fs::File::open(path).await.map_err(CacheError::Io)?;
        let mut skip = [0u8; CACHE_HEADER_LEN];
        file.read_exact(&mut skip).await.map_err(CacheError::Io)?;

        let frame_bytes = format.bytes_per_frame() as usize;
        let chunk_len = MAX_CHUNK_BYTES / frame_bytes * frame_bytes;
        let mut chunk = vec![0u8; chunk_len];
        let mut total = 0u64;
        loop {
            let n = read_full(&mut file, &mut chunk).await.map_err(CacheError::Io)?;
            if n == 0 {
                break;
            }
            session.send_audio(format, &chunk[..n]).await?;
            total += n as u64;
            if n < chunk_len {
                break;
            }
        }
        Ok(total)
    }
}

/// Fill `buf` unless EOF comes first.
async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

fn corrupt(path: &Path, reason: &'static str) -> CacheError {
    CacheError::Corrupt {
        path: path.to_path_buf(),
        reason,
    }
}

#[async_trait]
impl PlaybackBackend for SessionBackend {
    async fn prepare_track(&self, track: &Track) -> Result<(), BackendError> {
        let path = self
            .cache
            .ensure_decoded(&track.url, self.decoder.clone())
            .await?;

        let format = match cache::read_header(&path).await {
            Ok(format) if format.sample_rate > 0 && format.bytes_per_frame() > 0 => Ok(format),
            Ok(_) => Err(corrupt(&path, "bad format")),
            Err(CacheError::Io(_)) => Err(corrupt(&path, "unreadable")),
            Err(err) => Err(err),
        };
        let format = match format {
            Ok(format) => format,
            Err(err) => {
                tracing::warn!(url = %track.url, error = %err, "cached file unusable; invalidating");
                self.cache.invalidate(&track.url).await?;
                return Err(err.into());
            }
        };

        let session = self.session().await?;
        if let Some(title) = track.title() {
            session.send_tag(title).await?;
        }
        let bytes = match self.upload(&session, &path, &format).await {
            Ok(bytes) => bytes,
            Err(BackendError::Cache(err)) => {
                tracing::warn!(url = %track.url, error = %err, "cached file unreadable; invalidating");
                self.cache.invalidate(&track.url).await?;
                return Err(corrupt(&path, "unreadable").into());
            }
            Err(err) => return Err(err),
        };

        let frames = bytes / format.bytes_per_frame();
        let duration = frames as f64 / f64::from(format.sample_rate);
        tracing::info!(
            url = %track.url,
            duration_secs = duration,
            bytes,
            "track uploaded"
        );
        *self.prepared.lock().unwrap() = Some(PreparedTrack {
            url: track.url.clone(),
            duration,
        });
        Ok(())
    }

    async fn start_playback(&self) -> Result<(), BackendError> {
        let session = self.session().await?;
        if let Some(prepared) = self.prepared.lock().unwrap().as_ref() {
            tracing::debug!(url = %prepared.url, target = %self.target, "starting playback");
        }
        session
            .connect_target(&self.target, self.interface.as_deref())
            .await?;
        Ok(())
    }

    async fn play(&self) -> Result<(), BackendError> {
        Ok(self.session().await?.play().await?)
    }

    async fn pause(&self) -> Result<(), BackendError> {
        Ok(self.session().await?.pause().await?)
    }

    async fn stop(&self) -> Result<(), BackendError> {
        match self.existing_session().await {
            Some(session) => Ok(session.quit().await?),
            None => Ok(()),
        }
    }

    async fn seek_absolute(&self, position_secs: u64) -> Result<(), BackendError> {
        Ok(self.session().await?.seek_absolute(position_secs).await?)
    }

    async fn seek_relative(&self, offset_secs: i64) -> Result<(), BackendError> {
        Ok(self.session().await?.seek_relative(offset_secs).await?)
    }

    async fn track_duration(&self) -> Result<f64, BackendError> {
        self.prepared_duration()
    }

    async fn elapsed_time(&self) -> Result<i64, BackendError> {
        let remaining = self.session().await?.get_current_time().await?;
        if remaining < 0 {
            return Ok(-1);
        }
        let duration = self.prepared_duration()?;
        Ok((duration - remaining as f64).max(0.0).round() as i64)
    }

    async fn is_track_complete(&self) -> Result<bool, BackendError> {
        let session = self.session().await?;
        if session.get_current_time().await? >= 0 {
            return Ok(false);
        }
        // -1 is shared by "finished" and "not connected"; a paused target is neither.
        let status = session.get_play_status().await?;
        Ok(status != PlayStatus::Paused)
    }

    async fn playback_status(&self) -> Result<BackendStatus, BackendError> {
        let status = self.session().await?.get_play_status().await?;
        Ok(match status {
            PlayStatus::Playing => BackendStatus::Playing,
            PlayStatus::Paused => BackendStatus::Paused,
            PlayStatus::Disconnected => BackendStatus::Stopped,
        })
    }

    async fn select_target(&self) -> Result<(), BackendError> {
        self.session()
            .await?
            .connect_target(&self.target, self.interface.as_deref())
            .await?;
        Ok(())
    }

    async fn tags(&self) -> Result<Vec<String>, BackendError> {
        Ok(self.session().await?.get_tag_list().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::DiskCache;
    use crate::cache::tests::FakeDecoder;
    use crate::session::tests::{Plan, ScriptedConnector, spawn_host};
    use std::time::Duration;

    fn fast() -> SessionTimeouts {
        SessionTimeouts {
            connect: Duration::from_millis(100),
            status: Duration::from_millis(100),
            time: Duration::from_millis(150),
        }
    }

    /// Two seconds of 44.1 kHz 16-bit stereo.
    const TWO_SECONDS: usize = 44_100 * 4 * 2;

    fn backend(
        dir: &Path,
        replies: Vec<Vec<Vec<(&'static str, &'static str)>>>,
    ) -> (
        SessionBackend,
        Arc<DiskCache>,
        Arc<std::sync::Mutex<Vec<relay_proto::CommandMap>>>,
    ) {
        let (ours, theirs) = tokio::io::duplex(4 * 1024 * 1024);
        let seen = spawn_host(theirs, replies);
        let connector = ScriptedConnector::new(vec![Plan::Live(ours)]);
        let cache = Arc::new(DiskCache::open(dir, 1 << 30).unwrap());
        let backend = SessionBackend::new(
            connector,
            fast(),
            "[fe80::2]:19645".to_string(),
            None,
            cache.clone(),
            FakeDecoder::new(TWO_SECONDS),
        );
        (backend, cache, seen)
    }

    #[tokio::test]
    async fn shutdown_is_not_blocked_by_slow_connect() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(DiskCache::open(dir.path(), 1 << 20).unwrap());
        let connector = ScriptedConnector::new(vec![Plan::Stall(Duration::from_millis(500))]);
        let backend = Arc::new(SessionBackend::new(
            connector,
            fast(),
            "target".to_string(),
            None,
            cache,
            FakeDecoder::new(16),
        ));
        let connecting = backend.clone();
        let pending = tokio::spawn(async move { connecting.session().await.map(|_| ()) });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let started = std::time::Instant::now();
        backend.shutdown().await;
        assert!(started.elapsed() < Duration::from_millis(200));
        assert!(pending.await.unwrap().is_err());
    }

    fn song() -> Track {
        Track::new("song.flac").with_meta("title", "Song")
    }

    #[tokio::test]
    async fn prepare_uploads_and_records_duration() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _cache, seen) = backend(dir.path(), Vec::new());

        backend.prepare_track(&song()).await.unwrap();
        backend.start_playback().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(backend.track_duration().await.unwrap(), 2.0);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["Connect"], "[fe80::2]:19645");
    }

    #[tokio::test]
    async fn elapsed_is_duration_minus_remaining() {
        let dir = tempfile::tempdir().unwrap();
        // Tag frame, one Data frame, then the time query.
        let (backend, _cache, _seen) = backend(
            dir.path(),
            vec![vec![], vec![], vec![vec![("LastTime", "1")]], vec![vec![("Status", "Pause")]]],
        );
        backend.prepare_track(&song()).await.unwrap();

        assert_eq!(backend.elapsed_time().await.unwrap(), 1);
        assert_eq!(backend.elapsed_time().await.unwrap(), -1);
    }

    #[tokio::test]
    async fn minus_one_is_disambiguated_by_status() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, _cache, _seen) = backend(
            dir.path(),
            vec![
                vec![vec![("Status", "Pause")]],
                vec![vec![("Status", "Pause")]],
                vec![vec![("Status", "Disconnect")]],
                vec![vec![("Status", "Disconnect")]],
                vec![vec![("LastTime", "30")]],
            ],
        );

        assert!(!backend.is_track_complete().await.unwrap());
        assert!(backend.is_track_complete().await.unwrap());
        assert!(!backend.is_track_complete().await.unwrap());
    }

    #[tokio::test]
    async fn corrupt_entry_is_invalidated() {
        let dir = tempfile::tempdir().unwrap();
        let (backend, cache, _seen) = backend(dir.path(), Vec::new());
        let track = song();
        let path = cache
            .ensure_decoded(&track.url, FakeDecoder::new(16))
            .await
            .unwrap();
        std::fs::write(&path, b"garbage that is long enough").unwrap();

        let err = backend.prepare_track(&track).await.unwrap_err();

        assert!(err.is_cache_corrupt());
        assert!(!cache.is_cached(&track.url));
    }

    #[tokio::test]
    async fn stop_without_session_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let connector = ScriptedConnector::new(Vec::new());
        let cache = Arc::new(DiskCache::open(dir.path(), 1 << 20).unwrap());
        let backend = SessionBackend::new(
            connector.clone(),
            fast(),
            "t".to_string(),
            None,
            cache,
            FakeDecoder::new(4),
        );

        backend.stop().await.unwrap();
        assert_eq!(
            connector.attempts.load(std::sync::atomic::Ordering::SeqCst),
            0
        );
        assert!(backend.play().await.is_err());
    }
}
