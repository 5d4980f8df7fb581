//! Content-addressed disk cache of decoded audio.
//!
//! Each entry is `<sha256(url)>.pcm`: the `RLYC` magic, a 16-byte [`FormatId`],
//! then raw interleaved PCM. Entries are produced through a [`Decoder`] on the
//! blocking pool and evicted least-recently-used once the directory exceeds its cap.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use relay_proto::{FORMAT_ID_LEN, FormatId};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::decoder::{DecodedAudio, Decoder};

pub const CACHE_MAGIC: &[u8; 4] = b"RLYC";
pub const CACHE_HEADER_LEN: usize = CACHE_MAGIC.len() + FORMAT_ID_LEN;

const ENTRY_EXT: &str = "pcm";
const PART_EXT: &str = "part";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cache io error: {0}")]
    Io(#[from] io::Error),
    #[error("decode failed: {0:#}")]
    Decode(anyhow::Error),
    #[error("corrupt cache entry {path:?}: {reason}")]
    Corrupt { path: PathBuf, reason: &'static str },
}

/// Materializes sources as locally readable decoded files.
#[async_trait]
pub trait TrackCache: Send + Sync {
    /// Path of the decoded rendering of `url`, decoding on a miss.
    ///
    /// At most one decode per url runs at a time; concurrent callers wait and
    /// then observe the hit.
    async fn ensure_decoded(&self, url: &str, decoder: Arc<dyn Decoder>)
    -> Result<PathBuf, CacheError>;

    /// Drop a possibly-corrupt entry. Missing entries are fine.
    async fn invalidate(&self, url: &str) -> Result<(), CacheError>;

    /// Non-blocking readiness probe.
    fn is_cached(&self, url: &str) -> bool;
}

/// Cache file name stem for `url`.
pub fn cache_key(url: &str) -> String {
    hex::encode(Sha256::digest(url.as_bytes()))
}

pub fn encode_header(format: &FormatId) -> [u8; CACHE_HEADER_LEN] {
    let mut out = [0u8; CACHE_HEADER_LEN];
    out[..CACHE_MAGIC.len()].copy_from_slice(CACHE_MAGIC);
    out[CACHE_MAGIC.len()..].copy_from_slice(&format.encode());
    out
}

/// Read and validate the header of a cache entry.
pub async fn read_header(path: &Path) -> Result<FormatId, CacheError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut head = [0u8; CACHE_HEADER_LEN];
    match file.read_exact(&mut head).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(CacheError::Corrupt {
                path: path.to_path_buf(),
                reason: "short header",
            });
        }
        Err(e) => return Err(e.into()),
    }
    if &head[..CACHE_MAGIC.len()] != CACHE_MAGIC {
        return Err(CacheError::Corrupt {
            path: path.to_path_buf(),
            reason: "bad magic",
        });
    }
    FormatId::decode(&head[CACHE_MAGIC.len()..]).map_err(|_| CacheError::Corrupt {
        path: path.to_path_buf(),
        reason: "bad format",
    })
}

#[derive(Debug)]
struct Entry {
    size: u64,
    last_used: u64,
}

#[derive(Debug, Default)]
struct CacheIndex {
    entries: HashMap<String, Entry>,
    total: u64,
    clock: u64,
}

impl CacheIndex {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn insert(&mut self, key: String, size: u64) {
        let last_used = self.tick();
        if let Some(old) = self.entries.insert(key, Entry { size, last_used }) {
            self.total -= old.size;
        }
        self.total += size;
    }

    fn remove(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(old) => {
                self.total -= old.size;
                true
            }
            None => false,
        }
    }

    /// Keys to drop, oldest first, until under `max_bytes`. `keep` is never chosen.
    fn evict(&mut self, max_bytes: u64, keep: &str) -> Vec<String> {
        let mut order: Vec<(u64, String)> = self
            .entries
            .iter()
            .filter(|(k, _)| k.as_str() != keep)
            .map(|(k, e)| (e.last_used, k.clone()))
            .collect();
        order.sort_unstable();

        let mut evicted = Vec::new();
        for (_, key) in order {
            if self.total <= max_bytes {
                break;
            }
            self.remove(&key);
            evicted.push(key);
        }
        evicted
    }
}

pub struct DiskCache {
    dir: PathBuf,
    max_bytes: u64,
    index: Mutex<CacheIndex>,
    inflight: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl DiskCache {
    /// Open `dir`, indexing existing entries and removing stale partial files.
    pub fn open(dir: impl Into<PathBuf>, max_bytes: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let mut found = Vec::new();
        for item in std::fs::read_dir(&dir)? {
            let item = item?;
            let path = item.path();
            match path.extension().and_then(|e| e.to_str()) {
                Some(PART_EXT) => {
                    tracing::debug!(path = %path.display(), "removing stale partial entry");
                    let _ = std::fs::remove_file(&path);
                }
                Some(ENTRY_EXT) => {
                    let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                        continue;
                    };
                    let meta = item.metadata()?;
                    let modified = meta.modified().ok();
                    found.push((modified, key.to_string(), meta.len()));
                }
                _ => {}
            }
        }
        found.sort();

        let mut index = CacheIndex::default();
        for (_, key, size) in found {
            index.insert(key, size);
        }
        tracing::info!(
            dir = %dir.display(),
            entries = index.entries.len(),
            bytes = index.total,
            max_bytes,
            "cache opened"
        );

        Ok(Self {
            dir,
            max_bytes,
            index: Mutex::new(index),
            inflight: Mutex::new(HashMap::new()),
        })
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{ENTRY_EXT}"))
    }

    /// Refresh recency and return the path if `key` is present on disk.
    fn touch(&self, key: &str) -> Option<PathBuf> {
        let path = self.path_for_key(key);
        let mut index = self.index.lock().unwrap();
        let tick = index.tick();
        let entry = index.entries.get_mut(key)?;
        entry.last_used = tick;
        if path.is_file() {
            Some(path)
        } else {
            index.remove(key);
            None
        }
    }

    fn url_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.inflight
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    fn release_url_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut inflight = self.inflight.lock().unwrap();
        // The map and `lock` are the only holders: nobody else is waiting.
        if Arc::strong_count(&lock) == 2 {
            inflight.remove(key);
        }
    }

    async fn produce(
        &self,
        key: &str,
        url: &str,
        decoder: Arc<dyn Decoder>,
    ) -> Result<PathBuf, CacheError> {
        let part = self.dir.join(format!("{key}.{PART_EXT}"));
        let path = self.path_for_key(key);

        let source = url.to_string();
        let part_for_task = part.clone();
        let decoded = tokio::task::spawn_blocking(move || {
            write_entry(&part_for_task, &source, decoder.as_ref())
        })
        .await
        .map_err(|e| CacheError::Decode(anyhow::anyhow!("decode task failed: {e}")))
        .and_then(|r| r);
        let decoded = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(err);
            }
        };

        tokio::fs::rename(&part, &path).await?;
        let size = tokio::fs::metadata(&path).await?.len();
        tracing::info!(
            url,
            frames = decoded.frames,
            rate = decoded.format.sample_rate,
            bits = decoded.format.bits_per_sample,
            channels = decoded.format.channels,
            size,
            "cached decoded track"
        );

        let evicted = {
            let mut index = self.index.lock().unwrap();
            index.insert(key.to_string(), size);
            index.evict(self.max_bytes, key)
        };
        for old in evicted {
            let old_path = self.path_for_key(&old);
            tracing::debug!(path = %old_path.display(), "evicting cache entry");
            if let Err(e) = tokio::fs::remove_file(&old_path).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %old_path.display(), error = %e, "evict failed");
                }
            }
        }
        Ok(path)
    }
}

#[async_trait]
impl TrackCache for DiskCache {
    async fn ensure_decoded(
        &self,
        url: &str,
        decoder: Arc<dyn Decoder>,
    ) -> Result<PathBuf, CacheError> {
        let key = cache_key(url);
        if let Some(path) = self.touch(&key) {
            tracing::debug!(url, "cache hit");
            return Ok(path);
        }

        let lock = self.url_lock(&key);
        let result = {
            let _guard = lock.lock().await;
            match self.touch(&key) {
                Some(path) => {
                    tracing::debug!(url, "cache hit after waiting on decode");
                    Ok(path)
                }
                None => {
                    tracing::debug!(url, "cache miss");
                    self.produce(&key, url, decoder).await
                }
            }
        };
        self.release_url_lock(&key, lock);
        result
    }

    async fn invalidate(&self, url: &str) -> Result<(), CacheError> {
        let key = cache_key(url);
        self.index.lock().unwrap().remove(&key);
        match tokio::fs::remove_file(self.path_for_key(&key)).await {
            Ok(()) => {
                tracing::info!(url, "invalidated cache entry");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn is_cached(&self, url: &str) -> bool {
        self.index
            .lock()
            .unwrap()
            .entries
            .contains_key(&cache_key(url))
    }
}

/// Decode into `part`: placeholder header, PCM, then the real header.
fn write_entry(part: &Path, source: &str, decoder: &dyn Decoder) -> Result<DecodedAudio, CacheError> {
    let mut writer = BufWriter::new(File::create(part)?);
    writer.write_all(&[0u8; CACHE_HEADER_LEN])?;
    let decoded = decoder.decode(source, &mut writer).map_err(CacheError::Decode)?;
    let mut file = writer.into_inner().map_err(|e| CacheError::Io(e.into_error()))?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&encode_header(&decoded.format))?;
    file.sync_all()?;
    Ok(decoded)
}
