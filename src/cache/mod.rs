//! # Cache Module
//!
//! Content-addressed store of transcoded audio shared by every guild player.
//!
//! Entries are keyed by the SHA-256 of the song's canonical URL (see
//! [`cache_key`]) and hold the exact bytes the transcoder produced, so a cache
//! hit can be handed straight to the transcoder as a local input.
//!
//! ## Write-once entries
//!
//! [`ContentCache::open_write_stream`] hands out a [`CacheWriter`] that writes
//! into an anonymous temporary file inside the cache directory. The entry only
//! becomes visible under its key when [`CacheWriter::finish`] persists it, so
//! readers never observe a half-written file and two players caching the same
//! song race harmlessly: the last rename wins with identical content.
//!
//! Eviction is not handled here.

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::seq::SliceRandom;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tempfile::TempPath;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{debug, info};

/// Stable cache key for a source URL.
pub fn cache_key(url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.trim().as_bytes());
    hex::encode(hasher.finalize())
}

/// A stored entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub path: PathBuf,
}

#[async_trait]
pub trait ContentCache: Send + Sync {
    /// Local path of a complete entry, if there is one.
    async fn path_for(&self, key: &str) -> Option<PathBuf>;

    /// Opens a writer whose content becomes the entry for `key` once finished.
    async fn open_write_stream(&self, key: &str) -> Result<CacheWriter>;

    /// Up to `count` distinct entries picked at random.
    async fn random_entries(&self, count: usize) -> Result<Vec<CacheEntry>>;
}

/// Pending cache entry. Dropping it without calling [`finish`](Self::finish)
/// discards the partial data.
#[derive(Debug)]
pub struct CacheWriter {
    file: fs::File,
    temp_path: TempPath,
    target: PathBuf,
    written: u64,
}

impl CacheWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Flushes and atomically publishes the entry.
    pub async fn finish(mut self) -> Result<PathBuf> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        drop(self.file);

        let target = self.target.clone();
        self.temp_path
            .persist(&target)
            .with_context(|| format!("Error persisting cache entry {}", target.display()))?;

        debug!("💾 Cache entry written: {} ({} bytes)", target.display(), self.written);
        Ok(target)
    }
}

/// Directory of `<key>` files.
#[derive(Debug, Clone)]
pub struct FileCache {
    dir: PathBuf,
}

impl FileCache {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        info!("📁 Content cache at: {}", dir.display());
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn is_valid_key(key: &str) -> bool {
        !key.is_empty() && key.chars().all(|c| c.is_ascii_alphanumeric())
    }
}

#[async_trait]
impl ContentCache for FileCache {
    async fn path_for(&self, key: &str) -> Option<PathBuf> {
        if !Self::is_valid_key(key) {
            return None;
        }

        let path = self.dir.join(key);
        match fs::metadata(&path).await {
            Ok(meta) if meta.is_file() && meta.len() > 0 => Some(path),
            _ => None,
        }
    }

    async fn open_write_stream(&self, key: &str) -> Result<CacheWriter> {
        if !Self::is_valid_key(key) {
            anyhow::bail!("Invalid cache key: {}", key);
        }

        let dir = self.dir.clone();
        let (file, temp_path) = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(".partial-")
                .tempfile_in(dir)
                .map(|tmp| tmp.into_parts())
        })
        .await??;

        Ok(CacheWriter {
            file: fs::File::from_std(file),
            temp_path,
            target: self.dir.join(key),
            written: 0,
        })
    }

    async fn random_entries(&self, count: usize) -> Result<Vec<CacheEntry>> {
        let mut entries = Vec::new();
        let mut dir = fs::read_dir(&self.dir).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            if Self::is_valid_key(&name) && entry.file_type().await?.is_file() {
                entries.push(CacheEntry {
                    key: name,
                    path: entry.path(),
                });
            }
        }

        let mut rng = rand::thread_rng();
        Ok(entries.choose_multiple(&mut rng, count).cloned().collect())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// Read-only cache with entries that need not exist on disk.
    #[derive(Default)]
    pub struct MemoryCache {
        entries: Mutex<HashMap<String, PathBuf>>,
    }

    impl MemoryCache {
        pub fn insert(&self, key: &str) -> PathBuf {
            let path = PathBuf::from(format!("/cache/{key}"));
            self.entries.lock().insert(key.to_string(), path.clone());
            path
        }
    }

    #[async_trait]
    impl ContentCache for MemoryCache {
        async fn path_for(&self, key: &str) -> Option<PathBuf> {
            self.entries.lock().get(key).cloned()
        }

        async fn open_write_stream(&self, key: &str) -> Result<CacheWriter> {
            anyhow::bail!("MemoryCache is read-only ({key})")
        }

        async fn random_entries(&self, count: usize) -> Result<Vec<CacheEntry>> {
            Ok(self
                .entries
                .lock()
                .iter()
                .take(count)
                .map(|(key, path)| CacheEntry { key: key.clone(), path: path.clone() })
                .collect())
        }
    }
}
