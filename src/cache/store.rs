//! On-disk rendition store
//!
//! Entries live flat under one root directory as `<escaped id>.<quality>.mp4`.
//! A fill writes to a uniquely named `.part` staging file in the same
//! directory and becomes visible only through an atomic rename, so a reader
//! never observes a partial entry.
//!
//! Open readers are counted per key. Eviction consults the count and leaves
//! busy entries alone.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::fs;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::keys::{ContentKey, STAGING_SUFFIX};
use crate::types::{RelayError, Result};

fn cache_io(context: &str, path: &Path, err: std::io::Error) -> RelayError {
    RelayError::CacheIo(format!("{} {}: {}", context, path.display(), err))
}

// ============================================================================
// Entries
// ============================================================================

/// A published rendition
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: ContentKey,
    pub path: PathBuf,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// Aggregate store statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub entries: usize,
    pub total_bytes: u64,
}

// ============================================================================
// Staging
// ============================================================================

/// An in-progress fill.
///
/// The file is deleted when this value is dropped without being published,
/// which covers errors, client disconnects and panics alike.
pub struct StagingFile {
    key: ContentKey,
    path: PathBuf,
    file: Option<fs::File>,
    written: u64,
    published: bool,
}

impl StagingFile {
    pub fn key(&self) -> &ContentKey {
        &self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes written so far
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write_all(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| RelayError::CacheIo("staging file already closed".into()))?;
        file.write_all(chunk)
            .await
            .map_err(|e| cache_io("write", &self.path, e))?;
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Explicitly abandon the fill. Equivalent to dropping.
    pub fn discard(self) {}

    /// Swap the handle for a read-only one so every later write fails
    #[cfg(test)]
    pub(crate) async fn reopen_read_only(&mut self) -> Result<()> {
        let file = fs::File::open(&self.path)
            .await
            .map_err(|e| cache_io("open", &self.path, e))?;
        self.file = Some(file);
        Ok(())
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.file.take();
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!(path = %self.path.display(), "Discarded staging file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove staging file"
            ),
        }
    }
}

// ============================================================================
// Readers
// ============================================================================

/// Decrements the reader count for a key on drop
pub struct ReaderGuard {
    readers: Arc<DashMap<ContentKey, usize>>,
    key: ContentKey,
}

impl ReaderGuard {
    fn acquire(readers: &Arc<DashMap<ContentKey, usize>>, key: &ContentKey) -> Self {
        *readers.entry(key.clone()).or_insert(0) += 1;
        Self {
            readers: Arc::clone(readers),
            key: key.clone(),
        }
    }
}

impl Drop for ReaderGuard {
    fn drop(&mut self) {
        self.readers.remove_if_mut(&self.key, |_, count| {
            *count = count.saturating_sub(1);
            *count == 0
        });
    }
}

/// An open cached entry, positioned for reading
pub struct CachedReader {
    pub file: fs::File,
    pub size: u64,
    _guard: ReaderGuard,
}

impl CachedReader {
    /// Position the handle at `offset`
    pub async fn seek_to(&mut self, offset: u64) -> Result<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .await
            .map_err(|e| RelayError::CacheIo(format!("seek: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// CacheStore
// ============================================================================

/// Rendition store rooted at one directory
pub struct CacheStore {
    root: PathBuf,
    readers: Arc<DashMap<ContentKey, usize>>,
}

impl CacheStore {
    /// Open (or create) a store at `root`, removing staging files left
    /// behind by an interrupted process.
    pub async fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .await
            .map_err(|e| cache_io("create", &root, e))?;

        let store = Self {
            root,
            readers: Arc::new(DashMap::new()),
        };
        let cleaned = store.clean_orphaned_staging().await;

        info!(path = %store.root.display(), cleaned, "Initialized cache store");
        Ok(store)
    }

    async fn clean_orphaned_staging(&self) -> u64 {
        let mut dir = match fs::read_dir(&self.root).await {
            Ok(d) => d,
            Err(_) => return 0,
        };
        let mut cleaned = 0u64;
        while let Ok(Some(entry)) = dir.next_entry().await {
            let path = entry.path();
            let is_staging = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.ends_with(STAGING_SUFFIX))
                .unwrap_or(false);
            if !is_staging {
                continue;
            }
            match fs::remove_file(&path).await {
                Ok(()) => cleaned += 1,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to clean orphaned staging file"
                    )
                }
            }
        }
        cleaned
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final path of an entry
    pub fn path_for(&self, key: &ContentKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    pub async fn exists(&self, key: &ContentKey) -> bool {
        fs::metadata(self.path_for(key))
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }

    pub async fn size(&self, key: &ContentKey) -> Option<u64> {
        fs::metadata(self.path_for(key)).await.ok().map(|m| m.len())
    }

    /// Open an entry for reading.
    ///
    /// Returns `Ok(None)` if the entry does not exist, including the case
    /// where it was evicted between a lookup and this call.
    pub async fn open_for_read(&self, key: &ContentKey) -> Result<Option<CachedReader>> {
        let guard = ReaderGuard::acquire(&self.readers, key);
        let path = self.path_for(key);

        let file = match fs::File::open(&path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(cache_io("open", &path, e)),
        };
        let size = file
            .metadata()
            .await
            .map_err(|e| cache_io("stat", &path, e))?
            .len();

        Ok(Some(CachedReader {
            file,
            size,
            _guard: guard,
        }))
    }

    /// Number of readers currently holding `key` open
    pub fn active_readers(&self, key: &ContentKey) -> usize {
        self.readers.get(key).map(|c| *c).unwrap_or(0)
    }

    /// Create a fresh staging file for one fill attempt
    pub async fn create_staging(&self, key: &ContentKey) -> Result<StagingFile> {
        let path = self.root.join(key.staging_name(&uuid::Uuid::new_v4()));
        let file = fs::File::create(&path)
            .await
            .map_err(|e| cache_io("create", &path, e))?;

        debug!(key = %key, path = %path.display(), "Created staging file");

        Ok(StagingFile {
            key: key.clone(),
            path,
            file: Some(file),
            written: 0,
            published: false,
        })
    }

    /// Flush, sync and atomically rename a staging file into place.
    ///
    /// Returns the published size. On error the staging file is removed.
    pub async fn publish(&self, mut staging: StagingFile) -> Result<u64> {
        let final_path = self.path_for(&staging.key);

        if let Some(mut file) = staging.file.take() {
            file.flush()
                .await
                .map_err(|e| cache_io("flush", &staging.path, e))?;
            file.sync_all()
                .await
                .map_err(|e| cache_io("sync", &staging.path, e))?;
        }

        fs::rename(&staging.path, &final_path)
            .await
            .map_err(|e| cache_io("rename", &staging.path, e))?;
        staging.published = true;

        info!(key = %staging.key, bytes = staging.written, "Published cache entry");
        Ok(staging.written)
    }

    /// Remove an entry. Returns whether anything was deleted.
    pub async fn delete(&self, key: &ContentKey) -> Result<bool> {
        let path = self.path_for(key);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(key = %key, "Deleted cache entry");
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(cache_io("delete", &path, e)),
        }
    }

    /// All published entries. Staging files and foreign files are skipped.
    pub async fn list_entries(&self) -> Result<Vec<CacheEntry>> {
        let mut dir = fs::read_dir(&self.root)
            .await
            .map_err(|e| cache_io("list", &self.root, e))?;

        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| cache_io("list", &self.root, e))?
        {
            let name = entry.file_name();
            let Some(key) = name.to_str().and_then(ContentKey::from_file_name) else {
                continue;
            };
            // Raced with a delete
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if !meta.is_file() {
                continue;
            }
            let modified = meta
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(|_| Utc::now());
            entries.push(CacheEntry {
                key,
                path: entry.path(),
                size: meta.len(),
                modified,
            });
        }
        Ok(entries)
    }

    pub async fn total_size(&self) -> Result<u64> {
        Ok(self.list_entries().await?.iter().map(|e| e.size).sum())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let entries = self.list_entries().await?;
        Ok(StoreStats {
            entries: entries.len(),
            total_bytes: entries.iter().map(|e| e.size).sum(),
        })
    }
}
