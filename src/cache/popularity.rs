//! Persisted view counters
//!
//! One JSON document maps content id to `{views, last_access}`. It is loaded
//! once at startup and rewritten through a temp file and rename after every
//! increment. Records are keyed by content id only, so every quality of a
//! content id shares one counter.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Popularity of one content id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PopularityRecord {
    pub views: u64,
    pub last_access: DateTime<Utc>,
}

/// View counter store backed by a JSON file
pub struct PopularityTracker {
    path: PathBuf,
    records: Mutex<HashMap<String, PopularityRecord>>,
}

impl PopularityTracker {
    /// Load the document at `path`. A missing file starts empty. An
    /// unreadable one is logged and also starts empty.
    pub async fn load<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();

        let records = match fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice::<HashMap<String, PopularityRecord>>(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "Ignoring unreadable popularity file"
                    );
                    HashMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read popularity file");
                HashMap::new()
            }
        };

        info!(path = %path.display(), records = records.len(), "Loaded popularity records");

        Self {
            path,
            records: Mutex::new(records),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one view of `content_id` now
    pub async fn increment(&self, content_id: &str) -> PopularityRecord {
        self.increment_at(content_id, Utc::now()).await
    }

    /// Record one view of `content_id` at `now`
    pub async fn increment_at(&self, content_id: &str, now: DateTime<Utc>) -> PopularityRecord {
        let mut records = self.records.lock().await;

        let record = records
            .entry(content_id.to_string())
            .and_modify(|r| {
                r.views += 1;
                r.last_access = now;
            })
            .or_insert(PopularityRecord {
                views: 1,
                last_access: now,
            });
        let updated = *record;

        if let Err(e) = self.persist(&records).await {
            warn!(path = %self.path.display(), error = %e, "Failed to persist popularity records");
        }

        debug!(content_id = %content_id, views = updated.views, "Recorded view");
        updated
    }

    pub async fn get(&self, content_id: &str) -> Option<PopularityRecord> {
        self.records.lock().await.get(content_id).copied()
    }

    /// Copy of every record
    pub async fn snapshot(&self) -> HashMap<String, PopularityRecord> {
        self.records.lock().await.clone()
    }

    /// Drop records of content ids not in `live` that were last accessed
    /// before `stale_before`. Returns how many were removed.
    pub async fn prune(&self, live: &HashSet<String>, stale_before: DateTime<Utc>) -> usize {
        let mut records = self.records.lock().await;

        let before = records.len();
        records.retain(|id, rec| live.contains(id) || rec.last_access >= stale_before);
        let removed = before - records.len();

        if removed > 0 {
            if let Err(e) = self.persist(&records).await {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Failed to persist popularity records"
                );
            }
            debug!(removed, remaining = records.len(), "Pruned popularity records");
        }
        removed
    }

    async fn persist(&self, records: &HashMap<String, PopularityRecord>) -> std::io::Result<()> {
        let json = serde_json::to_vec_pretty(records)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        fs::write(&tmp, &json).await?;
        fs::rename(&tmp, &self.path).await
    }
}
