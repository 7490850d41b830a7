//! Popularity-driven eviction
//!
//! When the store grows past `budget + threshold`, entries are ranked by
//! `(views, last_access)` ascending and removed from the front. Entries with
//! no popularity record count as zero views last accessed at their mtime.
//!
//! Entries being read are skipped. A failed delete is logged and skipped.
//! Only one run executes at a time; a trigger during a run is a no-op.
//!
//! After a run, popularity records of content ids with no entries left are
//! pruned once they are older than the retention window.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::keys::ContentKey;
use super::popularity::{PopularityRecord, PopularityTracker};
use super::store::{CacheEntry, CacheStore};
use crate::types::Result;

// ============================================================================
// Configuration
// ============================================================================

/// How much to remove once eviction triggers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum EvictionPolicy {
    /// Remove least popular entries until usage is back under budget
    #[default]
    Budget,
    /// Remove a fixed share of all entries
    Fraction,
}

/// Eviction settings
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Target disk usage (default: 5 GiB)
    pub budget_bytes: u64,
    /// Slack above the budget before a run triggers (default: 0)
    pub threshold_bytes: u64,
    pub policy: EvictionPolicy,
    /// Share of entries removed per `Fraction` run, 1..=100 (default: 10)
    pub fraction_pct: u8,
    /// Age after which records of evicted content ids are pruned (default: 30 days)
    pub popularity_retention: TimeDelta,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            budget_bytes: 5 * 1024 * 1024 * 1024,
            threshold_bytes: 0,
            policy: EvictionPolicy::Budget,
            fraction_pct: 10,
            popularity_retention: TimeDelta::days(30),
        }
    }
}

impl EvictionConfig {
    /// Usage above which a run is needed
    pub fn trigger_bytes(&self) -> u64 {
        self.budget_bytes.saturating_add(self.threshold_bytes)
    }
}

// ============================================================================
// Ranking
// ============================================================================

/// An entry joined with its popularity
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: CacheEntry,
    pub views: u64,
    pub last_access: DateTime<Utc>,
}

/// Rank entries least popular first
pub fn rank(
    entries: Vec<CacheEntry>,
    popularity: &HashMap<String, PopularityRecord>,
) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = entries
        .into_iter()
        .map(|entry| {
            let (views, last_access) = match popularity.get(&entry.key.content_id) {
                Some(rec) => (rec.views, rec.last_access),
                None => (0, entry.modified),
            };
            Candidate {
                entry,
                views,
                last_access,
            }
        })
        .collect();

    candidates.sort_by(|a, b| {
        (a.views, a.last_access)
            .cmp(&(b.views, b.last_access))
            .then_with(|| a.entry.key.content_id.cmp(&b.entry.key.content_id))
    });
    candidates
}

// ============================================================================
// Evictor
// ============================================================================

/// Outcome of one eviction run
#[derive(Debug, Clone, Default)]
pub struct EvictionReport {
    pub removed: Vec<ContentKey>,
    pub bytes_freed: u64,
    /// Entries left alone because a reader held them open
    pub skipped_busy: usize,
    /// Entries whose delete failed
    pub failed: usize,
    /// Popularity records dropped after the run
    pub pruned_records: usize,
}

/// Reclaims space in a [`CacheStore`]
pub struct Evictor {
    store: Arc<CacheStore>,
    popularity: Arc<PopularityTracker>,
    config: EvictionConfig,
    running: Mutex<()>,
}

impl Evictor {
    pub fn new(
        store: Arc<CacheStore>,
        popularity: Arc<PopularityTracker>,
        config: EvictionConfig,
    ) -> Self {
        Self {
            store,
            popularity,
            config,
            running: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &EvictionConfig {
        &self.config
    }

    /// Run eviction if usage exceeds the trigger.
    ///
    /// Returns `None` when nothing was needed or another run is in progress.
    pub async fn run_if_needed(&self) -> Result<Option<EvictionReport>> {
        let Ok(_running) = self.running.try_lock() else {
            debug!("Eviction already running");
            return Ok(None);
        };

        let entries = self.store.list_entries().await?;
        let total: u64 = entries.iter().map(|e| e.size).sum();
        if total <= self.config.trigger_bytes() {
            return Ok(None);
        }

        info!(
            total_bytes = total,
            budget_bytes = self.config.budget_bytes,
            entries = entries.len(),
            policy = ?self.config.policy,
            "Cache over budget, evicting"
        );

        let entry_count = entries.len();
        let keys: Vec<ContentKey> = entries.iter().map(|e| e.key.clone()).collect();
        let popularity = self.popularity.snapshot().await;
        let candidates = rank(entries, &popularity);

        let quota = match self.config.policy {
            EvictionPolicy::Budget => usize::MAX,
            EvictionPolicy::Fraction => {
                (entry_count * self.config.fraction_pct as usize / 100).max(1)
            }
        };

        let mut report = EvictionReport::default();
        let mut remaining = total;

        for candidate in candidates {
            let done = match self.config.policy {
                EvictionPolicy::Budget => remaining <= self.config.budget_bytes,
                EvictionPolicy::Fraction => report.removed.len() >= quota,
            };
            if done {
                break;
            }

            let key = &candidate.entry.key;
            if self.store.active_readers(key) > 0 {
                debug!(key = %key, "Skipping entry with open readers");
                report.skipped_busy += 1;
                continue;
            }

            match self.store.delete(key).await {
                Ok(true) => {
                    debug!(
                        key = %key,
                        bytes = candidate.entry.size,
                        views = candidate.views,
                        "Evicted entry"
                    );
                    remaining = remaining.saturating_sub(candidate.entry.size);
                    report.bytes_freed += candidate.entry.size;
                    report.removed.push(key.clone());
                }
                // Already gone
                Ok(false) => {
                    remaining = remaining.saturating_sub(candidate.entry.size);
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "Failed to evict entry");
                    report.failed += 1;
                }
            }
        }

        if !report.removed.is_empty() {
            let removed: HashSet<&ContentKey> = report.removed.iter().collect();
            let live: HashSet<String> = keys
                .iter()
                .filter(|key| !removed.contains(key))
                .map(|key| key.content_id.clone())
                .collect();
            report.pruned_records = self.prune_popularity(&live).await;
        }

        info!(
            removed = report.removed.len(),
            bytes_freed = report.bytes_freed,
            skipped_busy = report.skipped_busy,
            failed = report.failed,
            pruned_records = report.pruned_records,
            "Eviction finished"
        );
        Ok(Some(report))
    }

    async fn prune_popularity(&self, live: &HashSet<String>) -> usize {
        match Utc::now().checked_sub_signed(self.config.popularity_retention) {
            Some(stale_before) => self.popularity.prune(live, stale_before).await,
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::quality::Quality;
    use chrono::TimeZone;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn at(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, day, 0, 0, 0).unwrap()
    }

    fn entry(id: &str, size: u64) -> CacheEntry {
        CacheEntry {
            key: ContentKey::new(id, Quality::Height(360)),
            path: PathBuf::from(id),
            size,
            modified: at(1),
        }
    }

    fn record(views: u64, day: u32) -> PopularityRecord {
        PopularityRecord {
            views,
            last_access: at(day),
        }
    }

    #[test]
    fn test_rank_by_views_then_recency() {
        let mut popularity = HashMap::new();
        popularity.insert("A".to_string(), record(0, 1));
        popularity.insert("B".to_string(), record(10, 1));
        popularity.insert("C".to_string(), record(0, 20));

        let ranked = rank(
            vec![entry("B", 1), entry("C", 1), entry("A", 1)],
            &popularity,
        );
        let order: Vec<&str> = ranked.iter().map(|c| c.entry.key.content_id.as_str()).collect();
        assert_eq!(order, vec!["A", "C", "B"]);
    }

    #[test]
    fn test_rank_defaults_missing_record_to_mtime() {
        let mut popularity = HashMap::new();
        popularity.insert("seen".to_string(), record(0, 5));

        let ranked = rank(vec![entry("seen", 1), entry("unseen", 1)], &popularity);
        assert_eq!(ranked[0].entry.key.content_id, "unseen");
        assert_eq!(ranked[0].views, 0);
        assert_eq!(ranked[0].last_access, at(1));
    }

    #[test]
    fn test_trigger_bytes() {
        let config = EvictionConfig {
            budget_bytes: 100,
            threshold_bytes: 20,
            ..Default::default()
        };
        assert_eq!(config.trigger_bytes(), 120);
    }

    struct Fixture {
        _dir: TempDir,
        store: Arc<CacheStore>,
        popularity: Arc<PopularityTracker>,
    }

    async fn fixture(sizes: &[(&str, usize, u64)]) -> Fixture {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CacheStore::new(dir.path().join("cache")).await.unwrap());
        let popularity = Arc::new(PopularityTracker::load(dir.path().join("views.json")).await);

        for (id, size, views) in sizes {
            let key = ContentKey::new(id, Quality::Height(360));
            let mut staging = store.create_staging(&key).await.unwrap();
            staging.write_all(&vec![0u8; *size]).await.unwrap();
            store.publish(staging).await.unwrap();
            for _ in 0..*views {
                popularity.increment_at(id, at(1)).await;
            }
        }

        Fixture {
            _dir: dir,
            store,
            popularity,
        }
    }

    fn key(id: &str) -> ContentKey {
        ContentKey::new(id, Quality::Height(360))
    }

    #[tokio::test]
    async fn test_budget_policy_evicts_until_under_budget() {
        let f = fixture(&[("A", 100, 1), ("B", 100, 5), ("C", 100, 3)]).await;
        let evictor = Evictor::new(
            Arc::clone(&f.store),
            Arc::clone(&f.popularity),
            EvictionConfig {
                budget_bytes: 150,
                ..Default::default()
            },
        );

        let report = evictor.run_if_needed().await.unwrap().unwrap();
        assert_eq!(report.removed, vec![key("A"), key("C")]);
        assert_eq!(report.bytes_freed, 200);
        assert!(f.store.exists(&key("B")).await);
        assert!(f.store.total_size().await.unwrap() <= 150);

        // Under budget now
        assert!(evictor.run_if_needed().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_run_prunes_stale_records_of_evicted_content() {
        let f = fixture(&[("A", 100, 1), ("B", 100, 5), ("C", 100, 3)]).await;
        // Recent view of content that was never cached
        f.popularity.increment("fresh").await;

        let evictor = Evictor::new(
            Arc::clone(&f.store),
            Arc::clone(&f.popularity),
            EvictionConfig {
                budget_bytes: 150,
                ..Default::default()
            },
        );

        let report = evictor.run_if_needed().await.unwrap().unwrap();
        assert_eq!(report.removed, vec![key("A"), key("C")]);
        assert_eq!(report.pruned_records, 2);

        let records = f.popularity.snapshot().await;
        assert!(!records.contains_key("A"));
        assert!(!records.contains_key("C"));
        assert!(records.contains_key("B"));
        assert!(records.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_under_trigger_is_noop() {
        let f = fixture(&[("A", 100, 0), ("B", 100, 0)]).await;
        let evictor = Evictor::new(
            Arc::clone(&f.store),
            Arc::clone(&f.popularity),
            EvictionConfig {
                budget_bytes: 150,
                threshold_bytes: 100,
                ..Default::default()
            },
        );
        assert!(evictor.run_if_needed().await.unwrap().is_none());
        assert_eq!(f.store.list_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_fraction_policy_removes_at_least_one() {
        let f = fixture(&[("A", 100, 2), ("B", 100, 1), ("C", 100, 3)]).await;
        let evictor = Evictor::new(
            Arc::clone(&f.store),
            Arc::clone(&f.popularity),
            EvictionConfig {
                budget_bytes: 10,
                policy: EvictionPolicy::Fraction,
                fraction_pct: 10,
                ..Default::default()
            },
        );

        let report = evictor.run_if_needed().await.unwrap().unwrap();
        assert_eq!(report.removed, vec![key("B")]);
        assert_eq!(f.store.list_entries().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_busy_entries_are_skipped() {
        let f = fixture(&[("A", 100, 0), ("B", 100, 1)]).await;
        let evictor = Evictor::new(
            Arc::clone(&f.store),
            Arc::clone(&f.popularity),
            EvictionConfig {
                budget_bytes: 100,
                ..Default::default()
            },
        );

        let reader = f.store.open_for_read(&key("A")).await.unwrap().unwrap();
        let report = evictor.run_if_needed().await.unwrap().unwrap();
        assert_eq!(report.skipped_busy, 1);
        assert_eq!(report.removed, vec![key("B")]);
        assert!(f.store.exists(&key("A")).await);
        drop(reader);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_noop() {
        let f = fixture(&[("A", 100, 0)]).await;
        let evictor = Evictor::new(
            Arc::clone(&f.store),
            Arc::clone(&f.popularity),
            EvictionConfig {
                budget_bytes: 10,
                ..Default::default()
            },
        );

        let _held = evictor.running.lock().await;
        assert!(evictor.run_if_needed().await.unwrap().is_none());
        assert!(f.store.exists(&key("A")).await);
    }
}
