//! Rendition cache
//!
//! - [`store`]: on-disk entries with atomic publish
//! - [`inflight`]: one producer per cache slot
//! - [`popularity`]: persisted view counters
//! - [`admission`]: request-frequency gate for caching
//! - [`eviction`]: popularity-ranked space reclamation

pub mod admission;
pub mod eviction;
pub mod inflight;
pub mod keys;
pub mod popularity;
pub mod store;

pub use admission::AdmissionGate;
pub use eviction::{EvictionConfig, EvictionPolicy, EvictionReport, Evictor};
pub use inflight::{InFlightGuard, InFlightRegistry};
pub use keys::ContentKey;
pub use popularity::{PopularityRecord, PopularityTracker};
pub use store::{CacheEntry, CacheStore, CachedReader, StagingFile, StoreStats};
