//! media-relay - caching media delivery service
//!
//! Serves `GET /media?content_id=<id>&quality=<token>`. The first request for
//! a rendition resolves it to upstream streams, proxies or muxes them to the
//! client and tees the bytes into a disk cache; later requests are served from
//! disk with Range support. Least popular renditions are evicted when the
//! cache outgrows its budget.
//!
//! ## Modules
//!
//! - **cache**: on-disk store with atomic publish, fill claims, view counts,
//!   admission and eviction
//! - **delivery**: quality parsing, resolvers, muxers, the tee pipeline and
//!   the orchestrator tying them together
//! - **server** / **routes**: the hyper HTTP surface

pub mod cache;
pub mod config;
pub mod delivery;
pub mod routes;
pub mod server;
pub mod types;

pub use config::Args;
pub use delivery::DeliveryService;
pub use server::{run, AppState};
pub use types::{RelayError, Result};
