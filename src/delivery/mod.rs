//! Media delivery pipeline
//!
//! Request → quality normalization → cache lookup → resolve → proxy or mux
//! → tee into the cache.

pub mod body;
pub mod muxer;
pub mod orchestrator;
pub mod quality;
pub mod range;
pub mod resolver;
pub mod source;
pub mod tee;

pub use body::{ChannelBody, ResponseBody};
pub use muxer::{FfmpegMuxer, MuxMode, Muxer};
pub use orchestrator::{
    Delivery, DeliveryConfig, DeliveryPath, DeliveryService, MediaRequest, ServiceStats,
};
pub use quality::Quality;
pub use resolver::{Resolution, Resolver, StreamKind, StreamRef, YtDlpConfig, YtDlpResolver};
pub use source::{ByteSource, MuxProcess};
pub use tee::{TeeOutcome, TeeReport};
