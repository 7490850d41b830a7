//! HTTP routes for media-relay

pub mod health;
pub mod media;

pub use health::{health_check, HealthResponse};
pub use media::{delivery_response, handle_invalidate, handle_media, MediaQuery};
