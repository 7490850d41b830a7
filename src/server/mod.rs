//! HTTP server

pub mod http;

pub use http::{error_response, run, serve, to_boxed, AppState};
