//! Shared types

pub mod error;

pub use error::{RelayError, Result};
