//! Error types for media-relay
//!
//! One enum for every failure a delivery can surface, with a mapping to
//! HTTP status codes.

use hyper::StatusCode;

/// Main error type for relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Resolver answered, but has no rendition for this content
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resolver could not be reached or produced garbage
    #[error("Resolution failed: {0}")]
    Resolution(String),

    /// Muxer exited non-zero or produced no bytes
    #[error("Mux failed: {0}")]
    Mux(String),

    /// Upstream byte source failed mid-transfer or returned an error status
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Disk full, permissions, rename failure while filling the cache
    #[error("Cache I/O error: {0}")]
    CacheIo(String),

    #[error("Range not satisfiable for {size} bytes")]
    RangeNotSatisfiable { size: u64 },

    #[error("Method not allowed")]
    MethodNotAllowed,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Resolution(_) => StatusCode::BAD_GATEWAY,
            Self::Mux(_) => StatusCode::BAD_GATEWAY,
            Self::Upstream(_) => StatusCode::BAD_GATEWAY,
            Self::CacheIo(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short label used as the `error` field of JSON error bodies
    pub fn label(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "Bad Request",
            Self::NotFound(_) => "Not Found",
            Self::Resolution(_) => "Resolution Failed",
            Self::Mux(_) => "Mux Failed",
            Self::Upstream(_) => "Upstream Error",
            Self::CacheIo(_) => "Cache Error",
            Self::RangeNotSatisfiable { .. } => "Range Not Satisfiable",
            Self::MethodNotAllowed => "Method Not Allowed",
            Self::Config(_) => "Configuration Error",
            Self::Internal(_) => "Internal Server Error",
        }
    }

    /// Whether a different resolver configuration might succeed
    pub fn is_retryable_resolution(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::Resolution(_))
    }
}

// Implement From conversions for common error types

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Resolution(format!("JSON error: {}", err))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Upstream(err.to_string())
    }
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(RelayError::NotFound("x".into()).status_code(), StatusCode::NOT_FOUND);
        assert_eq!(RelayError::Mux("exit 1".into()).status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            RelayError::RangeNotSatisfiable { size: 10 }.status_code(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
    }

    #[test]
    fn test_retryable_resolution() {
        assert!(RelayError::NotFound("abc".into()).is_retryable_resolution());
        assert!(RelayError::Resolution("timeout".into()).is_retryable_resolution());
        assert!(!RelayError::Mux("boom".into()).is_retryable_resolution());
    }

    #[test]
    fn test_io_error_is_internal() {
        let err: RelayError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
