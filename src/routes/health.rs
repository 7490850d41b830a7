//! Health check endpoint
//!
//! `/health` and `/healthz` return 200 while the process runs. The body
//! carries cache occupancy; `status` drops to `degraded` when the cache
//! directory cannot be listed.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;
use tracing::warn;

use crate::delivery::ServiceStats;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    /// True while the service is running
    pub healthy: bool,
    /// `online` or `degraded`
    pub status: &'static str,
    pub version: &'static str,
    /// Uptime in seconds
    pub uptime: u64,
    pub timestamp: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache: Option<ServiceStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

async fn build_health_response(state: &AppState) -> HealthResponse {
    let (cache, error) = match state.service.stats().await {
        Ok(stats) => (Some(stats), None),
        Err(e) => {
            warn!(error = %e, "Cache stats unavailable");
            (None, Some(e.to_string()))
        }
    };

    HealthResponse {
        healthy: true,
        status: if error.is_none() { "online" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        cache,
        error,
    }
}

/// Liveness check (/health, /healthz)
pub async fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let response = build_health_response(&state).await;

    let body = serde_json::to_string(&response)
        .unwrap_or_else(|_| r#"{"healthy":true,"error":"Serialization failed"}"#.to_string());

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)))
        .unwrap()
}
