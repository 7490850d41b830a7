//! HTTP server
//!
//! Accept loop and request routing on hyper's http1 server. Every connection
//! runs on its own task; media bodies are streamed from their producer tasks.

use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::delivery::body::ResponseBody;
use crate::delivery::range;
use crate::delivery::DeliveryService;
use crate::routes;
use crate::types::{RelayError, Result};

/// Shared application state
pub struct AppState {
    pub listen: SocketAddr,
    pub service: Arc<DeliveryService>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(listen: SocketAddr, service: Arc<DeliveryService>) -> Self {
        Self {
            listen,
            service,
            started_at: Instant::now(),
        }
    }
}

/// Bind `state.listen` and serve until the process exits
pub async fn run(state: Arc<AppState>) -> Result<()> {
    let listener = TcpListener::bind(state.listen).await?;
    info!("media-relay listening on {}", listener.local_addr()?);
    serve(listener, state).await
}

/// Serve connections from an already bound listener
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!("Connection from {} ended: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

async fn handle_request(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<Incoming>,
) -> std::result::Result<Response<ResponseBody>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/media") | (Method::HEAD, "/media") => {
            routes::handle_media(Arc::clone(&state), req).await
        }

        (Method::DELETE, "/media") => routes::handle_invalidate(Arc::clone(&state), req).await,

        (_, "/media") => error_response(RelayError::MethodNotAllowed),

        (Method::GET, "/health") | (Method::GET, "/healthz") => {
            to_boxed(routes::health_check(Arc::clone(&state)).await)
        }

        _ => to_boxed(not_found_response(&path)),
    };

    Ok(response)
}

// ============================================================================
// Helpers
// ============================================================================

/// Convert a `Full` body response into the streaming body type
pub fn to_boxed(response: Response<Full<Bytes>>) -> Response<ResponseBody> {
    use http_body_util::BodyExt;
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// JSON error response for a [`RelayError`]
pub fn error_response(err: RelayError) -> Response<ResponseBody> {
    let status = err.status_code();
    let body = serde_json::json!({
        "error": err.label(),
        "message": err.to_string(),
    });

    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json");

    match &err {
        RelayError::RangeNotSatisfiable { size } => {
            builder = builder
                .header(header::CONTENT_RANGE, range::unsatisfiable_content_range(*size))
                .header(header::ACCEPT_RANGES, "bytes");
        }
        RelayError::MethodNotAllowed => {
            builder = builder.header(header::ALLOW, "GET, HEAD, DELETE");
        }
        _ => {}
    }

    to_boxed(
        builder
            .body(Full::new(Bytes::from(body.to_string())))
            .unwrap(),
    )
}

/// Create a 404 Not Found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
        "hint": "Use GET /media?content_id=<id>&quality=<quality>"
    });

    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[tokio::test]
    async fn test_error_response_shape() {
        let response = error_response(RelayError::NotFound("abc".into()));
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["error"], "Not Found");
        assert!(json["message"].as_str().unwrap().contains("abc"));
    }

    #[test]
    fn test_range_error_carries_content_range() {
        let response = error_response(RelayError::RangeNotSatisfiable { size: 1000 });
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");
    }

    #[test]
    fn test_method_not_allowed_lists_methods() {
        let response = error_response(RelayError::MethodNotAllowed);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert!(response.headers().contains_key(header::ALLOW));
    }
}
