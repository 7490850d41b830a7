//! Media delivery routes
//!
//! - `GET /media?content_id=<id>&quality=<token>` - stream a rendition
//! - `HEAD /media?...` - same headers, no body
//! - `DELETE /media?...` - drop a cached rendition
//!
//! `Range: bytes=start-end` is honored for cached renditions and forwarded
//! upstream for combined streams that are not being cached.
//!
//! ```bash
//! curl -H "Range: bytes=0-1023" "http://localhost:8080/media?content_id=abc&quality=720p"
//! ```

use bytes::Bytes;
use http_body_util::Full;
use hyper::{header, Request, Response, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use crate::delivery::body::ResponseBody;
use crate::delivery::{Delivery, MediaRequest};
use crate::server::{error_response, to_boxed, AppState};
use crate::types::{RelayError, Result};

/// Header reporting how a response was produced
pub const X_CACHE: &str = "x-cache";

/// Query string of `/media`
#[derive(Debug, Default, Deserialize)]
pub struct MediaQuery {
    pub content_id: Option<String>,
    pub quality: Option<String>,
}

impl MediaQuery {
    pub fn parse(query: Option<&str>) -> Result<Self> {
        serde_urlencoded::from_str(query.unwrap_or(""))
            .map_err(|e| RelayError::BadRequest(format!("invalid query string: {}", e)))
    }

    /// Non-empty content id or `BadRequest`
    pub fn content_id(&self) -> Result<&str> {
        match self.content_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(RelayError::BadRequest("content_id is required".into())),
        }
    }
}

/// Handle `GET` and `HEAD` on `/media`
pub async fn handle_media<B>(state: Arc<AppState>, req: Request<B>) -> Response<ResponseBody> {
    let head = req.method() == hyper::Method::HEAD;

    let query = match MediaQuery::parse(req.uri().query()) {
        Ok(q) => q,
        Err(e) => return error_response(e),
    };
    let content_id = match query.content_id() {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };

    let mut request = MediaRequest::get(content_id, query.quality.as_deref());
    if let Some(range) = req
        .headers()
        .get(header::RANGE)
        .and_then(|v| v.to_str().ok())
    {
        request = request.with_range(range);
    }
    if head {
        request = request.head();
    }

    match state.service.deliver(request).await {
        Ok(delivery) => delivery_response(delivery),
        Err(e) => {
            debug!(content_id, error = %e, "Delivery failed");
            error_response(e)
        }
    }
}

/// Handle `DELETE` on `/media`
pub async fn handle_invalidate<B>(
    state: Arc<AppState>,
    req: Request<B>,
) -> Response<ResponseBody> {
    let query = match MediaQuery::parse(req.uri().query()) {
        Ok(q) => q,
        Err(e) => return error_response(e),
    };
    let content_id = match query.content_id() {
        Ok(id) => id,
        Err(e) => return error_response(e),
    };

    match state
        .service
        .invalidate(content_id, query.quality.as_deref())
        .await
    {
        Ok(removed) => {
            let key = state.service.key_for(content_id, query.quality.as_deref());
            let body = serde_json::json!({
                "content_id": key.content_id,
                "quality": key.quality,
                "removed": removed,
            });
            let status = if removed {
                StatusCode::OK
            } else {
                StatusCode::NOT_FOUND
            };
            to_boxed(
                Response::builder()
                    .status(status)
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Full::new(Bytes::from(body.to_string())))
                    .unwrap(),
            )
        }
        Err(e) => error_response(e),
    }
}

/// Turn a [`Delivery`] into a response. Dropping the completion handle
/// detaches the fill; it keeps running to publish or clean up.
pub fn delivery_response(delivery: Delivery) -> Response<ResponseBody> {
    let mut builder = Response::builder()
        .status(delivery.status)
        .header(header::CONTENT_TYPE, delivery.content_type.as_str())
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, "public, max-age=3600")
        .header(X_CACHE, delivery.path.cache_status());

    if let Some(len) = delivery.content_length {
        builder = builder.header(header::CONTENT_LENGTH, len);
    }
    if let Some(range) = &delivery.content_range {
        builder = builder.header(header::CONTENT_RANGE, range.as_str());
    }

    builder.body(delivery.body).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ContentKey;
    use crate::delivery::{body, DeliveryPath, Quality};

    #[test]
    fn test_query_parsing() {
        let q = MediaQuery::parse(Some("content_id=abc&quality=720p")).unwrap();
        assert_eq!(q.content_id().unwrap(), "abc");
        assert_eq!(q.quality.as_deref(), Some("720p"));

        let q = MediaQuery::parse(Some("content_id=a%2Fb")).unwrap();
        assert_eq!(q.content_id().unwrap(), "a/b");
        assert!(q.quality.is_none());
    }

    #[test]
    fn test_missing_content_id() {
        let q = MediaQuery::parse(None).unwrap();
        assert!(matches!(q.content_id(), Err(RelayError::BadRequest(_))));

        let q = MediaQuery::parse(Some("content_id=&quality=hd")).unwrap();
        assert!(matches!(q.content_id(), Err(RelayError::BadRequest(_))));
    }

    #[test]
    fn test_delivery_headers() {
        let delivery = Delivery {
            key: ContentKey::new("abc", Quality::Height(360)),
            status: StatusCode::PARTIAL_CONTENT,
            content_type: "video/mp4".into(),
            content_length: Some(100),
            content_range: Some("bytes 100-199/1000".into()),
            path: DeliveryPath::Cached,
            body: body::empty(),
            completion: None,
        };

        let response = delivery_response(delivery);
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_LENGTH], "100");
        assert_eq!(headers[header::CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(headers[header::ACCEPT_RANGES], "bytes");
        assert_eq!(headers[X_CACHE], "HIT");
    }

    #[test]
    fn test_streamed_delivery_has_no_length() {
        let delivery = Delivery {
            key: ContentKey::new("abc", Quality::Standard),
            status: StatusCode::OK,
            content_type: "video/mp4".into(),
            content_length: None,
            content_range: None,
            path: DeliveryPath::Fill,
            body: body::empty(),
            completion: None,
        };

        let response = delivery_response(delivery);
        assert!(!response.headers().contains_key(header::CONTENT_LENGTH));
        assert_eq!(response.headers()[X_CACHE], "MISS");
    }
}
