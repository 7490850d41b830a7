//! Combined streams proxied from a local upstream

mod common;

use common::{combined, key, payload, Harness, Upstream};
use http_body_util::BodyExt;
use hyper::{Method, StatusCode};

use media_relay::delivery::{DeliveryPath, MediaRequest};
use media_relay::RelayError;

#[tokio::test]
async fn test_combined_stream_fills_cache() {
    let data = payload(20_000);
    let upstream = Upstream::start(data.clone()).await;
    let h = Harness::new(combined(&upstream.url("/video.mp4")), "exit 1").await;

    let delivery = h
        .service
        .deliver(MediaRequest::get("abc", Some("720p")))
        .await
        .unwrap();
    assert_eq!(delivery.path, DeliveryPath::Fill);
    assert_eq!(delivery.status, StatusCode::OK);
    assert_eq!(delivery.content_length, Some(20_000));

    let bytes = delivery.body.collect().await.unwrap().to_bytes();
    assert_eq!(bytes, data);
    assert!(delivery.completion.unwrap().await.unwrap().published);

    let delivery = h
        .service
        .deliver(MediaRequest::get("abc", Some("720")))
        .await
        .unwrap();
    assert_eq!(delivery.path, DeliveryPath::Cached);
    let bytes = delivery.body.collect().await.unwrap().to_bytes();
    assert_eq!(bytes, data);

    assert_eq!(upstream.hits(), 1);
    assert_eq!(upstream.ranges(), vec![None]);
    assert_eq!(h.muxer.spawns(), 0);
}

#[tokio::test]
async fn test_partial_range_is_forwarded_without_caching() {
    let data = payload(5000);
    let upstream = Upstream::start(data.clone()).await;
    let h = Harness::new(combined(&upstream.url("/video.mp4")), "exit 1").await;

    let delivery = h
        .service
        .deliver(MediaRequest::get("abc", Some("720")).with_range("bytes=10-19"))
        .await
        .unwrap();
    assert_eq!(delivery.path, DeliveryPath::Passthrough);
    assert_eq!(delivery.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(delivery.content_range.as_deref(), Some("bytes 10-19/5000"));

    let bytes = delivery.body.collect().await.unwrap().to_bytes();
    assert_eq!(bytes, data.slice(10..20));
    assert!(!delivery.completion.unwrap().await.unwrap().published);

    assert_eq!(upstream.ranges(), vec![Some("bytes=10-19".to_string())]);
    assert!(!h.store().exists(&key("abc", 720)).await);
    assert!(h.service.inflight().is_empty());
}

#[tokio::test]
async fn test_open_range_from_zero_still_fills() {
    let data = payload(3000);
    let upstream = Upstream::start(data.clone()).await;
    let h = Harness::new(combined(&upstream.url("/video.mp4")), "exit 1").await;

    let delivery = h
        .service
        .deliver(MediaRequest::get("abc", Some("720")).with_range("bytes=0-"))
        .await
        .unwrap();
    assert_eq!(delivery.path, DeliveryPath::Fill);
    delivery.body.collect().await.unwrap();
    assert!(delivery.completion.unwrap().await.unwrap().published);

    assert_eq!(h.store().size(&key("abc", 720)).await, Some(3000));
}

#[tokio::test]
async fn test_upstream_error_status_is_bad_gateway() {
    let upstream = Upstream::start(payload(10)).await;
    let h = Harness::new(combined(&upstream.url("/missing")), "exit 1").await;

    let err = h
        .service
        .deliver(MediaRequest::get("abc", None))
        .await
        .unwrap_err();
    assert!(matches!(err, RelayError::Upstream(_)));
    assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    assert!(h.cache_files().is_empty());
}

#[tokio::test]
async fn test_head_miss_describes_upstream_without_caching() {
    let upstream = Upstream::start(payload(4321)).await;
    let h = Harness::new(combined(&upstream.url("/video.mp4")), "exit 1").await;

    let delivery = h
        .service
        .deliver(MediaRequest::get("abc", Some("720")).head())
        .await
        .unwrap();
    assert_eq!(delivery.status, StatusCode::OK);
    assert_eq!(delivery.content_length, Some(4321));
    assert_eq!(delivery.content_type, "video/mp4");
    assert!(delivery.completion.is_none());
    assert!(!h.store().exists(&key("abc", 720)).await);

    // Described from upstream headers only
    assert_eq!(upstream.methods(), vec![Method::HEAD]);
}

#[tokio::test]
async fn test_ranged_head_miss_reports_partial_length() {
    let upstream = Upstream::start(payload(4321)).await;
    let h = Harness::new(combined(&upstream.url("/video.mp4")), "exit 1").await;

    let delivery = h
        .service
        .deliver(MediaRequest::get("abc", Some("720")).with_range("bytes=0-99").head())
        .await
        .unwrap();
    assert_eq!(delivery.status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(delivery.content_length, Some(100));
    assert_eq!(delivery.content_range.as_deref(), Some("bytes 0-99/4321"));
    assert_eq!(upstream.methods(), vec![Method::HEAD]);
    assert_eq!(upstream.ranges(), vec![Some("bytes=0-99".to_string())]);
}
