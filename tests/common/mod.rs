//! Shared fixtures for integration tests: counting fakes for the resolver
//! and muxer seams, a service builder over a temp dir and a tiny upstream
//! HTTP server with Range support.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::process::Command;

use media_relay::cache::{CacheStore, ContentKey, EvictionConfig, PopularityTracker};
use media_relay::delivery::range::{parse_range, RangeRequest};
use media_relay::delivery::{
    DeliveryConfig, DeliveryService, MuxMode, MuxProcess, Muxer, Quality, Resolution, Resolver,
    StreamKind, StreamRef,
};
use media_relay::Result;

// ============================================================================
// Fakes
// ============================================================================

/// Resolver returning a fixed answer and counting calls
pub struct CountingResolver {
    resolution: Resolution,
    calls: AtomicUsize,
}

impl CountingResolver {
    pub fn new(resolution: Resolution) -> Arc<Self> {
        Arc::new(Self {
            resolution,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Resolver for CountingResolver {
    fn name(&self) -> &str {
        "counting"
    }

    async fn resolve(&self, _content_id: &str, _quality: Quality) -> Result<Resolution> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.resolution.clone())
    }
}

/// Muxer running a shell script in place of ffmpeg
pub struct ScriptMuxer {
    script: String,
    spawns: AtomicUsize,
}

impl ScriptMuxer {
    pub fn new(script: &str) -> Arc<Self> {
        Arc::new(Self {
            script: script.to_string(),
            spawns: AtomicUsize::new(0),
        })
    }

    pub fn spawns(&self) -> usize {
        self.spawns.load(Ordering::SeqCst)
    }
}

impl Muxer for ScriptMuxer {
    fn name(&self) -> &str {
        "script"
    }

    fn spawn(&self, _inputs: &[StreamRef], _mode: MuxMode) -> Result<MuxProcess> {
        self.spawns.fetch_add(1, Ordering::SeqCst);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&self.script);
        MuxProcess::spawn(cmd, "script")
    }
}

pub fn split() -> Resolution {
    Resolution::Split {
        video: StreamRef::new("https://cdn.invalid/video", StreamKind::VideoOnly),
        audio: StreamRef::new("https://cdn.invalid/audio", StreamKind::AudioOnly),
    }
}

pub fn combined(url: &str) -> Resolution {
    Resolution::Combined(StreamRef::new(url, StreamKind::Combined))
}

pub fn key(content_id: &str, quality: u32) -> ContentKey {
    ContentKey::new(content_id, Quality::Height(quality))
}

// ============================================================================
// Service
// ============================================================================

pub struct Harness {
    pub dir: TempDir,
    pub service: Arc<DeliveryService>,
    pub resolver: Arc<CountingResolver>,
    pub muxer: Arc<ScriptMuxer>,
}

impl Harness {
    pub async fn new(resolution: Resolution, script: &str) -> Self {
        Self::with_eviction(resolution, script, EvictionConfig::default()).await
    }

    pub async fn with_eviction(
        resolution: Resolution,
        script: &str,
        eviction: EvictionConfig,
    ) -> Self {
        let dir = TempDir::new().unwrap();
        let resolver = CountingResolver::new(resolution);
        let muxer = ScriptMuxer::new(script);

        let store = Arc::new(CacheStore::new(dir.path().join("cache")).await.unwrap());
        let popularity = Arc::new(PopularityTracker::load(dir.path().join("views.json")).await);
        let service = DeliveryService::new(
            store,
            popularity,
            vec![Arc::clone(&resolver) as Arc<dyn Resolver>],
            Arc::clone(&muxer) as Arc<dyn Muxer>,
            DeliveryConfig {
                chunk_size: 4096,
                ..Default::default()
            },
        )
        .unwrap()
        .with_eviction(eviction);

        Self {
            dir,
            service: Arc::new(service),
            resolver,
            muxer,
        }
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        self.service.store()
    }

    /// Publish `bytes` directly as a cache entry
    pub async fn seed(&self, key: &ContentKey, bytes: &[u8]) {
        let mut staging = self.store().create_staging(key).await.unwrap();
        staging.write_all(bytes).await.unwrap();
        self.store().publish(staging).await.unwrap();
    }

    /// Names of every file in the cache directory
    pub fn cache_files(&self) -> Vec<String> {
        std::fs::read_dir(self.store().root())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect()
    }
}

/// Poll until `key` is published or two seconds pass
pub async fn wait_for_entry(store: &CacheStore, key: &ContentKey) -> bool {
    for _ in 0..100 {
        if store.exists(key).await {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    false
}

// ============================================================================
// Upstream
// ============================================================================

/// Static file server standing in for a media CDN
pub struct Upstream {
    pub addr: SocketAddr,
    hits: Arc<AtomicUsize>,
    ranges: Arc<Mutex<Vec<Option<String>>>>,
    methods: Arc<Mutex<Vec<Method>>>,
}

impl Upstream {
    /// Serve `body` at every path; `/missing` answers 404. HEAD answers
    /// carry the length without the bytes.
    pub async fn start(body: Bytes) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let methods = Arc::new(Mutex::new(Vec::new()));

        let server_hits = Arc::clone(&hits);
        let server_ranges = Arc::clone(&ranges);
        let server_methods = Arc::clone(&methods);
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                let body = body.clone();
                let hits = Arc::clone(&server_hits);
                let ranges = Arc::clone(&server_ranges);
                let methods = Arc::clone(&server_methods);
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let range = req
                            .headers()
                            .get(header::RANGE)
                            .and_then(|v| v.to_str().ok())
                            .map(str::to_string);
                        ranges.lock().unwrap().push(range.clone());
                        methods.lock().unwrap().push(req.method().clone());
                        let mut response = respond(req.uri().path(), range.as_deref(), &body);
                        if req.method() == Method::HEAD {
                            *response.body_mut() = Full::new(Bytes::new());
                        }
                        async move { Ok::<_, Infallible>(response) }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });

        Self {
            addr,
            hits,
            ranges,
            methods,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    pub fn ranges(&self) -> Vec<Option<String>> {
        self.ranges.lock().unwrap().clone()
    }

    pub fn methods(&self) -> Vec<Method> {
        self.methods.lock().unwrap().clone()
    }
}

fn respond(path: &str, range: Option<&str>, body: &Bytes) -> Response<Full<Bytes>> {
    if path == "/missing" {
        return Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new()))
            .unwrap();
    }

    let builder = Response::builder()
        .header(header::CONTENT_TYPE, "video/mp4")
        .header(header::ACCEPT_RANGES, "bytes");

    match parse_range(range, body.len() as u64) {
        RangeRequest::Full => builder
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, body.len())
            .body(Full::new(body.clone()))
            .unwrap(),
        RangeRequest::Partial(r) => builder
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, r.content_range())
            .header(header::CONTENT_LENGTH, r.len())
            .body(Full::new(body.slice(r.start as usize..=r.end as usize)))
            .unwrap(),
        RangeRequest::Unsatisfiable => builder
            .status(StatusCode::RANGE_NOT_SATISFIABLE)
            .header(header::CONTENT_RANGE, format!("bytes */{}", body.len()))
            .body(Full::new(Bytes::new()))
            .unwrap(),
    }
}

/// Deterministic test payload
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}
