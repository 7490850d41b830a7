//! Delivery orchestration
//!
//! [`DeliveryService::deliver`] runs one request through the cache:
//!
//! ```text
//! count view ─► cached? ──yes──► serve file (Range aware)
//!                  │no
//!                  ▼
//!            claim slot ──lost──► resolve ─► stream without caching
//!                  │won
//!                  ▼
//!     re-check cache ─► resolve ─► combined:  proxy  ─┐
//!                                  split:     mux    ─┼─► tee ─► publish
//!                                  segmented: transcode┘
//!                                                          │
//!                                                   eviction check
//! ```
//!
//! The claim guard travels with the fill into the tee task, so the slot is
//! released when the fill ends however it ends.

use std::sync::Arc;
use std::time::Duration;

use hyper::StatusCode;
use reqwest::Method;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::body::{self, cached_file_body, ChannelBody, ResponseBody};
use super::muxer::{MuxMode, Muxer, DEFAULT_USER_AGENT};
use super::quality::Quality;
use super::range::{covers_whole_body, parse_range, RangeRequest};
use super::resolver::{resolution_kind, Resolution, Resolver, StreamRef};
use super::source::ByteSource;
use super::tee::{spawn_tee, Fill, TeeOutcome, TeeReport};
use crate::cache::{
    AdmissionGate, CacheStore, ContentKey, EvictionConfig, Evictor, InFlightGuard,
    InFlightRegistry, PopularityTracker,
};
use crate::types::{RelayError, Result};

/// Content type of cached and muxed renditions
pub const MEDIA_CONTENT_TYPE: &str = "video/mp4";

// ============================================================================
// Configuration
// ============================================================================

/// Delivery settings
#[derive(Debug, Clone)]
pub struct DeliveryConfig {
    /// Tee chunk size in bytes (default: 64 KiB)
    pub chunk_size: usize,
    /// Quality used when the request has none
    pub default_quality: Option<String>,
    /// Upstream connect timeout (default: 30s)
    pub request_timeout: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            chunk_size: 64 * 1024,
            default_quality: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Request / response
// ============================================================================

/// One media request
#[derive(Debug, Clone, Default)]
pub struct MediaRequest {
    pub content_id: String,
    /// Raw quality as supplied by the client
    pub quality: Option<String>,
    /// Raw `Range` header
    pub range: Option<String>,
    /// HEAD request: headers only
    pub head: bool,
}

impl MediaRequest {
    pub fn get(content_id: &str, quality: Option<&str>) -> Self {
        Self {
            content_id: content_id.to_string(),
            quality: quality.map(str::to_string),
            ..Default::default()
        }
    }

    pub fn with_range(mut self, range: &str) -> Self {
        self.range = Some(range.to_string());
        self
    }

    pub fn head(mut self) -> Self {
        self.head = true;
        self
    }
}

/// Which path served a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    /// Served from the cache
    Cached,
    /// Streamed while filling the cache
    Fill,
    /// Streamed without caching
    Passthrough,
}

impl DeliveryPath {
    /// Value of the `X-Cache` response header
    pub fn cache_status(&self) -> &'static str {
        match self {
            DeliveryPath::Cached => "HIT",
            DeliveryPath::Fill => "MISS",
            DeliveryPath::Passthrough => "BYPASS",
        }
    }
}

/// Everything the HTTP layer needs to answer a request
pub struct Delivery {
    pub key: ContentKey,
    pub status: StatusCode,
    pub content_type: String,
    pub content_length: Option<u64>,
    pub content_range: Option<String>,
    pub path: DeliveryPath,
    pub body: ResponseBody,
    /// Resolves when the stream behind `body` has ended
    pub completion: Option<JoinHandle<TeeReport>>,
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("key", &self.key)
            .field("status", &self.status)
            .field("content_length", &self.content_length)
            .field("content_range", &self.content_range)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Cache statistics for the health endpoint
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct ServiceStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub in_flight: usize,
}

// ============================================================================
// DeliveryService
// ============================================================================

/// Per-request state machine over the cache, resolvers and muxer
pub struct DeliveryService {
    store: Arc<CacheStore>,
    popularity: Arc<PopularityTracker>,
    inflight: Arc<InFlightRegistry>,
    admission: AdmissionGate,
    evictor: Arc<Evictor>,
    resolvers: Vec<Arc<dyn Resolver>>,
    muxer: Arc<dyn Muxer>,
    http: reqwest::Client,
    config: DeliveryConfig,
}

impl DeliveryService {
    /// Create a service. Resolvers are tried in the given order.
    pub fn new(
        store: Arc<CacheStore>,
        popularity: Arc<PopularityTracker>,
        resolvers: Vec<Arc<dyn Resolver>>,
        muxer: Arc<dyn Muxer>,
        config: DeliveryConfig,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()
            .map_err(|e| RelayError::Config(format!("HTTP client: {}", e)))?;

        let evictor = Arc::new(Evictor::new(
            Arc::clone(&store),
            Arc::clone(&popularity),
            EvictionConfig::default(),
        ));

        Ok(Self {
            store,
            popularity,
            inflight: Arc::new(InFlightRegistry::new()),
            admission: AdmissionGate::always(),
            evictor,
            resolvers,
            muxer,
            http,
            config,
        })
    }

    pub fn with_eviction(mut self, config: EvictionConfig) -> Self {
        self.evictor = Arc::new(Evictor::new(
            Arc::clone(&self.store),
            Arc::clone(&self.popularity),
            config,
        ));
        self
    }

    pub fn with_admission(mut self, gate: AdmissionGate) -> Self {
        self.admission = gate;
        self
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn popularity(&self) -> &Arc<PopularityTracker> {
        &self.popularity
    }

    pub fn inflight(&self) -> &Arc<InFlightRegistry> {
        &self.inflight
    }

    pub fn evictor(&self) -> &Arc<Evictor> {
        &self.evictor
    }

    /// Cache key for a raw request, applying the default quality
    pub fn key_for(&self, content_id: &str, quality: Option<&str>) -> ContentKey {
        let raw = quality
            .filter(|q| !q.trim().is_empty())
            .or(self.config.default_quality.as_deref())
            .unwrap_or("");
        ContentKey::new(content_id, Quality::parse(raw))
    }

    /// Serve one request
    pub async fn deliver(&self, request: MediaRequest) -> Result<Delivery> {
        if request.content_id.trim().is_empty() {
            return Err(RelayError::BadRequest("content_id is required".into()));
        }

        let key = self.key_for(&request.content_id, request.quality.as_deref());
        self.popularity.increment(&key.content_id).await;
        let admitted = self.admission.record_and_admit(&key.content_id);

        if let Some(delivery) = self.serve_cached(&key, &request).await? {
            return Ok(delivery);
        }

        if request.head {
            return self.describe_miss(&key, &request).await;
        }

        let claim = if admitted {
            self.inflight.claim(&key)
        } else {
            debug!(key = %key, "Not yet admitted for caching");
            None
        };

        if claim.is_some() {
            // A concurrent fill may have published between lookup and claim
            if let Some(delivery) = self.serve_cached(&key, &request).await? {
                return Ok(delivery);
            }
        }

        let resolution = self.resolve(&key).await?;
        debug!(
            key = %key,
            resolution = resolution_kind(&resolution),
            filling = claim.is_some(),
            "Deciding delivery path"
        );

        match resolution {
            Resolution::Combined(stream) => self.proxy(key, stream, &request, claim).await,
            Resolution::Split { video, audio } => {
                self.mux(key, &[video, audio], MuxMode::Mux, claim).await
            }
            Resolution::Segmented(stream) => {
                self.mux(key, &[stream], MuxMode::Transcode, claim).await
            }
            Resolution::NotFound => Err(RelayError::NotFound(key.content_id.clone())),
        }
    }

    /// Remove one cached rendition. Returns whether it existed.
    pub async fn invalidate(&self, content_id: &str, quality: Option<&str>) -> Result<bool> {
        let key = self.key_for(content_id, quality);
        let removed = self.store.delete(&key).await?;
        info!(key = %key, removed, "Invalidated cache entry");
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<ServiceStats> {
        let store = self.store.stats().await?;
        Ok(ServiceStats {
            entries: store.entries,
            total_bytes: store.total_bytes,
            budget_bytes: self.evictor.config().budget_bytes,
            in_flight: self.inflight.len(),
        })
    }

    // ========================================================================
    // Cached path
    // ========================================================================

    async fn serve_cached(
        &self,
        key: &ContentKey,
        request: &MediaRequest,
    ) -> Result<Option<Delivery>> {
        let Some(reader) = self.store.open_for_read(key).await? else {
            return Ok(None);
        };
        let size = reader.size;

        let requested = parse_range(request.range.as_deref(), size);
        let (status, start, len, content_range) = match requested {
            RangeRequest::Full => (StatusCode::OK, 0, size, None),
            RangeRequest::Partial(range) => (
                StatusCode::PARTIAL_CONTENT,
                range.start,
                range.len(),
                Some(range.content_range()),
            ),
            RangeRequest::Unsatisfiable => return Err(RelayError::RangeNotSatisfiable { size }),
        };

        debug!(key = %key, size, start, len, "Serving cached entry");

        let body = if request.head {
            body::empty()
        } else {
            cached_file_body(reader, start, len, self.config.chunk_size).boxed()
        };

        Ok(Some(Delivery {
            key: key.clone(),
            status,
            content_type: MEDIA_CONTENT_TYPE.to_string(),
            content_length: Some(len),
            content_range,
            path: DeliveryPath::Cached,
            body,
            completion: None,
        }))
    }

    // ========================================================================
    // Resolution
    // ========================================================================

    /// Try each resolver in order. `NotFound` and transport failures move on
    /// to the next one.
    async fn resolve(&self, key: &ContentKey) -> Result<Resolution> {
        let quality = key.quality();
        let mut not_found = false;
        let mut last_error = None;

        for resolver in &self.resolvers {
            match resolver.resolve(&key.content_id, quality).await {
                Ok(Resolution::NotFound) => {
                    debug!(resolver = resolver.name(), key = %key, "Resolver found nothing");
                    not_found = true;
                }
                Ok(resolution) => return Ok(resolution),
                Err(e) if e.is_retryable_resolution() => {
                    warn!(
                        resolver = resolver.name(),
                        key = %key,
                        error = %e,
                        "Resolver failed, trying next"
                    );
                    if matches!(e, RelayError::NotFound(_)) {
                        not_found = true;
                    }
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if not_found {
            return Err(RelayError::NotFound(key.content_id.clone()));
        }
        Err(last_error.unwrap_or_else(|| RelayError::Resolution("no resolvers configured".into())))
    }

    /// HEAD on a miss: resolve and describe, stream nothing
    async fn describe_miss(&self, key: &ContentKey, request: &MediaRequest) -> Result<Delivery> {
        let resolution = self.resolve(key).await?;

        let mut delivery = Delivery {
            key: key.clone(),
            status: StatusCode::OK,
            content_type: MEDIA_CONTENT_TYPE.to_string(),
            content_length: None,
            content_range: None,
            path: DeliveryPath::Passthrough,
            body: body::empty(),
            completion: None,
        };

        match resolution {
            Resolution::Combined(stream) => {
                let response = self
                    .fetch(Method::HEAD, &stream, request.range.as_deref())
                    .await?;
                delivery.status = response.status();
                delivery.content_type = content_type_of(&response);
                delivery.content_length = content_length_of(&response);
                delivery.content_range = content_range_of(&response);
            }
            Resolution::Split { .. } | Resolution::Segmented(_) => {}
            Resolution::NotFound => return Err(RelayError::NotFound(key.content_id.clone())),
        }
        Ok(delivery)
    }

    // ========================================================================
    // Streaming paths
    // ========================================================================

    async fn fetch(
        &self,
        method: Method,
        stream: &StreamRef,
        range: Option<&str>,
    ) -> Result<reqwest::Response> {
        let mut request = self.http.request(method, &stream.locator);
        let mut has_user_agent = false;
        for (name, value) in &stream.headers {
            has_user_agent |= name.eq_ignore_ascii_case("user-agent");
            request = request.header(name.as_str(), value.as_str());
        }
        if !has_user_agent {
            request = request.header(reqwest::header::USER_AGENT, DEFAULT_USER_AGENT);
        }
        if let Some(range) = range {
            request = request.header(reqwest::header::RANGE, range);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() && status != StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(RelayError::Upstream(format!("upstream returned {}", status)));
        }
        Ok(response)
    }

    /// Combined stream: proxy it. A fill fetches the whole body and needs a
    /// plain 200; a client asking for a partial range gets that range proxied
    /// without caching.
    async fn proxy(
        &self,
        key: ContentKey,
        stream: StreamRef,
        request: &MediaRequest,
        claim: Option<InFlightGuard>,
    ) -> Result<Delivery> {
        let wants_whole = covers_whole_body(request.range.as_deref());
        let claim = if wants_whole { claim } else { None };
        let range = if claim.is_some() { None } else { request.range.as_deref() };

        let response = self.fetch(Method::GET, &stream, range).await?;
        let status = response.status();
        let content_type = content_type_of(&response);
        let content_range = content_range_of(&response);

        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Delivery {
                key,
                status,
                content_type,
                content_length: Some(0),
                content_range,
                path: DeliveryPath::Passthrough,
                body: body::empty(),
                completion: None,
            });
        }

        let claim = if status == StatusCode::OK { claim } else { None };
        let fill = self.start_fill(&key, claim).await;
        let path = if fill.is_some() {
            DeliveryPath::Fill
        } else {
            DeliveryPath::Passthrough
        };

        let content_length = response.content_length();
        let source = ByteSource::http(response, self.config.chunk_size);

        info!(key = %key, status = %status, path = ?path, "Proxying upstream stream");

        let (body, completion) = self.tee(key.clone(), source, fill, content_length);
        Ok(Delivery {
            key,
            status,
            content_type,
            content_length,
            content_range,
            path,
            body,
            completion: Some(completion),
        })
    }

    /// Split or segmented streams: run the muxer and stream its output. The
    /// output is not seekable, so any `Range` is ignored and the whole stream
    /// is served with 200.
    async fn mux(
        &self,
        key: ContentKey,
        inputs: &[StreamRef],
        mode: MuxMode,
        claim: Option<InFlightGuard>,
    ) -> Result<Delivery> {
        let process = self.muxer.spawn(inputs, mode)?;
        let mut source = ByteSource::process(process, self.config.chunk_size);

        // Fail before sending headers if the muxer dies without output
        match source.next_chunk().await {
            Ok(Some(first)) => source.unread(first),
            Ok(None) => {
                let (checked, _) = source.finish(true).await;
                return Err(checked
                    .err()
                    .unwrap_or_else(|| RelayError::Mux("muxer produced no output".into())));
            }
            Err(e) => {
                source.abort();
                let _ = source.finish(false).await;
                return Err(e);
            }
        }

        let fill = self.start_fill(&key, claim).await;
        let path = if fill.is_some() {
            DeliveryPath::Fill
        } else {
            DeliveryPath::Passthrough
        };

        info!(
            key = %key,
            mode = %mode,
            muxer = self.muxer.name(),
            path = ?path,
            "Streaming muxer output"
        );

        let (body, completion) = self.tee(key.clone(), source, fill, None);
        Ok(Delivery {
            key,
            status: StatusCode::OK,
            content_type: MEDIA_CONTENT_TYPE.to_string(),
            content_length: None,
            content_range: None,
            path,
            body,
            completion: Some(completion),
        })
    }

    /// Open a staging file for a claimed slot. A staging failure degrades to
    /// passthrough.
    async fn start_fill(&self, key: &ContentKey, claim: Option<InFlightGuard>) -> Option<Fill> {
        let claim = claim?;
        match self.store.create_staging(key).await {
            Ok(staging) => Some(Fill::new(staging, Arc::clone(&self.store), claim)),
            Err(e) => {
                warn!(key = %key, error = %e, "Cannot stage cache fill, streaming without caching");
                None
            }
        }
    }

    /// Start the tee task. The returned handle resolves after the stream ends
    /// and, when an entry was published, the follow-up eviction check has run.
    fn tee(
        &self,
        key: ContentKey,
        source: ByteSource,
        fill: Option<Fill>,
        content_length: Option<u64>,
    ) -> (ResponseBody, JoinHandle<TeeReport>) {
        let (tx, body) = ChannelBody::channel();
        let body = match content_length {
            Some(len) => body.with_length(len),
            None => body,
        };

        let tee = spawn_tee(key.clone(), source, tx, fill);
        let evictor = Arc::clone(&self.evictor);

        let completion = tokio::spawn(async move {
            let report = match tee.await {
                Ok(report) => report,
                Err(e) => TeeReport {
                    key,
                    bytes_streamed: 0,
                    outcome: TeeOutcome::SourceFailed(format!("tee task failed: {}", e)),
                    published: false,
                    source_terminated: false,
                },
            };
            // Only a new entry can push the cache over its threshold
            if report.published {
                if let Err(e) = evictor.run_if_needed().await {
                    warn!(error = %e, "Eviction check failed");
                }
            }
            report
        });

        (body.boxed(), completion)
    }
}

fn content_type_of(response: &reqwest::Response) -> String {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or(MEDIA_CONTENT_TYPE)
        .to_string()
}

/// Length announced in the headers. A HEAD response has no body, so the
/// body size hint cannot be used.
fn content_length_of(response: &reqwest::Response) -> Option<u64> {
    response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

fn content_range_of(response: &reqwest::Response) -> Option<String> {
    response
        .headers()
        .get(reqwest::header::CONTENT_RANGE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}
