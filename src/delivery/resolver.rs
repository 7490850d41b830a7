//! Stream resolution
//!
//! A [`Resolver`] turns a content id and quality into upstream stream
//! locators. [`YtDlpResolver`] asks a yt-dlp compatible binary for the
//! format list (`--dump-json`) and picks streams with [`select_streams`].
//!
//! Alternate resolver configurations (one per cookie file) are tried in
//! order by the orchestrator; see `DeliveryService::resolve`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, info};

use super::quality::Quality;
use crate::types::{RelayError, Result};

/// Quality picked for `standard` when a progressive stream this tall exists
const STANDARD_MAX_HEIGHT: u32 = 480;

// ============================================================================
// Resolution types
// ============================================================================

/// What an upstream locator carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    /// Audio and video in one ready-to-play file
    Combined,
    VideoOnly,
    AudioOnly,
    /// Playlist of segments (HLS)
    Segmented,
}

/// Opaque upstream locator plus what it carries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamRef {
    pub locator: String,
    pub kind: StreamKind,
    /// Request headers the upstream expects (user agent, cookies, ...)
    pub headers: BTreeMap<String, String>,
}

impl StreamRef {
    pub fn new(locator: impl Into<String>, kind: StreamKind) -> Self {
        Self {
            locator: locator.into(),
            kind,
            headers: BTreeMap::new(),
        }
    }

    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }
}

/// Outcome of resolving one content id at one quality
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Combined(StreamRef),
    Split { video: StreamRef, audio: StreamRef },
    Segmented(StreamRef),
    NotFound,
}

/// Maps a content id and quality to upstream streams
#[async_trait]
pub trait Resolver: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn resolve(&self, content_id: &str, quality: Quality) -> Result<Resolution>;
}

// ============================================================================
// yt-dlp format list
// ============================================================================

/// Top level of `--dump-json` output. Only the fields used are modeled.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaInfo {
    #[serde(default)]
    pub formats: Vec<Format>,
    /// Locator of the format yt-dlp picked itself
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub http_headers: Option<BTreeMap<String, String>>,
}

/// One entry of the format list
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Format {
    pub format_id: Option<String>,
    pub url: Option<String>,
    pub ext: Option<String>,
    pub vcodec: Option<String>,
    pub acodec: Option<String>,
    pub height: Option<u32>,
    pub abr: Option<f64>,
    pub protocol: Option<String>,
    pub language: Option<String>,
    pub http_headers: Option<BTreeMap<String, String>>,
}

fn is_codec(codec: &Option<String>) -> bool {
    matches!(codec.as_deref(), Some(c) if !c.is_empty() && c != "none")
}

fn is_segmented(url: &str, protocol: Option<&str>) -> bool {
    url.contains(".m3u8")
        || url.contains("hls_playlist")
        || protocol.map(|p| p.contains("m3u8")).unwrap_or(false)
}

impl Format {
    fn has_video(&self) -> bool {
        is_codec(&self.vcodec)
    }

    fn has_audio(&self) -> bool {
        is_codec(&self.acodec)
    }

    fn is_progressive(&self) -> bool {
        self.has_video() && self.has_audio()
    }

    fn is_video_only(&self) -> bool {
        self.has_video() && !self.has_audio()
    }

    fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    fn height(&self) -> u32 {
        self.height.unwrap_or(0)
    }

    fn ext_is(&self, exts: &[&str]) -> bool {
        self.ext.as_deref().map(|e| exts.contains(&e)).unwrap_or(false)
    }

    /// Higher is better: taller first, mp4 breaks ties
    fn video_score(&self) -> (u32, bool) {
        (self.height(), self.ext_is(&["mp4"]))
    }

    /// Higher is better: m4a/mp4 first, then bitrate
    fn audio_score(&self) -> (bool, u64) {
        (
            self.ext_is(&["m4a", "mp4"]),
            (self.abr.unwrap_or(0.0).max(0.0) * 1000.0) as u64,
        )
    }

    fn language_rank(&self) -> u8 {
        let lang = self
            .language
            .as_deref()
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if lang == "english" || lang.starts_with("en") {
            0
        } else if lang == "russian" || lang.starts_with("ru") {
            1
        } else {
            2
        }
    }

    fn to_ref(&self, kind: StreamKind) -> Option<StreamRef> {
        let url = self.url.as_deref()?;
        let kind = if is_segmented(url, self.protocol.as_deref()) {
            StreamKind::Segmented
        } else {
            kind
        };
        Some(StreamRef::new(url, kind).with_headers(self.http_headers.clone().unwrap_or_default()))
    }
}

fn combined(stream: StreamRef) -> Resolution {
    match stream.kind {
        StreamKind::Segmented => Resolution::Segmented(stream),
        _ => Resolution::Combined(stream),
    }
}

fn best_by<'a, K: Ord>(
    formats: impl Iterator<Item = &'a Format>,
    score: impl Fn(&Format) -> K,
) -> Option<&'a Format> {
    formats.max_by_key(|f| score(*f))
}

/// Pick streams for `quality` from a format list.
///
/// - A progressive stream matching the target height exactly is served as is.
/// - Otherwise the best video-only stream (exact height, else tallest below,
///   else tallest overall) is paired with the best audio-only stream.
/// - `standard` prefers the tallest progressive stream up to 480p.
/// - If nothing pairs up, any progressive stream (or yt-dlp's own pick) is
///   used before giving up.
pub fn select_streams(info: &MediaInfo, quality: Quality) -> Resolution {
    let with_url = || info.formats.iter().filter(|f| f.url.is_some());
    let progressive = || with_url().filter(|f| f.is_progressive());

    match quality {
        Quality::Height(target) => {
            let exact = best_by(
                progressive().filter(|f| f.height == Some(target)),
                Format::video_score,
            );
            if let Some(stream) = exact.and_then(|f| f.to_ref(StreamKind::Combined)) {
                return combined(stream);
            }
        }
        Quality::Standard => {
            let capped = best_by(
                progressive().filter(|f| f.height() <= STANDARD_MAX_HEIGHT),
                Format::video_score,
            );
            let best = capped.or_else(|| best_by(progressive(), Format::video_score));
            if let Some(stream) = best.and_then(|f| f.to_ref(StreamKind::Combined)) {
                return combined(stream);
            }
        }
    }

    let videos = || with_url().filter(|f| f.is_video_only());
    let video = match quality.height() {
        Some(target) => {
            best_by(videos().filter(|f| f.height == Some(target)), Format::video_score)
                .or_else(|| best_by(videos().filter(|f| f.height() <= target), Format::video_score))
        }
        None => None,
    }
    .or_else(|| best_by(videos(), Format::video_score));

    let audios = || with_url().filter(|f| f.is_audio_only());
    let audio = (0..=2u8).find_map(|rank| {
        best_by(audios().filter(|f| f.language_rank() == rank), Format::audio_score)
    });

    if let (Some(video), Some(audio)) = (video, audio) {
        if let (Some(v), Some(a)) = (
            video.to_ref(StreamKind::VideoOnly),
            audio.to_ref(StreamKind::AudioOnly),
        ) {
            // A segmented half can only be read by the muxer as a whole
            if v.kind == StreamKind::Segmented {
                return Resolution::Segmented(v);
            }
            return Resolution::Split { video: v, audio: a };
        }
    }

    let fallback = best_by(progressive(), Format::video_score);
    if let Some(stream) = fallback.and_then(|f| f.to_ref(StreamKind::Combined)) {
        return combined(stream);
    }

    match info.url.as_deref() {
        Some(url) => {
            let kind = if is_segmented(url, info.protocol.as_deref()) {
                StreamKind::Segmented
            } else {
                StreamKind::Combined
            };
            let headers = info.http_headers.clone().unwrap_or_default();
            combined(StreamRef::new(url, kind).with_headers(headers))
        }
        None => Resolution::NotFound,
    }
}

// ============================================================================
// YtDlpResolver
// ============================================================================

/// Settings for [`YtDlpResolver`]
#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Resolver executable (default: `yt-dlp`)
    pub binary: PathBuf,
    /// Page URL handed to the resolver; `{id}` is replaced by the content id
    pub url_template: String,
    /// Cookie file, if this configuration uses one
    pub cookies: Option<PathBuf>,
    pub timeout: Duration,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("yt-dlp"),
            url_template: "https://www.youtube.com/watch?v={id}".to_string(),
            cookies: None,
            timeout: Duration::from_secs(60),
        }
    }
}

/// Resolver backed by a yt-dlp compatible binary
pub struct YtDlpResolver {
    name: String,
    config: YtDlpConfig,
}

impl YtDlpResolver {
    pub fn new(config: YtDlpConfig) -> Self {
        let name = match &config.cookies {
            Some(path) => format!(
                "yt-dlp[{}]",
                path.file_name().and_then(|n| n.to_str()).unwrap_or("cookies")
            ),
            None => "yt-dlp".to_string(),
        };
        Self { name, config }
    }

    /// One resolver without cookies, then one per `*.txt` file in
    /// `cookies_dir`, in file name order.
    pub fn with_cookie_alternates(base: YtDlpConfig, cookies_dir: Option<&Path>) -> Vec<Self> {
        let mut resolvers = vec![Self::new(base.clone())];

        let Some(dir) = cookies_dir else {
            return resolvers;
        };
        let mut files: Vec<PathBuf> = match std::fs::read_dir(dir) {
            Ok(entries) => entries
                .flatten()
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.extension().and_then(|e| e.to_str()) == Some("txt"))
                .collect(),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Cannot read cookies directory");
                return resolvers;
            }
        };
        files.sort();

        for file in files {
            resolvers.push(Self::new(YtDlpConfig {
                cookies: Some(file),
                ..base.clone()
            }));
        }
        info!(count = resolvers.len(), "Configured resolvers");
        resolvers
    }

    pub fn page_url(&self, content_id: &str) -> String {
        self.config
            .url_template
            .replace("{id}", &urlencoding::encode(content_id))
    }

    fn command(&self, content_id: &str) -> Command {
        let mut cmd = Command::new(&self.config.binary);
        cmd.arg("--dump-json")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--skip-download");
        if let Some(cookies) = &self.config.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        cmd.arg(self.page_url(content_id))
            .stdin(std::process::Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Resolver for YtDlpResolver {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(&self, content_id: &str, quality: Quality) -> Result<Resolution> {
        let output = tokio::time::timeout(self.config.timeout, self.command(content_id).output())
            .await
            .map_err(|_| {
                RelayError::Resolution(format!(
                    "{} timed out after {:?}",
                    self.name, self.config.timeout
                ))
            })?
            .map_err(|e| RelayError::Resolution(format!("failed to run {}: {}", self.name, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let reason = stderr.lines().last().unwrap_or("").trim().to_string();
            debug!(
                resolver = %self.name,
                content_id = %content_id,
                reason = %reason,
                "Resolver failed"
            );
            return Err(RelayError::Resolution(format!(
                "{} exited with {}: {}",
                self.name, output.status, reason
            )));
        }

        // With --no-playlist there is one JSON document; take the first line
        // in case a playlist slipped through anyway.
        let stdout = String::from_utf8_lossy(&output.stdout);
        let first = stdout.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
        let info: MediaInfo = serde_json::from_str(first)?;

        let resolution = select_streams(&info, quality);
        debug!(
            resolver = %self.name,
            content_id = %content_id,
            quality = %quality,
            formats = info.formats.len(),
            resolution = resolution_kind(&resolution),
            "Resolved streams"
        );
        Ok(resolution)
    }
}

/// Short name of a resolution variant, for logs
pub fn resolution_kind(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Combined(_) => "combined",
        Resolution::Split { .. } => "split",
        Resolution::Segmented(_) => "segmented",
        Resolution::NotFound => "not_found",
    }
}
