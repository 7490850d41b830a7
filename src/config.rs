//! Configuration for media-relay
//!
//! CLI arguments and environment variable handling using clap. Library users
//! build [`DeliveryConfig`], [`EvictionConfig`] and [`YtDlpConfig`] directly;
//! [`Args`] converts into them.

use chrono::TimeDelta;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::{EvictionConfig, EvictionPolicy};
use crate::delivery::{DeliveryConfig, YtDlpConfig};

const MAX_RETENTION_DAYS: u32 = 36_500;

/// Smallest accepted tee chunk
pub const MIN_CHUNK_SIZE: usize = 4 * 1024;

/// Largest accepted tee chunk
pub const MAX_CHUNK_SIZE: usize = 1024 * 1024;

/// media-relay - caching media delivery service
#[derive(Parser, Debug, Clone)]
#[command(name = "media-relay")]
#[command(about = "Streams media renditions to clients while caching them on disk")]
pub struct Args {
    /// Address to listen on
    #[arg(long, env = "LISTEN", default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Directory holding cached renditions
    #[arg(long, env = "CACHE_DIR", default_value = "./media-cache")]
    pub cache_dir: PathBuf,

    /// Popularity document (default: <cache-dir>/views.json)
    #[arg(long, env = "POPULARITY_FILE")]
    pub popularity_file: Option<PathBuf>,

    /// Disk budget for cached renditions in bytes (default: 5 GiB)
    #[arg(long, env = "CACHE_MAX_BYTES", default_value_t = 5 * 1024 * 1024 * 1024)]
    pub cache_max_bytes: u64,

    /// Slack above the budget before eviction runs
    #[arg(long, env = "EVICTION_THRESHOLD_BYTES", default_value_t = 0)]
    pub eviction_threshold_bytes: u64,

    /// What an eviction run removes
    #[arg(long, env = "EVICTION_POLICY", value_enum, default_value_t = EvictionPolicy::Budget)]
    pub eviction_policy: EvictionPolicy,

    /// Share of entries removed per run with the `fraction` policy
    #[arg(long, env = "EVICTION_FRACTION_PCT", default_value_t = 10)]
    pub eviction_fraction_pct: u8,

    /// Days before the view counts of evicted content are forgotten
    #[arg(long, env = "POPULARITY_RETENTION_DAYS", default_value_t = 30)]
    pub popularity_retention_days: u32,

    /// Tee chunk size in bytes
    #[arg(long, env = "CHUNK_SIZE", default_value_t = 64 * 1024)]
    pub chunk_size: usize,

    /// Quality used when a request has none
    #[arg(long, env = "DEFAULT_QUALITY")]
    pub default_quality: Option<String>,

    /// Requests within the admission window before a content id is cached
    #[arg(long, env = "CACHE_ADMISSION_THRESHOLD", default_value_t = 1)]
    pub cache_admission_threshold: u32,

    /// Sliding admission window in seconds
    #[arg(long, env = "ADMISSION_WINDOW_SECS", default_value_t = 3600)]
    pub admission_window_secs: u64,

    /// Resolver executable (yt-dlp compatible)
    #[arg(long, env = "RESOLVER_BIN", default_value = "yt-dlp")]
    pub resolver_bin: PathBuf,

    /// Page URL handed to the resolver, `{id}` is replaced by the content id
    #[arg(
        long,
        env = "RESOLVER_URL_TEMPLATE",
        default_value = "https://www.youtube.com/watch?v={id}"
    )]
    pub resolver_url_template: String,

    /// Directory of cookie files; each `*.txt` adds a fallback resolver
    #[arg(long, env = "COOKIES_DIR")]
    pub cookies_dir: Option<PathBuf>,

    /// Resolver process timeout in milliseconds
    #[arg(long, env = "RESOLVER_TIMEOUT_MS", default_value_t = 60_000)]
    pub resolver_timeout_ms: u64,

    /// Muxer executable (ffmpeg compatible)
    #[arg(long, env = "MUXER_BIN", default_value = "ffmpeg")]
    pub muxer_bin: PathBuf,

    /// Upstream connect timeout in milliseconds
    #[arg(long, env = "REQUEST_TIMEOUT_MS", default_value_t = 30_000)]
    pub request_timeout_ms: u64,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "LOG_JSON")]
    pub log_json: bool,
}

impl Args {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.cache_max_bytes == 0 {
            return Err("CACHE_MAX_BYTES must be greater than zero".to_string());
        }

        if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&self.chunk_size) {
            return Err(format!(
                "CHUNK_SIZE must be between {} and {} bytes",
                MIN_CHUNK_SIZE, MAX_CHUNK_SIZE
            ));
        }

        if !(1..=100).contains(&self.eviction_fraction_pct) {
            return Err("EVICTION_FRACTION_PCT must be between 1 and 100".to_string());
        }

        if self.popularity_retention_days > MAX_RETENTION_DAYS {
            return Err(format!(
                "POPULARITY_RETENTION_DAYS must be at most {}",
                MAX_RETENTION_DAYS
            ));
        }

        if self.cache_admission_threshold == 0 {
            return Err("CACHE_ADMISSION_THRESHOLD must be at least 1".to_string());
        }

        Ok(())
    }

    /// Popularity document path
    pub fn popularity_path(&self) -> PathBuf {
        self.popularity_file
            .clone()
            .unwrap_or_else(|| self.cache_dir.join("views.json"))
    }

    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            chunk_size: self.chunk_size,
            default_quality: self.default_quality.clone(),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
        }
    }

    pub fn eviction_config(&self) -> EvictionConfig {
        EvictionConfig {
            budget_bytes: self.cache_max_bytes,
            threshold_bytes: self.eviction_threshold_bytes,
            policy: self.eviction_policy,
            fraction_pct: self.eviction_fraction_pct,
            popularity_retention: TimeDelta::days(i64::from(self.popularity_retention_days)),
        }
    }

    pub fn resolver_config(&self) -> YtDlpConfig {
        YtDlpConfig {
            binary: self.resolver_bin.clone(),
            url_template: self.resolver_url_template.clone(),
            cookies: None,
            timeout: Duration::from_millis(self.resolver_timeout_ms),
        }
    }

    pub fn admission_window(&self) -> Duration {
        Duration::from_secs(self.admission_window_secs)
    }
}
