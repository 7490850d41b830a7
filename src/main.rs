//! media-relay - caching media delivery service

use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use media_relay::{
    cache::{AdmissionGate, CacheStore, PopularityTracker},
    config::Args,
    delivery::{DeliveryService, FfmpegMuxer, Resolver, YtDlpResolver},
    server::{self, AppState},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file if present
    let _ = dotenvy::dotenv();

    let args = Args::parse();

    let log_level = args.log_level.clone();
    let registry = tracing_subscriber::registry().with(
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| format!("media_relay={},info", log_level).into()),
    );
    if args.log_json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    if let Err(e) = args.validate() {
        error!("Configuration error: {}", e);
        std::process::exit(1);
    }

    info!("======================================");
    info!("  media-relay");
    info!("======================================");
    info!("Listen: {}", args.listen);
    info!("Cache dir: {}", args.cache_dir.display());
    info!("Popularity file: {}", args.popularity_path().display());
    info!(
        "Budget: {} bytes (+{} slack), policy {:?}",
        args.cache_max_bytes, args.eviction_threshold_bytes, args.eviction_policy
    );
    info!("Resolver: {}", args.resolver_bin.display());
    info!("Muxer: {}", args.muxer_bin.display());
    if let Some(quality) = &args.default_quality {
        info!("Default quality: {}", quality);
    }
    if args.cache_admission_threshold > 1 {
        info!(
            "Admission: {} requests within {}s",
            args.cache_admission_threshold, args.admission_window_secs
        );
    }
    info!("======================================");

    let store = Arc::new(CacheStore::new(&args.cache_dir).await?);
    let popularity = Arc::new(PopularityTracker::load(args.popularity_path()).await);

    let resolvers: Vec<Arc<dyn Resolver>> =
        YtDlpResolver::with_cookie_alternates(args.resolver_config(), args.cookies_dir.as_deref())
            .into_iter()
            .map(|r| Arc::new(r) as Arc<dyn Resolver>)
            .collect();
    let names: Vec<&str> = resolvers.iter().map(|r| r.name()).collect();
    info!("Resolver chain: {}", names.join(" -> "));

    let muxer = Arc::new(FfmpegMuxer::new(args.muxer_bin.clone()));

    let service = DeliveryService::new(
        store,
        popularity,
        resolvers,
        muxer,
        args.delivery_config(),
    )?
    .with_eviction(args.eviction_config())
    .with_admission(AdmissionGate::new(
        args.cache_admission_threshold,
        args.admission_window(),
    ));

    // Bring an oversized cache back under budget before serving
    match service.evictor().run_if_needed().await {
        Ok(Some(report)) => info!(
            "Startup eviction removed {} entries ({} bytes)",
            report.removed.len(),
            report.bytes_freed
        ),
        Ok(None) => {}
        Err(e) => warn!("Startup eviction failed: {}", e),
    }

    let state = Arc::new(AppState::new(args.listen, Arc::new(service)));
    server::run(state).await?;

    Ok(())
}
