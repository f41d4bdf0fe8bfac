//! livevault - live broadcast archiver service.

use blobstore::S3BlobStore;
use livevault::Config;
use livevault::capture::CaptureConfig;
use livevault::catalog::PgCatalog;
use livevault::feeder::{
    AllowAllChannels, AutoDiscovery, ChannelAllowlist, FeedClient, FeedConfig, MetadataProvider,
};
use livevault::scheduler::{Scheduler, SchedulerConfig};
use media_resolver::{YtDlpResolver, ytdlp::YtDlpConfig};
use remux::RemuxSpec;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    livevault::logging::init();

    info!("starting livevault v{}", env!("CARGO_PKG_VERSION"));
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("connected to catalog database");

    let catalog = Arc::new(PgCatalog::new(pool));
    let client = reqwest::Client::builder()
        .user_agent(config.user_agent.clone())
        .build()?;

    let resolver = Arc::new(YtDlpResolver::new(YtDlpConfig {
        binary: config.resolver_path.clone(),
        force_ipv4: config.force_ipv4,
    }));
    let blobs = Arc::new(S3BlobStore::new(config.s3.clone())?);

    let mut feed_config = FeedConfig::new(config.feed.base_url.clone(), config.feed.api_key.clone());
    feed_config.orgs = config.feed.orgs.clone();
    feed_config.topic = config.feed.topic.clone();
    feed_config.interval = config.feed.interval;
    feed_config.user_agent = config.user_agent.clone();
    let feed = Arc::new(FeedClient::new(client.clone(), feed_config));

    let metadata: Arc<dyn MetadataProvider> = feed.clone();
    let allowlist: Arc<dyn ChannelAllowlist> = if config.feed.restrict_channels {
        feed.clone()
    } else {
        Arc::new(AllowAllChannels)
    };

    let capture = CaptureConfig::new(RemuxSpec::ffmpeg(config.ffmpeg_path.clone()));
    let scheduler = Scheduler::new(
        catalog.clone(),
        resolver,
        metadata.clone(),
        allowlist,
        blobs.clone(),
        client.clone(),
        SchedulerConfig::new(capture),
        config.download_base_url.clone(),
    );

    let resumed = scheduler.resume_unfinished().await?;
    info!(resumed, "resumed unfinished captures");

    let discovery_token = CancellationToken::new();
    if config.feed.orgs.is_empty() || config.feed.api_key.is_empty() {
        warn!("auto-discovery disabled: FEED_ORGS or FEED_API_KEY not configured");
    } else {
        let discovery = AutoDiscovery::new(
            catalog.clone(),
            scheduler.clone(),
            feed.clone(),
            metadata,
            blobs,
            client,
            config.download_base_url.clone(),
        );
        tokio::spawn(discovery.run(discovery_token.clone()));
    }

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received SIGINT, shutting down");
        }
        _ = wait_for_sigterm() => {
            info!("received SIGTERM, shutting down");
        }
    }

    discovery_token.cancel();
    scheduler.shutdown();
    Ok(())
}

#[cfg(unix)]
async fn wait_for_sigterm() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            sigterm.recv().await;
        }
        Err(error) => {
            warn!(%error, "failed to install SIGTERM handler");
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_sigterm() {
    std::future::pending::<()>().await;
}
