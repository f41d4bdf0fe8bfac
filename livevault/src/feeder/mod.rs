//! Auto-discovery: periodically asks the upstream curated feed for upcoming
//! broadcasts and enqueues capture jobs for the ones the catalog does not
//! know yet.

pub mod allowlist;
pub mod metadata;

pub use allowlist::{AllowAllChannels, ChannelAllowlist};
pub use metadata::{BroadcastInfo, LiveState, MetadataProvider};

use crate::catalog::{Catalog, NewBroadcast};
use crate::scheduler::{ScheduleRequest, Scheduler};
use blobstore::BlobStore;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Submitter identity stamped on auto-discovered broadcasts.
const DISCOVERY_SUBMITTER: &str = "livevault";

#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    #[error("feed request failed: {source}")]
    Http {
        #[from]
        source: reqwest::Error,
    },

    #[error("feed returned HTTP {status}")]
    Status { status: reqwest::StatusCode },

    #[error("broadcast not found in feed: {id}")]
    NotFound { id: String },
}

#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub base_url: String,
    pub api_key: String,
    pub orgs: Vec<String>,
    pub topic: Option<String>,
    pub user_agent: String,
    /// How often the discovery pass runs.
    pub interval: Duration,
}

impl FeedConfig {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            orgs: Vec::new(),
            topic: None,
            user_agent: DISCOVERY_SUBMITTER.to_string(),
            interval: Duration::from_secs(60 * 60),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpcomingBroadcast {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub start_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    pub channel: FeedChannel,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FeedChannel {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub org: String,
}

/// Client for the upstream feed API. Also serves as the broadcast metadata
/// provider and, when restriction is on, the channel allowlist.
pub struct FeedClient {
    client: reqwest::Client,
    config: FeedConfig,
}

impl FeedClient {
    pub fn new(client: reqwest::Client, config: FeedConfig) -> Self {
        Self { client, config }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client
            .get(format!("{}{path}", self.config.base_url))
            .header("X-APIKEY", &self.config.api_key)
            .header(reqwest::header::USER_AGENT, &self.config.user_agent)
    }

    /// Upcoming broadcasts of one organization, capped to the next day
    /// (discovery runs hourly anyway).
    pub async fn upcoming(&self, org: &str) -> Result<Vec<UpcomingBroadcast>, FeedError> {
        let mut request = self.get("/api/v2/live").query(&[
            ("include", "live_info"),
            ("limit", "50"),
            ("type", "stream"),
            ("status", "upcoming"),
            ("max_upcoming_hours", "24"),
            ("org", org),
        ]);
        if let Some(topic) = &self.config.topic {
            request = request.query(&[("topic", topic.as_str())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FeedError::Status {
                status: response.status(),
            });
        }
        Ok(response.json().await?)
    }
}

/// Recurring discovery pass. Singleton: the scheduler's per-broadcast job
/// table deduplicates anything this and a user submission both find.
pub struct AutoDiscovery {
    catalog: Arc<dyn Catalog>,
    scheduler: Arc<Scheduler>,
    feed: Arc<FeedClient>,
    metadata: Arc<dyn MetadataProvider>,
    blobs: Arc<dyn BlobStore>,
    client: reqwest::Client,
    download_base_url: Option<String>,
}

impl AutoDiscovery {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        scheduler: Arc<Scheduler>,
        feed: Arc<FeedClient>,
        metadata: Arc<dyn MetadataProvider>,
        blobs: Arc<dyn BlobStore>,
        client: reqwest::Client,
        download_base_url: Option<String>,
    ) -> Self {
        Self {
            catalog,
            scheduler,
            feed,
            metadata,
            blobs,
            client,
            download_base_url,
        }
    }

    /// Runs the discovery loop until cancelled. The first pass starts
    /// immediately.
    pub async fn run(self, token: CancellationToken) {
        let interval = self.feed.config.interval;
        loop {
            if let Err(error) = self.discover_once().await {
                warn!(%error, "discovery pass failed");
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => {
                    info!("auto-discovery stopped");
                    return;
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    /// One pass over every configured organization.
    pub async fn discover_once(&self) -> Result<usize, FeedError> {
        let mut scheduled = 0;
        for org in &self.feed.config.orgs {
            let streams = match self.feed.upcoming(org).await {
                Ok(streams) => streams,
                Err(error) => {
                    warn!(org = %org, %error, "failed to query upcoming broadcasts");
                    continue;
                }
            };
            info!(org = %org, count = streams.len(), "found upcoming broadcasts");

            for stream in streams {
                if stream.id.is_empty() {
                    debug!("skipping feed entry without a broadcast id");
                    continue;
                }
                match self.enqueue(&stream).await {
                    Ok(true) => scheduled += 1,
                    Ok(false) => {}
                    Err(error) => {
                        warn!(broadcast_id = %stream.id, %error, "failed to enqueue broadcast");
                    }
                }
            }
        }
        Ok(scheduled)
    }

    /// Inserts the catalog row and schedules the capture. Returns false
    /// when the broadcast is already known.
    async fn enqueue(&self, stream: &UpcomingBroadcast) -> Result<bool, crate::Error> {
        if self.catalog.find_by_id(&stream.id).await?.is_some() {
            debug!(broadcast_id = %stream.id, "already scheduled, skipping");
            return Ok(false);
        }

        let info = self.metadata.broadcast_info(&stream.id).await?;
        let start = info
            .scheduled_start
            .or(stream.start_scheduled)
            .unwrap_or_else(Utc::now);

        let thumbnail = archive_thumbnail(
            &self.client,
            self.blobs.as_ref(),
            self.download_base_url.as_deref(),
            &stream.id,
            info.thumbnail_url.as_deref(),
        )
        .await;

        let row = self
            .catalog
            .insert_broadcast(NewBroadcast {
                id: stream.id.clone(),
                submitter: DISCOVERY_SUBMITTER.to_string(),
                start,
                title: info.title.clone(),
                channel_name: info.channel_name.clone(),
                channel_id: info.channel_id.clone(),
                thumbnail,
            })
            .await?;

        self.scheduler.schedule(ScheduleRequest {
            broadcast_id: row.id.clone(),
            broadcast_url: watch_url(&row.id),
            // Auto-pick best quality.
            quality: 0,
            start,
        });

        info!(
            broadcast_id = %row.id,
            title = %row.title,
            start = %start.to_rfc3339(),
            "automatically scheduled broadcast"
        );
        Ok(true)
    }
}

/// The canonical watch URL for a broadcast ID.
pub fn watch_url(broadcast_id: &str) -> String {
    format!("https://youtu.be/{broadcast_id}")
}

/// Snapshots the broadcast thumbnail into the blob store, returning the URL
/// to record in the catalog. Failures fall back to the upstream URL; a
/// missing thumbnail records an empty string, like a broadcast without one.
pub async fn archive_thumbnail(
    client: &reqwest::Client,
    blobs: &dyn BlobStore,
    download_base_url: Option<&str>,
    broadcast_id: &str,
    thumbnail_url: Option<&str>,
) -> String {
    let Some(thumbnail_url) = thumbnail_url else {
        return String::new();
    };

    let bytes = match client.get(thumbnail_url).send().await {
        Ok(response) if response.status().is_success() => match response.bytes().await {
            Ok(bytes) => bytes,
            Err(error) => {
                warn!(broadcast_id, %error, "failed to read thumbnail body");
                return thumbnail_url.to_string();
            }
        },
        Ok(response) => {
            warn!(broadcast_id, status = %response.status(), "thumbnail fetch failed");
            return thumbnail_url.to_string();
        }
        Err(error) => {
            warn!(broadcast_id, %error, "thumbnail fetch failed");
            return thumbnail_url.to_string();
        }
    };

    let key = format!("{broadcast_id}.jpg");
    if let Err(error) = blobs.put_bytes(&key, &bytes, "image/jpeg").await {
        warn!(broadcast_id, %error, "thumbnail upload failed");
        return thumbnail_url.to_string();
    }

    match download_base_url {
        Some(base) => format!("{base}/{key}"),
        None => thumbnail_url.to_string(),
    }
}
