// Broadcast metadata: liveness and the announced start time. This is the
// narrow seam the scheduler's reschedule check looks through.

use super::{FeedClient, FeedError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveState {
    Upcoming,
    Live,
    Ended,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct BroadcastInfo {
    pub id: String,
    pub title: String,
    pub channel_id: String,
    pub channel_name: String,
    pub thumbnail_url: Option<String>,
    pub scheduled_start: Option<DateTime<Utc>>,
    pub state: LiveState,
}

#[async_trait]
pub trait MetadataProvider: Send + Sync {
    async fn broadcast_info(&self, broadcast_id: &str) -> Result<BroadcastInfo, FeedError>;
}

#[derive(Debug, Deserialize)]
struct FeedVideo {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    start_scheduled: Option<DateTime<Utc>>,
    #[serde(default)]
    thumbnail: Option<String>,
    #[serde(default)]
    channel: super::FeedChannel,
}

#[async_trait]
impl MetadataProvider for FeedClient {
    async fn broadcast_info(&self, broadcast_id: &str) -> Result<BroadcastInfo, FeedError> {
        let response = self
            .get(&format!("/api/v2/videos/{broadcast_id}"))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(FeedError::NotFound {
                id: broadcast_id.to_string(),
            });
        }
        if !response.status().is_success() {
            return Err(FeedError::Status {
                status: response.status(),
            });
        }

        let video: FeedVideo = response.json().await?;
        let state = match video.status.as_str() {
            "upcoming" => LiveState::Upcoming,
            "live" => LiveState::Live,
            "past" | "missing" => LiveState::Ended,
            _ => LiveState::Unknown,
        };

        Ok(BroadcastInfo {
            id: video.id,
            title: video.title,
            channel_id: video.channel.id,
            channel_name: video.channel.name,
            thumbnail_url: video.thumbnail,
            scheduled_start: video.start_scheduled,
            state,
        })
    }
}
