// Optional channel restriction: submissions are filtered through the
// upstream channel directory when the operator turns the flag on.

use super::{FeedClient, FeedError};
use async_trait::async_trait;

#[async_trait]
pub trait ChannelAllowlist: Send + Sync {
    async fn is_allowed(&self, channel_id: &str) -> Result<bool, FeedError>;
}

/// Used when submissions are unrestricted.
#[derive(Debug, Default)]
pub struct AllowAllChannels;

#[async_trait]
impl ChannelAllowlist for AllowAllChannels {
    async fn is_allowed(&self, _channel_id: &str) -> Result<bool, FeedError> {
        Ok(true)
    }
}

#[async_trait]
impl ChannelAllowlist for FeedClient {
    /// A channel the directory knows (HTTP 200) is allowed; an unknown one
    /// (HTTP 404) is not.
    async fn is_allowed(&self, channel_id: &str) -> Result<bool, FeedError> {
        let response = self
            .get(&format!("/api/v2/channels/{channel_id}"))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(true)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Ok(false)
        } else {
            Err(FeedError::Status { status })
        }
    }
}
