//! Media URL resolution for live broadcasts.
//!
//! Wraps an external extractor binary (the yt-dlp CLI contract): one call
//! lists the offered qualities of a broadcast, another resolves a quality to
//! the current media playlist URL. A broadcast that has not started yet is a
//! retryable lifecycle state ([`ResolverError::NotStarted`]), not a failure.

pub mod error;
mod parse;
pub mod ytdlp;

pub use error::ResolverError;
pub use parse::parse_broadcast_id;
pub use ytdlp::YtDlpResolver;

use async_trait::async_trait;
use serde::Serialize;

/// One quality variant offered by a broadcast.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Quality {
    pub code: i32,
    pub resolution: String,
    #[serde(skip)]
    pub vbr: f64,
    pub best: bool,
}

impl Quality {
    /// The synthetic entry reported while a broadcast has not started yet
    /// and no real format list exists.
    pub fn not_yet_started() -> Self {
        Self {
            code: -1,
            resolution: "Not yet started, will use best quality".to_string(),
            vbr: 0.0,
            best: false,
        }
    }
}

/// Narrow seam between the capture pipeline and the outside world: given a
/// broadcast URL and a quality code, where does its media playlist currently
/// live? One production implementation (subprocess) and one in-memory test
/// implementation; the interface stays this small on purpose.
#[async_trait]
pub trait MediaUrlResolver: Send + Sync {
    /// Resolves the current media playlist URL. A non-positive `quality`
    /// selects the best offered quality.
    async fn media_playlist(&self, broadcast_url: &str, quality: i32)
    -> Result<String, ResolverError>;
}
