//! Environment-driven configuration. Everything the capture core needs is
//! read once at boot; components receive typed sub-structs, never the
//! environment itself.

use crate::{Error, Result};
use blobstore::S3Config;
use std::time::Duration;

const DEFAULT_FEED_BASE_URL: &str = "https://holodex.net";
const DEFAULT_DISCOVERY_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct FeedSettings {
    pub base_url: String,
    pub api_key: String,
    pub orgs: Vec<String>,
    pub topic: Option<String>,
    pub restrict_channels: bool,
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub user_agent: String,
    pub ffmpeg_path: String,
    pub resolver_path: String,
    pub force_ipv4: bool,
    pub s3: S3Config,
    /// Public base URL objects are served from; used for recorded
    /// thumbnail links.
    pub download_base_url: Option<String>,
    pub feed: FeedSettings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let s3 = S3Config::new(
            required("S3_BUCKET")?,
            required("S3_ENDPOINT")?,
            required("S3_REGION")?,
            required("S3_KEY_ID")?,
            required("S3_APPLICATION_KEY")?,
        );

        let feed = FeedSettings {
            base_url: optional("FEED_BASE_URL")
                .unwrap_or_else(|| DEFAULT_FEED_BASE_URL.to_string()),
            api_key: optional("FEED_API_KEY").unwrap_or_default(),
            orgs: parse_orgs(optional("FEED_ORGS").as_deref()),
            topic: optional("FEED_TOPIC"),
            restrict_channels: flag("RESTRICT_CHANNELS"),
            interval: DEFAULT_DISCOVERY_INTERVAL,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            user_agent: optional("HTTP_USERAGENT").unwrap_or_else(default_user_agent),
            ffmpeg_path: optional("FFMPEG").unwrap_or_else(|| "ffmpeg".to_string()),
            resolver_path: optional("YT_DLP").unwrap_or_else(|| "yt-dlp".to_string()),
            force_ipv4: flag_default("FORCE_IPV4", true),
            s3,
            download_base_url: optional("S3_DOWNLOAD_URL"),
            feed,
        })
    }
}

fn default_user_agent() -> String {
    format!("livevault/{}", env!("CARGO_PKG_VERSION"))
}

fn required(name: &str) -> Result<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| Error::configuration(format!("missing required environment variable {name}")))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn flag(name: &str) -> bool {
    flag_default(name, false)
}

fn flag_default(name: &str, default: bool) -> bool {
    match optional(name) {
        Some(value) => matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes"),
        None => default,
    }
}

fn parse_orgs(raw: Option<&str>) -> Vec<String> {
    raw.map(|value| {
        value
            .split(',')
            .map(str::trim)
            .filter(|org| !org.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orgs_are_comma_separated_and_trimmed() {
        assert_eq!(
            parse_orgs(Some("Hololive, Nijisanji ,,Indie")),
            vec!["Hololive", "Nijisanji", "Indie"]
        );
        assert!(parse_orgs(None).is_empty());
        assert!(parse_orgs(Some("  ")).is_empty());
    }
}
