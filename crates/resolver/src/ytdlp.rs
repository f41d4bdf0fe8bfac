// Subprocess-backed resolver speaking the yt-dlp CLI contract.

use crate::parse::{first_playlist_line, marks_not_started, parse_quality_listing};
use crate::{MediaUrlResolver, Quality, ResolverError, parse_broadcast_id};
use async_trait::async_trait;
use moka::sync::Cache;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Quality listings barely change while a broadcast is pending; cache them
/// per broadcast ID so the submit UI can poll cheaply.
const QUALITY_CACHE_TTL: Duration = Duration::from_secs(4 * 60 * 60);
const QUALITY_CACHE_CAPACITY: u64 = 1024;

#[derive(Debug, Clone)]
pub struct YtDlpConfig {
    /// Path to the extractor binary.
    pub binary: String,
    /// Pass `--force-ipv4`; some CDNs hand out broken IPv6 routes.
    pub force_ipv4: bool,
}

impl Default for YtDlpConfig {
    fn default() -> Self {
        Self {
            binary: "yt-dlp".to_string(),
            force_ipv4: true,
        }
    }
}

pub struct YtDlpResolver {
    config: YtDlpConfig,
    qualities: Cache<String, Vec<Quality>>,
}

impl YtDlpResolver {
    pub fn new(config: YtDlpConfig) -> Self {
        Self {
            config,
            qualities: Cache::builder()
                .max_capacity(QUALITY_CACHE_CAPACITY)
                .time_to_live(QUALITY_CACHE_TTL)
                .build(),
        }
    }

    /// Lists the qualities a broadcast offers. The boolean reports whether
    /// the listing came from the cache. A broadcast that has not started
    /// yet yields the synthetic [`Quality::not_yet_started`] entry and is
    /// never cached.
    pub async fn qualities(
        &self,
        broadcast_url: &str,
        ignore_cache: bool,
    ) -> Result<(Vec<Quality>, bool), ResolverError> {
        // Unrecognized watch URLs still resolve through the extractor; the
        // whole URL then serves as the cache key.
        let broadcast_id =
            parse_broadcast_id(broadcast_url).unwrap_or_else(|_| broadcast_url.to_string());

        if !ignore_cache
            && let Some(cached) = self.qualities.get(&broadcast_id)
        {
            return Ok((cached, true));
        }

        let mut args = vec!["--list-formats"];
        if self.config.force_ipv4 {
            args.push("--force-ipv4");
        }
        args.push("-j");
        args.push(broadcast_url);

        let output = self.run(&args).await?;

        match output.success {
            true => {
                let qualities = parse_quality_listing(&output.combined)?;
                self.qualities.insert(broadcast_id, qualities.clone());
                Ok((qualities, false))
            }
            false if marks_not_started(&output.combined) => {
                Ok((vec![Quality::not_yet_started()], false))
            }
            false => {
                warn!(url = %broadcast_url, output = %output.combined, "format listing failed");
                Err(ResolverError::CommandFailed {
                    status: output.status,
                    output: output.combined,
                })
            }
        }
    }

    async fn best_quality_code(&self, broadcast_url: &str) -> Result<i32, ResolverError> {
        let (qualities, _) = self.qualities(broadcast_url, false).await?;
        let best = qualities
            .iter()
            .find(|quality| quality.best)
            .ok_or(ResolverError::NotStarted)?;
        Ok(best.code)
    }

    async fn run(&self, args: &[&str]) -> Result<RunOutput, ResolverError> {
        debug!(binary = %self.config.binary, ?args, "running resolver");
        let output = Command::new(&self.config.binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| ResolverError::Spawn {
                binary: self.config.binary.clone(),
                source,
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        Ok(RunOutput {
            success: output.status.success(),
            status: output.status.to_string(),
            stdout: stdout.to_string(),
            combined: format!("{stdout}{stderr}"),
        })
    }
}

struct RunOutput {
    success: bool,
    status: String,
    stdout: String,
    combined: String,
}

#[async_trait]
impl MediaUrlResolver for YtDlpResolver {
    async fn media_playlist(
        &self,
        broadcast_url: &str,
        quality: i32,
    ) -> Result<String, ResolverError> {
        let quality = if quality <= 0 {
            self.best_quality_code(broadcast_url).await?
        } else {
            quality
        };

        let code = quality.to_string();
        let mut args = vec!["-f", code.as_str()];
        if self.config.force_ipv4 {
            args.push("--force-ipv4");
        }
        args.push("-g");
        args.push(broadcast_url);

        let output = self.run(&args).await?;

        if !output.success {
            if marks_not_started(&output.combined) {
                return Err(ResolverError::NotStarted);
            }
            return Err(ResolverError::CommandFailed {
                status: output.status,
                output: output.combined,
            });
        }

        first_playlist_line(&output.stdout).ok_or_else(|| ResolverError::NoPlaylist {
            output: output.stdout,
        })
    }
}
