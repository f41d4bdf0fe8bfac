// Media playlist poller: discovers newly published segments of one live
// broadcast and emits each of them exactly once.

use crate::{HlsError, Segment};
use async_trait::async_trait;
use m3u8_rs::{MediaPlaylist, Playlist, parse_playlist_res};
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Capacity of the seen-segment LRU. Live playlists are sliding windows, so
/// a URI re-appears across many consecutive polls; the LRU rejects those
/// re-observations without growing with the broadcast length.
const SEEN_SEGMENTS_LRU_CAPACITY: u64 = 1000;

/// Something that can tell the poller where the media playlist currently
/// lives. Live playlist URLs rotate; `force_refresh` bypasses any cache the
/// implementation keeps.
#[async_trait]
pub trait PlaylistSource: Send + Sync {
    async fn playlist_url(&self, force_refresh: bool) -> Result<String, HlsError>;
}

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// How long a resolved playlist URL is trusted before the source is
    /// consulted again.
    pub url_ttl: Duration,
    /// Attempts per poll cycle; every failed attempt forces a URL refresh.
    pub max_fetch_attempts: u32,
    /// Delay between failed fetch attempts within one cycle.
    pub fetch_retry_delay: Duration,
    /// Consecutive polls with an unchanged media sequence number before the
    /// broadcast is considered over.
    pub stale_limit: u32,
    /// Upper bound on the inter-poll sleep. `None` sleeps the playlist's
    /// full target duration.
    pub poll_interval_cap: Option<Duration>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            url_ttl: Duration::from_secs(600),
            max_fetch_attempts: 20,
            fetch_retry_delay: Duration::from_secs(1),
            stale_limit: 40,
            poll_interval_cap: None,
        }
    }
}

/// Polls one live media playlist and emits unseen segments, in playlist
/// order, into a bounded channel. The channel close on return is the only
/// termination signal downstream consumers need.
pub struct PlaylistPoller {
    client: reqwest::Client,
    source: Arc<dyn PlaylistSource>,
    config: PollerConfig,
    seen: Cache<String, ()>,
    cached_url: Option<Url>,
    url_deadline: Option<Instant>,
    last_media_sequence: Option<u64>,
    stale_count: u32,
    token: CancellationToken,
    started_at: Instant,
}

impl PlaylistPoller {
    pub fn new(
        client: reqwest::Client,
        source: Arc<dyn PlaylistSource>,
        config: PollerConfig,
        token: CancellationToken,
    ) -> Self {
        let seen = Cache::builder()
            .max_capacity(SEEN_SEGMENTS_LRU_CAPACITY)
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            client,
            source,
            config,
            seen,
            cached_url: None,
            url_deadline: None,
            last_media_sequence: None,
            stale_count: 0,
            token,
            started_at: Instant::now(),
        }
    }

    /// Runs the poll loop until the broadcast ends, goes stale, or the
    /// token is cancelled. Dropping `tx` on return closes the stream.
    pub async fn run(mut self, tx: mpsc::Sender<Segment>) -> Result<(), HlsError> {
        loop {
            if self.token.is_cancelled() {
                info!("poller cancelled");
                return Ok(());
            }

            let sleep = self.poll_cycle(&tx).await?;

            if sleep.is_zero() {
                info!("playlist closed, stopping poller");
                return Ok(());
            }
            if self.stale_count > self.config.stale_limit {
                info!(
                    stale_polls = self.stale_count,
                    "no new content, stopping poller"
                );
                return Ok(());
            }

            let sleep = match self.config.poll_interval_cap {
                Some(cap) => sleep.min(cap),
                None => sleep,
            };
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    info!("poller cancelled during sleep");
                    return Ok(());
                }
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }

    /// One poll: fetch, parse, emit unseen segments. Returns the requested
    /// sleep before the next poll; zero means the capture is over.
    async fn poll_cycle(&mut self, tx: &mpsc::Sender<Segment>) -> Result<Duration, HlsError> {
        let (playlist, playlist_url) = self.fetch_playlist().await?;

        let playlist = match playlist {
            Playlist::MediaPlaylist(media) => media,
            Playlist::MasterPlaylist(_) => {
                warn!(url = %playlist_url, "expected media playlist, got master playlist");
                return Ok(Duration::ZERO);
            }
        };

        self.track_staleness(&playlist);

        for entry in &playlist.segments {
            if self.token.is_cancelled() {
                return Ok(Duration::ZERO);
            }

            let uri = resolve_segment_uri(&playlist_url, &entry.uri)?;
            if self.seen.contains_key(&uri) {
                continue;
            }
            self.seen.insert(uri.clone(), ());

            let segment = Segment {
                url: uri,
                elapsed: self.started_at.elapsed(),
            };
            trace!(url = %segment.url, elapsed = ?segment.elapsed, "new segment");
            if tx.send(segment).await.is_err() {
                // Receiver gone: the capture is shutting down.
                debug!("segment channel closed by receiver");
                return Ok(Duration::ZERO);
            }
        }

        if playlist.end_list {
            return Ok(Duration::ZERO);
        }

        Ok(Duration::from_secs(playlist.target_duration))
    }

    fn track_staleness(&mut self, playlist: &MediaPlaylist) {
        if self.last_media_sequence == Some(playlist.media_sequence) {
            self.stale_count += 1;
        } else {
            self.stale_count = 0;
        }
        self.last_media_sequence = Some(playlist.media_sequence);
    }

    /// Fetches and parses the current playlist, refreshing the playlist URL
    /// between failed attempts (live playlist URLs rotate mid-broadcast).
    async fn fetch_playlist(&mut self) -> Result<(Playlist, Url), HlsError> {
        let mut last_error: Option<HlsError> = None;

        for attempt in 0..self.config.max_fetch_attempts {
            if self.token.is_cancelled() {
                return Err(HlsError::Cancelled);
            }

            let force = attempt > 0;
            let url = match self.current_url(force).await {
                Ok(url) => url,
                Err(e) => {
                    warn!(attempt, error = %e, "playlist URL refresh failed");
                    last_error = Some(e);
                    self.retry_pause().await?;
                    continue;
                }
            };

            match self.try_fetch(&url).await {
                Ok(playlist) => return Ok((playlist, url)),
                Err(e) if e.is_retryable() => {
                    warn!(attempt, url = %url, error = %e, "playlist fetch failed");
                    last_error = Some(e);
                    self.retry_pause().await?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(HlsError::PlaylistFetchExhausted {
            attempts: self.config.max_fetch_attempts,
            reason: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no attempts made".to_string()),
        })
    }

    async fn retry_pause(&self) -> Result<(), HlsError> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(HlsError::Cancelled),
            _ = tokio::time::sleep(self.config.fetch_retry_delay) => Ok(()),
        }
    }

    async fn current_url(&mut self, force_refresh: bool) -> Result<Url, HlsError> {
        let expired = self
            .url_deadline
            .is_none_or(|deadline| Instant::now() >= deadline);

        if !force_refresh
            && !expired
            && let Some(url) = &self.cached_url
        {
            return Ok(url.clone());
        }

        let raw = self.source.playlist_url(force_refresh).await?;
        let url = Url::parse(&raw).map_err(|e| HlsError::invalid_url(&raw, e.to_string()))?;
        debug!(url = %url, force_refresh, "resolved playlist URL");
        self.cached_url = Some(url.clone());
        self.url_deadline = Some(Instant::now() + self.config.url_ttl);
        Ok(url)
    }

    async fn try_fetch(&self, url: &Url) -> Result<Playlist, HlsError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(HlsError::http_status(status, url.as_str()));
        }
        let body = response.bytes().await?;
        parse_playlist_res(&body).map_err(|e| HlsError::playlist(format!("parse failed: {e}")))
    }
}

/// Resolves a segment URI (relative or absolute) against the playlist URL.
fn resolve_segment_uri(playlist_url: &Url, uri: &str) -> Result<String, HlsError> {
    playlist_url
        .join(uri)
        .map(|u| u.to_string())
        .map_err(|e| HlsError::invalid_url(uri, e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct FixedSource {
        urls: Vec<String>,
        next: AtomicUsize,
    }

    impl FixedSource {
        fn new(urls: Vec<String>) -> Arc<Self> {
            Arc::new(Self {
                urls,
                next: AtomicUsize::new(0),
            })
        }

        fn resolutions(&self) -> usize {
            self.next.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl PlaylistSource for FixedSource {
        async fn playlist_url(&self, _force_refresh: bool) -> Result<String, HlsError> {
            let index = self.next.fetch_add(1, Ordering::SeqCst);
            let index = index.min(self.urls.len() - 1);
            Ok(self.urls[index].clone())
        }
    }

    fn test_config() -> PollerConfig {
        PollerConfig {
            fetch_retry_delay: Duration::from_millis(1),
            poll_interval_cap: Some(Duration::from_millis(1)),
            ..PollerConfig::default()
        }
    }

    fn media_playlist(sequence: u64, uris: &[&str], closed: bool) -> String {
        let mut body = format!(
            "#EXTM3U\n#EXT-X-VERSION:3\n#EXT-X-TARGETDURATION:6\n#EXT-X-MEDIA-SEQUENCE:{sequence}\n"
        );
        for uri in uris {
            body.push_str(&format!("#EXTINF:6.0,\n{uri}\n"));
        }
        if closed {
            body.push_str("#EXT-X-ENDLIST\n");
        }
        body
    }

    async fn collect(mut rx: mpsc::Receiver<Segment>) -> Vec<String> {
        let mut urls = Vec::new();
        while let Some(segment) = rx.recv().await {
            urls.push(segment.url);
        }
        urls
    }

    #[tokio::test]
    async fn emits_segments_in_order_and_stops_on_endlist() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(media_playlist(1, &["u1.ts", "u2.ts", "u3.ts"], true)),
            )
            .mount(&server)
            .await;

        let source = FixedSource::new(vec![format!("{}/live.m3u8", server.uri())]);
        let poller = PlaylistPoller::new(
            reqwest::Client::new(),
            source,
            test_config(),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(10);
        let poll = tokio::spawn(poller.run(tx));
        let urls = collect(rx).await;
        poll.await.unwrap().unwrap();

        let base = server.uri();
        assert_eq!(
            urls,
            vec![
                format!("{base}/u1.ts"),
                format!("{base}/u2.ts"),
                format!("{base}/u3.ts"),
            ]
        );
    }

    #[tokio::test]
    async fn repeated_playlist_windows_emit_each_uri_once() {
        let server = MockServer::start().await;
        // First window: u1..u2. Second window overlaps: u2..u3, then ends.
        Mock::given(method("GET"))
            .and(path("/live.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(media_playlist(1, &["u1.ts", "u2.ts"], false)),
            )
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/live.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(media_playlist(2, &["u2.ts", "u3.ts"], true)),
            )
            .mount(&server)
            .await;

        let source = FixedSource::new(vec![format!("{}/live.m3u8", server.uri())]);
        let poller = PlaylistPoller::new(
            reqwest::Client::new(),
            source,
            test_config(),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(10);
        let poll = tokio::spawn(poller.run(tx));
        let urls = collect(rx).await;
        poll.await.unwrap().unwrap();

        let base = server.uri();
        assert_eq!(
            urls,
            vec![
                format!("{base}/u1.ts"),
                format!("{base}/u2.ts"),
                format!("{base}/u3.ts"),
            ]
        );
    }

    #[tokio::test]
    async fn stale_sequence_number_terminates_the_poll_loop() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(media_playlist(100, &["u1.ts", "u2.ts"], false)),
            )
            .mount(&server)
            .await;

        let source = FixedSource::new(vec![format!("{}/live.m3u8", server.uri())]);
        let poller = PlaylistPoller::new(
            reqwest::Client::new(),
            source,
            test_config(),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(10);
        let poll = tokio::spawn(poller.run(tx));
        let urls = collect(rx).await;
        // Terminates normally once the sequence number sits still too long.
        poll.await.unwrap().unwrap();

        assert_eq!(urls.len(), 2);
    }

    #[tokio::test]
    async fn rotated_playlist_url_is_refreshed_without_duplicates() {
        let server = MockServer::start().await;
        // Old URL serves one window, then starts rejecting.
        Mock::given(method("GET"))
            .and(path("/old.m3u8"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(media_playlist(1, &["u1.ts"], false)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/old.m3u8"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/new.m3u8"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(media_playlist(2, &["u1.ts", "u2.ts", "u3.ts"], true)),
            )
            .mount(&server)
            .await;

        let source = FixedSource::new(vec![
            format!("{}/old.m3u8", server.uri()),
            format!("{}/new.m3u8", server.uri()),
        ]);
        let handle = source.clone();
        let poller = PlaylistPoller::new(
            reqwest::Client::new(),
            source,
            test_config(),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(10);
        let poll = tokio::spawn(poller.run(tx));
        let urls = collect(rx).await;
        poll.await.unwrap().unwrap();

        let base = server.uri();
        assert_eq!(
            urls,
            vec![
                format!("{base}/u1.ts"),
                format!("{base}/u2.ts"),
                format!("{base}/u3.ts"),
            ]
        );
        assert_eq!(handle.resolutions(), 2);
    }

    #[tokio::test]
    async fn master_playlist_terminates_the_capture() {
        let server = MockServer::start().await;
        let master = "#EXTM3U\n#EXT-X-STREAM-INF:BANDWIDTH=1000000\nvariant.m3u8\n";
        Mock::given(method("GET"))
            .and(path("/live.m3u8"))
            .respond_with(ResponseTemplate::new(200).set_body_string(master))
            .mount(&server)
            .await;

        let source = FixedSource::new(vec![format!("{}/live.m3u8", server.uri())]);
        let poller = PlaylistPoller::new(
            reqwest::Client::new(),
            source,
            test_config(),
            CancellationToken::new(),
        );

        let (tx, rx) = mpsc::channel(10);
        let poll = tokio::spawn(poller.run(tx));
        let urls = collect(rx).await;
        poll.await.unwrap().unwrap();
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn cancellation_closes_the_segment_stream() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/live.m3u8"))
            .respond_with(
                ResponseTemplate::new(200).set_body_string(media_playlist(1, &["u1.ts"], false)),
            )
            .mount(&server)
            .await;

        let source = FixedSource::new(vec![format!("{}/live.m3u8", server.uri())]);
        let token = CancellationToken::new();
        let poller = PlaylistPoller::new(
            reqwest::Client::new(),
            source,
            test_config(),
            token.clone(),
        );

        let (tx, mut rx) = mpsc::channel(10);
        let poll = tokio::spawn(poller.run(tx));
        assert!(rx.recv().await.is_some());
        token.cancel();
        // Stream must close in finite time after cancellation.
        while rx.recv().await.is_some() {}
        poll.await.unwrap().unwrap();
    }
}
