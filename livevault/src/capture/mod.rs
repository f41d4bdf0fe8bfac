//! One capture: the per-broadcast pipeline that turns a live playlist into
//! a single object in the blob store.
//!
//! Four cooperating tasks share the job: the poll task discovers segments,
//! the fetch task streams their bytes into the remuxer's stdin, the
//! mux-copy task moves the remuxer's stdout into an in-memory pipe, and
//! the upload task streams that pipe into object storage. Termination is a
//! cascade rooted at the segment channel closing; no task outlives the job.

use crate::Error;
use blobstore::{BlobError, BlobStore};
use hls_capture::{HlsError, PlaylistPoller, PlaylistSource, PollerConfig, Segment, copy_segments};
use media_resolver::MediaUrlResolver;
use async_trait::async_trait;
use remux::{RemuxError, RemuxSpec, RingLog, parse_last_duration};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Capacity of the segment descriptor channel. A slow fetcher blocks the
/// poller; the poller never runs ahead of what is being ingested.
const SEGMENT_CHANNEL_CAPACITY: usize = 10;

/// What a capture was asked to record.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub broadcast_id: String,
    pub broadcast_url: String,
    /// Requested quality code; non-positive selects the best offered.
    pub quality: i32,
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub remux: RemuxSpec,
    pub poller: PollerConfig,
    /// Lines kept from the remuxer's stderr.
    pub log_capacity: usize,
    /// In-memory pipe size between the remuxer output and the uploader.
    pub pipe_capacity: usize,
}

impl CaptureConfig {
    pub fn new(remux: RemuxSpec) -> Self {
        Self {
            remux,
            poller: PollerConfig::default(),
            log_capacity: 512,
            pipe_capacity: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CaptureOutcome {
    /// Bytes of the finished object in the blob store.
    pub bytes: u64,
    /// Duration scraped from the remuxer diagnostics; zero when absent.
    pub duration: Duration,
    /// Segments lost to non-200 responses or short bodies.
    pub failed_segments: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("remuxer failed: {0}")]
    Remux(#[from] RemuxError),

    #[error("segment pipeline failed: {0}")]
    Hls(#[from] HlsError),

    #[error("remuxed stream copy failed: {0}")]
    MuxCopy(#[source] std::io::Error),

    #[error("upload failed: {0}")]
    Upload(#[from] BlobError),

    #[error("capture task aborted: {0}")]
    TaskAborted(String),
}

/// A failed capture still reports how many bytes reached the blob store;
/// the scheduler keeps the catalog row when the object is partially there.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct CaptureFailure {
    #[source]
    pub error: CaptureError,
    pub uploaded_bytes: u64,
}

impl From<CaptureFailure> for Error {
    fn from(failure: CaptureFailure) -> Self {
        Error::Capture(failure.error)
    }
}

/// Bridges the capture pipeline to the resolver: the poller only ever asks
/// "where does the playlist live right now?".
struct ResolvedPlaylist {
    resolver: Arc<dyn MediaUrlResolver>,
    broadcast_url: String,
    quality: i32,
}

#[async_trait]
impl PlaylistSource for ResolvedPlaylist {
    async fn playlist_url(&self, _force_refresh: bool) -> Result<String, HlsError> {
        self.resolver
            .media_playlist(&self.broadcast_url, self.quality)
            .await
            .map_err(|e| HlsError::url_resolve(e.to_string()))
    }
}

pub struct CaptureJob {
    request: CaptureRequest,
    client: reqwest::Client,
    resolver: Arc<dyn MediaUrlResolver>,
    blobs: Arc<dyn BlobStore>,
    config: CaptureConfig,
    token: CancellationToken,
    log: Arc<RingLog>,
}

impl CaptureJob {
    pub fn new(
        request: CaptureRequest,
        client: reqwest::Client,
        resolver: Arc<dyn MediaUrlResolver>,
        blobs: Arc<dyn BlobStore>,
        config: CaptureConfig,
        token: CancellationToken,
    ) -> Self {
        let log = Arc::new(RingLog::new(config.log_capacity));
        Self {
            request,
            client,
            resolver,
            blobs,
            config,
            token,
            log,
        }
    }

    /// The remuxer diagnostics buffer; readable while the job runs.
    pub fn log(&self) -> Arc<RingLog> {
        self.log.clone()
    }

    pub async fn run(self) -> Result<CaptureOutcome, CaptureFailure> {
        let broadcast_id = self.request.broadcast_id.clone();
        info!(broadcast_id = %broadcast_id, "starting capture");

        let mut remuxer = self
            .config
            .remux
            .spawn(self.log.clone())
            .map_err(|e| CaptureFailure {
                error: CaptureError::Remux(e),
                uploaded_bytes: 0,
            })?;
        let stdin = remuxer.take_stdin().expect("fresh remuxer has stdin");
        let mut stdout = remuxer.take_stdout().expect("fresh remuxer has stdout");

        let source = Arc::new(ResolvedPlaylist {
            resolver: self.resolver.clone(),
            broadcast_url: self.request.broadcast_url.clone(),
            quality: self.request.quality,
        });

        let (segment_tx, segment_rx) = mpsc::channel::<Segment>(SEGMENT_CHANNEL_CAPACITY);
        let poller = PlaylistPoller::new(
            self.client.clone(),
            source,
            self.config.poller.clone(),
            self.token.clone(),
        );

        let poll_task = tokio::spawn(poller.run(segment_tx));
        let fetch_task = tokio::spawn(copy_segments(segment_rx, stdin, self.client.clone()));

        let (mut pipe_writer, mut pipe_reader) = tokio::io::duplex(self.config.pipe_capacity);
        let mux_copy_task: JoinHandle<std::io::Result<u64>> = tokio::spawn(async move {
            let copied = tokio::io::copy(&mut stdout, &mut pipe_writer).await?;
            // EOF to the uploader before the byte count is ever read.
            pipe_writer.shutdown().await?;
            Ok(copied)
        });

        let blobs = self.blobs.clone();
        let object_key = format!("{broadcast_id}.mp4");
        let upload_task: JoinHandle<Result<u64, BlobError>> = tokio::spawn(async move {
            blobs
                .put_stream(&object_key, &mut pipe_reader, "video/mp4")
                .await
        });

        let poll_result = flatten(poll_task.await);
        let fetch_result = flatten(fetch_task.await);
        let mux_result = flatten(mux_copy_task.await);
        // The upload completes last: it only finishes once the pipe writer
        // closed, which in turn requires the remuxer to have exited.
        let upload_result = flatten(upload_task.await);

        if let Err(error) = remuxer.wait().await {
            warn!(broadcast_id = %broadcast_id, %error, "remuxer wait failed");
        }

        let uploaded_bytes = *upload_result.as_ref().ok().unwrap_or(&0);
        let fail = |error: CaptureError| CaptureFailure {
            error,
            uploaded_bytes,
        };

        poll_result.map_err(|e| fail(e))?;
        let report = fetch_result.map_err(|e| fail(e))?;
        mux_result.map_err(|e| fail(e))?;
        let bytes = upload_result.map_err(|e| fail(e))?;

        let duration = match parse_last_duration(&self.log.contents()) {
            Some(duration) => duration,
            None => {
                warn!(broadcast_id = %broadcast_id, "no duration in remuxer log");
                Duration::ZERO
            }
        };

        // Detached: the scheduler gets the result without waiting on the
        // log object.
        self.spawn_log_upload(&broadcast_id);

        info!(
            broadcast_id = %broadcast_id,
            bytes,
            ?duration,
            failed_segments = report.failed,
            "capture finished"
        );
        Ok(CaptureOutcome {
            bytes,
            duration,
            failed_segments: report.failed,
        })
    }

    /// Archives the remuxer diagnostics next to the video, off the job's
    /// critical path. The first three lines are the process banner, not
    /// capture output.
    fn spawn_log_upload(&self, broadcast_id: &str) {
        let blobs = self.blobs.clone();
        let log = self.log.clone();
        let broadcast_id = broadcast_id.to_string();
        tokio::spawn(async move {
            let contents = log.contents();
            let trimmed: Vec<&str> = contents.lines().skip(3).collect();
            let body = trimmed.join("\n");
            let key = format!("{broadcast_id}.log");
            if let Err(error) = blobs.put_bytes(&key, body.as_bytes(), "text/plain").await {
                warn!(broadcast_id = %broadcast_id, %error, "failed to upload remuxer log");
            }
        });
    }
}

fn flatten<T, E>(joined: Result<Result<T, E>, tokio::task::JoinError>) -> Result<T, CaptureError>
where
    E: Into<CaptureError>,
{
    match joined {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(error)) => Err(error.into()),
        Err(join_error) => Err(CaptureError::TaskAborted(join_error.to_string())),
    }
}

impl From<std::io::Error> for CaptureError {
    fn from(error: std::io::Error) -> Self {
        CaptureError::MuxCopy(error)
    }
}
