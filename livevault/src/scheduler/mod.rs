//! Recording scheduler: owns the lifecycle of every capture job.
//!
//! One job per broadcast ID at a time, enforced by the job table. A job
//! waits for its fire time, converges on postponed start times, polls the
//! resolver until the broadcast is actually live, records, and reports the
//! result back into the catalog. The scheduler is the only component that
//! mutates the catalog on behalf of a capture, so partial state from a
//! failed job never becomes visible.
//!
//! Per-job state machine:
//!
//! ```text
//! PLANNED -> (fire at start) -> PRE_START_POLL
//!                            |- playlist resolved -> RECORDING
//!                            |- start moved far out -> PLANNED (new fire time)
//!                            '- retries exhausted -> FAILED (row deleted)
//! RECORDING -> upload done -> FINALIZING -> catalog update -> DONE
//! RECORDING -> fatal error -> FAILED (row deleted unless bytes were archived)
//! ```

use crate::capture::{CaptureConfig, CaptureJob, CaptureRequest};
use crate::catalog::{Broadcast, Catalog, CatalogError, NewBroadcast};
use crate::feeder::{
    ChannelAllowlist, LiveState, MetadataProvider, archive_thumbnail, watch_url,
};
use crate::{Error, Result};
use blobstore::BlobStore;
use chrono::{DateTime, Utc};
use media_resolver::{MediaUrlResolver, parse_broadcast_id};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Default pre-start poll cadence: once a minute for up to two hours.
const DEFAULT_PRE_START_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_PRE_START_MAX_ATTEMPTS: u32 = 120;

/// Default delay before re-checking a broadcast whose start moved far out.
const DEFAULT_RESCHEDULE_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Planned,
    PreStart,
    Recording,
    Finalizing,
    Done,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ScheduleRequest {
    pub broadcast_id: String,
    pub broadcast_url: String,
    /// Requested quality code; non-positive selects the best offered.
    pub quality: i32,
    /// The job fires no earlier than this.
    pub start: DateTime<Utc>,
}

/// Handle returned by [`Scheduler::schedule`]; re-scheduling an already
/// known broadcast returns a handle to the existing job.
#[derive(Debug, Clone)]
pub struct ScheduledJob {
    pub broadcast_id: String,
    pub state: watch::Receiver<JobState>,
}

#[derive(Clone)]
pub struct SchedulerConfig {
    pub pre_start_interval: Duration,
    pub pre_start_max_attempts: u32,
    pub reschedule_delay: Duration,
    pub capture: CaptureConfig,
}

impl SchedulerConfig {
    pub fn new(capture: CaptureConfig) -> Self {
        Self {
            pre_start_interval: DEFAULT_PRE_START_INTERVAL,
            pre_start_max_attempts: DEFAULT_PRE_START_MAX_ATTEMPTS,
            reschedule_delay: DEFAULT_RESCHEDULE_DELAY,
            capture,
        }
    }

    /// A start further out than the whole pre-start budget is not worth
    /// burning retries on; the job re-plans itself instead.
    pub fn reschedule_threshold(&self) -> Duration {
        self.pre_start_interval * self.pre_start_max_attempts
    }
}

struct JobEntry {
    tag: Arc<Mutex<String>>,
    cancel: CancellationToken,
    state: watch::Receiver<JobState>,
}

pub struct Scheduler {
    catalog: Arc<dyn Catalog>,
    resolver: Arc<dyn MediaUrlResolver>,
    metadata: Arc<dyn MetadataProvider>,
    allowlist: Arc<dyn ChannelAllowlist>,
    blobs: Arc<dyn BlobStore>,
    client: reqwest::Client,
    config: SchedulerConfig,
    jobs: Mutex<HashMap<String, JobEntry>>,
    shutdown: CancellationToken,
    download_base_url: Option<String>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        catalog: Arc<dyn Catalog>,
        resolver: Arc<dyn MediaUrlResolver>,
        metadata: Arc<dyn MetadataProvider>,
        allowlist: Arc<dyn ChannelAllowlist>,
        blobs: Arc<dyn BlobStore>,
        client: reqwest::Client,
        config: SchedulerConfig,
        download_base_url: Option<String>,
    ) -> Arc<Self> {
        Arc::new(Self {
            catalog,
            resolver,
            metadata,
            allowlist,
            blobs,
            client,
            config,
            jobs: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            download_base_url,
        })
    }

    /// Schedules a capture job. Idempotent per broadcast ID: a second call
    /// while a job is planned or running returns the existing handle.
    pub fn schedule(self: &Arc<Self>, request: ScheduleRequest) -> ScheduledJob {
        let mut jobs = self.jobs.lock();
        if let Some(entry) = jobs.get(&request.broadcast_id) {
            return ScheduledJob {
                broadcast_id: request.broadcast_id,
                state: entry.state.clone(),
            };
        }

        let (state_tx, state_rx) = watch::channel(JobState::Planned);
        let cancel = self.shutdown.child_token();
        let tag = Arc::new(Mutex::new(request.broadcast_id.clone()));
        jobs.insert(
            request.broadcast_id.clone(),
            JobEntry {
                tag: tag.clone(),
                cancel: cancel.clone(),
                state: state_rx.clone(),
            },
        );
        drop(jobs);

        info!(
            broadcast_id = %request.broadcast_id,
            start = %request.start.to_rfc3339(),
            quality = request.quality,
            "scheduled capture job"
        );

        let broadcast_id = request.broadcast_id.clone();
        let scheduler = self.clone();
        let job_id = broadcast_id.clone();
        tokio::spawn(async move {
            scheduler.run_job(request, tag, state_tx, cancel).await;
            scheduler.jobs.lock().remove(&job_id);
        });

        ScheduledJob {
            broadcast_id,
            state: state_rx,
        }
    }

    /// Submit entry point: records the submitter and makes sure exactly one
    /// job exists for the broadcast. Both first and repeat submissions
    /// return the catalog row.
    pub async fn submit(
        self: &Arc<Self>,
        broadcast_url: &str,
        quality: i32,
        submitter: &str,
    ) -> Result<Broadcast> {
        let broadcast_id = parse_broadcast_id(broadcast_url).map_err(|_| {
            Error::Validation(format!(
                "cannot parse a broadcast id out of `{broadcast_url}`"
            ))
        })?;

        if let Some(existing) = self.catalog.find_by_id(&broadcast_id).await? {
            let row = self
                .catalog
                .append_submitter(&broadcast_id, submitter, existing.start)
                .await?;
            self.schedule(ScheduleRequest {
                broadcast_id,
                broadcast_url: broadcast_url.to_string(),
                quality,
                start: row.start,
            });
            return Ok(row);
        }

        let info = self.metadata.broadcast_info(&broadcast_id).await?;
        if info.state == LiveState::Ended {
            return Err(Error::Validation("broadcast has already ended".to_string()));
        }
        if !self.allowlist.is_allowed(&info.channel_id).await? {
            return Err(Error::Validation(
                "channel is not allowed for archiving".to_string(),
            ));
        }

        let start = info.scheduled_start.unwrap_or_else(Utc::now);
        let thumbnail = archive_thumbnail(
            &self.client,
            self.blobs.as_ref(),
            self.download_base_url.as_deref(),
            &broadcast_id,
            info.thumbnail_url.as_deref(),
        )
        .await;

        let row = match self
            .catalog
            .insert_broadcast(NewBroadcast {
                id: broadcast_id.clone(),
                submitter: submitter.to_string(),
                start,
                title: info.title,
                channel_name: info.channel_name,
                channel_id: info.channel_id,
                thumbnail,
            })
            .await
        {
            Ok(row) => row,
            // Lost a race with another submission: record the submitter on
            // the row that won.
            Err(CatalogError::AlreadyExists { .. }) => {
                self.catalog
                    .append_submitter(&broadcast_id, submitter, start)
                    .await?
            }
            Err(error) => return Err(error.into()),
        };

        self.schedule(ScheduleRequest {
            broadcast_id,
            broadcast_url: broadcast_url.to_string(),
            quality,
            start,
        });
        Ok(row)
    }

    /// Restart-on-boot: every unfinished catalog row gets its job back, as
    /// if newly submitted. The requested quality is not persisted, so
    /// resumed jobs record at auto-best.
    pub async fn resume_unfinished(self: &Arc<Self>) -> Result<usize> {
        let rows = self.catalog.list_unfinished().await?;
        let count = rows.len();
        for row in rows {
            self.schedule(ScheduleRequest {
                broadcast_id: row.id.clone(),
                broadcast_url: watch_url(&row.id),
                quality: 0,
                start: row.start,
            });
        }
        info!(count, "rescheduled unfinished broadcasts");
        Ok(count)
    }

    pub fn job_state(&self, broadcast_id: &str) -> Option<JobState> {
        self.jobs
            .lock()
            .get(broadcast_id)
            .map(|entry| *entry.state.borrow())
    }

    pub fn job_tag(&self, broadcast_id: &str) -> Option<String> {
        self.jobs
            .lock()
            .get(broadcast_id)
            .map(|entry| entry.tag.lock().clone())
    }

    pub fn active_jobs(&self) -> usize {
        self.jobs.lock().len()
    }

    /// Cancels every job; their cancellation cascades through the capture
    /// pipelines.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn cancel_job(&self, broadcast_id: &str) -> bool {
        let jobs = self.jobs.lock();
        match jobs.get(broadcast_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    async fn run_job(
        self: &Arc<Self>,
        request: ScheduleRequest,
        tag: Arc<Mutex<String>>,
        state_tx: watch::Sender<JobState>,
        cancel: CancellationToken,
    ) {
        let broadcast_id = request.broadcast_id.clone();
        let mut fire_at = request.start;

        // PLANNED: wait for the fire time, deferring as long as the
        // announced start keeps moving beyond the whole pre-start budget.
        loop {
            if !wait_until(fire_at, &cancel).await {
                info!(broadcast_id = %broadcast_id, "job cancelled before start");
                return;
            }

            match self.far_future_start(&broadcast_id).await {
                Some(announced) => {
                    *tag.lock() = format!("Reschedule:{broadcast_id}");
                    fire_at = Utc::now()
                        + chrono::Duration::from_std(self.config.reschedule_delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(60));
                    info!(
                        broadcast_id = %broadcast_id,
                        announced = %announced.to_rfc3339(),
                        next_check = %fire_at.to_rfc3339(),
                        "start moved far out, re-planning"
                    );
                }
                None => break,
            }
        }

        // PRE_START_POLL: the broadcast is due; wait for it to actually go
        // live.
        state_tx.send_replace(JobState::PreStart);
        let mut attempts: u32 = 0;
        loop {
            match self
                .resolver
                .media_playlist(&request.broadcast_url, request.quality)
                .await
            {
                Ok(_) => break,
                Err(error) if error.is_retryable() => {
                    attempts += 1;
                    if attempts >= self.config.pre_start_max_attempts {
                        warn!(
                            broadcast_id = %broadcast_id,
                            attempts,
                            "broadcast never went live, giving up"
                        );
                        self.discard(&broadcast_id).await;
                        state_tx.send_replace(JobState::Failed);
                        return;
                    }
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            info!(broadcast_id = %broadcast_id, "job cancelled during pre-start poll");
                            return;
                        }
                        _ = tokio::time::sleep(self.config.pre_start_interval) => {}
                    }
                }
                Err(error) => {
                    warn!(broadcast_id = %broadcast_id, %error, "resolver failed, abandoning job");
                    self.discard(&broadcast_id).await;
                    state_tx.send_replace(JobState::Failed);
                    return;
                }
            }
        }

        // RECORDING
        state_tx.send_replace(JobState::Recording);
        let capture = CaptureJob::new(
            CaptureRequest {
                broadcast_id: broadcast_id.clone(),
                broadcast_url: request.broadcast_url.clone(),
                quality: request.quality,
            },
            self.client.clone(),
            self.resolver.clone(),
            self.blobs.clone(),
            self.config.capture.clone(),
            cancel.clone(),
        );

        match capture.run().await {
            Ok(outcome) => {
                state_tx.send_replace(JobState::Finalizing);
                let seconds = i32::try_from(outcome.duration.as_secs()).unwrap_or(i32::MAX);
                match self
                    .catalog
                    .mark_finished(&broadcast_id, outcome.bytes as i64, seconds)
                    .await
                {
                    Ok(_) => {
                        info!(
                            broadcast_id = %broadcast_id,
                            bytes = outcome.bytes,
                            "broadcast archived"
                        );
                        state_tx.send_replace(JobState::Done);
                    }
                    Err(error) => {
                        warn!(broadcast_id = %broadcast_id, %error, "failed to finalize catalog row");
                        state_tx.send_replace(JobState::Failed);
                    }
                }
            }
            Err(failure) => {
                warn!(
                    broadcast_id = %broadcast_id,
                    error = %failure.error,
                    uploaded_bytes = failure.uploaded_bytes,
                    "capture failed"
                );
                if failure.uploaded_bytes == 0 {
                    self.discard(&broadcast_id).await;
                } else {
                    // Bytes reached the blob store; keep the row so an
                    // operator can re-submit or clean up deliberately.
                    warn!(
                        broadcast_id = %broadcast_id,
                        "keeping catalog row for partially archived broadcast"
                    );
                }
                state_tx.send_replace(JobState::Failed);
            }
        }
    }

    /// Returns the announced start when it sits beyond the reschedule
    /// threshold, meaning the job should go back to PLANNED.
    async fn far_future_start(&self, broadcast_id: &str) -> Option<DateTime<Utc>> {
        let info = match self.metadata.broadcast_info(broadcast_id).await {
            Ok(info) => info,
            Err(error) => {
                warn!(broadcast_id, %error, "metadata unavailable, keeping fire time");
                return None;
            }
        };

        let announced = info.scheduled_start?;
        let threshold = chrono::Duration::from_std(self.config.reschedule_threshold())
            .unwrap_or_else(|_| chrono::Duration::hours(2));
        (announced > Utc::now() + threshold).then_some(announced)
    }

    /// Removes the row of a broadcast that never produced archived bytes.
    async fn discard(&self, broadcast_id: &str) {
        if let Err(error) = self.catalog.delete(broadcast_id).await {
            warn!(broadcast_id, %error, "failed to delete catalog row");
        }
    }
}

/// Sleeps until the wall-clock instant; false when cancelled first.
async fn wait_until(fire_at: DateTime<Utc>, cancel: &CancellationToken) -> bool {
    let now = Utc::now();
    if fire_at <= now {
        return true;
    }
    let delay = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}
