//! Bounded pool of conversion workers.
//!
//! Each worker loops: claim the next ready job, run the transcoder under a
//! heartbeat and a wall-clock budget, then record the outcome. A separate
//! maintenance task requeues stalled jobs and enforces retention. Workers
//! never crash on a job failure; they log it and go back to the queue.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tq_av::{remove_if_exists, ProgressFn, TranscodeOutput};
use tq_core::events::EventPayload;
use tq_core::{
    ConversionJob, ConversionJobId, ConversionStatus, Error, FailureDisposition, JobLease,
    JobResult, LeasedJob, MediaId, MediaUpdate, Result, StallReport,
};
use uuid::Uuid;

use crate::context::QueueContext;
use crate::controller::QueueController;
use crate::finalize::{sync_after_terminal, sync_media, with_retries};

/// How often terminal jobs beyond the retention counts are pruned.
const RETENTION_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10 * 60);

/// A job currently being executed by this process.
#[derive(Debug, Clone, PartialEq)]
pub struct InFlightJob {
    pub job_id: ConversionJobId,
    pub media_id: MediaId,
    pub worker: String,
    pub attempt: u32,
    pub progress: u8,
    pub started_at: DateTime<Utc>,
    /// Where this attempt writes its output.
    pub output: PathBuf,
    pub lease: JobLease,
}

type InFlight = Arc<DashMap<ConversionJobId, InFlightJob>>;

/// Fixed-size pool of workers draining the job store.
pub struct WorkerPool {
    ctx: QueueContext,
    cancel: CancellationToken,
    tasks: Mutex<Option<JoinSet<()>>>,
    in_flight: InFlight,
}

impl WorkerPool {
    pub fn new(ctx: QueueContext) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(None),
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn context(&self) -> &QueueContext {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.tasks.lock().is_some()
    }

    /// Snapshot of the jobs this pool is executing right now.
    pub fn in_flight(&self) -> Vec<InFlightJob> {
        self.in_flight.iter().map(|e| e.value().clone()).collect()
    }

    /// Recover leftovers from a previous run, then spawn the workers and the
    /// maintenance task.
    ///
    /// Fails with [`Error::Conflict`] if the pool was already started or has
    /// been shut down.
    pub async fn start(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Conflict("worker pool has been shut down".into()));
        }
        if self.is_running() {
            return Err(Error::Conflict("worker pool already started".into()));
        }

        match QueueController::new(self.ctx.clone()).reconcile().await {
            Ok(0) => {}
            Ok(n) => tracing::info!(count = n, "Reconciled media records of finished jobs"),
            Err(e) => tracing::warn!("Reconcile failed, will retry on next start: {e}"),
        }
        if let Err(e) = recover_stalled(&self.ctx).await {
            tracing::warn!("Initial stall sweep failed: {e}");
        }

        let concurrency = self.ctx.config.queue.concurrency;
        let instance = Uuid::new_v4().simple().to_string();

        let mut guard = self.tasks.lock();
        if guard.is_some() {
            return Err(Error::Conflict("worker pool already started".into()));
        }
        let mut set = JoinSet::new();
        for i in 0..concurrency {
            let worker_id = format!("worker-{}-{i}", &instance[..8]);
            set.spawn(run_worker(
                self.ctx.clone(),
                worker_id,
                self.cancel.clone(),
                self.in_flight.clone(),
            ));
        }
        set.spawn(run_maintenance(self.ctx.clone(), self.cancel.clone()));
        *guard = Some(set);

        tracing::info!(workers = concurrency, "Worker pool started");
        Ok(())
    }

    /// Stop dequeuing and wait for in-flight jobs.
    ///
    /// Jobs still running after `shutdown_grace` are aborted and released
    /// back to `waiting`; the interrupted attempt resumes on the next start
    /// without counting as a stall or a new attempt.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.ctx.wake.notify_waiters();

        let Some(mut set) = self.tasks.lock().take() else {
            return;
        };

        let grace = self.ctx.config.queue.shutdown_grace();
        let drained = tokio::time::timeout(grace, drain(&mut set)).await;
        if drained.is_err() {
            let abandoned: Vec<String> = self.in_flight.iter().map(|e| e.key().to_string()).collect();
            tracing::warn!(
                count = abandoned.len(),
                jobs = ?abandoned,
                "Shutdown grace elapsed; aborting in-flight jobs"
            );
            set.abort_all();
            drain(&mut set).await;
            self.release_in_flight().await;
        }

        tracing::info!("Worker pool stopped");
    }
}

impl WorkerPool {
    /// Give the leases of aborted jobs back to the store.
    ///
    /// A failed release leaves the row `active`; stall recovery picks it up
    /// on the next start. Outputs are only removed for released jobs, since a
    /// job that completed before the abort already owns its file.
    async fn release_in_flight(&self) {
        let aborted: Vec<InFlightJob> = self.in_flight.iter().map(|e| e.value().clone()).collect();
        self.in_flight.clear();

        for job in aborted {
            match self.ctx.jobs.release(&job.lease) {
                Ok(true) => {
                    discard_output(&job.output).await;
                    tracing::info!(
                        job_id = %job.job_id,
                        attempt = job.attempt,
                        "Released interrupted job; it resumes on next start"
                    );
                }
                Ok(false) => tracing::debug!(job_id = %job.job_id, "Job settled before release"),
                Err(e) => tracing::warn!(
                    job_id = %job.job_id,
                    "Could not release job, left for stall recovery: {e}"
                ),
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("running", &self.is_running())
            .field("in_flight", &self.in_flight.len())
            .finish_non_exhaustive()
    }
}

async fn drain(set: &mut JoinSet<()>) {
    while let Some(res) = set.join_next().await {
        if let Err(e) = res {
            if e.is_panic() {
                tracing::error!("Worker task panicked: {e}");
            }
        }
    }
}

/// Requeue stalled jobs, failing those over the stall limit, and broadcast
/// what happened.
pub async fn recover_stalled(ctx: &QueueContext) -> Result<StallReport> {
    let report = ctx.jobs.detect_stalled(ctx.config.queue.stall_timeout())?;

    for job_id in &report.requeued {
        tracing::warn!(job_id = %job_id, "Job stalled; requeued without consuming an attempt");
        ctx.event_bus
            .broadcast(EventPayload::ConversionStalled { job_id: *job_id });
    }

    for job in &report.failed {
        let reason = job.failed_reason.clone().unwrap_or_default();
        tracing::error!(job_id = %job.id, media_id = %job.media_id, "Job failed after stalling: {reason}");
        ctx.event_bus
            .broadcast(EventPayload::ConversionStalled { job_id: job.id });
        ctx.event_bus.broadcast(EventPayload::ConversionFailed {
            job_id: job.id,
            media_id: job.media_id,
            error: reason,
        });
        if let Err(e) = sync_media(ctx, job).await {
            tracing::warn!(job_id = %job.id, "Media record not updated, left for reconcile: {e}");
        }
    }

    if !report.requeued.is_empty() {
        ctx.wake_workers();
    }
    Ok(report)
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

async fn run_worker(ctx: QueueContext, worker_id: String, cancel: CancellationToken, in_flight: InFlight) {
    tracing::debug!(worker = %worker_id, "Worker started");
    let poll = ctx.config.queue.poll_interval();

    loop {
        if cancel.is_cancelled() {
            break;
        }

        match ctx.jobs.dequeue_next(&worker_id) {
            Ok(Some(leased)) => {
                run_isolated(&ctx, &worker_id, leased, &in_flight).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(worker = %worker_id, "Dequeue failed: {e}"),
        }

        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = ctx.wake.notified() => {}
            _ = cancel.cancelled() => break,
        }
    }

    tracing::debug!(worker = %worker_id, "Worker stopped");
}

async fn run_maintenance(ctx: QueueContext, cancel: CancellationToken) {
    let queue = &ctx.config.queue;
    let sweep_every = (queue.stall_timeout() / 2).max(std::time::Duration::from_secs(1));

    let mut stall_tick = tokio::time::interval_at(Instant::now() + sweep_every, sweep_every);
    stall_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut retention_tick = tokio::time::interval(RETENTION_INTERVAL);
    retention_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = stall_tick.tick() => {
                if let Err(e) = recover_stalled(&ctx).await {
                    tracing::warn!("Stall sweep failed: {e}");
                }
            }
            _ = retention_tick.tick() => {
                match ctx.jobs.prune_retention(queue.keep_completed, queue.keep_failed) {
                    Ok(0) => {}
                    Ok(n) => tracing::info!(removed = n, "Pruned finished jobs beyond retention"),
                    Err(e) => tracing::warn!("Retention pruning failed: {e}"),
                }
            }
        }
    }
}

/// Run one job on its own task so a panic in the transcoder fails the
/// attempt instead of the worker. Dropping the handle aborts the job, which
/// is how shutdown reaches it.
async fn run_isolated(ctx: &QueueContext, worker_id: &str, leased: LeasedJob, in_flight: &InFlight) {
    let job = leased.job.clone();
    let lease = leased.lease.clone();
    let output = output_path_for(&ctx.config.transcoder.output_dir);

    let handle = AbortOnDropHandle::new(tokio::spawn(process_job(
        ctx.clone(),
        worker_id.to_string(),
        leased,
        output.clone(),
        in_flight.clone(),
    )));

    if let Err(e) = handle.await {
        if e.is_panic() {
            tracing::error!(job_id = %job.id, worker = %worker_id, "Conversion task panicked");
            discard_output(&output).await;
            on_failure(ctx, &job, &lease, Error::Internal(format!("conversion task panicked: {e}"))).await;
            in_flight.remove(&job.id);
        }
    }
}

async fn process_job(
    ctx: QueueContext,
    worker_id: String,
    leased: LeasedJob,
    output: PathBuf,
    in_flight: InFlight,
) {
    let ctx = &ctx;
    let in_flight = &in_flight;
    let LeasedJob { job, lease } = leased;
    let job_id = job.id;

    tracing::info!(
        job_id = %job_id,
        media_id = %job.media_id,
        attempt = job.attempts_made,
        max_attempts = job.max_attempts,
        worker = %worker_id,
        "Processing conversion job"
    );
    in_flight.insert(
        job_id,
        InFlightJob {
            job_id,
            media_id: job.media_id,
            worker: worker_id.to_string(),
            attempt: job.attempts_made,
            progress: 0,
            started_at: Utc::now(),
            output: output.clone(),
            lease: lease.clone(),
        },
    );
    ctx.event_bus.broadcast(EventPayload::ConversionStarted {
        job_id,
        media_id: job.media_id,
        attempt: job.attempts_made,
    });

    match run_attempt(ctx, &job, &lease, &output, in_flight).await {
        Ok(output) => on_success(ctx, &job, &lease, output).await,
        Err(e) => on_failure(ctx, &job, &lease, e).await,
    }

    in_flight.remove(&job_id);
}

/// Fresh, collision-free output location for one attempt.
fn output_path_for(output_dir: &Path) -> PathBuf {
    output_dir.join(format!("{}.mp4", Uuid::new_v4()))
}

async fn discard_output(path: &Path) {
    if let Err(e) = remove_if_exists(path).await {
        tracing::warn!(path = %path.display(), "Failed to remove output file: {e}");
    }
}

async fn run_attempt(
    ctx: &QueueContext,
    job: &ConversionJob,
    lease: &JobLease,
    output: &Path,
    in_flight: &InFlight,
) -> Result<TranscodeOutput> {
    let processing = MediaUpdate::status(ConversionStatus::Processing);
    if ctx.media.update(job.media_id, &processing)?.is_none() {
        return Err(Error::not_found("media", job.media_id));
    }

    if !tokio::fs::try_exists(&job.input_path).await? {
        return Err(Error::missing_input(&job.input_path));
    }

    let result = supervise_conversion(ctx, job, lease, output, in_flight).await;
    if result.is_err() {
        discard_output(output).await;
    }
    result
}

/// Drive the transcoder while forwarding progress, sending heartbeats and
/// enforcing the per-attempt timeout. Returning drops the conversion future,
/// which kills the encoder.
async fn supervise_conversion(
    ctx: &QueueContext,
    job: &ConversionJob,
    lease: &JobLease,
    output: &Path,
    in_flight: &InFlight,
) -> Result<TranscodeOutput> {
    let queue = &ctx.config.queue;

    let (progress_tx, mut progress_rx) = watch::channel(0u8);
    let on_progress: ProgressFn = Arc::new(move |pct: u8| {
        progress_tx.send_if_modified(|current| {
            if pct > *current {
                *current = pct;
                true
            } else {
                false
            }
        });
    });

    let mut convert = ctx.transcoder.convert(&job.input_path, output, on_progress);

    let deadline = tokio::time::sleep(queue.job_timeout());
    tokio::pin!(deadline);

    let beat = queue.heartbeat_interval();
    let mut heartbeat = tokio::time::interval_at(Instant::now() + beat, beat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            result = &mut convert => return result,
            _ = &mut deadline => {
                return Err(Error::Timeout(format!(
                    "conversion exceeded {}s",
                    queue.job_timeout().as_secs()
                )));
            }
            Ok(()) = progress_rx.changed() => {
                let pct = *progress_rx.borrow_and_update();
                record_progress(ctx, job, lease, pct, in_flight);
            }
            _ = heartbeat.tick() => {
                match ctx.jobs.heartbeat(lease) {
                    Ok(true) => {}
                    Ok(false) => {
                        return Err(Error::Conflict(format!("lease on job {} was lost", job.id)));
                    }
                    Err(e) => tracing::warn!(job_id = %job.id, "Heartbeat failed: {e}"),
                }
            }
        }
    }
}

fn record_progress(ctx: &QueueContext, job: &ConversionJob, lease: &JobLease, pct: u8, in_flight: &InFlight) {
    // Best effort: a missed update is superseded by the next one.
    if let Err(e) = ctx.jobs.report_progress(lease, pct) {
        tracing::debug!(job_id = %job.id, "Progress not recorded: {e}");
    }
    if let Some(mut entry) = in_flight.get_mut(&job.id) {
        entry.progress = pct;
    }

    tracing::debug!(job_id = %job.id, progress = pct, "Conversion progress");
    ctx.event_bus.broadcast(EventPayload::ConversionProgress {
        job_id: job.id,
        media_id: job.media_id,
        progress: pct,
    });
}

async fn on_success(ctx: &QueueContext, job: &ConversionJob, lease: &JobLease, output: TranscodeOutput) {
    let job_id = job.id;
    let result = JobResult {
        output_path: output.output_path.clone(),
        duration_secs: output.duration_secs,
    };

    if let Err(e) = with_retries("mark_completed", job_id, || ctx.jobs.mark_completed(lease, &result)).await {
        // The job will run again, so this output would be orphaned.
        tracing::error!(job_id = %job_id, "Could not record completion: {e}");
        discard_output(&output.output_path).await;
        return;
    }

    tracing::info!(
        job_id = %job_id,
        media_id = %job.media_id,
        output = %output.output_path.display(),
        duration_secs = ?output.duration_secs,
        "Conversion completed"
    );
    ctx.event_bus.broadcast(EventPayload::ConversionCompleted {
        job_id,
        media_id: job.media_id,
        duration_secs: output.duration_secs,
    });

    sync_after_terminal(ctx, job_id).await;
}

async fn on_failure(ctx: &QueueContext, job: &ConversionJob, lease: &JobLease, err: Error) {
    let job_id = job.id;

    if matches!(err, Error::Conflict(_)) {
        tracing::warn!(job_id = %job_id, "Abandoning attempt: {err}");
        return;
    }

    let reason = err.to_string();
    let is_final = !err.is_transient() || !job.has_attempts_left();

    let disposition = match with_retries("mark_failed", job_id, || {
        ctx.jobs.mark_failed(lease, &reason, is_final)
    })
    .await
    {
        Ok(d) => d,
        Err(e) => {
            tracing::error!(job_id = %job_id, error = %reason, "Could not record failed attempt: {e}");
            return;
        }
    };

    match disposition {
        FailureDisposition::Retrying { attempts_made, delay } => {
            tracing::warn!(
                job_id = %job_id,
                media_id = %job.media_id,
                attempt = attempts_made,
                max_attempts = job.max_attempts,
                retry_in_secs = delay.as_secs(),
                error = %reason,
                "Conversion attempt failed; retrying"
            );
            ctx.event_bus.broadcast(EventPayload::ConversionRetrying {
                job_id,
                attempt: attempts_made,
                delay_secs: delay.as_secs(),
                error: reason,
            });
        }
        FailureDisposition::Failed => {
            tracing::error!(
                job_id = %job_id,
                media_id = %job.media_id,
                attempts = job.attempts_made,
                error = %reason,
                "Conversion failed permanently"
            );
            ctx.event_bus.broadcast(EventPayload::ConversionFailed {
                job_id,
                media_id: job.media_id,
                error: reason,
            });
            sync_after_terminal(ctx, job_id).await;
        }
    }
}
