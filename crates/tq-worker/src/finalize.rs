//! Bringing media records in line with terminal jobs.
//!
//! The job row is the source of truth. Once it is terminal, the media record
//! is updated, a completed job's input is deleted, and finally the row is
//! flagged `media_synced`. Every step is idempotent, so a crash anywhere in
//! between is repaired by running [`sync_media`] again from `reconcile`.

use std::time::Duration;

use tq_av::remove_if_exists;
use tq_core::{ConversionJob, ConversionJobId, ConversionStatus, Error, JobState, MediaUpdate, Result};

use crate::context::QueueContext;

/// Tries per finalize step before the step is left to `reconcile`.
const FINALIZE_ATTEMPTS: u32 = 3;

const FINALIZE_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Run a store call, retrying transient errors a bounded number of times.
pub(crate) async fn with_retries<T, F>(step: &str, job_id: ConversionJobId, mut op: F) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < FINALIZE_ATTEMPTS => {
                tracing::warn!(job_id = %job_id, step, attempt, "Finalize step failed, retrying: {e}");
                tokio::time::sleep(FINALIZE_RETRY_DELAY * attempt).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// The media update that reflects a terminal job.
fn media_update_for(job: &ConversionJob) -> Result<Option<MediaUpdate>> {
    match job.state {
        JobState::Completed => {
            let filename = job
                .output_path
                .as_deref()
                .and_then(|p| p.file_name())
                .map(|n| n.to_string_lossy().into_owned())
                .ok_or_else(|| {
                    Error::Internal(format!("completed job {} has no output file", job.id))
                })?;
            Ok(Some(MediaUpdate::converted(filename, job.duration_secs)))
        }
        JobState::Failed => Ok(Some(MediaUpdate::status(ConversionStatus::Failed))),
        _ => Ok(None),
    }
}

/// Apply the terminal outcome of `job` to its media record.
///
/// Does nothing for non-terminal or already synced jobs.
pub async fn sync_media(ctx: &QueueContext, job: &ConversionJob) -> Result<()> {
    if job.media_synced {
        return Ok(());
    }
    let Some(update) = media_update_for(job)? else {
        return Ok(());
    };

    let updated = with_retries("media_update", job.id, || ctx.media.update(job.media_id, &update)).await?;
    if updated.is_none() {
        tracing::warn!(
            job_id = %job.id,
            media_id = %job.media_id,
            "Media record no longer exists; nothing to update"
        );
    }

    // The source stays on disk after a failure so it can be retried by hand.
    if job.state == JobState::Completed {
        match remove_if_exists(&job.input_path).await {
            Ok(true) => {
                tracing::debug!(job_id = %job.id, path = %job.input_path.display(), "Removed original upload")
            }
            Ok(false) => {}
            Err(e) => tracing::warn!(
                job_id = %job.id,
                path = %job.input_path.display(),
                "Failed to remove original upload: {e}"
            ),
        }
    }

    with_retries("mark_media_synced", job.id, || ctx.jobs.mark_media_synced(job.id)).await
}

/// Re-read a job after a terminal transition and sync its media record,
/// logging instead of failing.
pub(crate) async fn sync_after_terminal(ctx: &QueueContext, job_id: ConversionJobId) {
    let job = match ctx.jobs.get(job_id) {
        Ok(Some(job)) => job,
        Ok(None) => return,
        Err(e) => {
            tracing::warn!(job_id = %job_id, "Could not reload job for media sync: {e}");
            return;
        }
    };

    if let Err(e) = sync_media(ctx, &job).await {
        tracing::warn!(
            job_id = %job_id,
            media_id = %job.media_id,
            "Media record not updated, left for reconcile: {e}"
        );
    }
}
