//! Administrative and producer-facing operations on the conversion queue.

use std::path::Path;
use std::time::Duration;

use tq_av::requires_conversion;
use tq_core::events::EventPayload;
use tq_core::{
    ConversionJobId, ConversionStatus, Error, JobInfo, MediaId, MediaUpdate, QueueStats,
    Result,
};

use crate::context::QueueContext;
use crate::finalize::sync_media;

/// Producer and admin surface of the queue.
#[derive(Debug, Clone)]
pub struct QueueController {
    ctx: QueueContext,
}

impl QueueController {
    pub fn new(ctx: QueueContext) -> Self {
        Self { ctx }
    }

    /// Queue a conversion for a media record.
    ///
    /// The record is marked `pending` first. If the job cannot be stored the
    /// record is marked `failed` and the store error is returned. When the
    /// media already has an open job, that job's id is returned unchanged.
    pub fn enqueue(&self, media_id: MediaId, input_path: &Path, priority: i32) -> Result<ConversionJobId> {
        if let Some(existing) = self.ctx.jobs.find_open_for_media(media_id)? {
            tracing::info!(
                job_id = %existing.id,
                media_id = %media_id,
                state = %existing.state,
                "Media already has an open conversion job"
            );
            return Ok(existing.id);
        }

        if self
            .ctx
            .media
            .update(media_id, &MediaUpdate::status(ConversionStatus::Pending))?
            .is_none()
        {
            return Err(Error::not_found("media", media_id));
        }

        let job_id = match self.ctx.jobs.enqueue(media_id, input_path, priority) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(media_id = %media_id, "Failed to enqueue conversion: {e}");
                let failed = MediaUpdate::status(ConversionStatus::Failed);
                if let Err(comp) = self.ctx.media.update(media_id, &failed) {
                    tracing::error!(media_id = %media_id, "Could not mark media as failed: {comp}");
                }
                return Err(e);
            }
        };

        tracing::info!(
            job_id = %job_id,
            media_id = %media_id,
            input = %input_path.display(),
            priority,
            "Conversion queued"
        );
        self.ctx
            .event_bus
            .broadcast(EventPayload::ConversionQueued { job_id, media_id });
        self.ctx.wake_workers();

        Ok(job_id)
    }

    /// Queue a conversion only when the upload's format needs one.
    ///
    /// Returns `None` and marks the record `none` for streamable uploads.
    pub fn schedule_if_needed(
        &self,
        media_id: MediaId,
        input_path: &Path,
        mime_type: &str,
    ) -> Result<Option<ConversionJobId>> {
        let extension = input_path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default();

        if requires_conversion(mime_type, &extension) {
            return self.enqueue(media_id, input_path, 0).map(Some);
        }

        tracing::debug!(media_id = %media_id, mime_type, "Upload is already streamable");
        let none = MediaUpdate::status(ConversionStatus::None);
        if self.ctx.media.update(media_id, &none)?.is_none() {
            return Err(Error::not_found("media", media_id));
        }
        Ok(None)
    }

    pub fn stats(&self) -> Result<QueueStats> {
        self.ctx.jobs.stats()
    }

    /// Look up one job by id string. Unknown ids yield `None`; malformed
    /// ones fail with [`Error::InvalidId`].
    pub fn get_job_info(&self, job_id: &str) -> Result<Option<JobInfo>> {
        let id = ConversionJobId::parse(job_id)?;
        Ok(self.ctx.jobs.get(id)?.as_ref().map(JobInfo::from))
    }

    /// Stop handing out new jobs. Running jobs are not interrupted.
    pub fn pause(&self) -> Result<()> {
        self.ctx.jobs.set_paused(true)?;
        tracing::info!("Queue paused");
        self.ctx.event_bus.broadcast(EventPayload::QueuePaused);
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        self.ctx.jobs.set_paused(false)?;
        tracing::info!("Queue resumed");
        self.ctx.event_bus.broadcast(EventPayload::QueueResumed);
        self.ctx.wake_workers();
        Ok(())
    }

    /// Delete finished jobs older than `older_than`.
    pub fn clean(&self, older_than: Duration) -> Result<usize> {
        let removed = self.ctx.jobs.clean(older_than)?;
        tracing::info!(removed, older_than_secs = older_than.as_secs(), "Cleaned finished jobs");
        Ok(removed)
    }

    /// [`clean`](Self::clean) with the configured age.
    pub fn clean_default(&self) -> Result<usize> {
        self.clean(self.ctx.config.queue.clean_older_than())
    }

    /// Finish media updates interrupted by a crash.
    ///
    /// Every terminal job whose media record was never updated gets its
    /// update re-applied; completed jobs also lose their leftover input.
    /// Returns the number of jobs brought in sync.
    pub async fn reconcile(&self) -> Result<usize> {
        let pending = self.ctx.jobs.unsynced_terminal()?;
        let mut synced = 0;

        for job in &pending {
            match sync_media(&self.ctx, job).await {
                Ok(()) => {
                    synced += 1;
                    tracing::debug!(job_id = %job.id, state = %job.state, "Media record reconciled");
                }
                Err(e) => {
                    tracing::warn!(job_id = %job.id, media_id = %job.media_id, "Reconcile failed: {e}");
                }
            }
        }

        Ok(synced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Arc;
    use tq_av::{ProgressFn, TranscodeOutput, Transcoder};
    use tq_core::config::Config;
    use tq_core::events::EventPayload;
    use tq_core::{
        ConversionJob, FailureDisposition, JobLease, JobResult, JobState, JobStore, LeasedJob,
        MediaStore, StallReport,
    };
    use tq_db::{init_memory_pool, SqliteJobStore, SqliteMediaStore, StoreOptions};

    struct Unused;

    #[async_trait]
    impl Transcoder for Unused {
        async fn convert(&self, _: &Path, _: &Path, _: ProgressFn) -> Result<TranscodeOutput> {
            Err(Error::Internal("not used in controller tests".into()))
        }
    }

    struct Harness {
        controller: QueueController,
        ctx: QueueContext,
        media: Arc<SqliteMediaStore>,
    }

    fn harness_with(jobs: impl FnOnce(tq_db::DbPool) -> Arc<dyn JobStore>) -> Harness {
        let pool = init_memory_pool().unwrap();
        let media = Arc::new(SqliteMediaStore::new(pool.clone()));
        let ctx = QueueContext::new(Config::default(), jobs(pool), media.clone(), Arc::new(Unused));
        Harness {
            controller: QueueController::new(ctx.clone()),
            ctx,
            media,
        }
    }

    fn harness() -> Harness {
        harness_with(|pool| Arc::new(SqliteJobStore::new(pool, StoreOptions::default())))
    }

    fn new_media(h: &Harness, filename: &str) -> MediaId {
        h.media
            .create(filename, "video/x-matroska", ConversionStatus::None)
            .unwrap()
            .id
    }

    fn status_of(h: &Harness, id: MediaId) -> ConversionStatus {
        h.media.get(id).unwrap().unwrap().conversion_status
    }

    #[test]
    fn enqueue_marks_media_pending_and_announces_job() {
        let h = harness();
        let media_id = new_media(&h, "a.mkv");
        let mut rx = h.ctx.event_bus.subscribe();

        let job_id = h.controller.enqueue(media_id, Path::new("/up/a.mkv"), 0).unwrap();

        assert_eq!(status_of(&h, media_id), ConversionStatus::Pending);
        let job = h.ctx.jobs.get(job_id).unwrap().unwrap();
        assert_eq!(job.state, JobState::Waiting);
        assert_eq!(job.attempts_made, 0);
        assert_eq!(
            rx.try_recv().unwrap().payload,
            EventPayload::ConversionQueued { job_id, media_id }
        );
    }

    #[test]
    fn second_enqueue_returns_open_job() {
        let h = harness();
        let media_id = new_media(&h, "a.mkv");

        let first = h.controller.enqueue(media_id, Path::new("/up/a.mkv"), 0).unwrap();
        let second = h.controller.enqueue(media_id, Path::new("/up/a.mkv"), 3).unwrap();

        assert_eq!(first, second);
        assert_eq!(h.controller.stats().unwrap().waiting, 1);
    }

    #[test]
    fn enqueue_for_unknown_media_is_not_found() {
        let h = harness();
        let err = h
            .controller
            .enqueue(MediaId::new(), Path::new("/up/a.mkv"), 0)
            .unwrap_err();
        assert_matches!(err, Error::NotFound { .. });
        assert_eq!(h.controller.stats().unwrap().total, 0);
    }

    /// Job store whose `enqueue` always reports the backing store as down.
    struct Unreachable(SqliteJobStore);

    impl JobStore for Unreachable {
        fn enqueue(&self, _: MediaId, _: &Path, _: i32) -> Result<ConversionJobId> {
            Err(Error::StoreUnavailable("connection refused".into()))
        }
        fn dequeue_next(&self, worker: &str) -> Result<Option<LeasedJob>> {
            self.0.dequeue_next(worker)
        }
        fn report_progress(&self, lease: &JobLease, percent: u8) -> Result<()> {
            self.0.report_progress(lease, percent)
        }
        fn heartbeat(&self, lease: &JobLease) -> Result<bool> {
            self.0.heartbeat(lease)
        }
        fn release(&self, lease: &JobLease) -> Result<bool> {
            self.0.release(lease)
        }
        fn mark_completed(&self, lease: &JobLease, result: &JobResult) -> Result<()> {
            self.0.mark_completed(lease, result)
        }
        fn mark_failed(&self, lease: &JobLease, reason: &str, is_final: bool) -> Result<FailureDisposition> {
            self.0.mark_failed(lease, reason, is_final)
        }
        fn detect_stalled(&self, timeout: Duration) -> Result<StallReport> {
            self.0.detect_stalled(timeout)
        }
        fn stats(&self) -> Result<QueueStats> {
            self.0.stats()
        }
        fn get(&self, id: ConversionJobId) -> Result<Option<ConversionJob>> {
            self.0.get(id)
        }
        fn find_open_for_media(&self, media_id: MediaId) -> Result<Option<ConversionJob>> {
            self.0.find_open_for_media(media_id)
        }
        fn set_paused(&self, paused: bool) -> Result<()> {
            self.0.set_paused(paused)
        }
        fn is_paused(&self) -> Result<bool> {
            self.0.is_paused()
        }
        fn clean(&self, older_than: Duration) -> Result<usize> {
            self.0.clean(older_than)
        }
        fn prune_retention(&self, keep_completed: u32, keep_failed: u32) -> Result<usize> {
            self.0.prune_retention(keep_completed, keep_failed)
        }
        fn unsynced_terminal(&self) -> Result<Vec<ConversionJob>> {
            self.0.unsynced_terminal()
        }
        fn mark_media_synced(&self, id: ConversionJobId) -> Result<()> {
            self.0.mark_media_synced(id)
        }
    }

    #[test]
    fn failed_enqueue_marks_media_failed() {
        let h = harness_with(|pool| {
            Arc::new(Unreachable(SqliteJobStore::new(pool, StoreOptions::default())))
        });
        let media_id = new_media(&h, "a.mkv");

        let err = h.controller.enqueue(media_id, Path::new("/up/a.mkv"), 0).unwrap_err();

        assert_matches!(err, Error::StoreUnavailable(_));
        assert_eq!(status_of(&h, media_id), ConversionStatus::Failed);
    }

    #[test]
    fn streamable_upload_is_not_scheduled() {
        let h = harness();
        let media_id = new_media(&h, "a.mp4");

        let scheduled = h
            .controller
            .schedule_if_needed(media_id, Path::new("/up/a.mp4"), "video/mp4")
            .unwrap();

        assert_eq!(scheduled, None);
        assert_eq!(status_of(&h, media_id), ConversionStatus::None);
        assert_eq!(h.controller.stats().unwrap().total, 0);
    }

    #[test]
    fn matroska_upload_is_scheduled() {
        let h = harness();
        let media_id = new_media(&h, "a.mkv");

        let scheduled = h
            .controller
            .schedule_if_needed(media_id, Path::new("/up/a.mkv"), "video/x-matroska")
            .unwrap();

        assert!(scheduled.is_some());
        assert_eq!(status_of(&h, media_id), ConversionStatus::Pending);
    }

    #[test]
    fn job_info_lookup() {
        let h = harness();
        let media_id = new_media(&h, "a.mkv");
        let job_id = h.controller.enqueue(media_id, Path::new("/up/a.mkv"), 0).unwrap();

        let info = h.controller.get_job_info(&job_id.to_string()).unwrap().unwrap();
        assert_eq!(info.id, job_id);
        assert_eq!(info.state, JobState::Waiting);
        assert_eq!(info.progress, 0);
        assert_eq!(info.max_attempts, 3);

        let unknown = ConversionJobId::new().to_string();
        assert_eq!(h.controller.get_job_info(&unknown).unwrap(), None);
        assert_matches!(
            h.controller.get_job_info("not-a-uuid"),
            Err(Error::InvalidId(_))
        );
    }

    #[test]
    fn pause_and_resume_toggle_durable_flag() {
        let h = harness();
        let mut rx = h.ctx.event_bus.subscribe();

        h.controller.pause().unwrap();
        assert!(h.controller.stats().unwrap().paused);
        assert_eq!(rx.try_recv().unwrap().payload, EventPayload::QueuePaused);

        h.controller.resume().unwrap();
        assert!(!h.controller.stats().unwrap().paused);
        assert_eq!(rx.try_recv().unwrap().payload, EventPayload::QueueResumed);
    }

    #[tokio::test]
    async fn reconcile_applies_missed_media_updates() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.mkv");
        std::fs::write(&input, b"mkv").unwrap();

        let h = harness();
        let media_id = new_media(&h, "a.mkv");
        let job_id = h.controller.enqueue(media_id, &input, 0).unwrap();

        // Simulate a crash right after the job row went terminal.
        let leased = h.ctx.jobs.dequeue_next("w").unwrap().unwrap();
        let result = JobResult {
            output_path: PathBuf::from("/out/converted.mp4"),
            duration_secs: Some(42.0),
        };
        h.ctx.jobs.mark_completed(&leased.lease, &result).unwrap();

        assert_eq!(h.controller.reconcile().await.unwrap(), 1);

        let media = h.media.get(media_id).unwrap().unwrap();
        assert_eq!(media.conversion_status, ConversionStatus::Completed);
        assert_eq!(media.filename, "converted.mp4");
        assert_eq!(media.mime_type, "video/mp4");
        assert!(media.is_converted);
        assert_eq!(media.duration_secs, Some(42.0));
        assert!(!input.exists());
        assert!(h.ctx.jobs.get(job_id).unwrap().unwrap().media_synced);

        // Nothing left to do on a second pass.
        assert_eq!(h.controller.reconcile().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn reconcile_keeps_input_of_failed_job() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("a.avi");
        std::fs::write(&input, b"avi").unwrap();

        let h = harness();
        let media_id = new_media(&h, "a.avi");
        h.controller.enqueue(media_id, &input, 0).unwrap();
        let leased = h.ctx.jobs.dequeue_next("w").unwrap().unwrap();
        h.ctx.jobs.mark_failed(&leased.lease, "corrupt", true).unwrap();

        assert_eq!(h.controller.reconcile().await.unwrap(), 1);
        assert_eq!(status_of(&h, media_id), ConversionStatus::Failed);
        assert!(input.exists());
    }
}
