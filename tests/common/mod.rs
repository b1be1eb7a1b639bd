//! Shared test harness for integration tests.
//!
//! [`TestHarness`] wires an in-memory database, a temp directory for uploads
//! and outputs, and a [`ScriptedTranscoder`] whose outcomes are queued up
//! front, into a [`QueueContext`].

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;

use tq_av::{ProgressFn, TranscodeOutput, Transcoder};
use tq_core::config::Config;
use tq_core::{
    ConversionJob, ConversionJobId, ConversionStatus, Error, JobStore, MediaId, MediaRecord,
    MediaStore,
};
use tq_db::{init_memory_pool, DbPool, SqliteJobStore, SqliteMediaStore, StoreOptions};
use tq_worker::{QueueContext, QueueController, WorkerPool};

/// What the next call to [`ScriptedTranscoder::convert`] does.
#[derive(Debug, Clone)]
pub enum Step {
    /// Write the output, report progress, and succeed.
    Succeed { duration_secs: Option<f64> },
    /// Fail with a transient tool error.
    CrashTool(String),
    /// Fail with a non-retryable error.
    RejectInput(String),
    /// Never finish; only a timeout, a lost lease or an abort ends it.
    Hang,
    /// Panic inside the conversion.
    Panic(String),
}

/// Fake transcoder replaying a script of outcomes. Once the script is
/// exhausted every call succeeds.
#[derive(Default)]
pub struct ScriptedTranscoder {
    script: Mutex<VecDeque<Step>>,
    calls: Mutex<Vec<PathBuf>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
    work: Mutex<Duration>,
}

impl ScriptedTranscoder {
    pub fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            ..Default::default()
        }
    }

    /// Simulated encode time for successful steps.
    pub fn with_work(self, d: Duration) -> Self {
        *self.work.lock() = d;
        self
    }

    /// Inputs in the order they were handed to the transcoder.
    pub fn calls(&self) -> Vec<PathBuf> {
        self.calls.lock().clone()
    }

    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }
}

struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn convert(
        &self,
        input: &Path,
        output: &Path,
        on_progress: ProgressFn,
    ) -> tq_core::Result<TranscodeOutput> {
        self.calls.lock().push(input.to_path_buf());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(now, Ordering::SeqCst);
        let _guard = RunningGuard(&self.running);

        let step = self.script.lock().pop_front().unwrap_or(Step::Succeed {
            duration_secs: Some(12.0),
        });
        let work = *self.work.lock();

        match step {
            Step::Succeed { duration_secs } => {
                for pct in [10, 50, 100] {
                    on_progress(pct);
                    tokio::time::sleep(work / 3).await;
                }
                if let Some(dir) = output.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                tokio::fs::write(output, b"mp4").await?;
                Ok(TranscodeOutput {
                    output_path: output.to_path_buf(),
                    duration_secs,
                })
            }
            Step::CrashTool(msg) => {
                on_progress(30);
                Err(Error::tool("ffmpeg", msg))
            }
            Step::RejectInput(msg) => Err(Error::Validation(msg)),
            Step::Panic(msg) => {
                on_progress(20);
                panic!("{msg}");
            }
            Step::Hang => {
                if let Some(dir) = output.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                tokio::fs::write(output, b"partial").await?;
                std::future::pending::<tq_core::Result<TranscodeOutput>>().await
            }
        }
    }
}

/// Config tuned for tests: instant retries and fast polling.
pub fn fast_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.transcoder.output_dir = root.join("out");
    config.queue.backoff_base_secs = 0;
    config.queue.backoff_max_secs = 0;
    config.queue.poll_interval_ms = 20;
    config.queue.heartbeat_interval_secs = 1;
    config.queue.shutdown_grace_secs = 5;
    config
}

pub struct TestHarness {
    pub ctx: QueueContext,
    pub db: DbPool,
    pub media: Arc<SqliteMediaStore>,
    pub controller: QueueController,
    pub transcoder: Arc<ScriptedTranscoder>,
    pub dir: TempDir,
}

impl TestHarness {
    pub fn new(transcoder: ScriptedTranscoder) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = fast_config(dir.path());
        Self::build(dir, config, transcoder)
    }

    /// Like [`new`](Self::new) with `adjust` applied to the test config.
    pub fn with_config(transcoder: ScriptedTranscoder, adjust: impl FnOnce(&mut Config)) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = fast_config(dir.path());
        adjust(&mut config);
        Self::build(dir, config, transcoder)
    }

    fn build(dir: TempDir, config: Config, transcoder: ScriptedTranscoder) -> Self {
        let db = init_memory_pool().expect("failed to create in-memory pool");
        let transcoder = Arc::new(transcoder);
        let media = Arc::new(SqliteMediaStore::new(db.clone()));
        let jobs = Arc::new(SqliteJobStore::new(db.clone(), StoreOptions::from(&config.queue)));

        let ctx = QueueContext::new(config, jobs, media.clone(), transcoder.clone());
        let controller = QueueController::new(ctx.clone());

        Self {
            ctx,
            db,
            media,
            controller,
            transcoder,
            dir,
        }
    }

    pub fn pool(&self) -> WorkerPool {
        WorkerPool::new(self.ctx.clone())
    }

    /// Write an upload to disk and create its media record.
    pub fn upload(&self, name: &str) -> (MediaId, PathBuf) {
        let uploads = self.dir.path().join("uploads");
        std::fs::create_dir_all(&uploads).expect("uploads dir");
        let path = uploads.join(name);
        std::fs::write(&path, b"source bytes").expect("write upload");

        let record = self
            .media
            .create(name, "video/x-matroska", ConversionStatus::None)
            .expect("create media");
        (record.id, path)
    }

    pub fn job(&self, id: ConversionJobId) -> ConversionJob {
        self.ctx.jobs.get(id).expect("get job").expect("job exists")
    }

    pub fn media_record(&self, id: MediaId) -> MediaRecord {
        self.media.get(id).expect("get media").expect("media exists")
    }

    /// Files left in the output directory.
    pub fn outputs(&self) -> Vec<PathBuf> {
        match std::fs::read_dir(&self.ctx.config.transcoder.output_dir) {
            Ok(entries) => entries.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Poll until `done` holds for the job, or panic after `limit`.
    pub async fn wait_for(
        &self,
        id: ConversionJobId,
        limit: Duration,
        done: impl Fn(&ConversionJob) -> bool,
    ) -> ConversionJob {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            let job = self.job(id);
            if done(&job) {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("job {id} did not reach the expected state; last seen: {job:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait until the job is terminal and its media record synced.
    pub async fn wait_settled(&self, id: ConversionJobId) -> ConversionJob {
        self.wait_for(id, Duration::from_secs(10), |j| j.is_terminal() && j.media_synced)
            .await
    }
}
