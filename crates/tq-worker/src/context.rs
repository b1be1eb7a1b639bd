//! Shared handles passed to the worker pool and the queue controller.

use std::sync::Arc;

use tokio::sync::Notify;
use tq_av::Transcoder;
use tq_core::config::Config;
use tq_core::events::EventBus;
use tq_core::{JobStore, MediaStore};

/// Everything a worker or controller needs, cheap to clone.
#[derive(Clone)]
pub struct QueueContext {
    pub config: Arc<Config>,
    pub jobs: Arc<dyn JobStore>,
    pub media: Arc<dyn MediaStore>,
    pub transcoder: Arc<dyn Transcoder>,
    pub event_bus: Arc<EventBus>,
    /// Signalled on enqueue and resume so idle workers poll immediately.
    pub wake: Arc<Notify>,
}

impl QueueContext {
    pub fn new(
        config: Config,
        jobs: Arc<dyn JobStore>,
        media: Arc<dyn MediaStore>,
        transcoder: Arc<dyn Transcoder>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            jobs,
            media,
            transcoder,
            event_bus: Arc::new(EventBus::default()),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Wake every idle worker. The stored permit covers a worker that is
    /// between its dequeue and its wait.
    pub fn wake_workers(&self) {
        self.wake.notify_waiters();
        self.wake.notify_one();
    }
}

impl std::fmt::Debug for QueueContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueContext")
            .field("concurrency", &self.config.queue.concurrency)
            .field("event_bus", &self.event_bus)
            .finish_non_exhaustive()
    }
}
