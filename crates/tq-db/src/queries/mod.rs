//! Database query modules.

pub mod conversion_jobs;
pub mod media;
pub mod queue_state;
