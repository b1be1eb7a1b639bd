//! tq-core: shared types, IDs, errors, configuration, and event system.
//!
//! This crate is the foundational dependency for all other tq-* crates,
//! providing type-safe identifiers, a unified error type, the conversion job
//! and media record domain types, the store traits the worker pool runs
//! against, application configuration, and a broadcast event bus.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod jobs;
pub mod media;
pub mod store;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::*;
pub use jobs::*;
pub use media::*;
pub use store::{JobStore, MediaStore};
