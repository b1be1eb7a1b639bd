//! tq-db: database access and persistence layer.
//!
//! This crate provides SQLite-backed storage with connection pooling,
//! embedded migrations, row mapping, and query modules for conversion jobs,
//! media records and queue-wide flags. [`SqliteJobStore`] and
//! [`SqliteMediaStore`] implement the `tq-core` store traits on top of them.

pub mod migrations;
pub mod models;
pub mod pool;
pub mod queries;
pub mod store;

pub use pool::{get_conn, init_memory_pool, init_pool, DbPool, PooledConnection};
pub use store::{SqliteJobStore, SqliteMediaStore, StoreOptions};
