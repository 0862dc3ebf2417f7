//! Postgres persistence for the file cache
//!
//! Three tables back the service: `cached_files` maps a book variant to the
//! message holding its bytes, `fill_jobs` is the durable work queue and
//! `fill_locks` holds leased per-variant fill locks.

pub mod cached_files;
pub mod jobs;
pub mod locks;
pub mod migrate;
pub mod types;

pub use sqlx::postgres::PgPool;
pub use types::*;
