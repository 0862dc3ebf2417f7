//! Cache-fill pipeline
//!
//! Decides for any `(item_id, variant)` whether a fetch-and-upload has to
//! run, keeps at most one such fill running per key across the cluster,
//! retries transient failures with jittered backoff and backfills the
//! whole catalog through a paginated crawl.
//!
//! The pipeline is written against the traits in [`ports`]; the process
//! entry point supplies concrete implementations.

pub mod caption;
pub mod crawler;
pub mod error;
pub mod filler;
pub mod job;
pub mod lock;
pub mod metrics;
pub mod ports;
pub mod reader;
pub mod retry;
pub mod runner;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;

pub use caption::{build_caption, CAPTION_LIMIT};
pub use crawler::{CrawlSettings, Crawler};
pub use error::{
    CatalogError, IndexError, KeyError, LockError, QueueError, ReadError, SinkError, SourceError,
};
pub use filler::{Collaborators, FillOutcome, FillSettings, Filler, RetryReason, TerminalReason};
pub use job::{job_identity, Job, JobKind, JobResult};
pub use lock::{lock_key, LockGuard};
pub use metrics::FillMetrics;
pub use ports::{
    CacheIndex, CatalogReader, Delivery, Enqueued, InsertOutcome, LockHandle, LockManager,
    QueueStats, Sink, SourceFetcher, TaskQueue,
};
pub use reader::{CacheReader, OpenedFile};
pub use retry::RetryPolicy;
pub use runner::{JobRunner, RunnerSettings};
pub use types::*;
