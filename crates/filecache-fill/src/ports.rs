//! Collaborator interfaces of the fill pipeline
//!
//! The pipeline only talks to these traits. Concrete HTTP and Postgres
//! implementations live in the server crate; in-memory ones in `testing`.

use crate::error::{CatalogError, IndexError, LockError, QueueError, SinkError, SourceError};
use crate::job::Job;
use crate::types::{
    BlobPointer, CacheEntry, CacheKey, CatalogItem, CatalogPage, FileName, SinkFile, SourceFile,
};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Duration;

#[async_trait]
pub trait CatalogReader: Send + Sync {
    /// One page of the catalog, 1-based
    async fn list_items(&self, page: u32, page_size: u32) -> Result<CatalogPage, CatalogError>;

    async fn get_item(&self, id: i32) -> Result<Option<CatalogItem>, CatalogError>;
}

#[async_trait]
pub trait SourceFetcher: Send + Sync {
    async fn fetch_bytes(&self, item: &CatalogItem, variant: &str)
        -> Result<SourceFile, SourceError>;

    async fn filename(&self, key: &CacheKey) -> Result<FileName, SourceError>;
}

#[async_trait]
pub trait Sink: Send + Sync {
    async fn upload(&self, file: SourceFile, caption: &str) -> Result<BlobPointer, SinkError>;

    async fn download(&self, pointer: BlobPointer) -> Result<SinkFile, SinkError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted(CacheEntry),
    /// The key was already cached; nothing was written
    Duplicate,
}

#[async_trait]
pub trait CacheIndex: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, IndexError>;

    /// Every cached key belonging to any of `item_ids`, in one round trip
    async fn exists_batch(&self, item_ids: &[i32]) -> Result<HashSet<CacheKey>, IndexError>;

    async fn insert(&self, key: &CacheKey, pointer: BlobPointer)
        -> Result<InsertOutcome, IndexError>;

    async fn upsert(&self, key: &CacheKey, pointer: BlobPointer) -> Result<CacheEntry, IndexError>;

    async fn delete(&self, key: &CacheKey) -> Result<Option<CacheEntry>, IndexError>;

    /// Delete `entry` only if the index still holds the same pointer for it
    async fn evict(&self, entry: &CacheEntry) -> Result<bool, IndexError>;

    async fn count(&self) -> Result<u64, IndexError>;

    /// Entries with `id > after_id`, ascending, at most `limit`
    async fn list_after(&self, after_id: i64, limit: usize)
        -> Result<Vec<CacheEntry>, IndexError>;
}

/// Proof of holding a lock; `token` distinguishes successive holders
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHandle {
    pub key: String,
    pub token: i64,
}

#[async_trait]
pub trait LockManager: Send + Sync {
    /// Wait up to `wait` for the lock. The grant lapses after `lease`
    /// unless released first. `Ok(None)` means the wait timed out.
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockError>;

    /// Extend a held lock to `lease` from now. `Ok(false)` means the grant
    /// already lapsed and someone else may hold the key.
    async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<bool, LockError>;

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Accepted,
    /// Collapsed into an outstanding job with the same identity
    Merged,
}

/// A leased job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub id: i64,
    pub job: Job,
    /// Deliveries so far, including this one
    pub attempts: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub leased: u64,
    pub failed: u64,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, job: &Job, delay: Duration) -> Result<Enqueued, QueueError>;

    /// Enqueue all of `jobs` or none of them
    async fn enqueue_many(&self, jobs: &[Job]) -> Result<Vec<Enqueued>, QueueError>;

    async fn dequeue(&self, worker: &str, lease: Duration) -> Result<Option<Delivery>, QueueError>;

    /// Settle calls return `Ok(false)` when `worker` no longer holds the
    /// lease on `id`; the job is then left alone.
    async fn complete(&self, id: i64, worker: &str) -> Result<bool, QueueError>;

    async fn retry(
        &self,
        id: i64,
        worker: &str,
        delay: Duration,
        reason: &str,
    ) -> Result<bool, QueueError>;

    async fn fail(&self, id: i64, worker: &str, reason: &str) -> Result<bool, QueueError>;

    async fn counts(&self) -> Result<QueueStats, QueueError>;
}
