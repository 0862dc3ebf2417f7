use async_trait::async_trait;
use filecache_db::{cached_files, jobs, locks, CachedFileRow, EnqueueStatus, NewCachedFile, NewJob};
use filecache_fill::{
    BlobPointer, CacheEntry, CacheIndex, CacheKey, Delivery, Enqueued, IndexError, InsertOutcome,
    Job, LockError, LockHandle, LockManager, QueueError, QueueStats, TaskQueue,
};
use sqlx::PgPool;
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

fn entry(row: CachedFileRow) -> CacheEntry {
    CacheEntry {
        id: row.id,
        item_id: row.object_id,
        variant: row.object_type,
        pointer: BlobPointer {
            chat_id: row.chat_id,
            message_id: row.message_id,
        },
    }
}

fn new_file(key: &CacheKey, pointer: BlobPointer) -> NewCachedFile {
    NewCachedFile {
        object_id: key.item_id,
        object_type: key.variant.clone(),
        message_id: pointer.message_id,
        chat_id: pointer.chat_id,
    }
}

fn index_error(err: sqlx::Error) -> IndexError {
    IndexError(err.to_string())
}

pub struct PgCacheIndex {
    pool: PgPool,
}

impl PgCacheIndex {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CacheIndex for PgCacheIndex {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, IndexError> {
        let row = cached_files::get(&self.pool, key.item_id, &key.variant)
            .await
            .map_err(index_error)?;
        Ok(row.map(entry))
    }

    async fn exists_batch(&self, item_ids: &[i32]) -> Result<HashSet<CacheKey>, IndexError> {
        let pairs = cached_files::existing_for_objects(&self.pool, item_ids)
            .await
            .map_err(index_error)?;
        Ok(pairs
            .into_iter()
            .map(|(item_id, variant)| CacheKey { item_id, variant })
            .collect())
    }

    async fn insert(
        &self,
        key: &CacheKey,
        pointer: BlobPointer,
    ) -> Result<InsertOutcome, IndexError> {
        let row = cached_files::insert(&self.pool, &new_file(key, pointer))
            .await
            .map_err(index_error)?;
        Ok(match row {
            Some(row) => InsertOutcome::Inserted(entry(row)),
            None => InsertOutcome::Duplicate,
        })
    }

    async fn upsert(&self, key: &CacheKey, pointer: BlobPointer) -> Result<CacheEntry, IndexError> {
        cached_files::upsert(&self.pool, &new_file(key, pointer))
            .await
            .map(entry)
            .map_err(index_error)
    }

    async fn delete(&self, key: &CacheKey) -> Result<Option<CacheEntry>, IndexError> {
        let row = cached_files::delete(&self.pool, key.item_id, &key.variant)
            .await
            .map_err(index_error)?;
        Ok(row.map(entry))
    }

    async fn evict(&self, entry: &CacheEntry) -> Result<bool, IndexError> {
        cached_files::delete_if_pointer(
            &self.pool,
            entry.item_id,
            &entry.variant,
            entry.pointer.chat_id,
            entry.pointer.message_id,
        )
        .await
        .map_err(index_error)
    }

    async fn count(&self) -> Result<u64, IndexError> {
        let n = cached_files::count(&self.pool).await.map_err(index_error)?;
        Ok(n.max(0) as u64)
    }

    async fn list_after(
        &self,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<CacheEntry>, IndexError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = cached_files::list_after(&self.pool, after_id, limit)
            .await
            .map_err(index_error)?;
        Ok(rows.into_iter().map(entry).collect())
    }
}

/// Polls `fill_locks` until the lock frees up or the wait runs out
pub struct PgLockManager {
    pool: PgPool,
    holder: String,
    poll: Duration,
}

impl PgLockManager {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            holder: format!("pid-{}", std::process::id()),
            poll: Duration::from_millis(200),
        }
    }

    pub async fn purge_expired(&self) -> Result<u64, sqlx::Error> {
        locks::purge_expired(&self.pool).await
    }
}

#[async_trait]
impl LockManager for PgLockManager {
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            let token: i64 = rand::random();
            let acquired = locks::try_acquire(&self.pool, key, token, &self.holder, lease)
                .await
                .map_err(|e| LockError(e.to_string()))?;
            if acquired {
                return Ok(Some(LockHandle {
                    key: key.to_string(),
                    token,
                }));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.poll.min(deadline - now)).await;
        }
    }

    async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<bool, LockError> {
        locks::renew(&self.pool, &handle.key, handle.token, lease)
            .await
            .map_err(|e| LockError(e.to_string()))
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let released = locks::release(&self.pool, &handle.key, handle.token)
            .await
            .map_err(|e| LockError(e.to_string()))?;
        if !released {
            warn!(lock = %handle.key, "Lock lease expired before release");
        }
        Ok(())
    }
}

fn queue_error(err: sqlx::Error) -> QueueError {
    QueueError::Backend(err.to_string())
}

fn new_job(job: &Job, delay: Duration) -> Result<NewJob, QueueError> {
    Ok(NewJob {
        identity: job.identity(),
        kind: job.kind().as_str().to_string(),
        payload: serde_json::to_value(job).map_err(|e| QueueError::Backend(e.to_string()))?,
        delay,
    })
}

fn enqueued(status: EnqueueStatus) -> Enqueued {
    if status.is_accepted() {
        Enqueued::Accepted
    } else {
        Enqueued::Merged
    }
}

pub struct PgTaskQueue {
    pool: PgPool,
}

impl PgTaskQueue {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TaskQueue for PgTaskQueue {
    async fn enqueue(&self, job: &Job, delay: Duration) -> Result<Enqueued, QueueError> {
        let status = jobs::enqueue(&self.pool, &new_job(job, delay)?)
            .await
            .map_err(queue_error)?;
        debug!(job = %job, job_id = status.id(), accepted = status.is_accepted(), "Enqueued job");
        Ok(enqueued(status))
    }

    async fn enqueue_many(&self, batch: &[Job]) -> Result<Vec<Enqueued>, QueueError> {
        let new_jobs = batch
            .iter()
            .map(|job| new_job(job, Duration::ZERO))
            .collect::<Result<Vec<_>, _>>()?;
        let statuses = jobs::enqueue_many(&self.pool, &new_jobs)
            .await
            .map_err(queue_error)?;
        Ok(statuses.into_iter().map(enqueued).collect())
    }

    async fn dequeue(&self, worker: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        let Some(row) = jobs::dequeue(&self.pool, worker, lease)
            .await
            .map_err(queue_error)?
        else {
            return Ok(None);
        };

        match serde_json::from_value::<Job>(row.payload) {
            Ok(job) => Ok(Some(Delivery {
                id: row.id,
                job,
                attempts: u32::try_from(row.attempts).unwrap_or(0),
            })),
            Err(e) => {
                let reason = format!("undecodable {} payload: {}", row.kind, e);
                jobs::fail(&self.pool, row.id, worker, &reason)
                    .await
                    .map_err(queue_error)?;
                Err(QueueError::Malformed { id: row.id, reason })
            }
        }
    }

    async fn complete(&self, id: i64, worker: &str) -> Result<bool, QueueError> {
        jobs::complete(&self.pool, id, worker)
            .await
            .map_err(queue_error)
    }

    async fn retry(
        &self,
        id: i64,
        worker: &str,
        delay: Duration,
        reason: &str,
    ) -> Result<bool, QueueError> {
        jobs::retry(&self.pool, id, worker, delay, reason)
            .await
            .map_err(queue_error)
    }

    async fn fail(&self, id: i64, worker: &str, reason: &str) -> Result<bool, QueueError> {
        jobs::fail(&self.pool, id, worker, reason)
            .await
            .map_err(queue_error)
    }

    async fn counts(&self) -> Result<QueueStats, QueueError> {
        let counts = jobs::counts(&self.pool).await.map_err(queue_error)?;
        Ok(QueueStats {
            ready: counts.ready.max(0) as u64,
            leased: counts.leased.max(0) as u64,
            failed: counts.failed.max(0) as u64,
        })
    }
}
