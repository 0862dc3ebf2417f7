//! In-memory collaborators for exercising the pipeline without services.
//!
//! Each fake counts the calls tests care about and can be told to fail.

use crate::caption::CAPTION_LIMIT;
use crate::crawler::{CrawlSettings, Crawler};
use crate::error::{CatalogError, IndexError, LockError, QueueError, SinkError, SourceError};
use crate::filler::{Collaborators, FillSettings, Filler};
use crate::job::Job;
use crate::lock::LockGuard;
use crate::ports::{
    CacheIndex, CatalogReader, Delivery, Enqueued, InsertOutcome, LockHandle, LockManager,
    QueueStats, Sink, SourceFetcher, TaskQueue,
};
use crate::reader::CacheReader;
use crate::retry::RetryPolicy;
use crate::runner::{JobRunner, RunnerSettings};
use crate::types::{
    BlobPointer, ByteStream, CacheEntry, CacheKey, CatalogAuthor, CatalogItem, CatalogPage,
    FileName, ItemSummary, SinkFile, SourceFile,
};
use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

fn bytes_stream(data: Vec<u8>) -> ByteStream {
    Box::pin(futures::stream::iter(vec![Ok::<_, std::io::Error>(Bytes::from(data))]))
}

/// Consume a counter of pending injected failures
fn take_failure(failures: &AtomicUsize) -> bool {
    failures
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[derive(Default)]
pub struct MemoryCatalog {
    items: Mutex<BTreeMap<i32, CatalogItem>>,
    failures: AtomicUsize,
    rejections: AtomicUsize,
    lookups: AtomicUsize,
}

impl MemoryCatalog {
    pub fn add(&self, item: CatalogItem) {
        self.items.lock().unwrap().insert(item.id, item);
    }

    /// Make the next `n` calls fail
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls fail with a non-transient error
    pub fn reject_next(&self, n: usize) {
        self.rejections.store(n, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CatalogError> {
        if take_failure(&self.rejections) {
            return Err(CatalogError::Rejected("injected rejection".into()));
        }
        if take_failure(&self.failures) {
            return Err(CatalogError::Unavailable("injected failure".into()));
        }
        Ok(())
    }

    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogReader for MemoryCatalog {
    async fn list_items(&self, page: u32, page_size: u32) -> Result<CatalogPage, CatalogError> {
        self.check()?;
        let items = self.items.lock().unwrap();
        let size = page_size.max(1) as usize;
        let total_pages = items.len().div_ceil(size) as u32;
        let start = (page.max(1) as usize - 1) * size;
        Ok(CatalogPage {
            items: items
                .values()
                .skip(start)
                .take(size)
                .map(|item| ItemSummary {
                    id: item.id,
                    available_types: item.available_types.clone(),
                })
                .collect(),
            total_pages,
        })
    }

    async fn get_item(&self, id: i32) -> Result<Option<CatalogItem>, CatalogError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.check()?;
        Ok(self.items.lock().unwrap().get(&id).cloned())
    }
}

/// Serves `"{item_id}.{variant}"` as the content of every file
#[derive(Default)]
pub struct MemorySource {
    gone: Mutex<HashSet<CacheKey>>,
    unavailable: AtomicBool,
    names_unavailable: AtomicBool,
    delay: Mutex<Duration>,
    empty: AtomicBool,
    calls: AtomicUsize,
}

impl MemorySource {
    pub fn mark_gone(&self, key: &CacheKey) {
        self.gone.lock().unwrap().insert(key.clone());
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn set_names_unavailable(&self, unavailable: bool) {
        self.names_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Answer with a successful response whose body carries no bytes
    pub fn set_empty(&self, empty: bool) {
        self.empty.store(empty, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn name(key: &CacheKey) -> String {
        format!("book-{}.{}", key.item_id, key.variant)
    }
}

#[async_trait]
impl SourceFetcher for MemorySource {
    async fn fetch_bytes(
        &self,
        item: &CatalogItem,
        variant: &str,
    ) -> Result<SourceFile, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("injected failure".into()));
        }

        let key = CacheKey {
            item_id: item.id,
            variant: variant.to_string(),
        };
        if self.gone.lock().unwrap().contains(&key) {
            return Err(SourceError::Gone);
        }

        if self.empty.load(Ordering::SeqCst) {
            return Ok(SourceFile {
                filename: Self::name(&key),
                size: None,
                body: bytes_stream(Vec::new()),
            });
        }

        let content = key.to_string().replace(':', ".").into_bytes();
        Ok(SourceFile {
            filename: Self::name(&key),
            size: Some(content.len() as u64),
            body: bytes_stream(content),
        })
    }

    async fn filename(&self, key: &CacheKey) -> Result<FileName, SourceError> {
        if self.names_unavailable.load(Ordering::SeqCst) {
            return Err(SourceError::Unavailable("injected failure".into()));
        }
        Ok(FileName {
            filename: Self::name(key),
            filename_ascii: Self::name(key),
        })
    }
}

pub const SINK_CHAT_ID: i64 = -1000;

#[derive(Default)]
pub struct MemorySink {
    blobs: Mutex<HashMap<BlobPointer, (Vec<u8>, String)>>,
    next_message: AtomicI64,
    uploads: AtomicUsize,
    drop_uploads: AtomicBool,
}

impl MemorySink {
    pub fn uploads(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Delete a blob out-of-band
    pub fn drop_blob(&self, pointer: BlobPointer) {
        self.blobs.lock().unwrap().remove(&pointer);
    }

    /// Accept uploads but keep nothing, so every pointer dangles
    pub fn set_drop_uploads(&self, drop_uploads: bool) {
        self.drop_uploads.store(drop_uploads, Ordering::SeqCst);
    }

    pub fn caption(&self, pointer: BlobPointer) -> Option<String> {
        self.blobs
            .lock()
            .unwrap()
            .get(&pointer)
            .map(|(_, caption)| caption.clone())
    }
}

#[async_trait]
impl Sink for MemorySink {
    async fn upload(&self, file: SourceFile, caption: &str) -> Result<BlobPointer, SinkError> {
        let data = file
            .body
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .map_err(|e| SinkError::Failed(e.to_string()))?;

        self.uploads.fetch_add(1, Ordering::SeqCst);
        let pointer = BlobPointer {
            chat_id: SINK_CHAT_ID,
            message_id: self.next_message.fetch_add(1, Ordering::SeqCst) + 1,
        };
        if !self.drop_uploads.load(Ordering::SeqCst) {
            self.blobs
                .lock()
                .unwrap()
                .insert(pointer, (data, caption.to_string()));
        }
        Ok(pointer)
    }

    async fn download(&self, pointer: BlobPointer) -> Result<SinkFile, SinkError> {
        let data = self
            .blobs
            .lock()
            .unwrap()
            .get(&pointer)
            .map(|(data, _)| data.clone());
        match data {
            Some(data) => Ok(SinkFile {
                size: Some(data.len() as u64),
                body: bytes_stream(data),
            }),
            None => Err(SinkError::Dangling(pointer)),
        }
    }
}

#[derive(Default)]
struct IndexState {
    entries: Vec<CacheEntry>,
    next_id: i64,
    /// Entries another writer lands just before our next insert of the key
    racing: HashMap<CacheKey, BlobPointer>,
}

impl IndexState {
    fn find(&self, key: &CacheKey) -> Option<&CacheEntry> {
        self.entries
            .iter()
            .find(|e| e.item_id == key.item_id && e.variant == key.variant)
    }

    fn push(&mut self, key: &CacheKey, pointer: BlobPointer) -> CacheEntry {
        self.next_id += 1;
        let entry = CacheEntry {
            id: self.next_id,
            item_id: key.item_id,
            variant: key.variant.clone(),
            pointer,
        };
        self.entries.push(entry.clone());
        entry
    }
}

#[derive(Default)]
pub struct MemoryIndex {
    state: Mutex<IndexState>,
    batch_queries: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryIndex {
    pub fn seed(&self, key: &CacheKey, chat_id: i64, message_id: i64) -> CacheEntry {
        self.state.lock().unwrap().push(
            key,
            BlobPointer {
                chat_id,
                message_id,
            },
        )
    }

    /// Simulate a concurrent writer caching `key` right before the next insert
    pub fn reject_next_insert(&self, key: &CacheKey, chat_id: i64, message_id: i64) {
        self.state.lock().unwrap().racing.insert(
            key.clone(),
            BlobPointer {
                chat_id,
                message_id,
            },
        );
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().unwrap().entries.len()
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.get_entry(key).is_some()
    }

    pub fn get_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.state.lock().unwrap().find(key).cloned()
    }

    pub fn batch_queries(&self) -> usize {
        self.batch_queries.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), IndexError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IndexError("injected failure".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheIndex for MemoryIndex {
    async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, IndexError> {
        self.check()?;
        Ok(self.get_entry(key))
    }

    async fn exists_batch(&self, item_ids: &[i32]) -> Result<HashSet<CacheKey>, IndexError> {
        self.check()?;
        self.batch_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.lock().unwrap();
        Ok(state
            .entries
            .iter()
            .filter(|e| item_ids.contains(&e.item_id))
            .map(CacheEntry::key)
            .collect())
    }

    async fn insert(
        &self,
        key: &CacheKey,
        pointer: BlobPointer,
    ) -> Result<InsertOutcome, IndexError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        if let Some(other) = state.racing.remove(key) {
            state.push(key, other);
        }
        if state.find(key).is_some() {
            return Ok(InsertOutcome::Duplicate);
        }
        Ok(InsertOutcome::Inserted(state.push(key, pointer)))
    }

    async fn upsert(&self, key: &CacheKey, pointer: BlobPointer) -> Result<CacheEntry, IndexError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let existing = state
            .entries
            .iter_mut()
            .find(|e| e.item_id == key.item_id && e.variant == key.variant);
        if let Some(entry) = existing {
            entry.pointer = pointer;
            return Ok(entry.clone());
        }
        Ok(state.push(key, pointer))
    }

    async fn delete(&self, key: &CacheKey) -> Result<Option<CacheEntry>, IndexError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let position = state
            .entries
            .iter()
            .position(|e| e.item_id == key.item_id && e.variant == key.variant);
        Ok(position.map(|i| state.entries.remove(i)))
    }

    async fn evict(&self, entry: &CacheEntry) -> Result<bool, IndexError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        let before = state.entries.len();
        state.entries.retain(|e| {
            !(e.item_id == entry.item_id
                && e.variant == entry.variant
                && e.pointer == entry.pointer)
        });
        Ok(state.entries.len() < before)
    }

    async fn count(&self) -> Result<u64, IndexError> {
        self.check()?;
        Ok(self.entry_count() as u64)
    }

    async fn list_after(&self, after_id: i64, limit: usize) -> Result<Vec<CacheEntry>, IndexError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        let mut entries: Vec<CacheEntry> = state
            .entries
            .iter()
            .filter(|e| e.id > after_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.id);
        entries.truncate(limit);
        Ok(entries)
    }
}

/// Lease locks with polling acquisition
#[derive(Default)]
pub struct MemoryLocks {
    held: Mutex<HashMap<String, (i64, Instant)>>,
    next_token: AtomicI64,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, key: &str, lease: Duration) -> Option<LockHandle> {
        let mut held = self.held.lock().unwrap();
        let now = Instant::now();
        if matches!(held.get(key), Some((_, expires)) if *expires > now) {
            return None;
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        held.insert(key.to_string(), (token, now + lease));
        Some(LockHandle {
            key: key.to_string(),
            token,
        })
    }

    /// Hand `key` to another holder as if the current lease had lapsed
    pub fn steal(&self, key: &str) {
        let token = self.next_token.fetch_add(1, Ordering::SeqCst) + 1;
        self.held
            .lock()
            .unwrap()
            .insert(key.to_string(), (token, Instant::now() + Duration::from_secs(60)));
    }
}

#[async_trait]
impl LockManager for MemoryLocks {
    async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<LockHandle>, LockError> {
        let deadline = Instant::now() + wait;
        loop {
            if let Some(handle) = self.try_take(key, lease) {
                return Ok(Some(handle));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn renew(&self, handle: &LockHandle, lease: Duration) -> Result<bool, LockError> {
        let mut held = self.held.lock().unwrap();
        match held.get_mut(&handle.key) {
            Some((token, expires)) if *token == handle.token => {
                *expires = Instant::now() + lease;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, handle: &LockHandle) -> Result<(), LockError> {
        let mut held = self.held.lock().unwrap();
        if matches!(held.get(&handle.key), Some((token, _)) if *token == handle.token) {
            held.remove(&handle.key);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Ready,
    Leased,
    Failed,
}

struct StoredJob {
    id: i64,
    job: Job,
    identity: String,
    state: JobState,
    available_at: Instant,
    lease_expires: Option<Instant>,
    owner: Option<String>,
    attempts: u32,
}

impl StoredJob {
    fn active(&self) -> bool {
        matches!(self.state, JobState::Ready | JobState::Leased)
    }

    fn leased_by(&self, worker: &str) -> bool {
        self.state == JobState::Leased && self.owner.as_deref() == Some(worker)
    }
}

/// Queue with identity dedup over ready and leased jobs
#[derive(Default)]
pub struct MemoryQueue {
    jobs: Mutex<Vec<StoredJob>>,
    next_id: AtomicI64,
    accepted: AtomicUsize,
    unavailable: AtomicBool,
}

impl MemoryQueue {
    /// Jobs accepted (not merged) since creation
    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Ready and leased jobs in enqueue order
    pub fn pending_jobs(&self) -> Vec<Job> {
        self.jobs_in(|state| state != JobState::Failed)
    }

    pub fn failed_jobs(&self) -> Vec<Job> {
        self.jobs_in(|state| state == JobState::Failed)
    }

    fn jobs_in(&self, filter: impl Fn(JobState) -> bool) -> Vec<Job> {
        self.jobs
            .lock()
            .unwrap()
            .iter()
            .filter(|j| filter(j.state))
            .map(|j| j.job.clone())
            .collect()
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::Backend("injected failure".into()));
        }
        Ok(())
    }

    fn push(&self, jobs: &mut Vec<StoredJob>, job: &Job, delay: Duration) -> Enqueued {
        let identity = job.identity();
        if jobs.iter().any(|j| j.active() && j.identity == identity) {
            return Enqueued::Merged;
        }
        self.accepted.fetch_add(1, Ordering::SeqCst);
        jobs.push(StoredJob {
            id: self.next_id.fetch_add(1, Ordering::SeqCst) + 1,
            job: job.clone(),
            identity,
            state: JobState::Ready,
            available_at: Instant::now() + delay,
            lease_expires: None,
            owner: None,
            attempts: 0,
        });
        Enqueued::Accepted
    }

    /// Apply `apply` to `id` only while `worker` holds its lease
    fn settle(&self, id: i64, worker: &str, apply: impl FnOnce(&mut StoredJob)) -> bool {
        let mut jobs = self.jobs.lock().unwrap();
        match jobs.iter_mut().find(|j| j.id == id && j.leased_by(worker)) {
            Some(job) => {
                apply(job);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, job: &Job, delay: Duration) -> Result<Enqueued, QueueError> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        Ok(self.push(&mut jobs, job, delay))
    }

    async fn enqueue_many(&self, batch: &[Job]) -> Result<Vec<Enqueued>, QueueError> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        Ok(batch
            .iter()
            .map(|job| self.push(&mut jobs, job, Duration::ZERO))
            .collect())
    }

    async fn dequeue(&self, worker: &str, lease: Duration) -> Result<Option<Delivery>, QueueError> {
        self.check()?;
        let now = Instant::now();
        let mut jobs = self.jobs.lock().unwrap();
        let next = jobs.iter_mut().find(|j| match j.state {
            JobState::Ready => j.available_at <= now,
            JobState::Leased => j.lease_expires.is_some_and(|t| t < now),
            JobState::Failed => false,
        });
        Ok(next.map(|j| {
            j.state = JobState::Leased;
            j.attempts += 1;
            j.lease_expires = Some(now + lease);
            j.owner = Some(worker.to_string());
            Delivery {
                id: j.id,
                job: j.job.clone(),
                attempts: j.attempts,
            }
        }))
    }

    async fn complete(&self, id: i64, worker: &str) -> Result<bool, QueueError> {
        self.check()?;
        let mut jobs = self.jobs.lock().unwrap();
        let before = jobs.len();
        jobs.retain(|j| !(j.id == id && j.leased_by(worker)));
        Ok(jobs.len() < before)
    }

    async fn retry(
        &self,
        id: i64,
        worker: &str,
        delay: Duration,
        _reason: &str,
    ) -> Result<bool, QueueError> {
        self.check()?;
        Ok(self.settle(id, worker, |j| {
            j.state = JobState::Ready;
            j.available_at = Instant::now() + delay;
            j.lease_expires = None;
            j.owner = None;
        }))
    }

    async fn fail(&self, id: i64, worker: &str, _reason: &str) -> Result<bool, QueueError> {
        self.check()?;
        Ok(self.settle(id, worker, |j| {
            j.state = JobState::Failed;
            j.lease_expires = None;
            j.owner = None;
        }))
    }

    async fn counts(&self) -> Result<QueueStats, QueueError> {
        self.check()?;
        let jobs = self.jobs.lock().unwrap();
        let count = |state: JobState| jobs.iter().filter(|j| j.state == state).count() as u64;
        Ok(QueueStats {
            ready: count(JobState::Ready),
            leased: count(JobState::Leased),
            failed: count(JobState::Failed),
        })
    }
}

/// All fakes wired together, with quick settings
#[derive(Default)]
pub struct Harness {
    pub catalog: Arc<MemoryCatalog>,
    pub source: Arc<MemorySource>,
    pub sink: Arc<MemorySink>,
    pub index: Arc<MemoryIndex>,
    pub locks: Arc<MemoryLocks>,
    pub queue: Arc<MemoryQueue>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn item(id: i32, types: &[&str]) -> CatalogItem {
        CatalogItem {
            id,
            source_id: 1,
            remote_id: id.unsigned_abs() + 1000,
            title: format!("Book {}", id),
            authors: vec![CatalogAuthor {
                first_name: "Author".into(),
                last_name: format!("No{}", id),
                middle_name: String::new(),
            }],
            available_types: types.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators {
            catalog: self.catalog.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            index: self.index.clone(),
            locks: self.locks.clone(),
        }
    }

    pub fn fill_settings() -> FillSettings {
        FillSettings {
            lock_wait: Duration::from_millis(500),
            lock_lease: Duration::from_secs(60),
            retry: RetryPolicy::new(Duration::ZERO, Duration::ZERO),
            catalog_attempts: 3,
            catalog_retry_delay: Duration::from_millis(1),
            caption_limit: CAPTION_LIMIT,
        }
    }

    pub fn runner_settings() -> RunnerSettings {
        RunnerSettings {
            job_lease: Duration::from_secs(60),
            max_attempts: 5,
            idle_poll: Duration::from_millis(10),
        }
    }

    pub fn filler(&self) -> Filler {
        Filler::new(self.collaborators(), Self::fill_settings())
    }

    pub fn crawler(&self) -> Crawler {
        Crawler::new(
            self.catalog.clone(),
            self.index.clone(),
            self.queue.clone(),
            CrawlSettings {
                page_size: 50,
                page_retry: Duration::ZERO,
            },
        )
    }

    pub fn runner(&self) -> JobRunner {
        self.runner_with(Self::runner_settings())
    }

    pub fn runner_with(&self, settings: RunnerSettings) -> JobRunner {
        JobRunner::new(
            self.queue.clone(),
            Arc::new(self.filler()),
            Arc::new(self.crawler()),
            settings,
        )
    }

    pub fn reader(&self) -> CacheReader {
        CacheReader::new(self.collaborators(), Arc::new(self.filler()), 1)
    }

    /// Take the fill lock for `key` as some other worker would
    pub async fn hold_lock(&self, key: &CacheKey) -> LockGuard {
        let locks: Arc<dyn LockManager> = self.locks.clone();
        LockGuard::acquire(&locks, key, Duration::ZERO, Duration::from_secs(60))
            .await
            .expect("memory locks never error")
            .expect("lock should be free")
    }
}
