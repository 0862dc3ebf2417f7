//! The fill state machine
//!
//! `ensure_cached` walks check-cache, validate, lock, re-check, fetch,
//! upload and persist for one key. Every collaborator failure is classified
//! here into a terminal or transient outcome; none escape as errors.

use crate::caption::{build_caption, CAPTION_LIMIT};
use crate::error::{CatalogError, SourceError};
use crate::lock::LockGuard;
use crate::metrics::FillMetrics;
use crate::ports::{CacheIndex, CatalogReader, InsertOutcome, LockManager, Sink, SourceFetcher};
use crate::retry::{with_attempts, RetryPolicy};
use crate::types::{CacheEntry, CacheKey, CatalogItem};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the pipeline talks to, injected by the process entry point
#[derive(Clone)]
pub struct Collaborators {
    pub catalog: Arc<dyn CatalogReader>,
    pub source: Arc<dyn SourceFetcher>,
    pub sink: Arc<dyn Sink>,
    pub index: Arc<dyn CacheIndex>,
    pub locks: Arc<dyn LockManager>,
}

#[derive(Debug, Clone)]
pub struct FillSettings {
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub retry: RetryPolicy,
    pub catalog_attempts: usize,
    pub catalog_retry_delay: Duration,
    pub caption_limit: usize,
}

impl Default for FillSettings {
    fn default() -> Self {
        Self {
            lock_wait: Duration::from_secs(5),
            lock_lease: Duration::from_secs(600),
            retry: RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(900)),
            catalog_attempts: 3,
            catalog_retry_delay: Duration::from_secs(1),
            caption_limit: CAPTION_LIMIT,
        }
    }
}

/// Why a key will never be filled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalReason {
    ItemNotFound,
    VariantNotOffered,
    SourceGone,
}

impl fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalReason::ItemNotFound => write!(f, "item not in catalog"),
            TerminalReason::VariantNotOffered => write!(f, "variant not offered"),
            TerminalReason::SourceGone => write!(f, "source file does not exist"),
        }
    }
}

/// Why a fill could not finish this time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryReason {
    LockBusy,
    Catalog(String),
    Source(String),
    Sink(String),
    Index(String),
    Lock(String),
}

impl fmt::Display for RetryReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryReason::LockBusy => write!(f, "another fill holds the lock"),
            RetryReason::Catalog(e) => write!(f, "catalog: {}", e),
            RetryReason::Source(e) => write!(f, "source: {}", e),
            RetryReason::Sink(e) => write!(f, "sink: {}", e),
            RetryReason::Index(e) => write!(f, "index: {}", e),
            RetryReason::Lock(e) => write!(f, "lock: {}", e),
        }
    }
}

impl RetryReason {
    /// Stable label for metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RetryReason::LockBusy => "lock_busy",
            RetryReason::Catalog(_) => "catalog",
            RetryReason::Source(_) => "source",
            RetryReason::Sink(_) => "sink",
            RetryReason::Index(_) => "index",
            RetryReason::Lock(_) => "lock",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FillOutcome {
    Cached(CacheEntry),
    NotApplicable(TerminalReason),
    /// Background caller: run again after `delay`
    Retry { delay: Duration, reason: RetryReason },
    /// Interactive caller: nothing scheduled, try again later
    Unavailable(RetryReason),
}

pub struct Filler {
    parts: Collaborators,
    settings: FillSettings,
    metrics: Option<Arc<FillMetrics>>,
}

impl Filler {
    pub fn new(parts: Collaborators, settings: FillSettings) -> Self {
        Self {
            parts,
            settings,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<FillMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn settings(&self) -> &FillSettings {
        &self.settings
    }

    pub async fn ensure_cached(&self, key: &CacheKey, by_request: bool) -> FillOutcome {
        let outcome = self.classify(key, by_request).await;
        if let Some(metrics) = &self.metrics {
            metrics.record(&outcome);
        }
        outcome
    }

    async fn classify(&self, key: &CacheKey, by_request: bool) -> FillOutcome {
        match self.fill(key).await {
            Ok(outcome) => outcome,
            Err(reason) if by_request => {
                debug!(key = %key, reason = %reason, "Fill unavailable for interactive caller");
                FillOutcome::Unavailable(reason)
            }
            Err(reason) => {
                let delay = self.settings.retry.jittered();
                debug!(key = %key, reason = %reason, delay = ?delay, "Fill will be retried");
                FillOutcome::Retry { delay, reason }
            }
        }
    }

    async fn fill(&self, key: &CacheKey) -> Result<FillOutcome, RetryReason> {
        if let Some(entry) = self.cached(key).await? {
            if let Some(metrics) = &self.metrics {
                metrics.record_hit();
            }
            return Ok(FillOutcome::Cached(entry));
        }

        let Some(item) = self.lookup_item(key.item_id).await? else {
            return Ok(FillOutcome::NotApplicable(TerminalReason::ItemNotFound));
        };
        if !item.offers(&key.variant) {
            return Ok(FillOutcome::NotApplicable(TerminalReason::VariantNotOffered));
        }

        let guard = LockGuard::acquire(
            &self.parts.locks,
            key,
            self.settings.lock_wait,
            self.settings.lock_lease,
        )
        .await
        .map_err(|e| RetryReason::Lock(e.to_string()))?
        .ok_or(RetryReason::LockBusy)?;

        let lease = self.settings.lock_lease;
        let result = guard
            .hold_while(lease, self.fill_locked(key, &item))
            .await
            .unwrap_or_else(|| Err(RetryReason::Lock("lease lost during fill".into())));
        guard.release().await;
        result
    }

    async fn fill_locked(
        &self,
        key: &CacheKey,
        item: &CatalogItem,
    ) -> Result<FillOutcome, RetryReason> {
        // Another worker may have finished while we waited for the lock
        if let Some(entry) = self.cached(key).await? {
            return Ok(FillOutcome::Cached(entry));
        }

        let file = match self.parts.source.fetch_bytes(item, &key.variant).await {
            Ok(file) => file,
            Err(SourceError::Gone) => {
                info!(key = %key, "Source reports file does not exist");
                return Ok(FillOutcome::NotApplicable(TerminalReason::SourceGone));
            }
            Err(e) => return Err(RetryReason::Source(e.to_string())),
        };
        let file = match file.non_empty().await {
            Ok(Some(file)) => file,
            Ok(None) => {
                warn!(key = %key, "Source answered with an empty body");
                return Err(RetryReason::Source("empty response body".into()));
            }
            Err(e) => return Err(RetryReason::Source(e.to_string())),
        };

        let caption = build_caption(item, self.settings.caption_limit);
        let pointer = self
            .parts
            .sink
            .upload(file, &caption)
            .await
            .map_err(|e| RetryReason::Sink(e.to_string()))?;
        if let Some(metrics) = &self.metrics {
            metrics.record_upload();
        }

        let inserted = self
            .parts
            .index
            .insert(key, pointer)
            .await
            .map_err(|e| RetryReason::Index(e.to_string()))?;

        match inserted {
            InsertOutcome::Inserted(entry) => {
                info!(
                    key = %key,
                    chat_id = pointer.chat_id,
                    message_id = pointer.message_id,
                    "Cached file"
                );
                Ok(FillOutcome::Cached(entry))
            }
            InsertOutcome::Duplicate => {
                warn!(key = %key, "Key was cached concurrently, keeping existing entry");
                self.cached(key)
                    .await?
                    .map(FillOutcome::Cached)
                    .ok_or_else(|| RetryReason::Index("entry vanished after duplicate insert".into()))
            }
        }
    }

    async fn cached(&self, key: &CacheKey) -> Result<Option<CacheEntry>, RetryReason> {
        self.parts
            .index
            .get(key)
            .await
            .map_err(|e| RetryReason::Index(e.to_string()))
    }

    async fn lookup_item(&self, id: i32) -> Result<Option<CatalogItem>, RetryReason> {
        with_attempts(
            "catalog lookup",
            self.settings.catalog_attempts,
            self.settings.catalog_retry_delay,
            CatalogError::is_transient,
            || self.parts.catalog.get_item(id),
        )
        .await
        .map_err(|e| RetryReason::Catalog(e.to_string()))
    }
}
