//! Prometheus counters for the fill pipeline
//!
//! Registered on a caller-owned `Registry` so the server can expose them
//! next to its own metrics and tests can read them in isolation.

use crate::filler::{FillOutcome, RetryReason};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry};

pub struct FillMetrics {
    outcomes: IntCounterVec,
    retries: IntCounterVec,
    hits: IntCounter,
    uploads: IntCounter,
}

impl FillMetrics {
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let outcomes = IntCounterVec::new(
            Opts::new(
                "filecache_fill_outcomes_total",
                "Fill attempts by final outcome",
            ),
            &["outcome"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new(
                "filecache_fill_retries_total",
                "Fills that could not finish, by cause",
            ),
            &["reason"],
        )?;
        let hits = IntCounter::new(
            "filecache_cache_hits_total",
            "Fills answered from the index without fetching",
        )?;
        let uploads = IntCounter::new(
            "filecache_uploads_total",
            "Files fetched from the source and stored in the sink",
        )?;

        registry.register(Box::new(outcomes.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(hits.clone()))?;
        registry.register(Box::new(uploads.clone()))?;

        Ok(Self {
            outcomes,
            retries,
            hits,
            uploads,
        })
    }

    pub(crate) fn record(&self, outcome: &FillOutcome) {
        let label = match outcome {
            FillOutcome::Cached(_) => "cached",
            FillOutcome::NotApplicable(_) => "not_applicable",
            FillOutcome::Retry { reason, .. } => {
                self.record_retry(reason);
                "retry"
            }
            FillOutcome::Unavailable(reason) => {
                self.record_retry(reason);
                "unavailable"
            }
        };
        self.outcomes.with_label_values(&[label]).inc();
    }

    fn record_retry(&self, reason: &RetryReason) {
        self.retries.with_label_values(&[reason.kind()]).inc();
    }

    pub(crate) fn record_hit(&self) {
        self.hits.inc();
    }

    pub(crate) fn record_upload(&self) {
        self.uploads.inc();
    }

    pub fn outcome_count(&self, outcome: &str) -> u64 {
        self.outcomes.with_label_values(&[outcome]).get()
    }

    pub fn retry_count(&self, reason: &str) -> u64 {
        self.retries.with_label_values(&[reason]).get()
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.get()
    }

    pub fn upload_count(&self) -> u64 {
        self.uploads.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_twice_on_one_registry_fails() {
        let registry = Registry::new();
        assert!(FillMetrics::register(&registry).is_ok());
        assert!(FillMetrics::register(&registry).is_err());
    }

    #[test]
    fn test_retry_outcomes_count_reason() {
        let registry = Registry::new();
        let metrics = FillMetrics::register(&registry).unwrap();

        metrics.record(&FillOutcome::Unavailable(RetryReason::LockBusy));
        metrics.record(&FillOutcome::Retry {
            delay: std::time::Duration::ZERO,
            reason: RetryReason::Source("timeout".into()),
        });

        assert_eq!(metrics.outcome_count("unavailable"), 1);
        assert_eq!(metrics.outcome_count("retry"), 1);
        assert_eq!(metrics.retry_count("lock_busy"), 1);
        assert_eq!(metrics.retry_count("source"), 1);
        assert_eq!(metrics.outcome_count("cached"), 0);
    }
}
