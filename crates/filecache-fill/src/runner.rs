use crate::crawler::Crawler;
use crate::error::QueueError;
use crate::filler::{FillOutcome, Filler};
use crate::job::{Job, JobResult};
use crate::ports::TaskQueue;
use crate::types::CacheKey;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// How long a dequeued job stays invisible to other workers
    pub job_lease: Duration,
    /// Deliveries after which a still-failing job is parked
    pub max_attempts: u32,
    /// Sleep when the queue is empty
    pub idle_poll: Duration,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            job_lease: Duration::from_secs(900),
            max_attempts: 5,
            idle_poll: Duration::from_secs(1),
        }
    }
}

/// Queue consumer: leases jobs, runs them, and settles each delivery
pub struct JobRunner {
    queue: Arc<dyn TaskQueue>,
    filler: Arc<Filler>,
    crawler: Arc<Crawler>,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        filler: Arc<Filler>,
        crawler: Arc<Crawler>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            queue,
            filler,
            crawler,
            settings,
        }
    }

    pub async fn execute(&self, job: &Job) -> JobResult {
        match job {
            Job::Crawl => self.crawler.crawl().await,
            Job::CrawlPage { page } => self.crawler.crawl_page(*page).await,
            Job::EnsureCached {
                item_id,
                variant,
                by_request,
            } => {
                let key = match CacheKey::new(*item_id, variant.as_str()) {
                    Ok(key) => key,
                    Err(e) => return JobResult::Failed(e.to_string()),
                };
                match self.filler.ensure_cached(&key, *by_request).await {
                    FillOutcome::Cached(_) => JobResult::Done,
                    FillOutcome::NotApplicable(reason) => {
                        info!(key = %key, reason = %reason, "Nothing to cache");
                        JobResult::Done
                    }
                    FillOutcome::Retry { delay, reason } => JobResult::Retry {
                        delay,
                        reason: reason.to_string(),
                    },
                    FillOutcome::Unavailable(reason) => {
                        debug!(key = %key, reason = %reason, "Interactive fill not retried");
                        JobResult::Done
                    }
                }
            }
        }
    }

    /// Process at most one job. Returns `false` when nothing was ready.
    pub async fn run_once(&self, worker: &str) -> Result<bool, QueueError> {
        let Some(delivery) = self.queue.dequeue(worker, self.settings.job_lease).await? else {
            return Ok(false);
        };
        debug!(worker, job_id = delivery.id, job = %delivery.job, attempt = delivery.attempts, "Running job");

        let settled = match self.execute(&delivery.job).await {
            JobResult::Done => self.queue.complete(delivery.id, worker).await?,
            JobResult::Retry { reason, .. } if delivery.attempts >= self.settings.max_attempts => {
                warn!(job_id = delivery.id, job = %delivery.job, reason = %reason, "Job out of attempts");
                let reason = format!("gave up after {} attempts: {}", delivery.attempts, reason);
                self.queue.fail(delivery.id, worker, &reason).await?
            }
            JobResult::Retry { delay, reason } => {
                self.queue.retry(delivery.id, worker, delay, &reason).await?
            }
            JobResult::Failed(reason) => {
                warn!(job_id = delivery.id, job = %delivery.job, reason = %reason, "Job failed");
                self.queue.fail(delivery.id, worker, &reason).await?
            }
        };
        if !settled {
            warn!(worker, job_id = delivery.id, job = %delivery.job, "Job lease expired before settling, left to its new owner");
        }
        Ok(true)
    }

    /// Consume jobs until `shutdown` flips to `true`
    pub async fn run(&self, worker: String, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %worker, "Worker started");
        while !*shutdown.borrow() {
            let idle = match self.run_once(&worker).await {
                Ok(true) => false,
                Ok(false) => true,
                Err(e @ QueueError::Malformed { .. }) => {
                    warn!(worker = %worker, error = %e, "Dropped malformed job");
                    false
                }
                Err(e) => {
                    error!(worker = %worker, error = %e, "Queue error");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.settings.idle_poll) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
        info!(worker = %worker, "Worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    #[tokio::test]
    async fn test_full_pipeline_fills_catalog() {
        let harness = Harness::new();
        for id in 1..=3 {
            harness.catalog.add(Harness::item(id, &["pdf", "fb2"]));
        }
        let runner = harness.runner();
        harness.queue.enqueue(&Job::Crawl, Duration::ZERO).await.unwrap();

        while runner.run_once("w1").await.unwrap() {}

        assert_eq!(harness.index.entry_count(), 6);
        assert_eq!(harness.sink.uploads(), 6);
        assert!(harness.queue.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried_then_parked() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(1, &["pdf"]));
        harness.source.set_unavailable(true);
        let runner = harness.runner_with(RunnerSettings {
            max_attempts: 2,
            ..Harness::runner_settings()
        });
        let job = Job::EnsureCached {
            item_id: 1,
            variant: "pdf".into(),
            by_request: false,
        };
        harness.queue.enqueue(&job, Duration::ZERO).await.unwrap();

        assert!(runner.run_once("w1").await.unwrap());
        assert_eq!(harness.queue.pending_jobs(), vec![job.clone()]);

        // Harness retry delays are zero, so the job is immediately eligible again
        assert!(runner.run_once("w1").await.unwrap());
        assert!(harness.queue.pending_jobs().is_empty());
        assert_eq!(harness.queue.failed_jobs(), vec![job]);
    }

    #[tokio::test]
    async fn test_terminal_job_completes() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(1, &["pdf"]));
        let runner = harness.runner();
        let job = Job::EnsureCached {
            item_id: 1,
            variant: "epub".into(),
            by_request: false,
        };
        harness.queue.enqueue(&job, Duration::ZERO).await.unwrap();

        assert!(runner.run_once("w1").await.unwrap());
        assert!(!runner.run_once("w1").await.unwrap());
        assert!(harness.queue.failed_jobs().is_empty());
        assert_eq!(harness.source.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_variant_fails_job() {
        let harness = Harness::new();
        let runner = harness.runner();
        let job = Job::EnsureCached {
            item_id: 1,
            variant: "way-too-long".into(),
            by_request: false,
        };
        harness.queue.enqueue(&job, Duration::ZERO).await.unwrap();

        runner.run_once("w1").await.unwrap();
        assert_eq!(harness.queue.failed_jobs(), vec![job]);
    }

    #[tokio::test]
    async fn test_expired_lease_settles_only_for_new_owner() {
        let harness = Harness::new();
        harness.catalog.add(Harness::item(1, &["pdf"]));
        harness.source.set_delay(Duration::from_millis(300));
        let runner = Arc::new(harness.runner());
        let job = Job::EnsureCached {
            item_id: 1,
            variant: "pdf".into(),
            by_request: false,
        };
        harness.queue.enqueue(&job, Duration::ZERO).await.unwrap();

        // First worker leases the job and stalls past its lease
        let stale = harness
            .queue
            .dequeue("w1", Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let second = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run_once("w2").await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!harness.queue.complete(stale.id, "w1").await.unwrap());
        assert!(!harness
            .queue
            .retry(stale.id, "w1", Duration::ZERO, "late")
            .await
            .unwrap());
        assert_eq!(harness.queue.pending_jobs(), vec![job]);

        assert!(second.await.unwrap().unwrap());
        assert!(harness.queue.pending_jobs().is_empty());
        assert!(harness.queue.failed_jobs().is_empty());
        assert_eq!(harness.sink.uploads(), 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let harness = Harness::new();
        let runner = Arc::new(harness.runner());
        let (tx, rx) = watch::channel(false);

        let handle = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.run("w1".into(), rx).await })
        };
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
