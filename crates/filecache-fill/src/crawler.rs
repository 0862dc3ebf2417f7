use crate::error::IndexError;
use crate::job::{Job, JobResult};
use crate::ports::{CacheIndex, CatalogReader, Enqueued, TaskQueue};
use crate::types::{CacheKey, ItemSummary};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct CrawlSettings {
    pub page_size: u32,
    /// Fixed delay before a failed crawl or page job runs again
    pub page_retry: Duration,
}

impl Default for CrawlSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            page_retry: Duration::from_secs(30),
        }
    }
}

/// Walks the catalog and queues a fill for every uncached variant
pub struct Crawler {
    catalog: Arc<dyn CatalogReader>,
    index: Arc<dyn CacheIndex>,
    queue: Arc<dyn TaskQueue>,
    settings: CrawlSettings,
}

impl Crawler {
    pub fn new(
        catalog: Arc<dyn CatalogReader>,
        index: Arc<dyn CacheIndex>,
        queue: Arc<dyn TaskQueue>,
        settings: CrawlSettings,
    ) -> Self {
        Self {
            catalog,
            index,
            queue,
            settings,
        }
    }

    /// Read page 1 for the page count, then queue one job per page
    pub async fn crawl(&self) -> JobResult {
        let first = match self.catalog.list_items(1, self.settings.page_size).await {
            Ok(page) => page,
            Err(e) => return self.retry(format!("listing catalog: {}", e)),
        };

        let jobs: Vec<Job> = (1..=first.total_pages)
            .map(|page| Job::CrawlPage { page })
            .collect();

        match self.queue.enqueue_many(&jobs).await {
            Ok(results) => {
                info!(
                    pages = first.total_pages,
                    queued = accepted(&results),
                    "Catalog crawl fanned out"
                );
                JobResult::Done
            }
            Err(e) => self.retry(format!("queueing pages: {}", e)),
        }
    }

    /// Diff one page against the index and queue fills for the gaps.
    /// The page is listed and diffed before anything is queued, and the
    /// batch is queued atomically, so a failure never leaves a partial page.
    pub async fn crawl_page(&self, page: u32) -> JobResult {
        let listing = match self.catalog.list_items(page, self.settings.page_size).await {
            Ok(listing) => listing,
            Err(e) => return self.retry(format!("listing page {}: {}", page, e)),
        };

        let missing = match self.missing_keys(&listing.items).await {
            Ok(missing) => missing,
            Err(e) => return self.retry(format!("diffing page {}: {}", page, e)),
        };
        if missing.is_empty() {
            return JobResult::Done;
        }

        let jobs: Vec<Job> = missing.iter().map(|key| Job::ensure(key, false)).collect();
        match self.queue.enqueue_many(&jobs).await {
            Ok(results) => {
                info!(
                    page,
                    missing = missing.len(),
                    queued = accepted(&results),
                    "Crawled catalog page"
                );
                JobResult::Done
            }
            Err(e) => self.retry(format!("queueing fills for page {}: {}", page, e)),
        }
    }

    /// Offered keys of `items` absent from the index, using one index query
    pub async fn missing_keys(&self, items: &[ItemSummary]) -> Result<Vec<CacheKey>, IndexError> {
        let ids: Vec<i32> = items.iter().map(|item| item.id).collect();
        let cached = self.index.exists_batch(&ids).await?;

        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for item in items {
            for variant in &item.available_types {
                let key = match CacheKey::new(item.id, variant.as_str()) {
                    Ok(key) => key,
                    Err(e) => {
                        warn!(item_id = item.id, error = %e, "Skipping unusable variant");
                        continue;
                    }
                };
                if !cached.contains(&key) && seen.insert(key.clone()) {
                    missing.push(key);
                }
            }
        }
        Ok(missing)
    }

    fn retry(&self, reason: String) -> JobResult {
        warn!(reason = %reason, delay = ?self.settings.page_retry, "Crawl step failed");
        JobResult::Retry {
            delay: self.settings.page_retry,
            reason,
        }
    }
}

fn accepted(results: &[Enqueued]) -> usize {
    results.iter().filter(|r| **r == Enqueued::Accepted).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;

    fn both_formats(harness: &Harness, count: i32) {
        for id in 1..=count {
            harness.catalog.add(Harness::item(id, &["pdf", "epub"]));
        }
    }

    #[tokio::test]
    async fn test_crawl_page_enqueues_only_missing_pairs() {
        let harness = Harness::new();
        both_formats(&harness, 50);
        // 30 of the 100 pairs already cached
        for id in 1..=30 {
            let variant = if id % 2 == 0 { "pdf" } else { "epub" };
            harness
                .index
                .seed(&CacheKey::new(id, variant).unwrap(), 1, i64::from(id));
        }
        let crawler = harness.crawler();

        assert_eq!(crawler.crawl_page(1).await, JobResult::Done);

        let queued = harness.queue.pending_jobs();
        assert_eq!(queued.len(), 70);
        assert_eq!(harness.index.batch_queries(), 1);
        for job in queued {
            let Job::EnsureCached {
                item_id,
                variant,
                by_request,
            } = job
            else {
                panic!("unexpected job {:?}", job);
            };
            assert!(!by_request);
            let key = CacheKey::new(item_id, variant).unwrap();
            assert!(!harness.index.contains(&key));
        }
    }

    #[tokio::test]
    async fn test_crawl_page_twice_enqueues_nothing_new() {
        let harness = Harness::new();
        both_formats(&harness, 10);
        let crawler = harness.crawler();

        crawler.crawl_page(1).await;
        let first = harness.queue.accepted();
        crawler.crawl_page(1).await;

        assert_eq!(first, 20);
        assert_eq!(harness.queue.accepted(), first);
    }

    #[tokio::test]
    async fn test_crawl_fans_out_pages() {
        let harness = Harness::new();
        both_formats(&harness, 120);

        assert_eq!(harness.crawler().crawl().await, JobResult::Done);

        let pages: Vec<Job> = harness.queue.pending_jobs();
        assert_eq!(
            pages,
            vec![
                Job::CrawlPage { page: 1 },
                Job::CrawlPage { page: 2 },
                Job::CrawlPage { page: 3 }
            ]
        );
    }

    #[tokio::test]
    async fn test_catalog_failure_retries_whole_page() {
        let harness = Harness::new();
        both_formats(&harness, 5);
        harness.catalog.fail_next(1);

        let result = harness.crawler().crawl_page(1).await;
        assert!(matches!(result, JobResult::Retry { .. }));
        assert!(harness.queue.pending_jobs().is_empty());
    }

    #[tokio::test]
    async fn test_queue_failure_enqueues_nothing() {
        let harness = Harness::new();
        both_formats(&harness, 5);
        harness.queue.set_unavailable(true);

        let result = harness.crawler().crawl_page(1).await;
        assert!(matches!(result, JobResult::Retry { .. }));
        harness.queue.set_unavailable(false);
        assert!(harness.queue.pending_jobs().is_empty());
    }
}
