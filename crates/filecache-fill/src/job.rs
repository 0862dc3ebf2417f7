use crate::types::CacheKey;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Work items carried by the task queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Job {
    /// Discover the catalog size and fan out one job per page
    Crawl,
    CrawlPage {
        page: u32,
    },
    EnsureCached {
        item_id: i32,
        variant: String,
        #[serde(default)]
        by_request: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Crawl,
    CrawlPage,
    EnsureCached,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Crawl => "crawl",
            JobKind::CrawlPage => "crawl_page",
            JobKind::EnsureCached => "ensure_cached",
        }
    }

    fn identity_prefix(&self) -> &'static str {
        match self {
            JobKind::Crawl => "crawl",
            JobKind::CrawlPage => "crawl_page",
            JobKind::EnsureCached => "ensure",
        }
    }
}

/// Deduplication identity of a job: the kind prefix followed by the key parts,
/// colon separated. Two jobs with equal identities collapse in the queue.
pub fn job_identity(kind: JobKind, key: &[&dyn fmt::Display]) -> String {
    let mut identity = kind.identity_prefix().to_string();
    for part in key {
        identity.push(':');
        identity.push_str(&part.to_string());
    }
    identity
}

impl Job {
    pub fn ensure(key: &CacheKey, by_request: bool) -> Self {
        Job::EnsureCached {
            item_id: key.item_id,
            variant: key.variant.clone(),
            by_request,
        }
    }

    pub fn kind(&self) -> JobKind {
        match self {
            Job::Crawl => JobKind::Crawl,
            Job::CrawlPage { .. } => JobKind::CrawlPage,
            Job::EnsureCached { .. } => JobKind::EnsureCached,
        }
    }

    /// Interactive and background fills of one key share an identity
    pub fn identity(&self) -> String {
        match self {
            Job::Crawl => job_identity(JobKind::Crawl, &[]),
            Job::CrawlPage { page } => job_identity(JobKind::CrawlPage, &[page]),
            Job::EnsureCached {
                item_id, variant, ..
            } => job_identity(JobKind::EnsureCached, &[item_id, variant]),
        }
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identity())
    }
}

/// How a job handler finished, as interpreted by the queue adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobResult {
    Done,
    Retry { delay: Duration, reason: String },
    Failed(String),
}
