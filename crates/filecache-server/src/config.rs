use crate::error::{Result, ServerError};
use filecache_fill::{CrawlSettings, FillSettings, RetryPolicy, RunnerSettings, CAPTION_LIMIT};
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Service configuration parsed from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub api_key: String,
    pub database_url: String,
    pub database_max_connections: u32,

    pub library_url: String,
    pub library_api_key: String,
    pub downloader_url: String,
    pub downloader_api_key: String,
    pub files_url: String,
    pub files_api_key: String,

    pub workers: usize,
    pub lock_wait: Duration,
    pub lock_lease: Duration,
    pub job_lease: Duration,
    pub retry_min: Duration,
    pub retry_max: Duration,
    pub page_retry: Duration,
    pub max_attempts: u32,
    pub heal_attempts: usize,
    pub crawl_interval: Option<Duration>,
    pub catalog_page_size: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Parse from any variable source; `from_env` passes the process environment
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let vars = Vars(&lookup);

        let database_url = match vars.get("DATABASE_URL") {
            Some(url) => url,
            None => {
                let user = vars.required("POSTGRES_USER")?;
                let password = vars.get("POSTGRES_PASSWORD").unwrap_or_default();
                let host = vars.required("POSTGRES_HOST")?;
                let port = vars.get("POSTGRES_PORT").unwrap_or_else(|| "5432".into());
                let db = vars.required("POSTGRES_DB")?;
                format!("postgresql://{}:{}@{}:{}/{}", user, password, host, port, db)
            }
        };

        Ok(Self {
            port: vars.parsed("PORT", 8080)?,
            api_key: vars.required("API_KEY")?,
            database_url,
            database_max_connections: vars.parsed("DATABASE_MAX_CONNECTIONS", 10)?,

            library_url: vars.required("LIBRARY_URL")?,
            library_api_key: vars.required("LIBRARY_API_KEY")?,
            downloader_url: vars.required("DOWNLOADER_URL")?,
            downloader_api_key: vars.required("DOWNLOADER_API_KEY")?,
            files_url: vars.required("FILES_SERVER_URL")?,
            files_api_key: vars.required("FILES_SERVER_API_KEY")?,

            workers: vars.parsed("WORKERS", 4)?,
            lock_wait: vars.secs("LOCK_WAIT_SECS", 5)?,
            lock_lease: vars.secs("LOCK_LEASE_SECS", 600)?,
            job_lease: vars.secs("JOB_LEASE_SECS", 900)?,
            retry_min: vars.secs("RETRY_MIN_SECS", 30)?,
            retry_max: vars.secs("RETRY_MAX_SECS", 900)?,
            page_retry: vars.secs("PAGE_RETRY_SECS", 30)?,
            max_attempts: vars.parsed("MAX_ATTEMPTS", 5)?,
            heal_attempts: vars.parsed("HEAL_ATTEMPTS", 1)?,
            crawl_interval: vars
                .get("CRAWL_INTERVAL_SECS")
                .map(|v| parse("CRAWL_INTERVAL_SECS", &v).map(Duration::from_secs))
                .transpose()?,
            catalog_page_size: vars.parsed("CATALOG_PAGE_SIZE", 50)?,
        })
    }

    pub fn fill_settings(&self) -> FillSettings {
        FillSettings {
            lock_wait: self.lock_wait,
            lock_lease: self.lock_lease,
            retry: RetryPolicy::new(self.retry_min, self.retry_max),
            caption_limit: CAPTION_LIMIT,
            ..FillSettings::default()
        }
    }

    pub fn crawl_settings(&self) -> CrawlSettings {
        CrawlSettings {
            page_size: self.catalog_page_size,
            page_retry: self.page_retry,
        }
    }

    pub fn runner_settings(&self) -> RunnerSettings {
        RunnerSettings {
            job_lease: self.job_lease,
            max_attempts: self.max_attempts,
            ..RunnerSettings::default()
        }
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, name: &str) -> Option<String> {
        (self.0)(name).filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> Result<String> {
        self.get(name)
            .ok_or_else(|| ServerError::Config(format!("{} environment variable is required", name)))
    }

    fn parsed<T: FromStr>(&self, name: &str, default: T) -> Result<T> {
        match self.get(name) {
            Some(value) => parse(name, &value),
            None => Ok(default),
        }
    }

    fn secs(&self, name: &str, default: u64) -> Result<Duration> {
        self.parsed(name, default).map(Duration::from_secs)
    }
}

fn parse<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| ServerError::Config(format!("{} has an invalid value: {}", name, value)))
}
