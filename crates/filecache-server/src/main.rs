//! File cache service
//!
//! Runs the admin API, a pool of queue workers that fill the cache, and an
//! optional timer that schedules full catalog crawls.

use downloader_client::DownloaderClient;
use filecache_fill::{
    CacheReader, Collaborators, Crawler, FillMetrics, Filler, Job, JobRunner, TaskQueue,
};
use filecache_server::adapters::{
    HttpCatalog, HttpSink, HttpSource, PgCacheIndex, PgLockManager, PgTaskQueue,
};
use filecache_server::{start_server, AppState, Config, Result};
use files_client::FilesClient;
use library_client::LibraryClient;
use prometheus::Registry;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{prelude::*, EnvFilter};

const LOCK_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter =
        EnvFilter::from_default_env()
            .add_directive("filecache_server=info".parse()?)
            .add_directive("tower_http=info".parse()?);

    // Use JSON format for GCP Cloud Logging when LOG_FORMAT=json
    if std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false)
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_stackdriver::layer())
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    };

    info!("Starting file cache service...");

    let config = Config::from_env()?;
    info!("Port: {}", config.port);
    info!("Workers: {}", config.workers);

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;
    filecache_db::migrate::migrate(&pool).await?;
    info!("Database ready");

    let catalog = Arc::new(HttpCatalog::new(LibraryClient::new(
        &config.library_url,
        &config.library_api_key,
    )?));
    let source = Arc::new(HttpSource::new(DownloaderClient::new(
        &config.downloader_url,
        &config.downloader_api_key,
    )?));
    let sink = Arc::new(HttpSink::new(FilesClient::new(
        &config.files_url,
        &config.files_api_key,
    )?));
    let index = Arc::new(PgCacheIndex::new(pool.clone()));
    let locks = Arc::new(PgLockManager::new(pool.clone()));
    let queue: Arc<dyn TaskQueue> = Arc::new(PgTaskQueue::new(pool.clone()));

    let parts = Collaborators {
        catalog: catalog.clone(),
        source,
        sink,
        index: index.clone(),
        locks: locks.clone(),
    };
    let registry = Registry::new();
    let fill_metrics = Arc::new(FillMetrics::register(&registry)?);
    let filler = Arc::new(
        Filler::new(parts.clone(), config.fill_settings()).with_metrics(fill_metrics),
    );
    let crawler = Arc::new(Crawler::new(
        catalog,
        index.clone(),
        queue.clone(),
        config.crawl_settings(),
    ));
    let runner = Arc::new(JobRunner::new(
        queue.clone(),
        filler.clone(),
        crawler,
        config.runner_settings(),
    ));
    let reader = Arc::new(CacheReader::new(parts, filler, config.heal_attempts));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let workers: Vec<_> = (0..config.workers)
        .map(|n| {
            let runner = runner.clone();
            let shutdown = shutdown_rx.clone();
            let worker = format!("worker-{}-{}", std::process::id(), n);
            tokio::spawn(async move { runner.run(worker, shutdown).await })
        })
        .collect();

    if let Some(period) = config.crawl_interval {
        info!("Scheduling a full crawl every {:?}", period);
        let queue = queue.clone();
        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = queue.enqueue(&Job::Crawl, Duration::ZERO).await {
                    error!("Failed to schedule crawl: {}", e);
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut ticker = interval(LOCK_PURGE_INTERVAL);
        loop {
            ticker.tick().await;
            match locks.purge_expired().await {
                Ok(0) => {}
                Ok(n) => info!("Purged {} expired fill locks", n),
                Err(e) => warn!("Failed to purge expired locks: {}", e),
            }
        }
    });

    let state = AppState::new(reader, index, queue, &config.api_key).with_registry(registry);
    tokio::select! {
        result = start_server(state, config.port) => {
            if let Err(e) = result {
                error!("HTTP server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
    }

    let _ = shutdown_tx.send(true);
    for worker in workers {
        if let Err(e) = worker.await {
            error!("Worker task failed: {}", e);
        }
    }
    pool.close().await;
    info!("Stopped");

    Ok(())
}
