use crate::error::LockError;
use crate::ports::{LockHandle, LockManager};
use crate::types::CacheKey;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

pub fn lock_key(key: &CacheKey) -> String {
    format!("fill:{}:{}", key.item_id, key.variant)
}

/// Held fill lock. Released by `release`, or on drop from a spawned task
/// when the holder exits early; if neither runs, the lease expires.
pub struct LockGuard {
    locks: Arc<dyn LockManager>,
    handle: Option<LockHandle>,
}

impl LockGuard {
    /// `Ok(None)` when the lock stayed busy for the whole `wait`
    pub async fn acquire(
        locks: &Arc<dyn LockManager>,
        key: &CacheKey,
        wait: Duration,
        lease: Duration,
    ) -> Result<Option<Self>, LockError> {
        let handle = locks.acquire(&lock_key(key), wait, lease).await?;
        Ok(handle.map(|handle| {
            debug!(lock = %handle.key, token = handle.token, "Lock acquired");
            Self {
                locks: Arc::clone(locks),
                handle: Some(handle),
            }
        }))
    }

    pub async fn renew(&self, lease: Duration) -> Result<bool, LockError> {
        match &self.handle {
            Some(handle) => self.locks.renew(handle, lease).await,
            None => Ok(false),
        }
    }

    /// Drive `work` to completion, renewing the lease every third of
    /// `lease`. Returns `None` and drops `work` if the lease is lost.
    pub async fn hold_while<F: Future>(&self, lease: Duration, work: F) -> Option<F::Output> {
        let mut ticks = tokio::time::interval((lease / 3).max(MIN_RENEW_INTERVAL));
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticks.tick().await;
        tokio::pin!(work);

        loop {
            tokio::select! {
                output = &mut work => return Some(output),
                _ = ticks.tick() => match self.renew(lease).await {
                    Ok(true) => {}
                    Ok(false) => {
                        if let Some(handle) = &self.handle {
                            warn!(lock = %handle.key, "Lock lease lost while held");
                        }
                        return None;
                    }
                    // The lease may still be valid; try again next tick
                    Err(e) => warn!(error = %e, "Failed to renew lock"),
                },
            }
        }
    }

    pub async fn release(mut self) {
        if let Some(handle) = self.handle.take() {
            release_logged(self.locks.as_ref(), &handle).await;
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        let locks = Arc::clone(&self.locks);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    release_logged(locks.as_ref(), &handle).await;
                });
            }
            Err(_) => {
                warn!(lock = %handle.key, "No runtime to release lock, leaving it to expire");
            }
        }
    }
}

async fn release_logged(locks: &dyn LockManager, handle: &LockHandle) {
    match locks.release(handle).await {
        Ok(()) => debug!(lock = %handle.key, "Lock released"),
        Err(e) => warn!(lock = %handle.key, error = %e, "Failed to release lock"),
    }
}
