use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::debug;

/// Randomized delay range for background retries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
        }
    }

    /// Uniform pick in `[min, max]`
    pub fn jittered(&self) -> Duration {
        if self.max <= self.min {
            return self.min;
        }
        let secs = rand::rng().random_range(self.min.as_secs_f64()..=self.max.as_secs_f64());
        Duration::from_secs_f64(secs)
    }
}

/// Run `op` up to `attempts` times, sleeping `delay` between failures.
/// Errors for which `retryable` is false are returned at once; otherwise
/// the last error is returned once attempts run out.
pub async fn with_attempts<T, E, F, Fut, R>(
    op_name: &'static str,
    attempts: usize,
    delay: Duration,
    retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: Fn(&E) -> bool,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if !retryable(&err) => {
                debug!("{} failed ({}), not retrying", op_name, err);
                return Err(err);
            }
            Err(err) if attempt >= attempts => return Err(err),
            Err(err) => {
                debug!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    op_name, err, delay, attempt, attempts
                );
                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_jitter_within_bounds() {
        let policy = RetryPolicy::new(Duration::from_secs(30), Duration::from_secs(900));
        for _ in 0..100 {
            let d = policy.jittered();
            assert!(d >= Duration::from_secs(30) && d <= Duration::from_secs(900));
        }
    }

    #[test]
    fn test_degenerate_range() {
        let policy = RetryPolicy::new(Duration::from_secs(5), Duration::from_secs(1));
        assert_eq!(policy.jittered(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_with_attempts_stops_after_limit() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = with_attempts("op", 3, Duration::ZERO, |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_attempts_returns_first_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<u32, String> = with_attempts("op", 3, Duration::ZERO, |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("flaky".to_string())
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_with_attempts_gives_up_on_permanent_error() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), String> = with_attempts(
            "op",
            3,
            Duration::ZERO,
            |e: &String| e != "forbidden",
            || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err("forbidden".to_string()) }
            },
        )
        .await;
        assert_eq!(result, Err("forbidden".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
