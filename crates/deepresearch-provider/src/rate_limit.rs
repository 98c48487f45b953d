use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// A single-flight interval limiter: at most one permit granted per
/// `interval`. Callers await `acquire()` and are released in FIFO order by
/// virtue of the mutex's fair-ish queueing.
#[derive(Clone)]
pub struct IntervalLimiter {
    inner: Arc<Mutex<Instant>>,
    interval: Duration,
}

impl IntervalLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Instant::now() - interval)),
            interval,
        }
    }

    /// Default 10-second single-flight interval for the search provider.
    pub fn search_default() -> Self {
        Self::new(Duration::from_secs(10))
    }

    /// Waits until the next slot is available, then reserves it.
    pub async fn acquire(&self) {
        let mut last = self.inner.lock().await;
        let now = Instant::now();
        let earliest = *last + self.interval;
        if earliest > now {
            tokio::time::sleep(earliest - now).await;
        }
        *last = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn acquire_serializes_to_interval() {
        let limiter = IntervalLimiter::new(Duration::from_millis(100));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(Instant::now() - start >= Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_does_not_wait_on_first_call() {
        let limiter = IntervalLimiter::new(Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;
        assert_eq!(Instant::now(), start);
    }
}
