use std::time::Duration;

use rand::Rng;

/// Shared backoff policy reused by the search and LLM clients so retry
/// behavior lives in one place instead of bespoke loops per provider.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    pub jitter: bool,
}

impl RetryPolicy {
    /// The search provider's policy: base 5s, up to 3 retries, capped at 60s.
    pub fn search() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            jitter: true,
        }
    }

    /// A single-retry policy for LLM provider-error recovery.
    pub fn single_retry() -> Self {
        Self {
            max_attempts: 1,
            base_backoff: Duration::from_millis(0),
            max_backoff: Duration::from_millis(0),
            jitter: false,
        }
    }

    /// Backoff duration for the given zero-indexed attempt, `base * 2^attempt`
    /// capped at `max_backoff`, with up to 20% jitter applied when enabled.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = 2u32.saturating_pow(attempt);
        let scaled = self.base_backoff.saturating_mul(exp);
        let capped = scaled.min(self.max_backoff);
        if !self.jitter {
            return capped;
        }
        let millis = capped.as_millis() as u64;
        if millis == 0 {
            return capped;
        }
        let jittered = rand::thread_rng().gen_range(millis..=millis + millis / 5);
        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(60),
            jitter: false,
        };
        assert_eq!(policy.backoff_for(0), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(1), Duration::from_secs(4));
        assert_eq!(policy.backoff_for(2), Duration::from_secs(8));
        assert_eq!(policy.backoff_for(10), Duration::from_secs(60));
    }

    #[test]
    fn search_policy_matches_spec_defaults() {
        let policy = RetryPolicy::search();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_backoff, Duration::from_secs(5));
        assert_eq!(policy.max_backoff, Duration::from_secs(60));
    }
}
