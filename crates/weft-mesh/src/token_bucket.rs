//! Token bucket for rate limiting inbound connection accepts.

use std::time::Duration;

use tokio::time::Instant;

/// Tokens the accept limiter holds when full.
pub const ACCEPT_BURST: u32 = 100;

/// One accept token is added per interval.
pub const ACCEPT_TOKEN_INTERVAL: Duration = Duration::from_millis(100);

/// Token bucket that refills one token per interval, up to `capacity`.
///
/// Tracks only the time at which the earliest unspent token became
/// available; in a full bucket that token is `capacity - 1` intervals old.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    token_interval: Duration,
    window: Duration,
    earliest_unspent: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    #[must_use]
    pub fn new(capacity: u32, token_interval: Duration) -> Self {
        let window = token_interval * capacity.saturating_sub(1);
        let now = Instant::now();
        Self {
            token_interval,
            window,
            earliest_unspent: now.checked_sub(window).unwrap_or(now),
        }
    }

    /// How long until a token is available; zero if one is now.
    #[must_use]
    pub fn time_until_available(&self, now: Instant) -> Duration {
        self.earliest_unspent.saturating_duration_since(now)
    }

    /// Takes a token at `now`, returning false if none is available.
    pub fn try_take(&mut self, now: Instant) -> bool {
        if self.earliest_unspent > now {
            return false;
        }
        self.take_at(now);
        true
    }

    /// Waits for a token and takes it.
    pub async fn wait(&mut self) {
        let now = Instant::now();
        if self.earliest_unspent > now {
            tokio::time::sleep_until(self.earliest_unspent).await;
        }
        self.take_at(Instant::now());
    }

    fn take_at(&mut self, now: Instant) {
        if let Some(oldest) = now.checked_sub(self.window) {
            if self.earliest_unspent < oldest {
                self.earliest_unspent = oldest;
            }
        }
        self.earliest_unspent += self.token_interval;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== Bucket Tests ==========

    #[tokio::test(start_paused = true)]
    async fn full_bucket_allows_a_burst() {
        let mut bucket = TokenBucket::new(5, Duration::from_millis(100));
        let now = Instant::now();
        for _ in 0..5 {
            assert!(bucket.try_take(now));
        }
        assert!(!bucket.try_take(now));
        assert_eq!(bucket.time_until_available(now), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn refills_one_token_per_interval() {
        let mut bucket = TokenBucket::new(2, Duration::from_millis(100));
        let start = Instant::now();
        assert!(bucket.try_take(start));
        assert!(bucket.try_take(start));
        assert!(!bucket.try_take(start + Duration::from_millis(50)));
        assert!(bucket.try_take(start + Duration::from_millis(100)));
        assert!(!bucket.try_take(start + Duration::from_millis(100)));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_bucket_caps_at_capacity() {
        let mut bucket = TokenBucket::new(3, Duration::from_millis(100));
        let later = Instant::now() + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(bucket.try_take(later));
        }
        assert!(!bucket.try_take(later));
    }

    #[tokio::test(start_paused = true)]
    async fn wait_sleeps_until_next_token() {
        let mut bucket = TokenBucket::new(1, Duration::from_millis(100));
        let start = Instant::now();
        bucket.wait().await;
        assert_eq!(Instant::now(), start);
        bucket.wait().await;
        assert!(Instant::now() >= start + Duration::from_millis(100));
    }
}
