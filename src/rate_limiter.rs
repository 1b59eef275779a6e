//! Per-source outbound request pacing.
//!
//! A token bucket refilled at `requests_per_sec` up to `burst` tokens. Each
//! HTTP attempt (including retries) takes one token. One bucket exists per
//! data source and is shared by every page fetched for it; buckets are never
//! shared across sources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub requests_per_sec: f64,
    pub burst: u32,
}

impl RateLimitConfig {
    pub fn new(requests_per_sec: f64, burst: u32) -> Self {
        Self {
            requests_per_sec,
            burst: burst.max(1),
        }
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket limiter. Starts full.
pub struct TokenBucket {
    config: RateLimitConfig,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.burst as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens =
            (state.tokens + elapsed * self.config.requests_per_sec).min(self.config.burst as f64);
        state.last_refill = now;
    }

    /// Take one token, waiting for the bucket to refill if it is empty.
    ///
    /// Returns the time spent waiting.
    pub async fn acquire(&self) -> Duration {
        let start = Instant::now();
        loop {
            let wait = {
                let mut state = self.state.lock().await;
                self.refill(&mut state, Instant::now());
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    None
                } else {
                    let missing = 1.0 - state.tokens;
                    Some(Duration::from_secs_f64(
                        missing / self.config.requests_per_sec,
                    ))
                }
            };
            match wait {
                None => {
                    let waited = start.elapsed();
                    if !waited.is_zero() {
                        debug!(waited_ms = waited.as_millis() as u64, "rate limiter delayed request");
                    }
                    return waited;
                }
                Some(d) => tokio::time::sleep(d).await,
            }
        }
    }

    /// Take one token if available right now.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Lazily created buckets keyed by data source id.
#[derive(Default)]
pub struct LimiterRegistry {
    buckets: std::sync::Mutex<HashMap<String, Arc<TokenBucket>>>,
}

impl LimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_source(&self, source_id: &str, config: RateLimitConfig) -> Arc<TokenBucket> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets
            .entry(source_id.to_string())
            .or_insert_with(|| Arc::new(TokenBucket::new(config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_throttle() {
        let bucket = TokenBucket::new(RateLimitConfig::new(2.0, 3));
        for _ in 0..3 {
            assert!(bucket.try_acquire().await);
        }
        assert!(!bucket.try_acquire().await);

        // One token every 500ms at 2 req/s.
        let waited = bucket.acquire().await;
        assert!(waited >= Duration::from_millis(450), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_caps_at_burst() {
        let bucket = TokenBucket::new(RateLimitConfig::new(10.0, 2));
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(bucket.try_acquire().await);
        assert!(bucket.try_acquire().await);
        assert!(!bucket.try_acquire().await);
    }

    #[test]
    fn test_registry_shares_bucket_per_source_only() {
        let registry = LimiterRegistry::new();
        let cfg = RateLimitConfig::new(1.0, 1);
        let a1 = registry.for_source("a", cfg);
        let a2 = registry.for_source("a", cfg);
        let b = registry.for_source("b", cfg);
        assert!(Arc::ptr_eq(&a1, &a2));
        assert!(!Arc::ptr_eq(&a1, &b));
    }
}
