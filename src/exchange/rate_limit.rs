//! Per-endpoint rate limiting using token buckets
//!
//! One policy instance per process, shared by every engine. Buckets refill
//! whole windows at a time (10/sec means 10 tokens granted each second, not
//! a smoothed drip), which matches how venues meter their endpoints.
//! Bucket state is in-memory only; it is rebuilt empty-handed at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::{timeout, Instant};

/// Venue endpoint classes with independent budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Order placement
    Orders,
    /// Order cancellation
    Cancel,
    /// Order status queries
    Status,
    /// Tickers and trades
    MarketData,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Endpoint::Orders => "orders",
            Endpoint::Cancel => "cancel",
            Endpoint::Status => "status",
            Endpoint::MarketData => "market_data",
        };
        write!(f, "{}", s)
    }
}

/// Budget for one endpoint: `max_requests` per `window`.
#[derive(Debug, Clone, Copy)]
pub struct EndpointLimit {
    pub max_requests: usize,
    pub window: Duration,
}

impl EndpointLimit {
    pub fn per_second(max_requests: usize) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(1),
        }
    }
}

/// Usage snapshot for observability.
#[derive(Debug, Clone, Copy)]
pub struct Usage {
    pub current_usage: usize,
    pub limit: usize,
    pub reset_at: Instant,
}

struct Bucket {
    permits: Semaphore,
    limit: usize,
    window: Duration,
    window_start: Mutex<Instant>,
}

impl Bucket {
    fn new(limit: EndpointLimit) -> Self {
        Self {
            permits: Semaphore::new(limit.max_requests),
            limit: limit.max_requests,
            window: limit.window,
            window_start: Mutex::new(Instant::now()),
        }
    }

    /// Top the bucket back up if at least one full window has elapsed.
    async fn refill(&self) {
        let mut start = self.window_start.lock().await;
        if start.elapsed() >= self.window {
            let available = self.permits.available_permits();
            let missing = self.limit.saturating_sub(available);
            if missing > 0 {
                self.permits.add_permits(missing);
            }
            *start = Instant::now();
        }
    }
}

/// Process-wide rate-limit policy keyed by endpoint.
#[derive(Clone)]
pub struct RateLimitPolicy {
    buckets: Arc<HashMap<Endpoint, Bucket>>,
}

impl RateLimitPolicy {
    pub fn new(limits: impl IntoIterator<Item = (Endpoint, EndpointLimit)>) -> Self {
        let buckets = limits
            .into_iter()
            .map(|(ep, limit)| (ep, Bucket::new(limit)))
            .collect();
        Self {
            buckets: Arc::new(buckets),
        }
    }

    /// Venue-typical defaults: 10/sec on mutating endpoints, 20/sec on reads.
    pub fn with_defaults() -> Self {
        Self::new([
            (Endpoint::Orders, EndpointLimit::per_second(10)),
            (Endpoint::Cancel, EndpointLimit::per_second(10)),
            (Endpoint::Status, EndpointLimit::per_second(20)),
            (Endpoint::MarketData, EndpointLimit::per_second(20)),
        ])
    }

    fn bucket(&self, endpoint: Endpoint) -> &Bucket {
        self.buckets
            .get(&endpoint)
            .unwrap_or_else(|| panic!("no bucket configured for endpoint {}", endpoint))
    }

    /// Acquire a token, suspending up to `max_wait`. Returns false if the
    /// budget could not be acquired in time.
    pub async fn wait_if_needed(&self, endpoint: Endpoint, max_wait: Duration) -> bool {
        let bucket = self.bucket(endpoint);
        let deadline = Instant::now() + max_wait;
        loop {
            bucket.refill().await;
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            // Wake at the next refill boundary rather than parking on the
            // semaphore: tokens arrive in window-sized batches.
            let window = bucket.window.min(remaining);
            match timeout(window, bucket.permits.acquire()).await {
                Ok(Ok(permit)) => {
                    permit.forget();
                    return true;
                }
                Ok(Err(_)) => return false,
                Err(_) => continue,
            }
        }
    }

    /// Non-blocking acquire.
    pub async fn try_acquire(&self, endpoint: Endpoint) -> bool {
        let bucket = self.bucket(endpoint);
        bucket.refill().await;
        match bucket.permits.try_acquire() {
            Ok(permit) => {
                permit.forget();
                true
            }
            Err(_) => false,
        }
    }

    /// Current usage for observability surfaces.
    pub async fn usage(&self, endpoint: Endpoint) -> Usage {
        let bucket = self.bucket(endpoint);
        bucket.refill().await;
        let start = bucket.window_start.lock().await;
        Usage {
            current_usage: bucket.limit - bucket.permits.available_permits(),
            limit: bucket.limit,
            reset_at: *start + bucket.window,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tight_policy(n: usize) -> RateLimitPolicy {
        RateLimitPolicy::new([(
            Endpoint::Orders,
            EndpointLimit {
                max_requests: n,
                window: Duration::from_secs(60),
            },
        )])
    }

    #[tokio::test]
    async fn test_try_acquire_until_exhausted() {
        let policy = tight_policy(2);
        assert!(policy.try_acquire(Endpoint::Orders).await);
        assert!(policy.try_acquire(Endpoint::Orders).await);
        assert!(!policy.try_acquire(Endpoint::Orders).await);
    }

    #[tokio::test]
    async fn test_wait_if_needed_times_out() {
        let policy = tight_policy(1);
        assert!(policy.wait_if_needed(Endpoint::Orders, Duration::from_millis(10)).await);
        // Budget gone, window is a minute out
        assert!(!policy.wait_if_needed(Endpoint::Orders, Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn test_refill_after_window() {
        let policy = RateLimitPolicy::new([(
            Endpoint::Orders,
            EndpointLimit {
                max_requests: 1,
                window: Duration::from_millis(20),
            },
        )]);
        assert!(policy.try_acquire(Endpoint::Orders).await);
        assert!(!policy.try_acquire(Endpoint::Orders).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(policy.try_acquire(Endpoint::Orders).await);
    }

    #[tokio::test]
    async fn test_usage_snapshot() {
        let policy = tight_policy(5);
        policy.try_acquire(Endpoint::Orders).await;
        policy.try_acquire(Endpoint::Orders).await;
        let usage = policy.usage(Endpoint::Orders).await;
        assert_eq!(usage.current_usage, 2);
        assert_eq!(usage.limit, 5);
        assert!(usage.reset_at > Instant::now());
    }

    #[tokio::test]
    async fn test_endpoints_are_independent() {
        let policy = RateLimitPolicy::new([
            (Endpoint::Orders, EndpointLimit::per_second(1)),
            (Endpoint::MarketData, EndpointLimit::per_second(1)),
        ]);
        assert!(policy.try_acquire(Endpoint::Orders).await);
        assert!(!policy.try_acquire(Endpoint::Orders).await);
        assert!(policy.try_acquire(Endpoint::MarketData).await);
    }
}
