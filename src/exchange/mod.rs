//! Exchange venue abstraction
//!
//! The engine talks to the venue exclusively through [`ExchangeAdapter`].
//! Two implementations ship: [`rest::RestVenue`] for the real exchange and
//! [`sim::SimVenue`] for paper trading and tests. Both honour idempotent
//! submission keyed on the caller-supplied client order id.

pub mod rate_limit;
pub mod rest;
pub mod sim;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::VenueError;
use crate::{Money, Side, Symbol};

pub use rate_limit::{Endpoint, EndpointLimit, RateLimitPolicy, Usage};

/// Limit BUY request opening a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitBuy {
    pub product_id: Symbol,
    pub client_order_id: String,
    pub price: Money,
    pub qty: Money,
}

/// Stop-limit SELL request protecting a position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLimitSell {
    pub product_id: Symbol,
    pub client_order_id: String,
    pub stop_trigger: Money,
    pub limit_price: Money,
    pub qty: Money,
}

/// Venue acknowledgement of a submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueAck {
    pub venue_order_id: String,
}

/// Venue-side view of an order's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VenueOrderState {
    Open,
    Filled,
    Cancelled,
    /// The venue has no record of the order
    Unknown,
}

/// Status report for one order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOrderStatus {
    pub state: VenueOrderState,
    pub filled_qty: Money,
    pub avg_fill_price: Option<Money>,
    /// Venue-assigned id, echoed so callers can adopt orders whose
    /// acknowledgement was lost
    pub venue_order_id: Option<String>,
}

impl VenueOrderStatus {
    pub fn unknown() -> Self {
        Self {
            state: VenueOrderState::Unknown,
            filled_qty: Money::ZERO,
            avg_fill_price: None,
            venue_order_id: None,
        }
    }
}

/// One order currently resting at the venue, as reported by the
/// open-orders listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VenueOpenOrder {
    pub venue_order_id: String,
    /// Echoed client id; absent for orders placed outside this process
    pub client_order_id: Option<String>,
    pub product_id: Symbol,
    pub side: Side,
    pub price: Money,
    pub qty: Money,
}

/// Venue capability set consumed by the engine and reconciliation.
///
/// Implementations consult the process-wide [`RateLimitPolicy`] before
/// dispatch, retry retriable failures with exponential backoff, and carry a
/// timeout on every call. A timed-out call reports [`VenueError::Timeout`]
/// and makes no claim about the venue-side outcome; callers resolve the
/// ambiguity through the idempotent client order id.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Place a limit buy. Re-submitting a known `client_order_id` returns
    /// the existing venue order id instead of creating a duplicate.
    async fn place_limit_buy(&self, req: &LimitBuy) -> Result<VenueAck, VenueError>;

    /// Place a stop-limit sell, idempotent like [`Self::place_limit_buy`].
    async fn place_stop_limit(&self, req: &StopLimitSell) -> Result<VenueAck, VenueError>;

    /// Cancel by venue order id.
    async fn cancel_order(&self, product_id: &Symbol, venue_order_id: &str)
        -> Result<(), VenueError>;

    /// Query status by client order id (works before the venue id is known).
    async fn get_order_status(
        &self,
        product_id: &Symbol,
        client_order_id: &str,
    ) -> Result<VenueOrderStatus, VenueError>;

    /// Last trade price for the product.
    async fn get_last_trade_price(&self, product_id: &Symbol) -> Result<Money, VenueError>;

    /// All orders currently resting at the venue for the product.
    async fn list_open_orders(&self, product_id: &Symbol)
        -> Result<Vec<VenueOpenOrder>, VenueError>;
}

/// Retry schedule for retriable venue errors: exponential backoff with
/// jitter, escalating to [`VenueError::RetriesExhausted`] past the ceiling.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry attempt `attempt` (1-based), jittered +/-25%.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        use rand::Rng;
        let exp = self.base_delay.saturating_mul(1u32 << attempt.min(16).saturating_sub(1));
        let capped = exp.min(self.max_delay);
        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        capped.mul_f64(jitter)
    }
}

/// Drive `operation` through the retry schedule. Non-retriable errors
/// surface immediately; retriable ones are retried until the ceiling, then
/// reported as `RetriesExhausted`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, VenueError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, VenueError>>,
{
    let mut last: Option<VenueError> = None;
    for attempt in 0..=policy.max_retries {
        if attempt > 0 {
            let delay = policy.delay_for(attempt);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying venue call");
            tokio::time::sleep(delay).await;
        }
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() => {
                tracing::warn!(attempt, error = %err, "venue call failed, will retry");
                last = Some(err);
            }
            Err(err) => return Err(err),
        }
    }
    Err(VenueError::RetriesExhausted {
        attempts: policy.max_retries + 1,
        last: last.map(|e| e.to_string()).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn quick_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_transient_failures() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&quick_policy(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(VenueError::Unavailable("503".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_fatal_short_circuits() {
        let calls = AtomicU32::new(0);
        let result: Result<(), _> = with_retry(&quick_policy(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(VenueError::UnknownOrder("x".into())) }
        })
        .await;
        assert!(matches!(result, Err(VenueError::UnknownOrder(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_exhaustion_escalates() {
        let result: Result<(), _> = with_retry(&quick_policy(), || async {
            Err(VenueError::RateLimited)
        })
        .await;
        match result {
            Err(VenueError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 3),
            other => panic!("expected RetriesExhausted, got {:?}", other),
        }
    }
}
