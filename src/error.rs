//! Error taxonomy for the execution core
//!
//! Every public operation returns one of these kinds. The split between
//! retriable and fatal venue errors drives the retry policy at call sites:
//! tick loops absorb `VenueRetriable` and re-arm on the next tick, while
//! `VenueFatal`, `ReconciliationConflict`, and `Persistence` surface to the
//! caller.

use thiserror::Error;

use crate::portfolio::AdmissionReason;
use crate::store::StoreError;
use crate::Money;

/// Errors surfaced by the exchange adapter.
#[derive(Debug, Clone, Error)]
pub enum VenueError {
    #[error("venue unavailable: {0}")]
    Unavailable(String),

    #[error("venue rate limit exceeded")]
    RateLimited,

    #[error("venue request timed out")]
    Timeout,

    #[error("insufficient funds: requested {requested} for {product_id}")]
    InsufficientFunds { product_id: String, requested: Money },

    #[error("unknown order {0}")]
    UnknownOrder(String),

    #[error("unknown product {0}")]
    UnknownProduct(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

impl VenueError {
    /// Transient failures worth retrying with backoff. `RetriesExhausted`
    /// is deliberately not retriable: once the adapter has burned its
    /// budget the failure escalates to fatal.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            VenueError::Unavailable(_) | VenueError::RateLimited | VenueError::Timeout
        )
    }
}

/// Top-level error kinds for engine, reconciliation, and orchestration.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An order or position state transition violated the lifecycle rules.
    /// Always a bug; fatal to the operation, never to the process.
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// Transient venue failure; safe to retry on the next tick.
    #[error("venue error (retriable): {0}")]
    VenueRetriable(VenueError),

    /// Non-retriable venue failure; surfaces to the caller with local
    /// state left consistent.
    #[error("venue error: {0}")]
    VenueFatal(VenueError),

    /// Local and venue state disagree in a way reconciliation cannot map.
    /// The position is quarantined and not traded until human intervention.
    #[error("reconciliation conflict on position {position_id}: {detail}")]
    ReconciliationConflict { position_id: String, detail: String },

    /// The portfolio manager denied the entry intent. Not an error log;
    /// surfaced to the signal source with a reason code.
    #[error("admission rejected: {reason}")]
    AdmissionRejected { reason: AdmissionReason },

    /// Storage failure; the enclosing transaction was rolled back and the
    /// caller sees no state change.
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
}

impl EngineError {
    /// Classify a venue error by its retriability.
    pub fn from_venue(err: VenueError) -> Self {
        if err.is_retriable() {
            EngineError::VenueRetriable(err)
        } else {
            EngineError::VenueFatal(err)
        }
    }

    pub fn rejected(reason: AdmissionReason) -> Self {
        EngineError::AdmissionRejected { reason }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_classification() {
        assert!(VenueError::RateLimited.is_retriable());
        assert!(VenueError::Timeout.is_retriable());
        assert!(VenueError::Unavailable("502".into()).is_retriable());
        assert!(!VenueError::UnknownOrder("x".into()).is_retriable());
        assert!(!VenueError::RetriesExhausted {
            attempts: 5,
            last: "503".into()
        }
        .is_retriable());
    }

    #[test]
    fn test_from_venue_escalates_exhausted_retries() {
        let err = EngineError::from_venue(VenueError::RetriesExhausted {
            attempts: 5,
            last: "503".into(),
        });
        assert!(matches!(err, EngineError::VenueFatal(_)));

        let err = EngineError::from_venue(VenueError::RateLimited);
        assert!(matches!(err, EngineError::VenueRetriable(_)));
    }
}
