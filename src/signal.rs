//! Signal generator interface
//!
//! The engine does not inspect indicator internals; it consumes fully-formed
//! entry intents from a [`SignalSource`] on each candle close.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Money, Symbol};

/// A request to open a position with a limit buy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryIntent {
    pub product_id: Symbol,
    /// Caller-supplied idempotency key; one position per id, ever
    pub client_order_id: String,
    pub limit_price: Money,
    pub qty: Money,
}

impl EntryIntent {
    pub fn notional(&self) -> Money {
        self.limit_price * self.qty
    }
}

/// External signal generator, polled on 5-minute candle closes.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Return an entry intent for the product, or `None` to stay flat.
    async fn signal(
        &self,
        product_id: &Symbol,
        as_of_candle_close: DateTime<Utc>,
    ) -> anyhow::Result<Option<EntryIntent>>;
}

/// Signal source that never trades. Used when the process runs purely to
/// manage stops on existing positions.
pub struct NoSignal;

#[async_trait]
impl SignalSource for NoSignal {
    async fn signal(
        &self,
        _product_id: &Symbol,
        _as_of_candle_close: DateTime<Utc>,
    ) -> anyhow::Result<Option<EntryIntent>> {
        Ok(None)
    }
}
