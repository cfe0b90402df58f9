//! Order lifecycle state machine
//!
//! One `Order` row per submitted exchange order. The order id is the
//! client-generated idempotency key (it exists before the venue ever sees
//! the order); the venue-assigned id is recorded on acknowledgement.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::{Money, Side, Symbol};

/// Order lifecycle states.
///
/// `PendingSubmit -> Open -> {PartiallyFilled ->} Filled | Cancelled | Rejected`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Created and persisted, venue call not yet acknowledged
    PendingSubmit,

    /// Acknowledged and resting at the venue
    Open,

    /// Some quantity executed, remainder still resting
    PartiallyFilled,

    /// Fully executed (terminal)
    Filled,

    /// Cancelled at the venue or by reconciliation (terminal)
    Cancelled,

    /// Rejected by the venue (terminal)
    Rejected,
}

impl OrderState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Cancelled | OrderState::Rejected
        )
    }
}

impl std::fmt::Display for OrderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderState::PendingSubmit => "pending_submit",
            OrderState::Open => "open",
            OrderState::PartiallyFilled => "partially_filled",
            OrderState::Filled => "filled",
            OrderState::Cancelled => "cancelled",
            OrderState::Rejected => "rejected",
        };
        write!(f, "{}", s)
    }
}

/// What an order is for, within its owning position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderKind {
    /// Limit BUY opening the position
    Entry,

    /// Stop-limit SELL protecting the position
    Stop,

    /// Synthetic SELL recorded by an admin force-exit
    ForceExit,
}

impl OrderKind {
    pub fn side(self) -> Side {
        match self {
            OrderKind::Entry => Side::Buy,
            OrderKind::Stop | OrderKind::ForceExit => Side::Sell,
        }
    }
}

/// Result of applying an event to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Transitioned(OrderState),
    /// Duplicate notification; state unchanged
    NoOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Client-generated idempotency key; primary identity of the row
    pub order_id: String,
    pub position_id: String,
    pub product_id: Symbol,
    pub kind: OrderKind,
    pub side: Side,
    /// Limit price (for stops, the limit below the trigger)
    pub price: Money,
    /// Stop trigger price; stops only
    pub stop_trigger: Option<Money>,
    pub qty: Money,
    pub state: OrderState,
    pub filled_qty: Money,
    /// Quantity-weighted average fill price
    pub fill_price: Money,
    /// Venue-assigned id, known once acknowledged
    pub venue_order_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    pub fn new_entry(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        product_id: Symbol,
        price: Money,
        qty: Money,
    ) -> Self {
        Self::new(order_id, position_id, product_id, OrderKind::Entry, price, None, qty)
    }

    pub fn new_stop(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        product_id: Symbol,
        trigger: Money,
        limit: Money,
        qty: Money,
    ) -> Self {
        Self::new(
            order_id,
            position_id,
            product_id,
            OrderKind::Stop,
            limit,
            Some(trigger),
            qty,
        )
    }

    pub fn new_force_exit(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        product_id: Symbol,
        price: Money,
        qty: Money,
    ) -> Self {
        Self::new(order_id, position_id, product_id, OrderKind::ForceExit, price, None, qty)
    }

    fn new(
        order_id: impl Into<String>,
        position_id: impl Into<String>,
        product_id: Symbol,
        kind: OrderKind,
        price: Money,
        stop_trigger: Option<Money>,
        qty: Money,
    ) -> Self {
        let now = Utc::now();
        Self {
            order_id: order_id.into(),
            position_id: position_id.into(),
            product_id,
            kind,
            side: kind.side(),
            price,
            stop_trigger,
            qty,
            state: OrderState::PendingSubmit,
            filled_qty: Money::ZERO,
            fill_price: Money::ZERO,
            venue_order_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn remaining_qty(&self) -> Money {
        self.qty - self.filled_qty
    }

    fn invalid(&self, to: OrderState) -> EngineError {
        EngineError::InvalidTransition {
            entity: "order",
            from: self.state.to_string(),
            to: to.to_string(),
        }
    }

    fn set_state(&mut self, state: OrderState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Venue acknowledged the submission.
    pub fn acknowledge(&mut self, venue_order_id: impl Into<String>) -> Result<Applied, EngineError> {
        match self.state {
            OrderState::PendingSubmit => {
                self.venue_order_id = Some(venue_order_id.into());
                self.set_state(OrderState::Open);
                Ok(Applied::Transitioned(OrderState::Open))
            }
            // Duplicate ack (retry after an ambiguous timeout)
            OrderState::Open | OrderState::PartiallyFilled => Ok(Applied::NoOp),
            _ => Err(self.invalid(OrderState::Open)),
        }
    }

    /// Venue rejected the submission.
    pub fn reject(&mut self) -> Result<Applied, EngineError> {
        match self.state {
            OrderState::PendingSubmit => {
                self.set_state(OrderState::Rejected);
                Ok(Applied::Transitioned(OrderState::Rejected))
            }
            OrderState::Rejected => Ok(Applied::NoOp),
            _ => Err(self.invalid(OrderState::Rejected)),
        }
    }

    /// Apply an execution of `qty` at `price`. Transitions to
    /// `PartiallyFilled` or `Filled` depending on the cumulative quantity.
    pub fn apply_fill(&mut self, qty: Money, price: Money) -> Result<Applied, EngineError> {
        match self.state {
            OrderState::Open | OrderState::PartiallyFilled => {}
            // Duplicate full-fill notification
            OrderState::Filled if self.filled_qty == self.qty => return Ok(Applied::NoOp),
            _ => return Err(self.invalid(OrderState::Filled)),
        }

        let new_filled = self.filled_qty + qty;
        if new_filled > self.qty {
            return Err(self.invalid(OrderState::Filled));
        }

        // Quantity-weighted average across executions; Decimal keeps this exact
        let prev_value = self.fill_price * self.filled_qty;
        self.fill_price = (prev_value + price * qty) / new_filled;
        self.filled_qty = new_filled;

        let next = if self.filled_qty == self.qty {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        self.set_state(next);
        Ok(Applied::Transitioned(next))
    }

    /// Cancel acknowledged by the venue, or terminalized by reconciliation.
    /// A never-acknowledged order may also be cancelled: reconciliation and
    /// the entry-expiry sweep both terminalize pending-submit rows whose
    /// venue outcome resolved to "not resting".
    pub fn cancel(&mut self) -> Result<Applied, EngineError> {
        match self.state {
            OrderState::PendingSubmit | OrderState::Open | OrderState::PartiallyFilled => {
                self.set_state(OrderState::Cancelled);
                Ok(Applied::Transitioned(OrderState::Cancelled))
            }
            OrderState::Cancelled => Ok(Applied::NoOp),
            _ => Err(self.invalid(OrderState::Cancelled)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn entry() -> Order {
        Order::new_entry(
            "client-1",
            "pos-1",
            Symbol::new("BTC-USD"),
            Money::new(dec!(50000)),
            Money::new(dec!(1)),
        )
    }

    #[test]
    fn test_happy_path_full_fill() {
        let mut order = entry();
        assert_eq!(order.state, OrderState::PendingSubmit);

        order.acknowledge("V-1").unwrap();
        assert_eq!(order.state, OrderState::Open);
        assert_eq!(order.venue_order_id.as_deref(), Some("V-1"));

        let applied = order.apply_fill(Money::new(dec!(1)), Money::new(dec!(50000))).unwrap();
        assert_eq!(applied, Applied::Transitioned(OrderState::Filled));
        assert!(order.is_terminal());
    }

    #[test]
    fn test_partial_fills_weighted_average() {
        let mut order = entry();
        order.acknowledge("V-1").unwrap();

        order.apply_fill(Money::new(dec!(0.4)), Money::new(dec!(50000))).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.remaining_qty(), Money::new(dec!(0.6)));

        order.apply_fill(Money::new(dec!(0.6)), Money::new(dec!(50100))).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.fill_price, Money::new(dec!(50060)));
    }

    #[test]
    fn test_overfill_is_invalid() {
        let mut order = entry();
        order.acknowledge("V-1").unwrap();
        let err = order.apply_fill(Money::new(dec!(1.5)), Money::new(dec!(50000)));
        assert!(matches!(err, Err(EngineError::InvalidTransition { .. })));
        // State untouched on a refused transition
        assert_eq!(order.state, OrderState::Open);
    }

    #[test]
    fn test_fill_before_ack_is_invalid() {
        let mut order = entry();
        let err = order.apply_fill(Money::new(dec!(1)), Money::new(dec!(50000)));
        assert!(matches!(err, Err(EngineError::InvalidTransition { .. })));
    }

    #[test]
    fn test_duplicate_notifications_are_noops() {
        let mut order = entry();
        order.acknowledge("V-1").unwrap();
        assert_eq!(order.acknowledge("V-1").unwrap(), Applied::NoOp);

        order.apply_fill(Money::new(dec!(1)), Money::new(dec!(50000))).unwrap();
        assert_eq!(
            order.apply_fill(Money::new(dec!(1)), Money::new(dec!(50000))).unwrap(),
            Applied::NoOp
        );

        let mut cancelled = entry();
        cancelled.acknowledge("V-2").unwrap();
        cancelled.cancel().unwrap();
        assert_eq!(cancelled.cancel().unwrap(), Applied::NoOp);
    }

    #[test]
    fn test_cancel_after_fill_is_invalid() {
        let mut order = entry();
        order.acknowledge("V-1").unwrap();
        order.apply_fill(Money::new(dec!(1)), Money::new(dec!(50000))).unwrap();
        assert!(order.cancel().is_err());
    }

    #[test]
    fn test_reject_only_from_pending() {
        let mut order = entry();
        order.reject().unwrap();
        assert_eq!(order.state, OrderState::Rejected);

        let mut acked = entry();
        acked.acknowledge("V-1").unwrap();
        assert!(acked.reject().is_err());
    }

    #[test]
    fn test_cancel_pending_submit() {
        // Entry-expiry and reconciliation both cancel never-acked rows
        let mut order = entry();
        order.cancel().unwrap();
        assert_eq!(order.state, OrderState::Cancelled);
    }

    #[test]
    fn test_updated_at_bumped_on_transition() {
        let mut order = entry();
        let before = order.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(2));
        order.acknowledge("V-1").unwrap();
        assert!(order.updated_at > before);
    }
}
