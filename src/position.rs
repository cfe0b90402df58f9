//! Per-position state and trailing-stop ratchet math
//!
//! A position is created when an entry is submitted, becomes OPEN on the
//! first confirmed fill, and from then on tracks the highest trade price
//! observed. The stop trigger derived from that high only ever moves up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::{Money, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    /// Entry submitted, no fill confirmed yet
    PendingEntry,

    /// At least one entry fill confirmed; exposure is live
    Open,

    /// Flat via stop fills or entry abort (terminal)
    Closed,

    /// Flat via admin force-exit (terminal)
    ForceExited,
}

impl PositionStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PositionStatus::Closed | PositionStatus::ForceExited)
    }
}

impl std::fmt::Display for PositionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PositionStatus::PendingEntry => "pending_entry",
            PositionStatus::Open => "open",
            PositionStatus::Closed => "closed",
            PositionStatus::ForceExited => "force_exited",
        };
        write!(f, "{}", s)
    }
}

/// How a position went flat; selects the terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    StopFill,
    ForceExit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionState {
    pub position_id: String,
    pub product_id: Symbol,
    /// Quantity-weighted average entry price; defined from the first fill
    pub entry_price: Option<Money>,
    /// Cumulative filled entry quantity, net of exits
    pub qty_filled: Money,
    /// Gross entry accumulators; the average is always re-derived from
    /// these so it carries no per-fill rounding drift
    pub entry_qty_gross: Money,
    pub entry_value_gross: Money,
    /// Monotonically non-decreasing once defined
    pub highest_price_since_entry: Option<Money>,
    pub current_stop_trigger: Option<Money>,
    pub current_stop_limit: Option<Money>,
    /// Order id of the live stop at the venue, if one is resting
    pub stop_order_id: Option<String>,
    pub status: PositionStatus,
    /// Quarantine flag set by reconciliation on unresolvable conflicts.
    /// A quarantined position is never traded.
    pub inconsistent: bool,
    pub realized_pnl: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PositionState {
    pub fn new(position_id: impl Into<String>, product_id: Symbol) -> Self {
        let now = Utc::now();
        Self {
            position_id: position_id.into(),
            product_id,
            entry_price: None,
            qty_filled: Money::ZERO,
            entry_qty_gross: Money::ZERO,
            entry_value_gross: Money::ZERO,
            highest_price_since_entry: None,
            current_stop_trigger: None,
            current_stop_limit: None,
            stop_order_id: None,
            status: PositionStatus::PendingEntry,
            inconsistent: false,
            realized_pnl: Money::ZERO,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    fn invalid(&self, to: &str) -> EngineError {
        EngineError::InvalidTransition {
            entity: "position",
            from: self.status.to_string(),
            to: to.to_string(),
        }
    }

    /// Record an entry fill. The first fill defines the entry price and the
    /// price high and opens the position; subsequent fills re-average the
    /// entry price and lift the high so it never sits below the average.
    pub fn register_fill(&mut self, filled_qty: Money, fill_price: Money) -> Result<(), EngineError> {
        if !matches!(self.status, PositionStatus::PendingEntry | PositionStatus::Open) {
            return Err(self.invalid("open"));
        }

        let first = self.entry_price.is_none();
        self.entry_qty_gross += filled_qty;
        self.entry_value_gross += fill_price * filled_qty;
        let avg = self.entry_value_gross / self.entry_qty_gross;
        self.entry_price = Some(avg);
        self.qty_filled += filled_qty;

        if first {
            self.highest_price_since_entry = Some(fill_price);
            self.status = PositionStatus::Open;
        }
        // Keep the high at or above the re-averaged entry
        self.highest_price_since_entry =
            Some(self.highest_price_since_entry.unwrap_or(avg).max(avg));
        self.touch();
        Ok(())
    }

    /// Fold a last-trade print into the running high. No-op unless OPEN.
    pub fn observe_price(&mut self, last_trade_price: Money) {
        if self.status != PositionStatus::Open {
            return;
        }
        if let Some(high) = self.highest_price_since_entry {
            if last_trade_price > high {
                self.highest_price_since_entry = Some(last_trade_price);
                self.touch();
            }
        }
    }

    /// Derive the candidate stop pair from the current high.
    ///
    /// `trigger = high * (1 - trail_pct)`, `limit = trigger * (1 - buffer_pct)`.
    /// Returns `None` before any entry fill (no high to trail).
    pub fn compute_new_stop(
        &self,
        trail_pct: Money,
        stop_limit_buffer_pct: Money,
    ) -> Option<(Money, Money)> {
        let high = self.highest_price_since_entry?;
        let trigger = high * (Money::ONE - trail_pct);
        let limit = trigger * (Money::ONE - stop_limit_buffer_pct);
        Some((trigger, limit))
    }

    /// Ratchet test: replace only when there is no stop yet, or the new
    /// trigger clears the old one by more than `min_ratchet`. Never true
    /// for a trigger at or below the current one.
    pub fn should_replace_stop(&self, new_trigger: Money, min_ratchet: Money) -> bool {
        match self.current_stop_trigger {
            None => true,
            Some(current) => {
                new_trigger > current && new_trigger > current * (Money::ONE + min_ratchet)
            }
        }
    }

    /// Install a new stop. Refuses anything that would loosen the stop or
    /// break the trigger/limit ordering.
    pub fn apply_new_stop(
        &mut self,
        trigger: Money,
        limit: Money,
        stop_order_id: impl Into<String>,
    ) -> Result<(), EngineError> {
        if limit >= trigger {
            return Err(self.invalid("stop(limit >= trigger)"));
        }
        if let Some(high) = self.highest_price_since_entry {
            if trigger >= high {
                return Err(self.invalid("stop(trigger >= high)"));
            }
        }
        if let Some(current) = self.current_stop_trigger {
            if trigger < current {
                return Err(self.invalid("stop(downward)"));
            }
        }
        self.current_stop_trigger = Some(trigger);
        self.current_stop_limit = Some(limit);
        self.stop_order_id = Some(stop_order_id.into());
        self.touch();
        Ok(())
    }

    /// The live stop is gone at the venue (cancelled, or cancel succeeded
    /// but the replacement has not landed yet). Trigger and limit are kept:
    /// the ratchet floor survives the gap.
    pub fn clear_stop_order(&mut self) {
        self.stop_order_id = None;
        self.touch();
    }

    /// Apply an exit execution. Accumulates realized P&L and transitions to
    /// the terminal status for `reason` once flat.
    pub fn close(
        &mut self,
        exit_price: Money,
        exit_qty: Money,
        reason: CloseReason,
    ) -> Result<(), EngineError> {
        if self.status != PositionStatus::Open {
            return Err(self.invalid("closed"));
        }
        if exit_qty > self.qty_filled || !exit_qty.is_positive() {
            return Err(self.invalid("closed(exit qty)"));
        }
        let entry = self.entry_price.unwrap_or(Money::ZERO);
        self.realized_pnl += (exit_price - entry) * exit_qty;
        self.qty_filled -= exit_qty;
        if self.qty_filled.is_zero() {
            self.status = match reason {
                CloseReason::StopFill => PositionStatus::Closed,
                CloseReason::ForceExit => PositionStatus::ForceExited,
            };
            self.stop_order_id = None;
        }
        self.touch();
        Ok(())
    }

    /// Terminalize a position whose entry never filled (venue reject or
    /// entry expiry). Requires a fill-free PENDING_ENTRY position.
    pub fn abort_entry(&mut self) -> Result<(), EngineError> {
        if self.status != PositionStatus::PendingEntry || !self.qty_filled.is_zero() {
            return Err(self.invalid("closed(abort)"));
        }
        self.status = PositionStatus::Closed;
        self.touch();
        Ok(())
    }

    /// Flag the position as untradeable pending human intervention.
    pub fn quarantine(&mut self) {
        self.inconsistent = true;
        self.touch();
    }

    /// Mark-to-market P&L against the remaining quantity.
    pub fn unrealized_pnl(&self, mark_price: Money) -> Money {
        match self.entry_price {
            Some(entry) if self.status == PositionStatus::Open => {
                (mark_price - entry) * self.qty_filled
            }
            _ => Money::ZERO,
        }
    }

    /// Notional deployed at entry for the remaining quantity.
    pub fn deployed_notional(&self) -> Money {
        self.entry_price.unwrap_or(Money::ZERO) * self.qty_filled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(d: rust_decimal::Decimal) -> Money {
        Money::new(d)
    }

    fn open_position(entry: rust_decimal::Decimal, qty: rust_decimal::Decimal) -> PositionState {
        let mut pos = PositionState::new("pos-1", Symbol::new("BTC-USD"));
        pos.register_fill(m(qty), m(entry)).unwrap();
        pos
    }

    #[test]
    fn test_first_fill_opens_position() {
        let pos = open_position(dec!(50000), dec!(1));
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.entry_price, Some(m(dec!(50000))));
        assert_eq!(pos.highest_price_since_entry, Some(m(dec!(50000))));
        assert_eq!(pos.qty_filled, m(dec!(1)));
    }

    #[test]
    fn test_partial_fills_average_exactly() {
        let mut pos = PositionState::new("pos-1", Symbol::new("BTC-USD"));
        pos.register_fill(m(dec!(0.4)), m(dec!(50000))).unwrap();
        pos.register_fill(m(dec!(0.6)), m(dec!(50100))).unwrap();
        // 0.4*50000 + 0.6*50100 = 50060, exact
        assert_eq!(pos.entry_price, Some(m(dec!(50060))));
        assert_eq!(pos.qty_filled, m(dec!(1.0)));
        // High lifted to the re-averaged entry, never below it
        assert_eq!(pos.highest_price_since_entry, Some(m(dec!(50060))));
    }

    #[test]
    fn test_register_fill_rejected_when_terminal() {
        let mut pos = open_position(dec!(100), dec!(1));
        pos.close(m(dec!(110)), m(dec!(1)), CloseReason::StopFill).unwrap();
        assert!(pos.register_fill(m(dec!(1)), m(dec!(100))).is_err());
    }

    #[test]
    fn test_observe_price_only_raises_high() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.observe_price(m(dec!(50500)));
        assert_eq!(pos.highest_price_since_entry, Some(m(dec!(50500))));
        pos.observe_price(m(dec!(50200)));
        assert_eq!(pos.highest_price_since_entry, Some(m(dec!(50500))));
    }

    #[test]
    fn test_observe_price_ignored_before_fill() {
        let mut pos = PositionState::new("pos-1", Symbol::new("BTC-USD"));
        pos.observe_price(m(dec!(55000)));
        assert_eq!(pos.highest_price_since_entry, None);
    }

    #[test]
    fn test_compute_new_stop() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.observe_price(m(dec!(50500)));
        let (trigger, limit) = pos.compute_new_stop(m(dec!(0.02)), m(dec!(0.005))).unwrap();
        assert_eq!(trigger, m(dec!(49490.00)));
        assert_eq!(limit, m(dec!(49242.5500)));
    }

    #[test]
    fn test_should_replace_requires_ratchet_margin() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.apply_new_stop(m(dec!(49000)), m(dec!(48755)), "S-1").unwrap();

        // Below, equal, or within the ratchet margin: never replace
        assert!(!pos.should_replace_stop(m(dec!(48900)), m(dec!(0.001))));
        assert!(!pos.should_replace_stop(m(dec!(49000)), m(dec!(0.001))));
        assert!(!pos.should_replace_stop(m(dec!(49049)), m(dec!(0.001))));
        // Clear of the margin: replace
        assert!(pos.should_replace_stop(m(dec!(49049.1)), m(dec!(0.001))));
    }

    #[test]
    fn test_should_replace_true_when_no_stop() {
        let pos = open_position(dec!(50000), dec!(1));
        assert!(pos.should_replace_stop(m(dec!(49000)), m(dec!(0.001))));
    }

    #[test]
    fn test_apply_new_stop_refuses_downward() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.observe_price(m(dec!(51000)));
        pos.apply_new_stop(m(dec!(49980)), m(dec!(49730.1)), "S-1").unwrap();
        let err = pos.apply_new_stop(m(dec!(49000)), m(dec!(48755)), "S-2");
        assert!(matches!(err, Err(EngineError::InvalidTransition { .. })));
        assert_eq!(pos.current_stop_trigger, Some(m(dec!(49980))));
    }

    #[test]
    fn test_apply_new_stop_refuses_inverted_pair() {
        let mut pos = open_position(dec!(50000), dec!(1));
        assert!(pos.apply_new_stop(m(dec!(49000)), m(dec!(49000)), "S-1").is_err());
    }

    #[test]
    fn test_clear_stop_keeps_ratchet_floor() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.apply_new_stop(m(dec!(49000)), m(dec!(48755)), "S-1").unwrap();
        pos.clear_stop_order();
        assert_eq!(pos.stop_order_id, None);
        assert_eq!(pos.current_stop_trigger, Some(m(dec!(49000))));
    }

    #[test]
    fn test_close_partial_then_flat() {
        let mut pos = open_position(dec!(50000), dec!(1));
        pos.close(m(dec!(51000)), m(dec!(0.4)), CloseReason::StopFill).unwrap();
        assert_eq!(pos.status, PositionStatus::Open);
        assert_eq!(pos.qty_filled, m(dec!(0.6)));
        assert_eq!(pos.realized_pnl, m(dec!(400.0)));

        pos.close(m(dec!(50500)), m(dec!(0.6)), CloseReason::StopFill).unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);
        assert_eq!(pos.realized_pnl, m(dec!(700.0)));
        assert_eq!(pos.stop_order_id, None);
    }

    #[test]
    fn test_force_exit_status() {
        let mut pos = open_position(dec!(100), dec!(2));
        pos.close(m(dec!(90)), m(dec!(2)), CloseReason::ForceExit).unwrap();
        assert_eq!(pos.status, PositionStatus::ForceExited);
        assert_eq!(pos.realized_pnl, m(dec!(-20)));
    }

    #[test]
    fn test_close_rejects_excess_qty() {
        let mut pos = open_position(dec!(100), dec!(1));
        assert!(pos.close(m(dec!(90)), m(dec!(2)), CloseReason::StopFill).is_err());
    }

    #[test]
    fn test_abort_entry() {
        let mut pos = PositionState::new("pos-1", Symbol::new("BTC-USD"));
        pos.abort_entry().unwrap();
        assert_eq!(pos.status, PositionStatus::Closed);

        let mut filled = open_position(dec!(100), dec!(1));
        assert!(filled.abort_entry().is_err());
    }

    #[test]
    fn test_unrealized_pnl() {
        let pos = open_position(dec!(50000), dec!(0.5));
        assert_eq!(pos.unrealized_pnl(m(dec!(52000))), m(dec!(1000.0)));
        assert_eq!(pos.unrealized_pnl(m(dec!(49000))), m(dec!(-500.0)));
    }
}
