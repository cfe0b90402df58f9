//! Property-based tests for the ratchet and fill-averaging invariants

use proptest::prelude::*;
use rust_decimal::Decimal;

use trailguard::position::{CloseReason, PositionState};
use trailguard::{Money, Symbol};

/// Prices as exact decimals with two fractional digits, strictly positive.
fn price() -> impl Strategy<Value = Money> {
    (100u64..100_000_000u64).prop_map(|cents| Money::new(Decimal::new(cents as i64, 2)))
}

/// Quantities with six fractional digits, strictly positive.
fn qty() -> impl Strategy<Value = Money> {
    (1u64..10_000_000u64).prop_map(|micros| Money::new(Decimal::new(micros as i64, 6)))
}

fn open_position(entry: Money) -> PositionState {
    let mut pos = PositionState::new("prop-pos", Symbol::new("BTC-USD"));
    pos.register_fill(Money::ONE, entry).unwrap();
    pos
}

proptest! {
    /// Over any tick sequence, the applied stop trigger never decreases.
    #[test]
    fn stop_trigger_is_monotone_nondecreasing(
        entry in price(),
        ticks in prop::collection::vec(price(), 1..60),
    ) {
        let trail: Money = "0.02".parse().unwrap();
        let buffer: Money = "0.005".parse().unwrap();
        let min_ratchet: Money = "0.001".parse().unwrap();

        let mut pos = open_position(entry);
        let mut triggers: Vec<Money> = Vec::new();
        let mut stop_seq = 0u32;

        for tick in ticks {
            pos.observe_price(tick);
            let (trigger, limit) = pos.compute_new_stop(trail, buffer).unwrap();
            if pos.should_replace_stop(trigger, min_ratchet) {
                stop_seq += 1;
                pos.apply_new_stop(trigger, limit, format!("S-{stop_seq}")).unwrap();
                triggers.push(trigger);
            }
        }

        for pair in triggers.windows(2) {
            prop_assert!(pair[1] >= pair[0], "trigger loosened: {} -> {}", pair[0], pair[1]);
        }
        // And each applied trigger sits strictly below the running high
        if let (Some(last), Some(high)) = (triggers.last(), pos.highest_price_since_entry) {
            prop_assert!(*last < high);
        }
    }

    /// should_replace_stop never fires for a trigger at or below the current
    /// one, whatever the ratchet margin.
    #[test]
    fn ratchet_never_accepts_lower_trigger(
        entry in price(),
        candidate in price(),
        min_ratchet in (0u64..100_000u64).prop_map(|n| Money::new(Decimal::new(n as i64, 6))),
    ) {
        let mut pos = open_position(entry);
        let current = entry * "0.98".parse::<Money>().unwrap();
        let limit = current * "0.995".parse::<Money>().unwrap();
        pos.apply_new_stop(current, limit, "S-1").unwrap();

        if candidate <= current {
            prop_assert!(!pos.should_replace_stop(candidate, min_ratchet));
        }
    }

    /// The averaged entry price equals sum(q*p)/sum(q) exactly, with no
    /// rounding drift across any fill sequence.
    #[test]
    fn entry_price_is_exact_weighted_average(
        fills in prop::collection::vec((qty(), price()), 1..20),
    ) {
        let mut pos = PositionState::new("prop-pos", Symbol::new("BTC-USD"));
        for (q, p) in &fills {
            pos.register_fill(*q, *p).unwrap();
        }

        let total_qty: Money = fills.iter().map(|(q, _)| *q).sum();
        let total_value: Money = fills.iter().map(|(q, p)| *q * *p).sum();
        let expected = total_value / total_qty;

        prop_assert_eq!(pos.entry_price.unwrap(), expected);
        prop_assert_eq!(pos.qty_filled, total_qty);
    }

    /// Partial exits conserve quantity and accumulate P&L exactly.
    #[test]
    fn closes_conserve_quantity_and_pnl(
        entry in price(),
        exit in price(),
        splits in prop::collection::vec(1u64..1000u64, 1..8),
    ) {
        let total: u64 = splits.iter().sum();
        let total_qty = Money::new(Decimal::new(total as i64, 3));

        let mut pos = PositionState::new("prop-pos", Symbol::new("BTC-USD"));
        pos.register_fill(total_qty, entry).unwrap();

        for part in &splits {
            let q = Money::new(Decimal::new(*part as i64, 3));
            pos.close(exit, q, CloseReason::StopFill).unwrap();
        }

        prop_assert!(pos.is_terminal());
        prop_assert_eq!(pos.qty_filled, Money::ZERO);
        prop_assert_eq!(pos.realized_pnl, (exit - entry) * total_qty);
    }
}
