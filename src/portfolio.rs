//! Portfolio-level capital accounting and risk limits
//!
//! One manager per process, consulted under a single critical section
//! before any entry is submitted. Capital flows in on `record_close` and
//! out on `record_fill`; admission checks run against the resulting
//! aggregate plus the per-group concentration ledger.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Money, Symbol};

/// Why an entry intent was refused. Closed set; the orchestrator surfaces
/// these verbatim to the signal source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AdmissionReason {
    PositionSizeExceedsLimit,
    MaxPositionsReached,
    CorrelatedExposureExceedsLimit,
    InsufficientCapital,
    DuplicateClientOrderId,
}

impl std::fmt::Display for AdmissionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AdmissionReason::PositionSizeExceedsLimit => "position_size_exceeds_limit",
            AdmissionReason::MaxPositionsReached => "max_positions_reached",
            AdmissionReason::CorrelatedExposureExceedsLimit => "correlated_exposure_exceeds_limit",
            AdmissionReason::InsufficientCapital => "insufficient_capital",
            AdmissionReason::DuplicateClientOrderId => "duplicate_client_order_id",
        };
        write!(f, "{}", s)
    }
}

/// Portfolio limits. Percent knobs are whole percents (5 means 5%).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    pub total_capital: Money,
    /// Hard cap on notional per position as % of total capital
    pub max_position_size_pct: Money,
    /// Hard cap on simultaneously open positions
    pub max_positions: usize,
    /// Cap on summed notional within one correlation group, % of total
    pub max_correlated_exposure_pct: Money,
    /// Drift from target allocation that raises a rebalance hint, in
    /// percentage points
    pub rebalance_threshold_pct: Money,
    /// Unrealized portfolio P&L as % of total capital (negative) that
    /// triggers emergency liquidation
    pub emergency_liquidation_loss_pct: Money,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            total_capital: Money::from_i64(100_000),
            max_position_size_pct: Money::from_i64(5),
            max_positions: 5,
            max_correlated_exposure_pct: Money::from_i64(15),
            rebalance_threshold_pct: Money::from_i64(5),
            emergency_liquidation_loss_pct: Money::from_i64(-10),
        }
    }
}

/// Registration data for one traded pair.
#[derive(Debug, Clone)]
struct PairAllocation {
    correlation_group: String,
    target_allocation_pct: Option<Money>,
}

/// Capital deployed into one live position.
#[derive(Debug, Clone)]
struct Exposure {
    product_id: Symbol,
    correlation_group: String,
    qty: Money,
    entry_notional: Money,
    mark_price: Option<Money>,
    entry_price: Money,
}

/// Snapshot of portfolio health for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct PortfolioMetrics {
    pub total_capital: Money,
    pub available_capital: Money,
    pub deployed_capital: Money,
    pub realized_pnl: Money,
    pub unrealized_pnl: Money,
    pub total_pnl: Money,
    pub open_positions: usize,
    pub closed_positions: usize,
    pub win_rate: f64,
    /// Deployed notional per correlation group
    pub concentration: HashMap<String, Money>,
}

/// Suggested correction when an allocation drifts past the threshold.
#[derive(Debug, Clone, Serialize)]
pub struct RebalanceHint {
    pub product_id: Symbol,
    pub current_pct: Money,
    pub target_pct: Money,
    /// Positive: overweight, trim. Negative: underweight, add.
    pub drift_pct: Money,
}

pub struct PortfolioManager {
    config: PortfolioConfig,
    pairs: HashMap<Symbol, PairAllocation>,
    exposures: HashMap<String, Exposure>,
    realized_pnl: Money,
    wins: usize,
    losses: usize,
    closed_positions: usize,
}

impl PortfolioManager {
    pub fn new(config: PortfolioConfig) -> Self {
        Self {
            config,
            pairs: HashMap::new(),
            exposures: HashMap::new(),
            realized_pnl: Money::ZERO,
            wins: 0,
            losses: 0,
            closed_positions: 0,
        }
    }

    /// Register a tradeable pair with its concentration group and optional
    /// target allocation.
    pub fn register_pair(
        &mut self,
        product_id: Symbol,
        correlation_group: impl Into<String>,
        target_allocation_pct: Option<Money>,
    ) {
        self.pairs.insert(
            product_id,
            PairAllocation {
                correlation_group: correlation_group.into(),
                target_allocation_pct,
            },
        );
    }

    fn group_of(&self, product_id: &Symbol) -> String {
        self.pairs
            .get(product_id)
            .map(|p| p.correlation_group.clone())
            .unwrap_or_else(|| "ungrouped".to_string())
    }

    pub fn deployed_capital(&self) -> Money {
        self.exposures.values().map(|e| e.entry_notional).sum()
    }

    pub fn available_capital(&self) -> Money {
        self.config.total_capital + self.realized_pnl - self.deployed_capital()
    }

    fn group_exposure(&self, group: &str) -> Money {
        self.exposures
            .values()
            .filter(|e| e.correlation_group == group)
            .map(|e| e.entry_notional)
            .sum()
    }

    /// Gate for a new entry intent of `notional` on `product_id`.
    pub fn check_admission(
        &self,
        product_id: &Symbol,
        notional: Money,
    ) -> Result<(), AdmissionReason> {
        let max_notional = self
            .config
            .max_position_size_pct
            .percent_of(self.config.total_capital);
        if notional > max_notional {
            return Err(AdmissionReason::PositionSizeExceedsLimit);
        }

        if self.exposures.len() >= self.config.max_positions {
            return Err(AdmissionReason::MaxPositionsReached);
        }

        let group = self.group_of(product_id);
        let group_cap = self
            .config
            .max_correlated_exposure_pct
            .percent_of(self.config.total_capital);
        if self.group_exposure(&group) + notional > group_cap {
            return Err(AdmissionReason::CorrelatedExposureExceedsLimit);
        }

        if notional > self.available_capital() {
            return Err(AdmissionReason::InsufficientCapital);
        }

        Ok(())
    }

    /// Deploy capital on a confirmed entry fill.
    pub fn record_fill(
        &mut self,
        position_id: &str,
        product_id: &Symbol,
        qty: Money,
        fill_price: Money,
    ) {
        let group = self.group_of(product_id);
        let exposure = self
            .exposures
            .entry(position_id.to_string())
            .or_insert_with(|| Exposure {
                product_id: product_id.clone(),
                correlation_group: group,
                qty: Money::ZERO,
                entry_notional: Money::ZERO,
                mark_price: None,
                entry_price: Money::ZERO,
            });
        let notional = qty * fill_price;
        let total_qty = exposure.qty + qty;
        exposure.entry_price =
            (exposure.entry_price * exposure.qty + fill_price * qty) / total_qty;
        exposure.qty = total_qty;
        exposure.entry_notional += notional;
    }

    /// Release capital and book P&L on an exit execution. Counts the
    /// position toward the win/loss tally when it goes flat.
    pub fn record_close(&mut self, position_id: &str, qty: Money, exit_price: Money) {
        let Some(exposure) = self.exposures.get_mut(position_id) else {
            return;
        };
        let qty = qty.min(exposure.qty);
        let pnl = (exit_price - exposure.entry_price) * qty;
        self.realized_pnl += pnl;
        exposure.entry_notional -= exposure.entry_price * qty;
        exposure.qty -= qty;

        if exposure.qty.is_zero() {
            self.exposures.remove(position_id);
            self.closed_positions += 1;
            if pnl.is_positive() {
                self.wins += 1;
            } else {
                self.losses += 1;
            }
        }
    }

    /// Refresh the mark used for unrealized P&L on every exposure in the
    /// product.
    pub fn update_mark(&mut self, product_id: &Symbol, price: Money) {
        for exposure in self.exposures.values_mut() {
            if exposure.product_id == *product_id {
                exposure.mark_price = Some(price);
            }
        }
    }

    pub fn unrealized_pnl(&self) -> Money {
        self.exposures
            .values()
            .map(|e| match e.mark_price {
                Some(mark) => (mark - e.entry_price) * e.qty,
                None => Money::ZERO,
            })
            .sum()
    }

    /// Unrealized loss past the configured floor.
    pub fn should_emergency_liquidate(&self) -> bool {
        let unrealized = self.unrealized_pnl();
        if !unrealized.is_negative() {
            return false;
        }
        let pct = unrealized * Money::HUNDRED / self.config.total_capital;
        pct <= self.config.emergency_liquidation_loss_pct
    }

    pub fn metrics(&self) -> PortfolioMetrics {
        let deployed = self.deployed_capital();
        let unrealized = self.unrealized_pnl();
        let mut concentration: HashMap<String, Money> = HashMap::new();
        for exposure in self.exposures.values() {
            *concentration
                .entry(exposure.correlation_group.clone())
                .or_default() += exposure.entry_notional;
        }
        let decided = self.wins + self.losses;
        PortfolioMetrics {
            total_capital: self.config.total_capital,
            available_capital: self.available_capital(),
            deployed_capital: deployed,
            realized_pnl: self.realized_pnl,
            unrealized_pnl: unrealized,
            total_pnl: self.realized_pnl + unrealized,
            open_positions: self.exposures.len(),
            closed_positions: self.closed_positions,
            win_rate: if decided == 0 {
                0.0
            } else {
                self.wins as f64 / decided as f64
            },
            concentration,
        }
    }

    /// Allocation drift checks against per-pair targets.
    pub fn rebalance_actions(&self) -> Vec<RebalanceHint> {
        let total = self.config.total_capital;
        let mut hints = Vec::new();
        for (product_id, alloc) in &self.pairs {
            let Some(target) = alloc.target_allocation_pct else {
                continue;
            };
            let deployed: Money = self
                .exposures
                .values()
                .filter(|e| e.product_id == *product_id)
                .map(|e| e.entry_notional)
                .sum();
            let current_pct = deployed * Money::HUNDRED / total;
            let drift = current_pct - target;
            if drift.abs() > self.config.rebalance_threshold_pct {
                hints.push(RebalanceHint {
                    product_id: product_id.clone(),
                    current_pct,
                    target_pct: target,
                    drift_pct: drift,
                });
            }
        }
        hints
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(d: rust_decimal::Decimal) -> Money {
        Money::new(d)
    }

    fn manager() -> PortfolioManager {
        let mut pm = PortfolioManager::new(PortfolioConfig {
            total_capital: m(dec!(10000)),
            max_position_size_pct: m(dec!(5)),
            max_positions: 2,
            max_correlated_exposure_pct: m(dec!(8)),
            rebalance_threshold_pct: m(dec!(5)),
            emergency_liquidation_loss_pct: m(dec!(-10)),
        });
        pm.register_pair(Symbol::new("BTC-USD"), "large_cap", Some(m(dec!(10))));
        pm.register_pair(Symbol::new("ETH-USD"), "large_cap", None);
        pm.register_pair(Symbol::new("DOGE-USD"), "meme", None);
        pm
    }

    #[test]
    fn test_position_size_cap() {
        let pm = manager();
        // 5% of 10,000 = 500
        assert!(pm.check_admission(&Symbol::new("BTC-USD"), m(dec!(500))).is_ok());
        assert_eq!(
            pm.check_admission(&Symbol::new("BTC-USD"), m(dec!(600))),
            Err(AdmissionReason::PositionSizeExceedsLimit)
        );
    }

    #[test]
    fn test_max_positions_cap() {
        let mut pm = manager();
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.01)), m(dec!(10000)));
        pm.record_fill("p2", &Symbol::new("ETH-USD"), m(dec!(0.1)), m(dec!(1000)));
        assert_eq!(
            pm.check_admission(&Symbol::new("DOGE-USD"), m(dec!(100))),
            Err(AdmissionReason::MaxPositionsReached)
        );
    }

    #[test]
    fn test_correlated_exposure_cap() {
        let mut pm = manager();
        // 400 deployed into large_cap; group cap is 8% of 10,000 = 800
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.04)), m(dec!(10000)));
        assert_eq!(
            pm.check_admission(&Symbol::new("ETH-USD"), m(dec!(450))),
            Err(AdmissionReason::CorrelatedExposureExceedsLimit)
        );
        // A different group is unaffected
        assert!(pm.check_admission(&Symbol::new("DOGE-USD"), m(dec!(450))).is_ok());
    }

    #[test]
    fn test_capital_flows() {
        let mut pm = manager();
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.01)), m(dec!(40000)));
        assert_eq!(pm.deployed_capital(), m(dec!(400.00)));
        assert_eq!(pm.available_capital(), m(dec!(9600.00)));

        pm.record_close("p1", m(dec!(0.01)), m(dec!(44000)));
        assert_eq!(pm.deployed_capital(), Money::ZERO);
        let metrics = pm.metrics();
        assert_eq!(metrics.realized_pnl, m(dec!(40.00)));
        assert_eq!(metrics.available_capital, m(dec!(10040.00)));
        assert_eq!(metrics.closed_positions, 1);
        assert_eq!(metrics.win_rate, 1.0);
    }

    #[test]
    fn test_partial_close_keeps_exposure() {
        let mut pm = manager();
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.02)), m(dec!(20000)));
        pm.record_close("p1", m(dec!(0.01)), m(dec!(21000)));
        let metrics = pm.metrics();
        assert_eq!(metrics.open_positions, 1);
        assert_eq!(metrics.deployed_capital, m(dec!(200.00)));
        assert_eq!(metrics.realized_pnl, m(dec!(10.00)));
    }

    #[test]
    fn test_emergency_liquidation_trigger() {
        let mut pm = manager();
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.5)), m(dec!(10000)));
        pm.update_mark(&Symbol::new("BTC-USD"), m(dec!(9000)));
        // Unrealized: -500 on 10,000 = -5%, above the -10% floor
        assert!(!pm.should_emergency_liquidate());

        pm.update_mark(&Symbol::new("BTC-USD"), m(dec!(7000)));
        // -1500 = -15%
        assert!(pm.should_emergency_liquidate());
    }

    #[test]
    fn test_rebalance_hints() {
        let mut pm = manager();
        // Target 10% of 10,000 = 1,000; deploy 1,600 => +6pp drift
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.04)), m(dec!(40000)));
        let hints = pm.rebalance_actions();
        assert_eq!(hints.len(), 1);
        assert_eq!(hints[0].product_id, Symbol::new("BTC-USD"));
        assert_eq!(hints[0].drift_pct, m(dec!(6)));

        // Inside the threshold: no hint
        let mut pm = manager();
        pm.record_fill("p1", &Symbol::new("BTC-USD"), m(dec!(0.03)), m(dec!(40000)));
        assert!(pm.rebalance_actions().is_empty());
    }
}
