//! In-memory venue for paper trading and tests
//!
//! Keeps a book of resting orders keyed by client order id, fills them when
//! the simulated trade stream crosses their prices, and exposes perturbation
//! hooks (externally filled/cancelled orders, foreign orders, injected
//! failures) so reconciliation and retry paths can be exercised without a
//! live exchange.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{
    ExchangeAdapter, LimitBuy, StopLimitSell, VenueAck, VenueOpenOrder, VenueOrderState,
    VenueOrderStatus,
};
use crate::error::VenueError;
use crate::{Money, Side, Symbol};

#[derive(Debug, Clone)]
struct SimOrder {
    venue_order_id: String,
    client_order_id: Option<String>,
    product_id: Symbol,
    side: Side,
    /// Limit price; stops fill here once triggered
    price: Money,
    stop_trigger: Option<Money>,
    qty: Money,
    filled_qty: Money,
    avg_fill_price: Option<Money>,
    state: VenueOrderState,
}

impl SimOrder {
    fn status(&self) -> VenueOrderStatus {
        VenueOrderStatus {
            state: self.state,
            filled_qty: self.filled_qty,
            avg_fill_price: self.avg_fill_price,
            venue_order_id: Some(self.venue_order_id.clone()),
        }
    }
}

#[derive(Default)]
struct SimState {
    /// Orders keyed by client id; foreign orders keyed by venue id
    orders: HashMap<String, SimOrder>,
    last_trade: HashMap<Symbol, Money>,
    /// Errors to return from the next placement calls, in order
    place_failures: Vec<VenueError>,
}

/// Simulated venue. Clone-free; share behind an `Arc`.
pub struct SimVenue {
    state: Mutex<SimState>,
    next_id: AtomicU64,
}

impl Default for SimVenue {
    fn default() -> Self {
        Self::new()
    }
}

impl SimVenue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn venue_id(&self) -> String {
        format!("SIM-{}", self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ==================== perturbation hooks ====================

    /// Queue an error for an upcoming placement call.
    pub fn fail_next_place(&self, err: VenueError) {
        self.state.lock().unwrap().place_failures.push(err);
    }

    /// Publish a trade print and cross any resting orders it reaches.
    pub fn set_last_trade(&self, product_id: &Symbol, price: Money) {
        let mut state = self.state.lock().unwrap();
        state.last_trade.insert(product_id.clone(), price);

        for order in state.orders.values_mut() {
            if order.product_id != *product_id || order.state != VenueOrderState::Open {
                continue;
            }
            let crosses = match (order.side, order.stop_trigger) {
                (Side::Buy, _) => price <= order.price,
                (Side::Sell, Some(trigger)) => price <= trigger,
                (Side::Sell, None) => price >= order.price,
            };
            if crosses {
                order.filled_qty = order.qty;
                order.avg_fill_price = Some(order.price);
                order.state = VenueOrderState::Filled;
            }
        }
    }

    /// Mark an order filled as if the venue executed it (by client id).
    pub fn force_fill(&self, client_order_id: &str, qty: Money, price: Money) {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(client_order_id) {
            let new_filled = order.filled_qty + qty;
            let prev = order.avg_fill_price.unwrap_or(Money::ZERO) * order.filled_qty;
            order.avg_fill_price = Some((prev + price * qty) / new_filled);
            order.filled_qty = new_filled;
            order.state = if new_filled >= order.qty {
                VenueOrderState::Filled
            } else {
                VenueOrderState::Open
            };
        }
    }

    /// Mark an order cancelled venue-side (by client id), e.g. by a human
    /// on the exchange web UI.
    pub fn force_cancel(&self, client_order_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(order) = state.orders.get_mut(client_order_id) {
            order.state = VenueOrderState::Cancelled;
        }
    }

    /// Drop all record of an order, so the venue reports it Unknown.
    pub fn forget_order(&self, client_order_id: &str) {
        self.state.lock().unwrap().orders.remove(client_order_id);
    }

    /// Rest an order that this process never placed (no known client id).
    pub fn inject_foreign_order(&self, product_id: &Symbol, side: Side, price: Money, qty: Money) -> String {
        let venue_order_id = self.venue_id();
        let mut state = self.state.lock().unwrap();
        state.orders.insert(
            venue_order_id.clone(),
            SimOrder {
                venue_order_id: venue_order_id.clone(),
                client_order_id: None,
                product_id: product_id.clone(),
                side,
                price,
                stop_trigger: None,
                qty,
                filled_qty: Money::ZERO,
                avg_fill_price: None,
                state: VenueOrderState::Open,
            },
        );
        venue_order_id
    }

    /// Status lookup for assertions (by client id or, for foreign orders,
    /// venue id).
    pub fn order_state(&self, id: &str) -> Option<VenueOrderState> {
        let state = self.state.lock().unwrap();
        state
            .orders
            .get(id)
            .or_else(|| state.orders.values().find(|o| o.venue_order_id == id))
            .map(|o| o.state)
    }

    fn place(
        &self,
        client_order_id: &str,
        product_id: &Symbol,
        side: Side,
        price: Money,
        stop_trigger: Option<Money>,
        qty: Money,
    ) -> Result<VenueAck, VenueError> {
        let mut state = self.state.lock().unwrap();

        // Idempotent resubmission returns the original ack
        if let Some(existing) = state.orders.get(client_order_id) {
            return Ok(VenueAck {
                venue_order_id: existing.venue_order_id.clone(),
            });
        }

        if let Some(err) = {
            let failures = &mut state.place_failures;
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        } {
            return Err(err);
        }

        if !price.is_positive() || !qty.is_positive() {
            return Err(VenueError::InvalidRequest(format!(
                "non-positive price or qty: {} x {}",
                price, qty
            )));
        }

        let venue_order_id = self.venue_id();
        state.orders.insert(
            client_order_id.to_string(),
            SimOrder {
                venue_order_id: venue_order_id.clone(),
                client_order_id: Some(client_order_id.to_string()),
                product_id: product_id.clone(),
                side,
                price,
                stop_trigger,
                qty,
                filled_qty: Money::ZERO,
                avg_fill_price: None,
                state: VenueOrderState::Open,
            },
        );
        Ok(VenueAck { venue_order_id })
    }
}

#[async_trait]
impl ExchangeAdapter for SimVenue {
    async fn place_limit_buy(&self, req: &LimitBuy) -> Result<VenueAck, VenueError> {
        self.place(
            &req.client_order_id,
            &req.product_id,
            Side::Buy,
            req.price,
            None,
            req.qty,
        )
    }

    async fn place_stop_limit(&self, req: &StopLimitSell) -> Result<VenueAck, VenueError> {
        self.place(
            &req.client_order_id,
            &req.product_id,
            Side::Sell,
            req.limit_price,
            Some(req.stop_trigger),
            req.qty,
        )
    }

    async fn cancel_order(
        &self,
        _product_id: &Symbol,
        venue_order_id: &str,
    ) -> Result<(), VenueError> {
        let mut state = self.state.lock().unwrap();
        let order = state
            .orders
            .values_mut()
            .find(|o| o.venue_order_id == venue_order_id)
            .ok_or_else(|| VenueError::UnknownOrder(venue_order_id.to_string()))?;
        match order.state {
            VenueOrderState::Open => {
                order.state = VenueOrderState::Cancelled;
                Ok(())
            }
            VenueOrderState::Cancelled => Ok(()),
            _ => Err(VenueError::InvalidRequest(format!(
                "order {} is not cancellable",
                venue_order_id
            ))),
        }
    }

    async fn get_order_status(
        &self,
        _product_id: &Symbol,
        client_order_id: &str,
    ) -> Result<VenueOrderStatus, VenueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .get(client_order_id)
            .map(|o| o.status())
            .unwrap_or_else(VenueOrderStatus::unknown))
    }

    async fn get_last_trade_price(&self, product_id: &Symbol) -> Result<Money, VenueError> {
        let state = self.state.lock().unwrap();
        state
            .last_trade
            .get(product_id)
            .copied()
            .ok_or_else(|| VenueError::UnknownProduct(product_id.to_string()))
    }

    async fn list_open_orders(
        &self,
        product_id: &Symbol,
    ) -> Result<Vec<VenueOpenOrder>, VenueError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .orders
            .values()
            .filter(|o| o.product_id == *product_id && o.state == VenueOrderState::Open)
            .map(|o| VenueOpenOrder {
                venue_order_id: o.venue_order_id.clone(),
                client_order_id: o.client_order_id.clone(),
                product_id: o.product_id.clone(),
                side: o.side,
                price: o.price,
                qty: o.qty,
            })
            .collect())
    }
}

/// Paper-trading venue: real market data, simulated order book. Each price
/// fetch is replayed into the book so resting paper orders cross exactly as
/// the live tape moves.
pub struct PaperVenue {
    market: std::sync::Arc<dyn ExchangeAdapter>,
    book: SimVenue,
}

impl PaperVenue {
    pub fn new(market: std::sync::Arc<dyn ExchangeAdapter>) -> Self {
        Self {
            market,
            book: SimVenue::new(),
        }
    }
}

#[async_trait]
impl ExchangeAdapter for PaperVenue {
    async fn place_limit_buy(&self, req: &LimitBuy) -> Result<VenueAck, VenueError> {
        self.book.place_limit_buy(req).await
    }

    async fn place_stop_limit(&self, req: &StopLimitSell) -> Result<VenueAck, VenueError> {
        self.book.place_stop_limit(req).await
    }

    async fn cancel_order(
        &self,
        product_id: &Symbol,
        venue_order_id: &str,
    ) -> Result<(), VenueError> {
        self.book.cancel_order(product_id, venue_order_id).await
    }

    async fn get_order_status(
        &self,
        product_id: &Symbol,
        client_order_id: &str,
    ) -> Result<VenueOrderStatus, VenueError> {
        self.book.get_order_status(product_id, client_order_id).await
    }

    async fn get_last_trade_price(&self, product_id: &Symbol) -> Result<Money, VenueError> {
        let price = self.market.get_last_trade_price(product_id).await?;
        self.book.set_last_trade(product_id, price);
        Ok(price)
    }

    async fn list_open_orders(
        &self,
        product_id: &Symbol,
    ) -> Result<Vec<VenueOpenOrder>, VenueError> {
        self.book.list_open_orders(product_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn m(d: rust_decimal::Decimal) -> Money {
        Money::new(d)
    }

    fn buy(client_id: &str) -> LimitBuy {
        LimitBuy {
            product_id: Symbol::new("BTC-USD"),
            client_order_id: client_id.to_string(),
            price: m(dec!(50000)),
            qty: m(dec!(1)),
        }
    }

    #[tokio::test]
    async fn test_place_and_status() {
        let venue = SimVenue::new();
        let ack = venue.place_limit_buy(&buy("c-1")).await.unwrap();
        assert!(ack.venue_order_id.starts_with("SIM-"));

        let status = venue
            .get_order_status(&Symbol::new("BTC-USD"), "c-1")
            .await
            .unwrap();
        assert_eq!(status.state, VenueOrderState::Open);
    }

    #[tokio::test]
    async fn test_resubmission_is_idempotent() {
        let venue = SimVenue::new();
        let first = venue.place_limit_buy(&buy("c-1")).await.unwrap();
        let second = venue.place_limit_buy(&buy("c-1")).await.unwrap();
        assert_eq!(first.venue_order_id, second.venue_order_id);

        let open = venue.list_open_orders(&Symbol::new("BTC-USD")).await.unwrap();
        assert_eq!(open.len(), 1);
    }

    #[tokio::test]
    async fn test_trade_print_crosses_resting_buy() {
        let venue = SimVenue::new();
        let sym = Symbol::new("BTC-USD");
        venue.place_limit_buy(&buy("c-1")).await.unwrap();

        venue.set_last_trade(&sym, m(dec!(50100)));
        assert_eq!(venue.order_state("c-1"), Some(VenueOrderState::Open));

        venue.set_last_trade(&sym, m(dec!(49900)));
        assert_eq!(venue.order_state("c-1"), Some(VenueOrderState::Filled));
        let status = venue.get_order_status(&sym, "c-1").await.unwrap();
        assert_eq!(status.filled_qty, m(dec!(1)));
        assert_eq!(status.avg_fill_price, Some(m(dec!(50000))));
    }

    #[tokio::test]
    async fn test_stop_limit_triggers_on_drop() {
        let venue = SimVenue::new();
        let sym = Symbol::new("BTC-USD");
        venue
            .place_stop_limit(&StopLimitSell {
                product_id: sym.clone(),
                client_order_id: "s-1".into(),
                stop_trigger: m(dec!(49000)),
                limit_price: m(dec!(48755)),
                qty: m(dec!(1)),
            })
            .await
            .unwrap();

        venue.set_last_trade(&sym, m(dec!(49500)));
        assert_eq!(venue.order_state("s-1"), Some(VenueOrderState::Open));

        venue.set_last_trade(&sym, m(dec!(48900)));
        assert_eq!(venue.order_state("s-1"), Some(VenueOrderState::Filled));
    }

    #[tokio::test]
    async fn test_cancel_unknown_order() {
        let venue = SimVenue::new();
        let err = venue
            .cancel_order(&Symbol::new("BTC-USD"), "missing")
            .await
            .unwrap_err();
        assert!(matches!(err, VenueError::UnknownOrder(_)));
    }

    #[tokio::test]
    async fn test_injected_failure_consumed_once() {
        let venue = SimVenue::new();
        venue.fail_next_place(VenueError::RateLimited);

        let err = venue.place_limit_buy(&buy("c-1")).await.unwrap_err();
        assert!(matches!(err, VenueError::RateLimited));

        // Next attempt goes through
        venue.place_limit_buy(&buy("c-1")).await.unwrap();
    }

    #[tokio::test]
    async fn test_foreign_orders_have_no_client_id() {
        let venue = SimVenue::new();
        let sym = Symbol::new("BTC-USD");
        let vid = venue.inject_foreign_order(&sym, Side::Sell, m(dec!(60000)), m(dec!(0.5)));

        let open = venue.list_open_orders(&sym).await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].venue_order_id, vid);
        assert_eq!(open[0].client_order_id, None);
    }
}
