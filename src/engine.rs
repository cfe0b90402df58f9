//! Per-pair execution engine
//!
//! Couples position state, the order state machine, the venue adapter, and
//! the store. One engine owns one product's positions exclusively; the
//! orchestrator serializes access with a per-engine mutex. The engine's
//! cardinal rules:
//!
//! - no exit order exists before an entry fill is confirmed
//! - a stop trigger never moves down, and a position that lost its stop is
//!   re-armed on the next tick with unchanged or tighter parameters
//! - local state is committed transactionally; when a venue call lands but
//!   the commit does not, startup reconciliation heals the disagreement

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::StrategyConfig;
use crate::error::{EngineError, EngineResult, VenueError};
use crate::exchange::{ExchangeAdapter, LimitBuy, StopLimitSell, VenueOrderState};
use crate::order::{Applied, Order, OrderKind, OrderState};
use crate::portfolio::{AdmissionReason, PortfolioManager};
use crate::position::{CloseReason, PositionState, PositionStatus};
use crate::signal::EntryIntent;
use crate::store::{Store, TradeRecord};
use crate::{Money, Side, Symbol};

/// Ids returned from a successful entry submission.
#[derive(Debug, Clone)]
pub struct SubmitReceipt {
    pub position_id: String,
    pub order_id: String,
}

pub struct Engine {
    pub(crate) product_id: Symbol,
    pub(crate) params: StrategyConfig,
    pub(crate) venue: Arc<dyn ExchangeAdapter>,
    pub(crate) store: Store,
    pub(crate) portfolio: Arc<Mutex<PortfolioManager>>,

    // Derived views of the store, rebuilt at startup; the store stays the
    // single source of truth.
    pub(crate) positions: HashMap<String, PositionState>,
    pub(crate) orders: HashMap<String, Order>,

    // Tick-loop bookkeeping, in-memory only.
    pub(crate) needs_stop: HashSet<String>,
    pub(crate) stop_failures: HashMap<String, u32>,
    pub(crate) aggression: HashMap<String, u32>,
    pub(crate) stop_triggered_at: HashMap<String, DateTime<Utc>>,
    pub(crate) entry_wait: HashMap<String, u32>,
}

impl Engine {
    pub fn new(
        product_id: Symbol,
        params: StrategyConfig,
        venue: Arc<dyn ExchangeAdapter>,
        store: Store,
        portfolio: Arc<Mutex<PortfolioManager>>,
    ) -> Self {
        Self {
            product_id,
            params,
            venue,
            store,
            portfolio,
            positions: HashMap::new(),
            orders: HashMap::new(),
            needs_stop: HashSet::new(),
            stop_failures: HashMap::new(),
            aggression: HashMap::new(),
            stop_triggered_at: HashMap::new(),
            entry_wait: HashMap::new(),
        }
    }

    pub fn product_id(&self) -> &Symbol {
        &self.product_id
    }

    pub fn open_positions(&self) -> impl Iterator<Item = &PositionState> {
        self.positions
            .values()
            .filter(|p| p.status == PositionStatus::Open)
    }

    pub fn position(&self, position_id: &str) -> Option<&PositionState> {
        self.positions.get(position_id)
    }

    /// Rebuild the in-memory views (and the portfolio's exposure ledger)
    /// from the store. Called once at startup, before reconciliation.
    pub fn load_state(&mut self) -> EngineResult<()> {
        let product = self.product_id.clone();
        let (positions, orders) = self.store.transaction(|tx| {
            let positions: Vec<PositionState> = tx
                .list_open_positions()?
                .into_iter()
                .filter(|p| p.product_id == product)
                .collect();
            let orders: Vec<Order> = tx
                .list_open_orders()?
                .into_iter()
                .filter(|o| o.product_id == product)
                .collect();
            Ok((positions, orders))
        })?;

        self.positions.clear();
        self.orders.clear();

        let mut portfolio = self.portfolio.lock().unwrap();
        for position in positions {
            if position.status == PositionStatus::Open {
                if let Some(entry) = position.entry_price {
                    portfolio.record_fill(
                        &position.position_id,
                        &position.product_id,
                        position.qty_filled,
                        entry,
                    );
                }
            } else {
                self.entry_wait.insert(position.position_id.clone(), 0);
            }
            self.positions.insert(position.position_id.clone(), position);
        }
        drop(portfolio);

        for order in orders {
            self.orders.insert(order.order_id.clone(), order);
        }

        info!(
            product = %self.product_id,
            positions = self.positions.len(),
            orders = self.orders.len(),
            "engine state loaded"
        );
        Ok(())
    }

    // ==================== cache maintenance ====================

    pub(crate) fn cache_order(&mut self, order: Order) {
        if order.is_terminal() {
            self.orders.remove(&order.order_id);
        } else {
            self.orders.insert(order.order_id.clone(), order);
        }
    }

    pub(crate) fn cache_position(&mut self, position: PositionState) {
        let id = position.position_id.clone();
        if position.is_terminal() {
            self.positions.remove(&id);
            self.needs_stop.remove(&id);
            self.stop_failures.remove(&id);
            self.aggression.remove(&id);
            self.stop_triggered_at.remove(&id);
            self.entry_wait.remove(&id);
        } else {
            self.positions.insert(id, position);
        }
    }

    pub(crate) fn lookup_order(&self, order_id: &str) -> EngineResult<Order> {
        if let Some(order) = self.orders.get(order_id) {
            return Ok(order.clone());
        }
        self.store
            .load_order(order_id)?
            .ok_or_else(|| EngineError::InvalidTransition {
                entity: "order",
                from: "missing".to_string(),
                to: order_id.to_string(),
            })
    }

    pub(crate) fn lookup_position(&self, position_id: &str) -> EngineResult<PositionState> {
        if let Some(position) = self.positions.get(position_id) {
            return Ok(position.clone());
        }
        self.store
            .load_position(position_id)?
            .ok_or_else(|| EngineError::InvalidTransition {
                entity: "position",
                from: "missing".to_string(),
                to: position_id.to_string(),
            })
    }

    fn entry_order_for(&self, position_id: &str) -> Option<Order> {
        self.orders
            .values()
            .find(|o| o.position_id == position_id && o.kind == OrderKind::Entry)
            .cloned()
    }

    fn pending_stop_for(&self, position_id: &str) -> Option<Order> {
        self.orders
            .values()
            .find(|o| {
                o.position_id == position_id
                    && o.kind == OrderKind::Stop
                    && o.state == OrderState::PendingSubmit
            })
            .cloned()
    }

    // ==================== entry submission ====================

    /// Submit a limit-buy entry. Admission runs before anything is written;
    /// a duplicate client order id either resumes a still-pending submission
    /// (idempotent retry) or is rejected outright.
    pub async fn submit_entry(&mut self, intent: &EntryIntent) -> EngineResult<SubmitReceipt> {
        if let Some(existing) = self.store.load_order(&intent.client_order_id)? {
            if existing.state == OrderState::PendingSubmit && existing.kind == OrderKind::Entry {
                return self.drive_entry_submission(existing).await;
            }
            return Err(EngineError::rejected(AdmissionReason::DuplicateClientOrderId));
        }

        {
            let portfolio = self.portfolio.lock().unwrap();
            portfolio
                .check_admission(&intent.product_id, intent.notional())
                .map_err(EngineError::rejected)?;
        }

        let position_id = Uuid::new_v4().to_string();
        let position = PositionState::new(&position_id, intent.product_id.clone());
        let order = Order::new_entry(
            &intent.client_order_id,
            &position_id,
            intent.product_id.clone(),
            intent.limit_price,
            intent.qty,
        );

        self.store.transaction(|tx| {
            tx.save_position(&position)?;
            tx.save_order(&order)
        })?;
        self.cache_position(position);
        self.entry_wait.insert(position_id.clone(), 0);

        info!(
            product = %self.product_id,
            position_id = %position_id,
            order_id = %order.order_id,
            price = %intent.limit_price,
            qty = %intent.qty,
            "entry submitted"
        );

        self.drive_entry_submission(order).await
    }

    /// Venue leg of an entry submission, shared by fresh submits and
    /// idempotent resumes of pending ones.
    async fn drive_entry_submission(&mut self, mut order: Order) -> EngineResult<SubmitReceipt> {
        let request = LimitBuy {
            product_id: order.product_id.clone(),
            client_order_id: order.order_id.clone(),
            price: order.price,
            qty: order.qty,
        };

        match self.venue.place_limit_buy(&request).await {
            Ok(ack) => {
                if order.acknowledge(ack.venue_order_id)? == Applied::Transitioned(OrderState::Open)
                {
                    self.store.save_order(&order)?;
                }
                let receipt = SubmitReceipt {
                    position_id: order.position_id.clone(),
                    order_id: order.order_id.clone(),
                };
                self.cache_order(order);
                Ok(receipt)
            }
            Err(err) if err.is_retriable() => {
                // Outcome unknown (timeout) or not accepted (rate limit,
                // 5xx). The row stays pending; a resubmit with the same
                // client id or startup reconciliation resolves it.
                warn!(order_id = %order.order_id, error = %err, "entry placement unresolved");
                self.cache_order(order);
                Err(EngineError::VenueRetriable(err))
            }
            Err(err) => {
                order.reject()?;
                let mut position = self.lookup_position(&order.position_id)?;
                position.abort_entry()?;
                self.store.transaction(|tx| {
                    tx.save_order(&order)?;
                    tx.save_position(&position)
                })?;
                self.cache_order(order);
                self.cache_position(position);
                Err(EngineError::VenueFatal(err))
            }
        }
    }

    // ==================== fills ====================

    /// Apply an entry fill event. On the first fill the protective stop is
    /// placed; on later partial fills the stop is replaced to cover the
    /// grown quantity. This path is the only creator of initial stops and
    /// runs strictly after a confirmed BUY execution.
    pub async fn handle_fill(
        &mut self,
        order_id: &str,
        filled_qty: Money,
        fill_price: Money,
    ) -> EngineResult<()> {
        let mut order = self.lookup_order(order_id)?;
        if order.kind != OrderKind::Entry {
            return self.handle_stop_fill(order_id, filled_qty, fill_price).await;
        }

        if order.apply_fill(filled_qty, fill_price)? == Applied::NoOp {
            return Ok(());
        }

        let mut position = self.lookup_position(&order.position_id)?;
        position.register_fill(filled_qty, fill_price)?;
        self.entry_wait.remove(&position.position_id);

        info!(
            product = %self.product_id,
            position_id = %position.position_id,
            qty = %filled_qty,
            price = %fill_price,
            entry = %position.entry_price.unwrap_or(Money::ZERO),
            "entry fill"
        );

        // Arm (or grow) the protective stop now that exposure is confirmed.
        // A venue failure here must not lose the fill itself; the position
        // is flagged and the stop re-arms on the next tick.
        let touched = match self.replace_stop(&mut position).await {
            Ok(touched) => touched,
            Err(err @ (EngineError::VenueRetriable(_) | EngineError::VenueFatal(_))) => {
                warn!(
                    position_id = %position.position_id,
                    error = %err,
                    "stop update deferred after fill"
                );
                self.needs_stop.insert(position.position_id.clone());
                Vec::new()
            }
            Err(err) => return Err(err),
        };

        self.store.transaction(|tx| {
            tx.save_order(&order)?;
            for stop in &touched {
                tx.save_order(stop)?;
            }
            tx.save_position(&position)
        })?;

        self.cache_order(order);
        for stop in touched {
            self.cache_order(stop);
        }

        {
            let mut portfolio = self.portfolio.lock().unwrap();
            portfolio.record_fill(
                &position.position_id,
                &position.product_id,
                filled_qty,
                fill_price,
            );
        }
        self.cache_position(position);
        Ok(())
    }

    /// Apply a stop (or force-exit) execution: transition the order, close
    /// the position pro rata, and book the trade once flat.
    pub async fn handle_stop_fill(
        &mut self,
        order_id: &str,
        filled_qty: Money,
        fill_price: Money,
    ) -> EngineResult<()> {
        let mut order = self.lookup_order(order_id)?;
        if order.kind == OrderKind::Entry {
            return Err(EngineError::InvalidTransition {
                entity: "order",
                from: "entry".to_string(),
                to: "stop fill".to_string(),
            });
        }

        if order.apply_fill(filled_qty, fill_price)? == Applied::NoOp {
            return Ok(());
        }

        let mut position = self.lookup_position(&order.position_id)?;
        position.close(fill_price, filled_qty, CloseReason::StopFill)?;

        let trade = position.is_terminal().then(|| TradeRecord {
            position_id: position.position_id.clone(),
            product_id: position.product_id.clone(),
            side: Side::Sell,
            qty: order.filled_qty,
            entry_price: position.entry_price.unwrap_or(Money::ZERO),
            exit_price: order.fill_price,
            realized_pnl: position.realized_pnl,
            forced: false,
            closed_at: Utc::now(),
        });

        self.store.transaction(|tx| {
            tx.save_order(&order)?;
            tx.save_position(&position)?;
            if let Some(trade) = &trade {
                tx.record_trade(trade)?;
            }
            Ok(())
        })?;

        info!(
            product = %self.product_id,
            position_id = %position.position_id,
            qty = %filled_qty,
            price = %fill_price,
            closed = position.is_terminal(),
            "stop fill"
        );

        {
            let mut portfolio = self.portfolio.lock().unwrap();
            portfolio.record_close(&position.position_id, filled_qty, fill_price);
        }
        self.cache_order(order);
        self.cache_position(position);
        Ok(())
    }

    // ==================== trade ticks ====================

    /// Fold a last-trade print into every open position: raise the high,
    /// ratchet the stop when the improvement clears `min_ratchet`, re-arm
    /// stops lost to earlier failures, and escalate stops that triggered
    /// but have not filled within the timeout.
    pub async fn on_trade(&mut self, last_price: Money) -> EngineResult<()> {
        {
            let mut portfolio = self.portfolio.lock().unwrap();
            portfolio.update_mark(&self.product_id, last_price);
        }

        let ids: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::Open && !p.inconsistent)
            .map(|p| p.position_id.clone())
            .collect();

        for id in ids {
            let mut position = match self.positions.get(&id) {
                Some(p) => p.clone(),
                None => continue,
            };
            let before = position.updated_at;
            position.observe_price(last_price);

            let mut force_replace = self.track_stop_trigger(&position, last_price);
            if self.needs_stop.contains(&id) {
                force_replace = true;
            }

            let wants_ratchet = position
                .compute_new_stop(self.params.trail_pct, self.params.stop_limit_buffer_pct)
                .map(|(trigger, _)| position.should_replace_stop(trigger, self.params.min_ratchet))
                .unwrap_or(false);

            let mut touched = Vec::new();
            if force_replace || wants_ratchet {
                match self.replace_stop(&mut position).await {
                    Ok(orders) => touched = orders,
                    Err(err @ EngineError::InvalidTransition { .. }) => {
                        // A bug, not a reason to stall the tick loop
                        error!(position_id = %id, error = %err, "skipping invalid stop transition");
                    }
                    Err(err @ (EngineError::VenueRetriable(_) | EngineError::VenueFatal(_))) => {
                        warn!(position_id = %id, error = %err, "stop replacement deferred");
                    }
                    Err(err) => return Err(err),
                }
            }

            let dirty = position.updated_at != before || !touched.is_empty();
            if dirty {
                self.store.transaction(|tx| {
                    for order in &touched {
                        tx.save_order(order)?;
                    }
                    tx.save_position(&position)
                })?;
                for order in touched {
                    self.cache_order(order);
                }
                self.cache_position(position);
            }
        }
        Ok(())
    }

    /// Track when price crosses the stop trigger; returns true when the
    /// resting stop has been triggered for longer than `stop_timeout_seconds`
    /// without filling, which forces a tighter replacement.
    fn track_stop_trigger(&mut self, position: &PositionState, last_price: Money) -> bool {
        let id = &position.position_id;
        let Some(trigger) = position.current_stop_trigger else {
            return false;
        };
        if last_price > trigger {
            self.stop_triggered_at.remove(id);
            return false;
        }
        if position.stop_order_id.is_none() {
            return false;
        }
        let now = Utc::now();
        let since = *self.stop_triggered_at.entry(id.clone()).or_insert(now);
        if (now - since).num_seconds() >= self.params.stop_timeout_seconds as i64 {
            warn!(
                position_id = %id,
                trigger = %trigger,
                "stop triggered but unfilled past timeout, escalating"
            );
            *self.aggression.entry(id.clone()).or_insert(0) += 1;
            self.stop_triggered_at.insert(id.clone(), now);
            return true;
        }
        false
    }

    /// Limit buffer after escalation: each step tightens the buffer toward
    /// the trigger. The trigger itself is never touched by escalation.
    fn effective_buffer(&self, position_id: &str) -> Money {
        let mut buffer = self.params.stop_limit_buffer_pct;
        let steps = self.aggression.get(position_id).copied().unwrap_or(0);
        for _ in 0..steps {
            buffer = buffer * (Money::ONE - self.params.stop_escalation_step_pct);
        }
        buffer
    }

    // ==================== stop placement ====================

    /// Cancel-then-place stop replacement. Mutates `position` and returns
    /// the order rows touched; the caller owns persistence so the whole
    /// event commits in one transaction. The new trigger is clamped to
    /// never sit below the current one.
    pub(crate) async fn replace_stop(
        &mut self,
        position: &mut PositionState,
    ) -> EngineResult<Vec<Order>> {
        let id = position.position_id.clone();
        let mut touched = Vec::new();

        if position.status != PositionStatus::Open || !position.qty_filled.is_positive() {
            return Ok(touched);
        }

        // A stop whose placement timed out may actually be resting at the
        // venue; resume that exact submission (same client id, same prices)
        // instead of creating a sibling.
        if let Some(pending) = self.pending_stop_for(&id) {
            let resumed = self.drive_stop_submission(position, pending).await?;
            if position.stop_order_id.is_some() && resumed.qty != position.qty_filled {
                // Quantity grew while the submission was in limbo; force a
                // proper cancel-and-replace on the next tick
                self.needs_stop.insert(id.clone());
            }
            return Ok(vec![resumed]);
        }

        let Some((raw_trigger, _)) = position
            .compute_new_stop(self.params.trail_pct, self.params.stop_limit_buffer_pct)
        else {
            return Ok(touched);
        };

        // Ratchet clamp: never below the last known trigger
        let trigger = match position.current_stop_trigger {
            Some(current) => raw_trigger.max(current),
            None => raw_trigger,
        };
        let limit = trigger * (Money::ONE - self.effective_buffer(&id));

        // Cancel the old stop first; if the cancel cannot land, the old
        // (tighter-or-equal) stop keeps standing and we try again next tick.
        if let Some(stop_order_id) = position.stop_order_id.clone() {
            let mut old = self.lookup_order(&stop_order_id)?;
            if let Some(venue_id) = old.venue_order_id.clone() {
                match self.venue.cancel_order(&self.product_id, &venue_id).await {
                    Ok(()) | Err(VenueError::UnknownOrder(_)) => {}
                    Err(err) => {
                        // The old (tighter-or-equal) stop keeps standing; if
                        // it just filled instead, the poll delivers that
                        warn!(position_id = %id, error = %err, "stop cancel deferred");
                        return Ok(touched);
                    }
                }
            }
            if !old.is_terminal() {
                old.cancel()?;
            }
            position.clear_stop_order();
            self.needs_stop.insert(id.clone());
            touched.push(old);
        }

        let stop = Order::new_stop(
            Uuid::new_v4().to_string(),
            &id,
            self.product_id.clone(),
            trigger,
            limit,
            position.qty_filled,
        );
        let placed = self.drive_stop_submission(position, stop).await?;
        touched.push(placed);
        Ok(touched)
    }

    /// Venue leg of a stop placement. On success the position's stop fields
    /// ratchet forward atomically; on failure the position is flagged
    /// needs-stop and the retry runs next tick (placement failures past the
    /// threshold tighten the limit buffer, never the trigger).
    async fn drive_stop_submission(
        &mut self,
        position: &mut PositionState,
        mut stop: Order,
    ) -> EngineResult<Order> {
        let id = position.position_id.clone();
        let trigger = stop.stop_trigger.unwrap_or(Money::ZERO);
        let request = StopLimitSell {
            product_id: self.product_id.clone(),
            client_order_id: stop.order_id.clone(),
            stop_trigger: trigger,
            limit_price: stop.price,
            qty: stop.qty,
        };

        match self.venue.place_stop_limit(&request).await {
            Ok(ack) => {
                stop.acknowledge(ack.venue_order_id)?;
                position.apply_new_stop(trigger, stop.price, &stop.order_id)?;
                self.needs_stop.remove(&id);
                self.stop_failures.remove(&id);
                debug!(
                    position_id = %id,
                    trigger = %trigger,
                    limit = %stop.price,
                    qty = %stop.qty,
                    "stop armed"
                );
                Ok(stop)
            }
            Err(err) => {
                let failures = self.stop_failures.entry(id.clone()).or_insert(0);
                *failures += 1;
                if *failures >= self.params.stop_fail_threshold {
                    *self.aggression.entry(id.clone()).or_insert(0) += 1;
                }
                self.needs_stop.insert(id.clone());
                warn!(
                    position_id = %id,
                    failures = *failures,
                    error = %err,
                    "stop placement failed, position unprotected until retry"
                );
                match err {
                    // Ambiguous: the venue may have accepted it. Keep the
                    // row pending so the retry resumes the same client id.
                    VenueError::Timeout => {}
                    _ => {
                        stop.cancel()?;
                    }
                }
                Ok(stop)
            }
        }
    }

    // ==================== candle closes ====================

    /// Entry-expiry sweep, run once per candle close: entries that have
    /// waited unfilled longer than `max_entry_wait_candles` are cancelled
    /// at the venue and their positions closed out.
    pub async fn on_candle_close(&mut self) -> EngineResult<()> {
        let pending: Vec<String> = self
            .positions
            .values()
            .filter(|p| p.status == PositionStatus::PendingEntry && !p.inconsistent)
            .map(|p| p.position_id.clone())
            .collect();

        for id in pending {
            let waited = {
                let counter = self.entry_wait.entry(id.clone()).or_insert(0);
                *counter += 1;
                *counter
            };
            if waited <= self.params.max_entry_wait_candles {
                continue;
            }

            let Some(mut order) = self.entry_order_for(&id) else {
                continue;
            };
            if let Some(venue_id) = order.venue_order_id.clone() {
                match self.venue.cancel_order(&self.product_id, &venue_id).await {
                    Ok(()) | Err(VenueError::UnknownOrder(_)) => {}
                    Err(err) if err.is_retriable() => {
                        warn!(position_id = %id, error = %err, "entry expiry cancel deferred");
                        continue;
                    }
                    Err(err) => return Err(EngineError::VenueFatal(err)),
                }
            }

            let mut position = self.lookup_position(&id)?;
            order.cancel()?;
            position.abort_entry()?;
            self.store.transaction(|tx| {
                tx.save_order(&order)?;
                tx.save_position(&position)
            })?;
            info!(position_id = %id, waited, "unfilled entry expired");
            self.cache_order(order);
            self.cache_position(position);
        }
        Ok(())
    }

    // ==================== execution polling ====================

    /// Poll venue-side status for every non-terminal order and synthesize
    /// the fill/cancel events the venue's stream would have delivered.
    pub async fn poll_executions(&mut self) -> EngineResult<()> {
        let ids: Vec<String> = self.orders.keys().cloned().collect();
        for order_id in ids {
            let Some(order) = self.orders.get(&order_id).cloned() else {
                continue;
            };
            let status = match self
                .venue
                .get_order_status(&self.product_id, &order_id)
                .await
            {
                Ok(status) => status,
                Err(err) => {
                    debug!(order_id = %order_id, error = %err, "status poll deferred");
                    continue;
                }
            };

            // Adopt the venue id for rows acked while we weren't looking
            if order.state == OrderState::PendingSubmit {
                if let (Some(venue_id), true) = (
                    status.venue_order_id.clone(),
                    status.state != VenueOrderState::Unknown,
                ) {
                    let mut acked = order.clone();
                    acked.acknowledge(venue_id)?;
                    self.store.save_order(&acked)?;
                    self.cache_order(acked);
                }
            }

            let outcome = match status.state {
                VenueOrderState::Open | VenueOrderState::Filled => {
                    let delta = status.filled_qty - order.filled_qty;
                    if delta.is_positive() {
                        let price = status.avg_fill_price.unwrap_or(order.price);
                        self.handle_fill(&order_id, delta, price).await
                    } else {
                        Ok(())
                    }
                }
                VenueOrderState::Cancelled => self.apply_external_cancel(&order_id).await,
                VenueOrderState::Unknown => {
                    // Not yet visible, or lost; startup reconciliation owns
                    // the authoritative resolution
                    Ok(())
                }
            };
            match outcome {
                Ok(()) => {}
                Err(err @ EngineError::Persistence(_)) => return Err(err),
                Err(err) => {
                    error!(order_id = %order_id, error = %err, "failed to apply polled execution");
                }
            }
        }
        Ok(())
    }

    /// An order we believed live was cancelled venue-side (operator action,
    /// venue self-trade prevention, ...). Terminalize it locally; a stop
    /// that vanished re-arms on the next tick.
    pub(crate) async fn apply_external_cancel(&mut self, order_id: &str) -> EngineResult<()> {
        let mut order = self.lookup_order(order_id)?;
        if order.is_terminal() {
            return Ok(());
        }
        order.cancel()?;
        let mut position = self.lookup_position(&order.position_id)?;

        match order.kind {
            OrderKind::Stop => {
                if position.stop_order_id.as_deref() == Some(order_id) {
                    position.clear_stop_order();
                    self.needs_stop.insert(position.position_id.clone());
                    warn!(
                        position_id = %position.position_id,
                        "live stop cancelled externally, re-arming next tick"
                    );
                }
            }
            OrderKind::Entry => {
                if position.status == PositionStatus::PendingEntry {
                    position.abort_entry()?;
                }
            }
            OrderKind::ForceExit => {}
        }

        self.store.transaction(|tx| {
            tx.save_order(&order)?;
            tx.save_position(&position)
        })?;
        self.cache_order(order);
        self.cache_position(position);
        Ok(())
    }

    // ==================== admin ====================

    /// Bookkeeping close at an operator-supplied price: cancels the live
    /// stop, records a synthetic force-exit order, and closes the position.
    /// Any real exit order at the venue remains the operator's job.
    pub async fn force_exit(&mut self, position_id: &str, price: Money) -> EngineResult<()> {
        let mut position = self.lookup_position(position_id)?;
        if position.is_terminal() {
            return Err(EngineError::InvalidTransition {
                entity: "position",
                from: position.status.to_string(),
                to: "force_exited".to_string(),
            });
        }

        // An unfilled entry has nothing to exit; cancel and abort instead
        if position.status == PositionStatus::PendingEntry {
            if let Some(mut order) = self.entry_order_for(position_id) {
                if let Some(venue_id) = order.venue_order_id.clone() {
                    match self.venue.cancel_order(&self.product_id, &venue_id).await {
                        Ok(()) | Err(VenueError::UnknownOrder(_)) => {}
                        Err(err) => return Err(EngineError::from_venue(err)),
                    }
                }
                order.cancel()?;
                position.abort_entry()?;
                self.store.transaction(|tx| {
                    tx.save_order(&order)?;
                    tx.save_position(&position)
                })?;
                self.cache_order(order);
                self.cache_position(position);
            }
            return Ok(());
        }

        let mut touched = Vec::new();
        if let Some(stop_order_id) = position.stop_order_id.clone() {
            let mut stop = self.lookup_order(&stop_order_id)?;
            if let Some(venue_id) = stop.venue_order_id.clone() {
                match self.venue.cancel_order(&self.product_id, &venue_id).await {
                    Ok(()) | Err(VenueError::UnknownOrder(_)) => {}
                    Err(err) => return Err(EngineError::from_venue(err)),
                }
            }
            if !stop.is_terminal() {
                stop.cancel()?;
            }
            position.clear_stop_order();
            touched.push(stop);
        }

        let qty = position.qty_filled;
        let mut exit = Order::new_force_exit(
            Uuid::new_v4().to_string(),
            position_id,
            self.product_id.clone(),
            price,
            qty,
        );
        exit.acknowledge(format!("synthetic-{}", exit.order_id))?;
        exit.apply_fill(qty, price)?;
        position.close(price, qty, CloseReason::ForceExit)?;

        let trade = TradeRecord {
            position_id: position.position_id.clone(),
            product_id: position.product_id.clone(),
            side: Side::Sell,
            qty,
            entry_price: position.entry_price.unwrap_or(Money::ZERO),
            exit_price: price,
            realized_pnl: position.realized_pnl,
            forced: true,
            closed_at: Utc::now(),
        };

        self.store.transaction(|tx| {
            for order in &touched {
                tx.save_order(order)?;
            }
            tx.save_order(&exit)?;
            tx.save_position(&position)?;
            tx.record_trade(&trade)
        })?;

        info!(
            position_id = %position_id,
            price = %price,
            qty = %qty,
            "position force-exited"
        );

        {
            let mut portfolio = self.portfolio.lock().unwrap();
            portfolio.record_close(position_id, qty, price);
        }
        for order in touched {
            self.cache_order(order);
        }
        self.cache_order(exit);
        self.cache_position(position);
        Ok(())
    }

    /// Admin order cancel. By default the venue cancel runs first; with
    /// `skip_venue` only the local row is terminalized (for rows the venue
    /// no longer knows).
    pub async fn admin_cancel_order(
        &mut self,
        order_id: &str,
        skip_venue: bool,
    ) -> EngineResult<()> {
        let order = self.lookup_order(order_id)?;
        if !skip_venue {
            let venue_id = order.venue_order_id.clone().ok_or_else(|| {
                EngineError::VenueFatal(VenueError::UnknownOrder(format!(
                    "{order_id} was never acknowledged; use --skip-venue for a local-only cancel"
                )))
            })?;
            match self.venue.cancel_order(&self.product_id, &venue_id).await {
                Ok(()) | Err(VenueError::UnknownOrder(_)) => {}
                Err(err) => return Err(EngineError::from_venue(err)),
            }
        }
        self.apply_external_cancel(order_id).await
    }
}
