//! Startup reconciliation
//!
//! Runs once per engine at process start, strictly before any intents or
//! trade ticks are accepted. Reads the persisted open orders, asks the
//! venue what actually happened to each, replays the missed events, re-arms
//! naked positions, and cancels venue orders this process has no record of.

use tracing::{error, info, warn};

use crate::engine::Engine;
use crate::error::{EngineError, EngineResult, VenueError};
use crate::exchange::VenueOrderState;
use crate::order::OrderState;
use crate::position::PositionStatus;

/// What a reconciliation pass found and did.
#[derive(Debug, Default, Clone)]
pub struct ReconcileReport {
    pub orders_checked: usize,
    pub fills_applied: usize,
    pub cancelled_locally: usize,
    pub stops_rearmed: usize,
    pub orphans_cancelled: usize,
    pub quarantined: usize,
}

impl Engine {
    /// Re-align local state with the venue. Conflicts outside the known
    /// mappings quarantine their position rather than aborting the whole
    /// startup; everything else either replays or terminalizes.
    pub async fn reconcile(&mut self) -> EngineResult<ReconcileReport> {
        let mut report = ReconcileReport::default();
        self.load_state()?;

        // Resolve each persisted open order against venue truth
        let order_ids: Vec<String> = self.orders.keys().cloned().collect();
        for order_id in &order_ids {
            let Some(order) = self.orders.get(order_id).cloned() else {
                continue;
            };
            report.orders_checked += 1;

            let status = self
                .venue
                .get_order_status(&self.product_id, order_id)
                .await
                .map_err(EngineError::from_venue)?;

            if status.filled_qty > order.qty {
                // Venue claims more than we ever asked for; nothing in the
                // lifecycle maps this. Park the position for a human.
                let conflict = EngineError::ReconciliationConflict {
                    position_id: order.position_id.clone(),
                    detail: format!(
                        "venue reports filled_qty {} exceeding order qty {} on {}",
                        status.filled_qty, order.qty, order_id
                    ),
                };
                error!(error = %conflict, "quarantining position");
                let mut position = self.lookup_position(&order.position_id)?;
                position.quarantine();
                self.store.save_position(&position)?;
                self.cache_position(position);
                report.quarantined += 1;
                continue;
            }

            match status.state {
                VenueOrderState::Open | VenueOrderState::Filled => {
                    if order.state == OrderState::PendingSubmit {
                        if let Some(venue_id) = status.venue_order_id.clone() {
                            let mut acked = order.clone();
                            acked.acknowledge(venue_id)?;
                            self.store.save_order(&acked)?;
                            self.cache_order(acked);
                        }
                    }
                    let delta = status.filled_qty - order.filled_qty;
                    if delta.is_positive() {
                        let price = status.avg_fill_price.unwrap_or(order.price);
                        self.handle_fill(order_id, delta, price).await?;
                        report.fills_applied += 1;
                    }
                }
                VenueOrderState::Cancelled | VenueOrderState::Unknown => {
                    self.apply_external_cancel(order_id).await?;
                    report.cancelled_locally += 1;
                }
            }
        }

        // Re-arm every open position without a live stop, ratcheting from
        // the last known trigger. Current market is folded in first so the
        // high is no staler than the venue's own view.
        let naked: Vec<String> = self
            .positions
            .values()
            .filter(|p| {
                p.status == PositionStatus::Open && p.stop_order_id.is_none() && !p.inconsistent
            })
            .map(|p| p.position_id.clone())
            .collect();

        if !naked.is_empty() {
            if let Ok(last) = self.venue.get_last_trade_price(&self.product_id).await {
                for id in &naked {
                    if let Some(position) = self.positions.get_mut(id) {
                        position.observe_price(last);
                    }
                }
            }
        }

        for id in naked {
            let mut position = self.lookup_position(&id)?;
            match self.replace_stop(&mut position).await {
                Ok(touched) => {
                    self.store.transaction(|tx| {
                        for order in &touched {
                            tx.save_order(order)?;
                        }
                        tx.save_position(&position)
                    })?;
                    for order in touched {
                        self.cache_order(order);
                    }
                    let armed = position.stop_order_id.is_some();
                    self.cache_position(position);
                    if armed {
                        report.stops_rearmed += 1;
                    }
                }
                Err(err) => {
                    // Position stays flagged needs-stop; the tick loop
                    // keeps retrying once processing starts
                    warn!(position_id = %id, error = %err, "stop re-arm deferred");
                }
            }
        }

        // Orphan cleanup: venue-resting orders with no local record were
        // placed by a lost write or another process; they cannot be managed,
        // so they go.
        let venue_open = self
            .venue
            .list_open_orders(&self.product_id)
            .await
            .map_err(EngineError::from_venue)?;
        for venue_order in venue_open {
            let known = match &venue_order.client_order_id {
                Some(client_id) => self.store.load_order(client_id)?.is_some(),
                None => false,
            };
            if known {
                continue;
            }
            warn!(
                venue_order_id = %venue_order.venue_order_id,
                "cancelling orphaned venue order"
            );
            match self
                .venue
                .cancel_order(&self.product_id, &venue_order.venue_order_id)
                .await
            {
                Ok(()) | Err(VenueError::UnknownOrder(_)) => report.orphans_cancelled += 1,
                Err(err) if err.is_retriable() => {
                    warn!(
                        venue_order_id = %venue_order.venue_order_id,
                        error = %err,
                        "orphan cancel deferred to next restart"
                    );
                }
                Err(err) => return Err(EngineError::VenueFatal(err)),
            }
        }

        info!(
            product = %self.product_id,
            orders_checked = report.orders_checked,
            fills_applied = report.fills_applied,
            cancelled_locally = report.cancelled_locally,
            stops_rearmed = report.stops_rearmed,
            orphans_cancelled = report.orphans_cancelled,
            quarantined = report.quarantined,
            "reconciliation complete"
        );
        Ok(report)
    }
}
