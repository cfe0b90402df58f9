//! Multi-pair orchestration
//!
//! Owns one engine per registered pair, fans signals and price updates
//! across them, and gates coordinated entry submission behind the portfolio
//! manager and a concurrency bound. Cross-pair state never touches engine
//! internals; everything shared routes through the portfolio's single
//! critical section.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::engine::{Engine, SubmitReceipt};
use crate::error::{EngineError, EngineResult, VenueError};
use crate::exchange::RetryPolicy;
use crate::portfolio::{PortfolioManager, PortfolioMetrics, RebalanceHint};
use crate::position::PositionStatus;
use crate::reconcile::ReconcileReport;
use crate::signal::{EntryIntent, SignalSource};
use crate::{Money, Symbol};

/// Default bound on concurrent entry submissions.
const DEFAULT_MAX_CONCURRENT: usize = 3;

/// Per-pair snapshot for the status surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PairStatus {
    pub product_id: Symbol,
    pub open_positions: usize,
    pub pending_entries: usize,
    pub quarantined: usize,
}

/// Aggregated portfolio view with risk flags and rebalance hints.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PortfolioStatus {
    pub metrics: PortfolioMetrics,
    pub rebalance_hints: Vec<RebalanceHint>,
    pub emergency_liquidation_advised: bool,
    pub pairs: Vec<PairStatus>,
}

pub struct Orchestrator {
    engines: HashMap<Symbol, Arc<tokio::sync::Mutex<Engine>>>,
    portfolio: Arc<Mutex<PortfolioManager>>,
    submit_retry: RetryPolicy,
}

impl Orchestrator {
    pub fn new(portfolio: Arc<Mutex<PortfolioManager>>) -> Self {
        Self {
            engines: HashMap::new(),
            portfolio,
            submit_retry: RetryPolicy::default(),
        }
    }

    pub fn with_submit_retry(mut self, retry: RetryPolicy) -> Self {
        self.submit_retry = retry;
        self
    }

    pub fn register(&mut self, engine: Engine) {
        let product = engine.product_id().clone();
        self.engines
            .insert(product, Arc::new(tokio::sync::Mutex::new(engine)));
    }

    pub fn products(&self) -> Vec<Symbol> {
        self.engines.keys().cloned().collect()
    }

    fn engine(&self, product_id: &Symbol) -> EngineResult<Arc<tokio::sync::Mutex<Engine>>> {
        self.engines
            .get(product_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::VenueFatal(VenueError::UnknownProduct(product_id.to_string()))
            })
    }

    /// Run startup reconciliation across every pair. Must complete before
    /// the first intent or price update is dispatched; the run loop calls
    /// this exactly once, ahead of everything else.
    pub async fn run_reconciliation(&self) -> EngineResult<Vec<(Symbol, ReconcileReport)>> {
        let mut reports = Vec::new();
        for (product, engine) in &self.engines {
            let mut engine = engine.lock().await;
            let report = engine.reconcile().await?;
            reports.push((product.clone(), report));
        }
        info!(pairs = reports.len(), "all engines reconciled");
        Ok(reports)
    }

    /// Fan `signal_source` across all pairs concurrently, keyed by product.
    pub async fn check_all_entries(
        &self,
        signal_source: Arc<dyn SignalSource>,
    ) -> HashMap<Symbol, Option<EntryIntent>> {
        let as_of = Utc::now();
        let mut tasks = JoinSet::new();
        for product in self.engines.keys().cloned() {
            let source = Arc::clone(&signal_source);
            tasks.spawn(async move {
                let signal = match source.signal(&product, as_of).await {
                    Ok(signal) => signal,
                    Err(err) => {
                        warn!(product = %product, error = %err, "signal source failed");
                        None
                    }
                };
                (product, signal)
            });
        }

        let mut signals = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((product, signal)) => {
                    signals.insert(product, signal);
                }
                Err(err) => error!(error = %err, "signal task panicked"),
            }
        }
        signals
    }

    /// Submit a batch of entries with bounded parallelism. Each entry's
    /// admission outcome is reported per pair; one rejection never aborts
    /// the rest. Rate-limit denials are retried with exponential backoff
    /// up to the configured ceiling.
    pub async fn submit_coordinated_entries(
        &self,
        entries: Vec<EntryIntent>,
        max_concurrent: Option<usize>,
    ) -> Vec<(Symbol, EngineResult<SubmitReceipt>)> {
        let bound = max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT).max(1);
        let semaphore = Arc::new(Semaphore::new(bound));
        let retry = self.submit_retry;

        let mut tasks = JoinSet::new();
        for intent in entries {
            let product = intent.product_id.clone();
            let engine = match self.engine(&product) {
                Ok(engine) => engine,
                Err(err) => {
                    tasks.spawn(async move { (product, Err(err)) });
                    continue;
                }
            };
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire().await.expect("semaphore not closed");
                let mut attempt = 0u32;
                let result = loop {
                    let outcome = {
                        let mut engine = engine.lock().await;
                        engine.submit_entry(&intent).await
                    };
                    match outcome {
                        Err(EngineError::VenueRetriable(VenueError::RateLimited))
                            if attempt < retry.max_retries =>
                        {
                            attempt += 1;
                            let delay = retry.delay_for(attempt);
                            warn!(
                                product = %intent.product_id,
                                attempt,
                                delay_ms = delay.as_millis() as u64,
                                "submission rate-limited, backing off"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        other => break other,
                    }
                };
                (intent.product_id.clone(), result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(entry) => results.push(entry),
                Err(err) => error!(error = %err, "submission task panicked"),
            }
        }
        results
    }

    /// Route a last-trade print to the owning engine.
    pub async fn handle_price_update(
        &self,
        product_id: &Symbol,
        last_price: Money,
    ) -> EngineResult<()> {
        let engine = self.engine(product_id)?;
        let mut engine = engine.lock().await;
        engine.on_trade(last_price).await
    }

    /// Candle-close housekeeping across all pairs (entry expiry sweeps).
    pub async fn handle_candle_close(&self) -> EngineResult<()> {
        for engine in self.engines.values() {
            let mut engine = engine.lock().await;
            engine.on_candle_close().await?;
        }
        Ok(())
    }

    /// Poll executions across all pairs.
    pub async fn poll_executions(&self) -> EngineResult<()> {
        for engine in self.engines.values() {
            let mut engine = engine.lock().await;
            engine.poll_executions().await?;
        }
        Ok(())
    }

    /// Close everything: cancel live stops and book force-exits at the
    /// supplied reference prices. Safe to re-run after partial success;
    /// already-terminal positions are skipped, remaining ones get exited.
    pub async fn emergency_liquidate_portfolio(
        &self,
        prices_by_product: &HashMap<Symbol, Money>,
    ) -> EngineResult<usize> {
        let mut exited = 0usize;
        for (product, engine) in &self.engines {
            let Some(&price) = prices_by_product.get(product) else {
                warn!(product = %product, "no reference price supplied, skipping");
                continue;
            };
            let mut engine = engine.lock().await;
            let ids: Vec<String> = engine
                .open_positions()
                .map(|p| p.position_id.clone())
                .collect();
            for position_id in ids {
                match engine.force_exit(&position_id, price).await {
                    Ok(()) => exited += 1,
                    Err(err) => {
                        // Keep going; a re-run finishes whatever is left
                        error!(
                            product = %product,
                            position_id = %position_id,
                            error = %err,
                            "emergency exit failed"
                        );
                    }
                }
            }
        }
        info!(exited, "emergency liquidation pass complete");
        Ok(exited)
    }

    /// Aggregate portfolio metrics, risk flags, and per-pair summaries.
    pub async fn portfolio_status(&self) -> PortfolioStatus {
        let (metrics, rebalance_hints, emergency) = {
            let portfolio = self.portfolio.lock().unwrap();
            (
                portfolio.metrics(),
                portfolio.rebalance_actions(),
                portfolio.should_emergency_liquidate(),
            )
        };

        let mut pairs = Vec::new();
        for (product, engine) in &self.engines {
            let engine = engine.lock().await;
            let mut status = PairStatus {
                product_id: product.clone(),
                open_positions: 0,
                pending_entries: 0,
                quarantined: 0,
            };
            for position in engine.positions.values() {
                match position.status {
                    PositionStatus::Open => status.open_positions += 1,
                    PositionStatus::PendingEntry => status.pending_entries += 1,
                    _ => {}
                }
                if position.inconsistent {
                    status.quarantined += 1;
                }
            }
            pairs.push(status);
        }
        pairs.sort_by(|a, b| a.product_id.as_str().cmp(b.product_id.as_str()));

        PortfolioStatus {
            metrics,
            rebalance_hints,
            emergency_liquidation_advised: emergency,
            pairs,
        }
    }

    /// Whether the portfolio has breached its emergency loss floor.
    pub fn should_emergency_liquidate(&self) -> bool {
        self.portfolio.lock().unwrap().should_emergency_liquidate()
    }

    /// Route an admin force-exit to the owning engine.
    pub async fn force_exit(
        &self,
        product_id: &Symbol,
        position_id: &str,
        price: Money,
    ) -> EngineResult<()> {
        let engine = self.engine(product_id)?;
        let mut engine = engine.lock().await;
        engine.force_exit(position_id, price).await
    }

    /// Route an admin order cancel to the owning engine.
    pub async fn admin_cancel_order(
        &self,
        product_id: &Symbol,
        order_id: &str,
        skip_venue: bool,
    ) -> EngineResult<()> {
        let engine = self.engine(product_id)?;
        let mut engine = engine.lock().await;
        engine.admin_cancel_order(order_id, skip_venue).await
    }
}
