//! Run command: the live/paper trading loop
//!
//! Startup order is fixed: open the store, reconcile every engine against
//! the venue, and only then start the candle and poll timers. Shutdown on
//! ctrl-c stops the timers first; no order is placed after the signal.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

use trailguard::config::Config;
use trailguard::orchestrator::Orchestrator;
use trailguard::signal::{NoSignal, SignalSource};
use trailguard::{Money, Symbol};

pub fn run(config_path: &str, paper: bool, live: bool) -> Result<()> {
    if !paper && !live {
        anyhow::bail!("Must specify either --paper or --live mode");
    }
    if paper && live {
        anyhow::bail!("Cannot specify both --paper and --live modes");
    }

    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    runtime.block_on(run_async(config, paper))
}

async fn run_async(config: Config, paper_mode: bool) -> Result<()> {
    let mode = if paper_mode { "PAPER" } else { "LIVE" };
    info!(
        mode,
        pairs = config.pairs.len(),
        capital = %config.portfolio.total_capital,
        trail_pct = %config.strategy.trail_pct,
        "starting trailguard"
    );

    if !paper_mode {
        warn!("LIVE TRADING MODE - REAL MONEY AT RISK. Press Ctrl+C within 5 seconds to abort...");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    let venue = super::build_venue(&config, paper_mode)?;
    let (orchestrator, _store, _portfolio) = super::build_orchestrator(&config, venue.clone())?;

    // Heal local/remote disagreements before accepting any work
    let reports = orchestrator
        .run_reconciliation()
        .await
        .context("startup reconciliation failed")?;
    for (product, report) in &reports {
        if report.quarantined > 0 {
            warn!(
                product = %product,
                quarantined = report.quarantined,
                "positions quarantined; inspect before trading resumes on them"
            );
        }
    }

    // The external 5-minute signal generator plugs in here; without one the
    // engine still manages entries already resting and every live stop.
    let signals: Arc<dyn SignalSource> = Arc::new(NoSignal);

    let mut candle_timer = interval(Duration::from_secs(config.candle_interval_secs));
    let mut poll_timer = interval(Duration::from_secs(config.poll_interval_secs));
    // The first tick of an interval fires immediately; burn it so the first
    // candle close is a real one
    candle_timer.tick().await;
    poll_timer.tick().await;

    info!("trading loop started");
    loop {
        tokio::select! {
            _ = candle_timer.tick() => {
                if let Err(err) = on_candle_close(&orchestrator, &signals).await {
                    error!(error = %err, "candle close cycle failed");
                }
            }
            _ = poll_timer.tick() => {
                if let Err(err) = on_poll(&orchestrator, &venue).await {
                    error!(error = %err, "poll cycle failed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    // Timers are stopped; nothing below places orders. The store commits
    // per event, so there is nothing left to flush beyond a final snapshot.
    let status = orchestrator.portfolio_status().await;
    info!(
        realized_pnl = %status.metrics.realized_pnl,
        unrealized_pnl = %status.metrics.unrealized_pnl,
        open_positions = status.metrics.open_positions,
        "shutdown complete"
    );
    Ok(())
}

async fn on_candle_close(
    orchestrator: &Orchestrator,
    signals: &Arc<dyn SignalSource>,
) -> Result<()> {
    orchestrator.handle_candle_close().await?;

    let checked = orchestrator.check_all_entries(Arc::clone(signals)).await;
    let entries: Vec<_> = checked.into_values().flatten().collect();
    if entries.is_empty() {
        return Ok(());
    }

    let results = orchestrator.submit_coordinated_entries(entries, None).await;
    for (product, result) in results {
        match result {
            Ok(receipt) => info!(
                product = %product,
                position_id = %receipt.position_id,
                "entry admitted and submitted"
            ),
            Err(trailguard::EngineError::AdmissionRejected { reason }) => {
                info!(product = %product, %reason, "entry rejected by portfolio")
            }
            Err(err) => warn!(product = %product, error = %err, "entry submission failed"),
        }
    }
    Ok(())
}

async fn on_poll(
    orchestrator: &Orchestrator,
    venue: &Arc<dyn trailguard::exchange::ExchangeAdapter>,
) -> Result<()> {
    let mut prices: HashMap<Symbol, Money> = HashMap::new();
    for product in orchestrator.products() {
        match venue.get_last_trade_price(&product).await {
            Ok(price) => {
                prices.insert(product.clone(), price);
                if let Err(err) = orchestrator.handle_price_update(&product, price).await {
                    warn!(product = %product, error = %err, "price update failed");
                }
            }
            Err(err) => warn!(product = %product, error = %err, "price fetch failed"),
        }
    }

    orchestrator.poll_executions().await?;

    if orchestrator.should_emergency_liquidate() {
        error!("portfolio loss floor breached, emergency liquidating");
        orchestrator.emergency_liquidate_portfolio(&prices).await?;
    }
    Ok(())
}
