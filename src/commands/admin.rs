//! Admin commands: force-exit, order cancel, emergency liquidation
//!
//! These run against the real venue and mutate the store directly; they are
//! meant for a stopped trading process. Running them concurrently with a
//! live `run` loop would violate the single-writer rule.

use anyhow::{Context, Result};
use std::collections::HashMap;
use tracing::info;

use trailguard::config::Config;
use trailguard::{Money, Symbol};

fn runtime() -> Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")
}

fn load_config(config_path: &str) -> Result<Config> {
    Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))
}

/// Bookkeeping close of one position at an operator-supplied price. The
/// live stop is cancelled at the venue; any real exit order remains the
/// operator's responsibility.
pub fn force_exit(config_path: &str, position_id: &str, price: &str) -> Result<()> {
    let config = load_config(config_path)?;
    let price: Money = price
        .parse()
        .map_err(|_| anyhow::anyhow!("--price must be a decimal string, got {:?}", price))?;

    let venue = super::build_venue(&config, false)?;
    let (orchestrator, store, _portfolio) = super::build_orchestrator(&config, venue)?;

    let position = store
        .load_position(position_id)?
        .with_context(|| format!("no position {} in the store", position_id))?;
    let product = position.product_id.clone();

    anyhow::ensure!(
        orchestrator.products().contains(&product),
        "position's product {} is not configured",
        product
    );

    runtime()?.block_on(async {
        // Reconcile first so the close runs against venue truth
        orchestrator.run_reconciliation().await?;
        orchestrator
            .force_exit(&product, position_id, price)
            .await
            .context("force-exit failed")
    })?;

    info!(position_id, %price, "force-exit recorded");
    Ok(())
}

/// Cancel one order. Venue-first by default; `--skip-venue` terminalizes
/// only the local row (for orders the venue no longer knows about).
pub fn cancel_order(config_path: &str, order_id: &str, skip_venue: bool) -> Result<()> {
    let config = load_config(config_path)?;

    let venue = super::build_venue(&config, false)?;
    let (orchestrator, store, _portfolio) = super::build_orchestrator(&config, venue)?;

    let order = store
        .load_order(order_id)?
        .with_context(|| format!("no order {} in the store", order_id))?;
    let product = order.product_id.clone();

    runtime()?.block_on(async {
        orchestrator.run_reconciliation().await?;
        orchestrator
            .admin_cancel_order(&product, order_id, skip_venue)
            .await
            .context("cancel failed")
    })?;

    info!(order_id, skip_venue, "order cancelled");
    Ok(())
}

/// Emergency liquidation: force-exit every open position across all pairs
/// at current venue prices. Idempotent; re-run after partial failures.
pub fn liquidate(config_path: &str, yes: bool) -> Result<()> {
    anyhow::ensure!(yes, "refusing to liquidate without --yes");
    let config = load_config(config_path)?;

    let venue = super::build_venue(&config, false)?;
    let (orchestrator, _store, _portfolio) = super::build_orchestrator(&config, venue.clone())?;

    let exited = runtime()?.block_on(async {
        orchestrator.run_reconciliation().await?;

        let mut prices: HashMap<Symbol, Money> = HashMap::new();
        for product in orchestrator.products() {
            let price = venue
                .get_last_trade_price(&product)
                .await
                .with_context(|| format!("no reference price for {}", product))?;
            prices.insert(product, price);
        }
        orchestrator
            .emergency_liquidate_portfolio(&prices)
            .await
            .context("liquidation failed")
    })?;

    info!(exited, "emergency liquidation complete");
    Ok(())
}
