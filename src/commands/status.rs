//! Status command: read-only view over the state store

use anyhow::{Context, Result};

use trailguard::config::Config;
use trailguard::store::Store;
use trailguard::Money;

pub fn run(config_path: &str) -> Result<()> {
    let config = Config::from_file(config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let store = Store::open(config.state_db_path())?;

    println!("schema version: v{}", store.schema_version()?);
    println!();

    let positions = store.list_positions()?;
    let open: Vec<_> = positions.iter().filter(|p| !p.is_terminal()).collect();
    println!("positions ({} open / {} total)", open.len(), positions.len());
    for p in &open {
        println!(
            "  {}  {}  {}  qty={}  entry={}  high={}  stop={}{}",
            p.position_id,
            p.product_id,
            p.status,
            p.qty_filled,
            p.entry_price.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
            p.highest_price_since_entry
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".into()),
            p.current_stop_trigger
                .map(|m| m.to_string())
                .unwrap_or_else(|| "-".into()),
            if p.inconsistent { "  [QUARANTINED]" } else { "" },
        );
    }
    println!();

    let orders = store.list_open_orders()?;
    println!("open orders ({})", orders.len());
    for o in &orders {
        println!(
            "  {}  {}  {:?}  {}  {} @ {}  filled={}",
            o.order_id, o.product_id, o.kind, o.state, o.qty, o.price, o.filled_qty,
        );
    }
    println!();

    let trades = store.list_trades()?;
    let realized: Money = trades.iter().map(|t| t.realized_pnl).sum();
    let wins = trades.iter().filter(|t| t.realized_pnl.is_positive()).count();
    println!("closed trades: {}", trades.len());
    if !trades.is_empty() {
        println!("  realized pnl: {}", realized);
        println!("  win rate: {:.1}%", 100.0 * wins as f64 / trades.len() as f64);
    }
    Ok(())
}
