//! SQLite-backed state store
//!
//! Single store file per process, single writer. Positions and orders are
//! persisted as serde_json blobs keyed by id, with indexed columns for the
//! lookups the engine needs (orders by position, orders by state). Money
//! fields serialize as decimal strings and round-trip exactly.
//!
//! Schema changes ride a linear migration ladder keyed off
//! `PRAGMA user_version`; migrations run at open and only ever move forward.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::order::Order;
use crate::position::PositionState;
use crate::{Money, Side, Symbol};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store schema version {found} is newer than this binary supports ({supported})")]
    VersionTooNew { found: i64, supported: i64 },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Closed-trade audit row, written when a position goes flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub position_id: String,
    pub product_id: Symbol,
    pub side: Side,
    pub qty: Money,
    pub entry_price: Money,
    pub exit_price: Money,
    pub realized_pnl: Money,
    pub forced: bool,
    pub closed_at: chrono::DateTime<Utc>,
}

// Migration ladder. Entry N upgrades user_version N to N+1; never edit a
// shipped entry, append a new one.
const MIGRATIONS: &[&str] = &[
    // v1: positions and orders
    "CREATE TABLE positions (
        position_id TEXT PRIMARY KEY,
        value       BLOB NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE TABLE orders (
        order_id    TEXT PRIMARY KEY,
        position_id TEXT NOT NULL,
        value       BLOB NOT NULL,
        state       TEXT NOT NULL,
        created_at  TEXT NOT NULL,
        updated_at  TEXT NOT NULL
    );
    CREATE INDEX idx_orders_position ON orders(position_id);
    CREATE INDEX idx_orders_state ON orders(state);",
    // v2: closed-trade audit trail
    "CREATE TABLE trades (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        position_id TEXT NOT NULL,
        value       BLOB NOT NULL,
        created_at  TEXT NOT NULL
    );
    CREATE INDEX idx_trades_position ON trades(position_id);",
];

/// Handle to the process-wide store. Cheap to clone; all clones share one
/// connection behind a mutex, which is also what serializes writers.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the store file and run pending migrations.
    pub fn open<P: AsRef<Path>>(db_path: P) -> Result<Self, StoreError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        info!(path = %db_path.display(), "state store opened");
        Ok(store)
    }

    /// In-memory store for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        let supported = MIGRATIONS.len() as i64;

        if version > supported {
            return Err(StoreError::VersionTooNew {
                found: version,
                supported,
            });
        }

        for (idx, sql) in MIGRATIONS.iter().enumerate().skip(version as usize) {
            let target = (idx + 1) as i64;
            debug!(target, "applying store migration");
            conn.execute_batch(sql)?;
            conn.pragma_update(None, "user_version", target)?;
        }
        Ok(())
    }

    /// Current schema version (for the status command).
    pub fn schema_version(&self) -> Result<i64, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("PRAGMA user_version", [], |row| row.get(0))?)
    }

    /// Run `f` inside a single SQLite transaction. Everything written
    /// through the view commits together or not at all; readers outside see
    /// either the pre-state or the post-state.
    pub fn transaction<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&StoreView<'_>) -> Result<T, StoreError>,
    {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let out = f(&StoreView { conn: &tx })?;
        tx.commit()?;
        Ok(out)
    }

    // Single-row conveniences; each is its own transaction.

    pub fn save_position(&self, pos: &PositionState) -> Result<(), StoreError> {
        self.transaction(|view| view.save_position(pos))
    }

    pub fn load_position(&self, position_id: &str) -> Result<Option<PositionState>, StoreError> {
        self.transaction(|view| view.load_position(position_id))
    }

    pub fn list_positions(&self) -> Result<Vec<PositionState>, StoreError> {
        self.transaction(|view| view.list_positions())
    }

    pub fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        self.transaction(|view| view.save_order(order))
    }

    pub fn load_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        self.transaction(|view| view.load_order(order_id))
    }

    pub fn list_orders(&self, position_id: &str) -> Result<Vec<Order>, StoreError> {
        self.transaction(|view| view.list_orders(position_id))
    }

    pub fn list_open_orders(&self) -> Result<Vec<Order>, StoreError> {
        self.transaction(|view| view.list_open_orders())
    }

    pub fn record_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        self.transaction(|view| view.record_trade(trade))
    }

    pub fn list_trades(&self) -> Result<Vec<TradeRecord>, StoreError> {
        self.transaction(|view| view.list_trades())
    }
}

/// Read/write surface available inside a transaction.
pub struct StoreView<'a> {
    conn: &'a Connection,
}

impl StoreView<'_> {
    pub fn save_position(&self, pos: &PositionState) -> Result<(), StoreError> {
        let value = serde_json::to_vec(pos)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO positions (position_id, value, updated_at)
             VALUES (?1, ?2, ?3)",
            params![pos.position_id, value, pos.updated_at.to_rfc3339()],
        )?;
        debug!(position_id = %pos.position_id, status = %pos.status, "position saved");
        Ok(())
    }

    pub fn load_position(&self, position_id: &str) -> Result<Option<PositionState>, StoreError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM positions WHERE position_id = ?1",
                params![position_id],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_positions(&self) -> Result<Vec<PositionState>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT value FROM positions")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut positions = Vec::new();
        for row in rows {
            positions.push(serde_json::from_slice(&row?)?);
        }
        Ok(positions)
    }

    /// Non-terminal positions only.
    pub fn list_open_positions(&self) -> Result<Vec<PositionState>, StoreError> {
        Ok(self
            .list_positions()?
            .into_iter()
            .filter(|p: &PositionState| !p.is_terminal())
            .collect())
    }

    pub fn save_order(&self, order: &Order) -> Result<(), StoreError> {
        let value = serde_json::to_vec(order)?;
        self.conn.execute(
            "INSERT OR REPLACE INTO orders
             (order_id, position_id, value, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                order.order_id,
                order.position_id,
                value,
                order.state.to_string(),
                order.created_at.to_rfc3339(),
                order.updated_at.to_rfc3339(),
            ],
        )?;
        debug!(order_id = %order.order_id, state = %order.state, "order saved");
        Ok(())
    }

    pub fn load_order(&self, order_id: &str) -> Result<Option<Order>, StoreError> {
        let blob: Option<Vec<u8>> = self
            .conn
            .query_row(
                "SELECT value FROM orders WHERE order_id = ?1",
                params![order_id],
                |row| row.get(0),
            )
            .optional()?;
        match blob {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn list_orders(&self, position_id: &str) -> Result<Vec<Order>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM orders WHERE position_id = ?1")?;
        let rows = stmt.query_map(params![position_id], |row| row.get::<_, Vec<u8>>(0))?;
        let mut orders = Vec::new();
        for row in rows {
            orders.push(serde_json::from_slice(&row?)?);
        }
        Ok(orders)
    }

    /// Orders in any non-terminal state, via the indexed `state` column.
    pub fn list_open_orders(&self) -> Result<Vec<Order>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT value FROM orders
             WHERE state IN ('pending_submit', 'open', 'partially_filled')",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut orders = Vec::new();
        for row in rows {
            let order: Order = serde_json::from_slice(&row?)?;
            debug_assert!(!order.state.is_terminal());
            orders.push(order);
        }
        Ok(orders)
    }

    pub fn record_trade(&self, trade: &TradeRecord) -> Result<(), StoreError> {
        let value = serde_json::to_vec(trade)?;
        self.conn.execute(
            "INSERT INTO trades (position_id, value, created_at) VALUES (?1, ?2, ?3)",
            params![trade.position_id, value, trade.closed_at.to_rfc3339()],
        )?;
        info!(
            position_id = %trade.position_id,
            product = %trade.product_id,
            pnl = %trade.realized_pnl,
            forced = trade.forced,
            "trade recorded"
        );
        Ok(())
    }

    pub fn list_trades(&self) -> Result<Vec<TradeRecord>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT value FROM trades ORDER BY id")?;
        let rows = stmt.query_map([], |row| row.get::<_, Vec<u8>>(0))?;
        let mut trades = Vec::new();
        for row in rows {
            trades.push(serde_json::from_slice(&row?)?);
        }
        Ok(trades)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::OrderKind;
    use crate::position::PositionStatus;
    use rust_decimal_macros::dec;

    fn m(d: rust_decimal::Decimal) -> Money {
        Money::new(d)
    }

    #[test]
    fn test_migrations_set_version() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.schema_version().unwrap(), MIGRATIONS.len() as i64);
    }

    #[test]
    fn test_position_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let mut pos = PositionState::new("pos-1", Symbol::new("BTC-USD"));
        pos.register_fill(m(dec!(0.4)), m(dec!(50000))).unwrap();
        pos.register_fill(m(dec!(0.6)), m(dec!(50100))).unwrap();
        store.save_position(&pos).unwrap();

        let loaded = store.load_position("pos-1").unwrap().unwrap();
        assert_eq!(loaded.status, PositionStatus::Open);
        // Exact decimal round-trip through the blob
        assert_eq!(loaded.entry_price, Some(m(dec!(50060))));
        assert_eq!(loaded.qty_filled, m(dec!(1.0)));
    }

    #[test]
    fn test_missing_rows_are_none() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.load_position("nope").unwrap().is_none());
        assert!(store.load_order("nope").unwrap().is_none());
    }

    #[test]
    fn test_order_listing_by_position_and_state() {
        let store = Store::open_in_memory().unwrap();
        let sym = Symbol::new("BTC-USD");

        let mut entry = Order::new_entry("c-1", "pos-1", sym.clone(), m(dec!(50000)), m(dec!(1)));
        entry.acknowledge("V-1").unwrap();
        entry.apply_fill(m(dec!(1)), m(dec!(50000))).unwrap();
        store.save_order(&entry).unwrap();

        let stop = Order::new_stop("c-2", "pos-1", sym.clone(), m(dec!(49000)), m(dec!(48755)), m(dec!(1)));
        store.save_order(&stop).unwrap();

        let other = Order::new_entry("c-3", "pos-2", sym, m(dec!(3000)), m(dec!(2)));
        store.save_order(&other).unwrap();

        assert_eq!(store.list_orders("pos-1").unwrap().len(), 2);

        let open = store.list_open_orders().unwrap();
        assert_eq!(open.len(), 2);
        assert!(open.iter().all(|o| !o.is_terminal()));
        assert!(open.iter().any(|o| o.kind == OrderKind::Stop));
    }

    #[test]
    fn test_transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let pos = PositionState::new("pos-1", Symbol::new("BTC-USD"));

        let result: Result<(), StoreError> = store.transaction(|view| {
            view.save_position(&pos)?;
            Err(StoreError::Db(rusqlite::Error::InvalidQuery))
        });
        assert!(result.is_err());
        assert!(store.load_position("pos-1").unwrap().is_none());
    }

    #[test]
    fn test_transaction_commits_multi_row() {
        let store = Store::open_in_memory().unwrap();
        let sym = Symbol::new("ETH-USD");
        let pos = PositionState::new("pos-1", sym.clone());
        let order = Order::new_entry("c-1", "pos-1", sym, m(dec!(3000)), m(dec!(2)));

        store
            .transaction(|view| {
                view.save_position(&pos)?;
                view.save_order(&order)
            })
            .unwrap();

        assert!(store.load_position("pos-1").unwrap().is_some());
        assert!(store.load_order("c-1").unwrap().is_some());
    }

    #[test]
    fn test_trade_audit_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let trade = TradeRecord {
            position_id: "pos-1".into(),
            product_id: Symbol::new("BTC-USD"),
            side: Side::Sell,
            qty: m(dec!(1)),
            entry_price: m(dec!(50000)),
            exit_price: m(dec!(51000)),
            realized_pnl: m(dec!(1000)),
            forced: false,
            closed_at: Utc::now(),
        };
        store.record_trade(&trade).unwrap();
        let trades = store.list_trades().unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].realized_pnl, m(dec!(1000)));
    }
}
