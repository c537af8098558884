//! SQLite emission backend
//!
//! Table written:
//! - `window_analytics` - UPSERT on window_id, so a record emitted twice (a
//!   replay after recovery, or a reopened late window) replaces the earlier row
//!
//! Writes run on the blocking pool so a slow disk never stalls a worker's
//! runtime thread. Reads are synchronous and meant for tools and tests.

use super::sink::{AnalyticsSink, SinkError};
use super::types::AggregatedAnalytics;
use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS window_analytics (
    window_id             TEXT PRIMARY KEY,
    pair_address          TEXT NOT NULL,
    window_start          INTEGER NOT NULL,
    window_end            INTEGER NOT NULL,
    token0                TEXT NOT NULL,
    token1                TEXT NOT NULL,
    token0_symbol         TEXT,
    token1_symbol         TEXT,
    twap                  REAL NOT NULL,
    open_price            REAL NOT NULL,
    close_price           REAL NOT NULL,
    high_price            REAL NOT NULL,
    low_price             REAL NOT NULL,
    price_volatility      REAL NOT NULL,
    total_volume0         TEXT NOT NULL,
    total_volume1         TEXT NOT NULL,
    volume_usd            REAL NOT NULL,
    swap_count            INTEGER NOT NULL,
    unique_traders        INTEGER NOT NULL,
    largest_swap_value    TEXT,
    largest_swap_address  TEXT,
    total_gas_used        INTEGER NOT NULL,
    average_gas_price     TEXT NOT NULL,
    arbitrage_count       INTEGER NOT NULL,
    repeated_traders      TEXT NOT NULL,
    processed_at          INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_window_analytics_pair
    ON window_analytics (pair_address, window_start);
"#;

const COLUMNS: &str = "window_id, window_start, window_end, pair_address, token0, token1,
    token0_symbol, token1_symbol, twap, open_price, close_price,
    high_price, low_price, price_volatility, total_volume0, total_volume1,
    volume_usd, swap_count, unique_traders, largest_swap_value,
    largest_swap_address, total_gas_used, average_gas_price,
    arbitrage_count, repeated_traders, processed_at";

fn to_sql_int(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Table-wide totals for a quick health check of the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnalyticsSummary {
    pub windows: u64,
    pub pairs: u64,
    pub total_swaps: u64,
    /// None while the table is empty
    pub latest_window_end: Option<i64>,
}

pub struct SqliteAnalyticsSink {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteAnalyticsSink {
    /// Open (or create) the database and ensure the schema exists
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)?;
        // Note: PRAGMA journal_mode returns results, so use pragma_update
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(SCHEMA)?;

        log::info!("🗄️  Writing window analytics to SQLite: {}", db_path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, SinkError> {
        self.conn
            .lock()
            .map_err(|_| SinkError::Database("connection lock poisoned".to_string()))
    }

    /// Load one stored record by window id
    pub fn fetch(&self, window_id: &str) -> Result<Option<AggregatedAnalytics>, SinkError> {
        let conn = self.lock()?;
        let sql = format!("SELECT {} FROM window_analytics WHERE window_id = ?1", COLUMNS);
        let row = conn
            .query_row(&sql, [window_id], read_row)
            .optional()?;
        row.map(with_traders).transpose()
    }

    /// Most recent window stored for a pair (served by idx_window_analytics_pair)
    pub fn latest_for_pair(&self, pair_address: &str) -> Result<Option<AggregatedAnalytics>, SinkError> {
        let conn = self.lock()?;
        let sql = format!(
            "SELECT {} FROM window_analytics WHERE pair_address = ?1
             ORDER BY window_start DESC LIMIT 1",
            COLUMNS
        );
        let row = conn
            .query_row(&sql, [pair_address.to_lowercase()], read_row)
            .optional()?;
        row.map(with_traders).transpose()
    }

    pub fn summary(&self) -> Result<AnalyticsSummary, SinkError> {
        let conn = self.lock()?;
        let summary = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT pair_address),
                    COALESCE(SUM(swap_count), 0), MAX(window_end)
             FROM window_analytics",
            [],
            |row| {
                Ok(AnalyticsSummary {
                    windows: row.get::<_, i64>(0)? as u64,
                    pairs: row.get::<_, i64>(1)? as u64,
                    total_swaps: row.get::<_, i64>(2)? as u64,
                    latest_window_end: row.get(3)?,
                })
            },
        )?;
        Ok(summary)
    }

    pub fn count(&self) -> Result<u64, SinkError> {
        let conn = self.lock()?;
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM window_analytics", [], |row| row.get(0))?;
        Ok(n as u64)
    }
}

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<(AggregatedAnalytics, String)> {
    Ok((
        AggregatedAnalytics {
            window_id: row.get(0)?,
            window_start: row.get(1)?,
            window_end: row.get(2)?,
            pair_address: row.get(3)?,
            token0: row.get(4)?,
            token1: row.get(5)?,
            token0_symbol: row.get(6)?,
            token1_symbol: row.get(7)?,
            twap: row.get(8)?,
            open_price: row.get(9)?,
            close_price: row.get(10)?,
            high_price: row.get(11)?,
            low_price: row.get(12)?,
            price_volatility: row.get(13)?,
            total_volume0: row.get(14)?,
            total_volume1: row.get(15)?,
            volume_usd: row.get(16)?,
            swap_count: row.get::<_, i64>(17)? as u64,
            unique_traders: row.get::<_, i64>(18)? as u64,
            largest_swap_value: row.get(19)?,
            largest_swap_address: row.get(20)?,
            total_gas_used: row.get::<_, i64>(21)? as u64,
            average_gas_price: row.get(22)?,
            arbitrage_count: row.get::<_, i64>(23)? as u64,
            repeated_traders: Vec::new(),
            processed_at: row.get(25)?,
        },
        row.get::<_, String>(24)?,
    ))
}

fn with_traders(
    (mut record, traders_json): (AggregatedAnalytics, String),
) -> Result<AggregatedAnalytics, SinkError> {
    record.repeated_traders = serde_json::from_str(&traders_json)?;
    Ok(record)
}

fn upsert(conn: &Connection, record: &AggregatedAnalytics) -> Result<(), SinkError> {
    let repeated_traders = serde_json::to_string(&record.repeated_traders)?;
    conn.execute(
        r#"
        INSERT INTO window_analytics (
            window_id, pair_address, window_start, window_end,
            token0, token1, token0_symbol, token1_symbol,
            twap, open_price, close_price, high_price, low_price, price_volatility,
            total_volume0, total_volume1, volume_usd,
            swap_count, unique_traders, largest_swap_value, largest_swap_address,
            total_gas_used, average_gas_price, arbitrage_count,
            repeated_traders, processed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(window_id) DO UPDATE SET
            token0 = excluded.token0,
            token1 = excluded.token1,
            token0_symbol = excluded.token0_symbol,
            token1_symbol = excluded.token1_symbol,
            twap = excluded.twap,
            open_price = excluded.open_price,
            close_price = excluded.close_price,
            high_price = excluded.high_price,
            low_price = excluded.low_price,
            price_volatility = excluded.price_volatility,
            total_volume0 = excluded.total_volume0,
            total_volume1 = excluded.total_volume1,
            volume_usd = excluded.volume_usd,
            swap_count = excluded.swap_count,
            unique_traders = excluded.unique_traders,
            largest_swap_value = excluded.largest_swap_value,
            largest_swap_address = excluded.largest_swap_address,
            total_gas_used = excluded.total_gas_used,
            average_gas_price = excluded.average_gas_price,
            arbitrage_count = excluded.arbitrage_count,
            repeated_traders = excluded.repeated_traders,
            processed_at = excluded.processed_at
        "#,
        rusqlite::params![
            record.window_id,
            record.pair_address,
            record.window_start,
            record.window_end,
            record.token0,
            record.token1,
            record.token0_symbol,
            record.token1_symbol,
            record.twap,
            record.open_price,
            record.close_price,
            record.high_price,
            record.low_price,
            record.price_volatility,
            record.total_volume0,
            record.total_volume1,
            record.volume_usd,
            to_sql_int(record.swap_count),
            to_sql_int(record.unique_traders),
            record.largest_swap_value,
            record.largest_swap_address,
            to_sql_int(record.total_gas_used),
            record.average_gas_price,
            to_sql_int(record.arbitrage_count),
            repeated_traders,
            record.processed_at,
        ],
    )?;

    Ok(())
}

#[async_trait]
impl AnalyticsSink for SqliteAnalyticsSink {
    async fn write(&self, record: &AggregatedAnalytics) -> Result<(), SinkError> {
        let conn = self.conn.clone();
        let record = record.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|_| SinkError::Database("connection lock poisoned".to_string()))?;
            upsert(&conn, &record)
        })
        .await
        .map_err(|e| SinkError::Database(format!("write task failed: {}", e)))?
    }

    async fn flush(&self) -> Result<(), SinkError> {
        // Each UPSERT commits on its own
        Ok(())
    }

    fn backend_type(&self) -> &'static str {
        "SQLite"
    }
}
