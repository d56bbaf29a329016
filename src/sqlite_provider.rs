use crate::bar::{parse_timestamp, Bar, Timeframe};
use crate::provider::{BarProvider, DateRange, ProviderError};
use chrono::NaiveDate;
use rusqlite::{params, Connection, Result as SqliteResult};
use std::path::Path;

/// SQLite-backed bar store.
///
/// Holds one hour bars for any number of symbols in a single `bars` table.
/// Automatically creates schema on first use.
#[derive(Debug)]
pub struct SqliteBarStore {
    conn: Connection,
}

impl SqliteBarStore {
    /// Opens (or creates) a file-based store.
    ///
    /// # Arguments
    /// * `db_path` - Path to the SQLite database file. Created if missing.
    ///
    /// # Errors
    /// Returns an error if the connection cannot be established or the schema
    /// cannot be created.
    pub fn new<P: AsRef<Path>>(db_path: P) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;
        let store = SqliteBarStore { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Creates a store backed by an in-memory database.
    ///
    /// Useful for testing.
    pub fn new_in_memory() -> SqliteResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = SqliteBarStore { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> SqliteResult<()> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS bars (
                symbol TEXT NOT NULL,
                time TEXT NOT NULL,
                open REAL NOT NULL,
                high REAL NOT NULL,
                low REAL NOT NULL,
                close REAL NOT NULL,
                PRIMARY KEY (symbol, time)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_bars_time ON bars(time)",
            [],
        )?;

        Ok(())
    }

    fn table_exists(&self, table_name: &str) -> SqliteResult<bool> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' AND name=?1")?;
        stmt.exists([table_name])
    }

    /// Returns a reference to the underlying SQLite connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Inserts bars for `symbol`, replacing any stored bar with the same time.
    ///
    /// Times are stored as RFC 3339 UTC strings so lexical order matches
    /// chronological order.
    ///
    /// # Returns
    /// The number of bars written.
    pub fn insert_bars(&mut self, symbol: &str, bars: &[Bar]) -> Result<usize, ProviderError> {
        let symbol = symbol.to_uppercase();
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO bars (symbol, time, open, high, low, close)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for bar in bars {
                stmt.execute(params![
                    symbol,
                    bar.time.to_rfc3339(),
                    bar.open,
                    bar.high,
                    bar.low,
                    bar.close
                ])?;
            }
        }
        tx.commit()?;
        Ok(bars.len())
    }

    /// Copies every symbol's base bars from another provider.
    ///
    /// # Returns
    /// Total number of bars imported.
    pub fn import_from(&mut self, source: &dyn BarProvider) -> Result<usize, ProviderError> {
        let mut total = 0;
        for symbol in source.symbols()? {
            let bars = source.base_bars(&symbol)?;
            total += self.insert_bars(&symbol, &bars)?;
            log::info!("Imported {} bars for {}", bars.len(), symbol);
        }
        Ok(total)
    }

    fn query_bars(&self, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Bar>, ProviderError> {
        let mut stmt = self.conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, f64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, f64>(3)?,
                row.get::<_, f64>(4)?,
            ))
        })?;

        let mut bars = Vec::new();
        for row in rows {
            let (time, open, high, low, close) = row?;
            let time = parse_timestamp(&time)
                .map_err(|e| ProviderError::Other(format!("Row parsing error: {}", e)))?;
            bars.push(Bar::new(time, open, high, low, close));
        }
        Ok(bars)
    }

    fn has_symbol(&self, symbol: &str) -> Result<bool, ProviderError> {
        let mut stmt = self
            .conn
            .prepare("SELECT 1 FROM bars WHERE symbol = ?1 LIMIT 1")?;
        Ok(stmt.exists([symbol])?)
    }
}

impl BarProvider for SqliteBarStore {
    fn symbols(&self) -> Result<Vec<String>, ProviderError> {
        let mut stmt = self
            .conn
            .prepare("SELECT DISTINCT symbol FROM bars ORDER BY symbol")?;
        let symbols = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<SqliteResult<Vec<String>>>()?;
        Ok(symbols)
    }

    fn base_bars(&self, symbol: &str) -> Result<Vec<Bar>, ProviderError> {
        let symbol = symbol.to_uppercase();
        let bars = self.query_bars(
            "SELECT time, open, high, low, close FROM bars WHERE symbol = ?1 ORDER BY time",
            &[&symbol],
        )?;
        if bars.is_empty() {
            return Err(ProviderError::SymbolNotFound(symbol));
        }
        Ok(bars)
    }

    fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
    ) -> Result<Vec<Bar>, ProviderError> {
        if range.start > range.end {
            return Err(ProviderError::InvalidDateRange);
        }
        if timeframe != Timeframe::OneHour {
            let bars = self.bars(symbol, timeframe)?;
            return Ok(bars.into_iter().filter(|bar| range.contains(bar)).collect());
        }

        // Open-ended ranges end at NaiveDate::MAX, which does not format as a
        // comparable four digit year
        let last_day = NaiveDate::from_ymd_opt(9999, 12, 31).unwrap_or(NaiveDate::MAX);
        let symbol = symbol.to_uppercase();
        let start = range.start.format("%Y-%m-%d").to_string();
        let end = range.end.min(last_day).format("%Y-%m-%d").to_string();
        let bars = self.query_bars(
            "SELECT time, open, high, low, close FROM bars
             WHERE symbol = ?1
             AND date(time) >= ?2
             AND date(time) <= ?3
             ORDER BY time",
            &[&symbol, &start, &end],
        )?;

        if bars.is_empty() && !self.has_symbol(&symbol)? {
            return Err(ProviderError::SymbolNotFound(symbol));
        }
        Ok(bars)
    }
}
