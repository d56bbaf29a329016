//! Bar data sources for the replay server
//!
//! [`BarProvider`] abstracts where the one hour base bars live. Larger
//! timeframes, latest-N queries, date ranges and summaries are derived from
//! the base bars by the trait's provided methods.

use crate::bar::{parse_timestamp, resample, Bar, Timeframe};
use crate::market_data::{SymbolInfo, SymbolStats};
use chrono::NaiveDate;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Inclusive calendar date range
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DateRange {
    /// Start date (inclusive)
    pub start: NaiveDate,
    /// End date (inclusive)
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        DateRange { start, end }
    }

    /// Range from `start` with no upper bound.
    pub fn starting(start: NaiveDate) -> Self {
        DateRange {
            start,
            end: NaiveDate::MAX,
        }
    }

    pub fn contains(&self, bar: &Bar) -> bool {
        let date = bar.time.date_naive();
        date >= self.start && date <= self.end
    }
}

/// Errors that can occur when querying a bar provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    /// No data source for the symbol
    SymbolNotFound(String),
    /// Start date after end date
    InvalidDateRange,
    /// The symbol exists but has no usable bars
    NoData(String),
    /// Storage failure
    Other(String),
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::SymbolNotFound(symbol) => write!(f, "Symbol '{}' not found", symbol),
            ProviderError::InvalidDateRange => write!(f, "Invalid date range"),
            ProviderError::NoData(symbol) => write!(f, "No data available for '{}'", symbol),
            ProviderError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for ProviderError {}

impl From<std::io::Error> for ProviderError {
    fn from(err: std::io::Error) -> Self {
        ProviderError::Other(format!("I/O error: {}", err))
    }
}

impl From<csv::Error> for ProviderError {
    fn from(err: csv::Error) -> Self {
        ProviderError::Other(format!("CSV error: {}", err))
    }
}

impl From<rusqlite::Error> for ProviderError {
    fn from(err: rusqlite::Error) -> Self {
        ProviderError::Other(format!("SQL error: {}", err))
    }
}

/// Source of one hour OHLC bars keyed by symbol.
///
/// Implementations only provide [`symbols`](BarProvider::symbols) and
/// [`base_bars`](BarProvider::base_bars); symbols are case-insensitive.
pub trait BarProvider {
    /// Available symbols, uppercase and sorted.
    fn symbols(&self) -> Result<Vec<String>, ProviderError>;

    /// All one hour bars for `symbol`, sorted by time.
    ///
    /// # Errors
    /// `SymbolNotFound` if the provider has no data source for `symbol`.
    fn base_bars(&self, symbol: &str) -> Result<Vec<Bar>, ProviderError>;

    /// All bars for `symbol` at `timeframe`.
    fn bars(&self, symbol: &str, timeframe: Timeframe) -> Result<Vec<Bar>, ProviderError> {
        Ok(resample(&self.base_bars(symbol)?, timeframe))
    }

    /// The most recent `limit` bars.
    fn latest(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Bar>, ProviderError> {
        let mut bars = self.bars(symbol, timeframe)?;
        let skip = bars.len().saturating_sub(limit);
        Ok(bars.split_off(skip))
    }

    /// Bars whose date falls within `range`.
    fn range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        range: &DateRange,
    ) -> Result<Vec<Bar>, ProviderError> {
        if range.start > range.end {
            return Err(ProviderError::InvalidDateRange);
        }
        let bars = self.bars(symbol, timeframe)?;
        Ok(bars.into_iter().filter(|bar| range.contains(bar)).collect())
    }

    /// Summary of the base data.
    fn info(&self, symbol: &str) -> Result<SymbolInfo, ProviderError> {
        let bars = self.base_bars(symbol)?;
        SymbolInfo::from_bars(symbol, &bars).ok_or_else(|| ProviderError::NoData(symbol.to_uppercase()))
    }

    /// Latest price movement at `timeframe`.
    fn stats(&self, symbol: &str, timeframe: Timeframe) -> Result<SymbolStats, ProviderError> {
        let bars = self.bars(symbol, timeframe)?;
        SymbolStats::from_bars(symbol, timeframe, &bars)
            .ok_or_else(|| ProviderError::NoData(symbol.to_uppercase()))
    }
}

/// In-memory bar provider, mainly for tests.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBarProvider {
    data: HashMap<String, Vec<Bar>>,
}

impl InMemoryBarProvider {
    pub fn new() -> Self {
        InMemoryBarProvider {
            data: HashMap::new(),
        }
    }

    /// Sets the one hour bars for `symbol`; bars are sorted by time.
    pub fn add_bars(&mut self, symbol: &str, mut bars: Vec<Bar>) {
        bars.sort_by_key(|bar| bar.time);
        self.data.insert(symbol.to_uppercase(), bars);
    }
}

impl BarProvider for InMemoryBarProvider {
    fn symbols(&self) -> Result<Vec<String>, ProviderError> {
        let mut symbols: Vec<String> = self.data.keys().cloned().collect();
        symbols.sort();
        Ok(symbols)
    }

    fn base_bars(&self, symbol: &str) -> Result<Vec<Bar>, ProviderError> {
        self.data
            .get(&symbol.to_uppercase())
            .cloned()
            .ok_or_else(|| ProviderError::SymbolNotFound(symbol.to_uppercase()))
    }
}

/// One row of a `<symbol>_1h.csv` file; extra columns are ignored
#[derive(Debug, Deserialize)]
struct CsvRow {
    #[serde(alias = "timestamp")]
    time: String,
    open: Option<f64>,
    high: Option<f64>,
    low: Option<f64>,
    close: Option<f64>,
}

impl CsvRow {
    fn into_bar(self) -> Option<Bar> {
        let time = parse_timestamp(&self.time).ok()?;
        Some(Bar::new(time, self.open?, self.high?, self.low?, self.close?))
    }
}

/// Reads hourly bars from `<data_dir>/<symbol>/<symbol>_1h.csv`
/// (lowercase symbol in both places).
#[derive(Debug, Clone)]
pub struct CsvBarProvider {
    data_dir: PathBuf,
}

impl CsvBarProvider {
    pub fn new<P: AsRef<Path>>(data_dir: P) -> Self {
        CsvBarProvider {
            data_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Path of the base CSV file for `symbol`.
    pub fn file_path(&self, symbol: &str) -> PathBuf {
        let lower = symbol.to_lowercase();
        self.data_dir.join(&lower).join(format!("{}_1h.csv", lower))
    }

    fn read_file(path: &Path) -> Result<Vec<Bar>, ProviderError> {
        let mut reader = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_path(path)?;

        let mut bars = Vec::new();
        let mut skipped = 0usize;
        for record in reader.deserialize::<CsvRow>() {
            match record.ok().and_then(CsvRow::into_bar) {
                Some(bar) if bar.validate().is_ok() => bars.push(bar),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            log::warn!("Skipped {} unusable rows in {}", skipped, path.display());
        }

        bars.sort_by_key(|bar| bar.time);
        bars.dedup_by_key(|bar| bar.time);
        Ok(bars)
    }
}

impl BarProvider for CsvBarProvider {
    fn symbols(&self) -> Result<Vec<String>, ProviderError> {
        let mut symbols = Vec::new();

        for entry in std::fs::read_dir(&self.data_dir)? {
            let dir = entry?.path();
            if !dir.is_dir() {
                continue;
            }
            for file in std::fs::read_dir(&dir)? {
                let name = file?.file_name().to_string_lossy().to_string();
                if let Some(symbol) = name.strip_suffix("_1h.csv") {
                    symbols.push(symbol.to_uppercase());
                }
            }
        }

        symbols.sort();
        symbols.dedup();
        Ok(symbols)
    }

    fn base_bars(&self, symbol: &str) -> Result<Vec<Bar>, ProviderError> {
        let path = self.file_path(symbol);
        if !path.exists() {
            log::debug!("File not found: {}", path.display());
            return Err(ProviderError::SymbolNotFound(symbol.to_uppercase()));
        }
        Self::read_file(&path)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::bar::Bar;
    use chrono::{Duration, TimeZone, Utc};

    /// `n` hourly bars from 2024-01-01 00:00 UTC with closes 100, 101, ...
    pub fn hourly_bars(n: usize) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        (0..n)
            .map(|i| {
                let close = 100.0 + i as f64;
                Bar::new(
                    base + Duration::hours(i as i64),
                    close - 0.5,
                    close + 1.0,
                    close - 1.0,
                    close,
                )
            })
            .collect()
    }
}
