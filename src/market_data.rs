//! REST response shapes shared by the server and the client.

use crate::bar::{iso_time, Bar, Timeframe};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// First and last bar time of a series
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateSpan {
    #[serde(with = "iso_time")]
    pub start: DateTime<Utc>,
    #[serde(with = "iso_time")]
    pub end: DateTime<Utc>,
}

impl DateSpan {
    /// Span of a time-ordered slice, `None` when empty.
    pub fn of(bars: &[Bar]) -> Option<Self> {
        Some(DateSpan {
            start: bars.first()?.time,
            end: bars.last()?.time,
        })
    }
}

/// Summary of one symbol's base data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    pub total_bars: usize,
    pub date_range: DateSpan,
    pub last_price: f64,
    pub available_timeframes: Vec<Timeframe>,
}

impl SymbolInfo {
    pub fn from_bars(symbol: &str, bars: &[Bar]) -> Option<Self> {
        Some(SymbolInfo {
            symbol: symbol.to_uppercase(),
            total_bars: bars.len(),
            date_range: DateSpan::of(bars)?,
            last_price: bars.last()?.close,
            available_timeframes: Timeframe::all().to_vec(),
        })
    }
}

/// Latest price movement for a symbol/timeframe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolStats {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub current_price: f64,
    pub price_change: f64,
    pub price_change_percent: f64,
    pub high_24h: f64,
    pub low_24h: f64,
    #[serde(with = "iso_time")]
    pub last_updated: DateTime<Utc>,
}

impl SymbolStats {
    /// Computes stats from a time-ordered series.
    ///
    /// Change is measured against the previous bar (zero for a single bar).
    /// The 24h range covers the last 24 bars for `1h` data and the last bar
    /// otherwise.
    pub fn from_bars(symbol: &str, timeframe: Timeframe, bars: &[Bar]) -> Option<Self> {
        let latest = bars.last()?;
        let previous = if bars.len() > 1 {
            &bars[bars.len() - 2]
        } else {
            latest
        };

        let price_change = latest.close - previous.close;
        let price_change_percent = if previous.close != 0.0 {
            price_change / previous.close * 100.0
        } else {
            0.0
        };

        let window = if timeframe == Timeframe::OneHour {
            &bars[bars.len().saturating_sub(24)..]
        } else {
            &bars[bars.len() - 1..]
        };
        let high_24h = window.iter().map(|b| b.high).fold(f64::MIN, f64::max);
        let low_24h = window.iter().map(|b| b.low).fold(f64::MAX, f64::min);

        Some(SymbolStats {
            symbol: symbol.to_uppercase(),
            timeframe,
            current_price: latest.close,
            price_change,
            price_change_percent,
            high_24h,
            low_24h,
            last_updated: latest.time,
        })
    }
}

/// Bars for a symbol/timeframe query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketDataResponse {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub data: Vec<Bar>,
    pub count: usize,
    pub date_range: Option<DateSpan>,
}

impl MarketDataResponse {
    pub fn new(symbol: &str, timeframe: Timeframe, data: Vec<Bar>) -> Self {
        MarketDataResponse {
            symbol: symbol.to_uppercase(),
            timeframe,
            count: data.len(),
            date_range: DateSpan::of(&data),
            data,
        }
    }
}

/// Body of `GET /commodities/timeframes`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeframesResponse {
    pub timeframes: Vec<Timeframe>,
    pub default: Timeframe,
    pub description: String,
}

impl Default for TimeframesResponse {
    fn default() -> Self {
        TimeframesResponse {
            timeframes: Timeframe::all().to_vec(),
            default: Timeframe::default(),
            description: "Available timeframes for OHLC data".to_string(),
        }
    }
}
