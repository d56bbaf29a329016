//! HTTP request handlers for the `/commodities` endpoints

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::error::ApiError;
use super::state::AppState;
use crate::bar::Timeframe;
use crate::market_data::{MarketDataResponse, SymbolInfo, SymbolStats, TimeframesResponse};
use crate::provider::DateRange;

/// Largest accepted `limit`
pub const MAX_LIMIT: usize = 10_000;

/// Health check endpoint
///
/// Returns a simple status response to verify the server is running
pub async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok"
    }))
}

fn parse_timeframe(raw: Option<&str>) -> Result<Timeframe, ApiError> {
    match raw {
        Some(raw) => Ok(raw.parse::<Timeframe>()?),
        None => Ok(Timeframe::default()),
    }
}

fn parse_date(raw: &str, name: &str) -> Result<NaiveDate, ApiError> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d")
        .map_err(|e| ApiError::InvalidDateRange(format!("Invalid {}: {}", name, e)))
}

/// GET /commodities/symbols - Summaries of every available symbol
pub async fn list_symbols(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<SymbolInfo>>, ApiError> {
    let provider = state.provider.lock().await;

    let mut infos = Vec::new();
    for symbol in provider.symbols()? {
        match provider.info(&symbol) {
            Ok(info) => infos.push(info),
            Err(e) => tracing::warn!(symbol = %symbol, "Skipping symbol: {}", e),
        }
    }

    if infos.is_empty() {
        return Err(ApiError::NoData("No symbols found".to_string()));
    }
    Ok(Json(infos))
}

/// GET /commodities/timeframes - Supported timeframes
pub async fn list_timeframes() -> Json<TimeframesResponse> {
    Json(TimeframesResponse::default())
}

/// Query parameters for the symbol data endpoint
#[derive(Debug, Deserialize)]
pub struct DataQueryParams {
    pub timeframe: Option<String>,
    pub limit: Option<usize>,
}

/// GET /commodities/{symbol} - Bars at a timeframe, optionally only the last `limit`
pub async fn get_symbol_data(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<DataQueryParams>,
) -> Result<Json<MarketDataResponse>, ApiError> {
    let timeframe = parse_timeframe(params.timeframe.as_deref())?;

    let provider = state.provider.lock().await;
    let bars = match params.limit {
        Some(limit) if limit == 0 || limit > MAX_LIMIT => {
            return Err(ApiError::InvalidParameter(format!(
                "limit must be between 1 and {}",
                MAX_LIMIT
            )));
        }
        Some(limit) => provider.latest(&symbol, timeframe, limit)?,
        None => provider.bars(&symbol, timeframe)?,
    };

    if bars.is_empty() {
        return Err(ApiError::NoData(format!("No data found for symbol {}", symbol)));
    }

    Ok(Json(MarketDataResponse::new(&symbol, timeframe, bars)))
}

/// Query parameters for the date range endpoint
#[derive(Debug, Deserialize)]
pub struct RangeQueryParams {
    pub start_date: String,
    pub end_date: Option<String>,
    pub timeframe: Option<String>,
}

/// GET /commodities/{symbol}/range - Bars between two dates (inclusive)
///
/// Without `end_date` the range runs to the last bar.
pub async fn get_symbol_range(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<RangeQueryParams>,
) -> Result<Json<MarketDataResponse>, ApiError> {
    let timeframe = parse_timeframe(params.timeframe.as_deref())?;
    let start = parse_date(&params.start_date, "start_date")?;
    let range = match params.end_date.as_deref() {
        Some(end) => DateRange::new(start, parse_date(end, "end_date")?),
        None => DateRange::starting(start),
    };

    let provider = state.provider.lock().await;
    let bars = provider.range(&symbol, timeframe, &range)?;

    if bars.is_empty() {
        return Err(ApiError::NoData(format!(
            "No data found for {} in date range",
            symbol.to_uppercase()
        )));
    }

    Ok(Json(MarketDataResponse::new(&symbol, timeframe, bars)))
}

/// Query parameters for the stats endpoint
#[derive(Debug, Deserialize)]
pub struct StatsQueryParams {
    pub timeframe: Option<String>,
}

/// GET /commodities/{symbol}/stats - Latest price movement
pub async fn get_symbol_stats(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(params): Query<StatsQueryParams>,
) -> Result<Json<SymbolStats>, ApiError> {
    let timeframe = parse_timeframe(params.timeframe.as_deref())?;
    let provider = state.provider.lock().await;
    Ok(Json(provider.stats(&symbol, timeframe)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::test_support::hourly_bars;
    use crate::provider::InMemoryBarProvider;

    fn state_with_gold(n: usize) -> Arc<AppState> {
        let mut provider = InMemoryBarProvider::new();
        provider.add_bars("GOLD", hourly_bars(n));
        Arc::new(AppState::new(provider))
    }

    #[tokio::test]
    async fn test_symbol_data_limit_returns_tail() {
        let state = state_with_gold(10);
        let Json(response) = get_symbol_data(
            State(state),
            Path("gold".to_string()),
            Query(DataQueryParams {
                timeframe: None,
                limit: Some(2),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.symbol, "GOLD");
        assert_eq!(response.count, 2);
        assert_eq!(response.data[1].close, 109.0);
    }

    #[tokio::test]
    async fn test_symbol_data_rejects_bad_limit_and_timeframe() {
        let state = state_with_gold(3);
        let result = get_symbol_data(
            State(state.clone()),
            Path("GOLD".to_string()),
            Query(DataQueryParams {
                timeframe: None,
                limit: Some(MAX_LIMIT + 1),
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::InvalidParameter(_))));

        let result = get_symbol_data(
            State(state),
            Path("GOLD".to_string()),
            Query(DataQueryParams {
                timeframe: Some("3h".to_string()),
                limit: None,
            }),
        )
        .await;
        assert!(matches!(result, Err(ApiError::InvalidParameter(_))));
    }

    #[tokio::test]
    async fn test_range_without_end_date_runs_to_last_bar() {
        let state = state_with_gold(72);
        let Json(response) = get_symbol_range(
            State(state),
            Path("GOLD".to_string()),
            Query(RangeQueryParams {
                start_date: "2024-01-02".to_string(),
                end_date: None,
                timeframe: Some("1d".to_string()),
            }),
        )
        .await
        .unwrap();

        assert_eq!(response.timeframe, Timeframe::OneDay);
        assert_eq!(response.count, 2);
    }

    #[tokio::test]
    async fn test_range_errors() {
        let state = state_with_gold(24);
        let bad_date = get_symbol_range(
            State(state.clone()),
            Path("GOLD".to_string()),
            Query(RangeQueryParams {
                start_date: "01/02/2024".to_string(),
                end_date: None,
                timeframe: None,
            }),
        )
        .await;
        assert!(matches!(bad_date, Err(ApiError::InvalidDateRange(_))));

        let empty = get_symbol_range(
            State(state),
            Path("GOLD".to_string()),
            Query(RangeQueryParams {
                start_date: "2025-01-01".to_string(),
                end_date: Some("2025-02-01".to_string()),
                timeframe: None,
            }),
        )
        .await;
        assert!(matches!(empty, Err(ApiError::NoData(_))));
    }

    #[tokio::test]
    async fn test_symbols_and_unknown_symbol() {
        let state = state_with_gold(3);
        let Json(infos) = list_symbols(State(state.clone())).await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].symbol, "GOLD");

        let result = get_symbol_stats(
            State(state),
            Path("SILVER".to_string()),
            Query(StatsQueryParams { timeframe: None }),
        )
        .await;
        assert_eq!(
            result.unwrap_err(),
            ApiError::SymbolNotFound("SILVER".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_symbols_is_not_found() {
        let state = Arc::new(AppState::new(InMemoryBarProvider::new()));
        assert!(matches!(
            list_symbols(State(state)).await,
            Err(ApiError::NoData(_))
        ));
    }
}
