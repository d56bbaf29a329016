use crate::bar::Timeframe;
use crate::market_data::{MarketDataResponse, SymbolInfo, SymbolStats, TimeframesResponse};
use chrono::NaiveDate;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;

/// Default REST base URL
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000/commodities";

/// Configuration for the market data client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL including the `/commodities` prefix
    pub base_url: String,
    /// Request timeout in seconds (default: 30)
    pub timeout_seconds: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: DEFAULT_BASE_URL.to_string(),
            timeout_seconds: 30,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        ClientConfig {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    /// Reads the base URL from `API_BASE_URL`, falling back to the default.
    pub fn from_env() -> Self {
        match std::env::var("API_BASE_URL") {
            Ok(url) if !url.trim().is_empty() => Self::new(url.trim()),
            _ => Self::default(),
        }
    }
}

/// Error body returned by the server
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// Async HTTP client for the `/commodities` REST endpoints.
#[derive(Debug)]
pub struct MarketDataClient {
    client: Client,
    config: ClientConfig,
}

impl MarketDataClient {
    /// Creates a client with default configuration.
    ///
    /// # Returns
    /// Returns an error if HTTP client creation fails.
    pub fn new() -> Result<Self, ClientError> {
        Self::with_config(ClientConfig::default())
    }

    /// Creates a client with custom configuration.
    ///
    /// # Arguments
    /// * `config` - Base URL and timeout
    pub fn with_config(config: ClientConfig) -> Result<Self, ClientError> {
        let timeout = Duration::from_secs(config.timeout_seconds);
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ClientError::ClientCreation(e.to_string()))?;

        Ok(MarketDataClient { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T, ClientError> {
        let url = self.url(path);
        log::debug!("GET {} {:?}", url, params);

        let response = self
            .client
            .get(&url)
            .query(params)
            .send()
            .await
            .map_err(|e| ClientError::NetworkError(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ErrorBody>().await {
                Ok(body) => body.message,
                Err(_) => status
                    .canonical_reason()
                    .unwrap_or("Unknown error")
                    .to_string(),
            };
            return Err(ClientError::ApiError {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<T>()
            .await
            .map_err(|e| ClientError::ParseError(e.to_string()))
    }

    /// Summaries of every symbol the server has data for.
    pub async fn symbols(&self) -> Result<Vec<SymbolInfo>, ClientError> {
        self.get("symbols", &[]).await
    }

    pub async fn timeframes(&self) -> Result<TimeframesResponse, ClientError> {
        self.get("timeframes", &[]).await
    }

    /// Bars for `symbol`, optionally only the most recent `limit`.
    pub async fn symbol_data(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: Option<usize>,
    ) -> Result<MarketDataResponse, ClientError> {
        let mut params = vec![("timeframe", timeframe.to_string())];
        if let Some(limit) = limit {
            params.push(("limit", limit.to_string()));
        }
        self.get(symbol, &params).await
    }

    /// Bars between `start` and `end` (inclusive); `None` runs to the last bar.
    pub async fn symbol_data_range(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        start: NaiveDate,
        end: Option<NaiveDate>,
    ) -> Result<MarketDataResponse, ClientError> {
        let mut params = vec![
            ("timeframe", timeframe.to_string()),
            ("start_date", start.format("%Y-%m-%d").to_string()),
        ];
        if let Some(end) = end {
            params.push(("end_date", end.format("%Y-%m-%d").to_string()));
        }
        self.get(&format!("{}/range", symbol), &params).await
    }

    pub async fn symbol_stats(
        &self,
        symbol: &str,
        timeframe: Timeframe,
    ) -> Result<SymbolStats, ClientError> {
        self.get(
            &format!("{}/stats", symbol),
            &[("timeframe", timeframe.to_string())],
        )
        .await
    }

    /// Returns a reference to the configuration.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }
}

/// Errors returned by [`MarketDataClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientError {
    /// HTTP client creation failed
    ClientCreation(String),
    /// Network error occurred
    NetworkError(String),
    /// Server returned an error status
    ApiError { status: u16, message: String },
    /// Failed to parse response data
    ParseError(String),
}

impl std::fmt::Display for ClientError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientError::ClientCreation(msg) => write!(f, "Client creation error: {}", msg),
            ClientError::NetworkError(msg) => write!(f, "Network error: {}", msg),
            ClientError::ApiError { status, message } => {
                write!(f, "API error (HTTP {}): {}", status, message)
            }
            ClientError::ParseError(msg) => write!(f, "Parse error: {}", msg),
        }
    }
}

impl std::error::Error for ClientError {}
