//! Error types for the replay server

use crate::bar::BarError;
use crate::provider::ProviderError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error types
#[derive(Debug, Clone, PartialEq)]
pub enum ApiError {
    /// No data source for the symbol
    SymbolNotFound(String),
    /// Invalid parameter in request
    InvalidParameter(String),
    /// Invalid date range
    InvalidDateRange(String),
    /// Symbol exists but the query produced nothing
    NoData(String),
    /// Too many concurrent replay streams
    SessionLimitReached,
    /// Internal server error
    InternalError(String),
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApiError::SymbolNotFound(symbol) => write!(f, "Symbol not found: {}", symbol),
            ApiError::InvalidParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            ApiError::InvalidDateRange(msg) => write!(f, "Invalid date range: {}", msg),
            ApiError::NoData(msg) => write!(f, "No data: {}", msg),
            ApiError::SessionLimitReached => write!(f, "Session limit reached"),
            ApiError::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::SymbolNotFound(_) | ApiError::NoData(_) => StatusCode::NOT_FOUND,
            ApiError::InvalidParameter(_) | ApiError::InvalidDateRange(_) => {
                StatusCode::BAD_REQUEST
            }
            ApiError::SessionLimitReached => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (error_type, message) = match &self {
            ApiError::SymbolNotFound(symbol) => (
                "SymbolNotFound",
                format!("Symbol '{}' not found", symbol),
            ),
            ApiError::InvalidParameter(msg) => ("InvalidParameter", msg.clone()),
            ApiError::InvalidDateRange(msg) => ("InvalidDateRange", msg.clone()),
            ApiError::NoData(msg) => ("NoData", msg.clone()),
            ApiError::SessionLimitReached => (
                "SessionLimitReached",
                "Maximum number of concurrent replay streams reached".to_string(),
            ),
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                ("InternalError", msg.clone())
            }
        };

        let body = Json(json!({
            "error": error_type,
            "message": message,
        }));

        (self.status_code(), body).into_response()
    }
}

impl From<ProviderError> for ApiError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::SymbolNotFound(symbol) => ApiError::SymbolNotFound(symbol),
            ProviderError::InvalidDateRange => ApiError::InvalidDateRange(
                "Start date must be before or equal to end date".to_string(),
            ),
            ProviderError::NoData(symbol) => {
                ApiError::NoData(format!("No data available for '{}'", symbol))
            }
            ProviderError::Other(msg) => ApiError::InternalError(msg),
        }
    }
}

impl From<BarError> for ApiError {
    fn from(err: BarError) -> Self {
        ApiError::InvalidParameter(err.to_string())
    }
}

impl From<chrono::ParseError> for ApiError {
    fn from(err: chrono::ParseError) -> Self {
        ApiError::InvalidDateRange(format!("Date parse error: {}", err))
    }
}
