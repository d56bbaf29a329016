//! Route definitions for the replay server

use axum::{routing::get, Router};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use super::handlers;
use super::replay_ws;
use super::state::AppState;

/// Creates the main application router with all routes and middleware
pub fn create_router(state: Arc<AppState>) -> Router {
    // The chart front end is served from another origin
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        // Static information endpoints
        .route("/commodities/symbols", get(handlers::list_symbols))
        .route("/commodities/timeframes", get(handlers::list_timeframes))
        // Market data queries
        .route("/commodities/:symbol", get(handlers::get_symbol_data))
        .route("/commodities/:symbol/range", get(handlers::get_symbol_range))
        .route("/commodities/:symbol/stats", get(handlers::get_symbol_stats))
        // Replay stream
        .route("/ws/:symbol", get(replay_ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
