#![allow(dead_code)]

use chrono::{Duration, TimeZone, Utc};
use market_replay::server::{serve, AppState};
use market_replay::{Bar, InMemoryBarProvider};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Hourly bars from 2024-01-01 00:00 UTC, one per close.
pub fn hourly_bars(closes: &[f64]) -> Vec<Bar> {
    let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
    closes
        .iter()
        .enumerate()
        .map(|(i, &close)| {
            Bar::new(
                base + Duration::hours(i as i64),
                close,
                close + 1.0,
                close - 1.0,
                close,
            )
        })
        .collect()
}

pub fn gold_provider(closes: &[f64]) -> InMemoryBarProvider {
    let mut provider = InMemoryBarProvider::new();
    provider.add_bars("GOLD", hourly_bars(closes));
    provider
}

/// Serves `state` on an ephemeral local port.
pub async fn spawn_server(state: AppState) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, Arc::new(state)));
    addr
}

/// Routes `log` output through the test harness; `RUST_LOG` sets the level.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}
