//! Market Replay Server Binary
//!
//! Run with: `cargo run --bin replay-server`

use market_replay::{run_server, DataSource, ServerConfig};
use std::path::PathBuf;
use std::time::Duration;

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse::<T>().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Tracing is initialized in run_server(); RUST_LOG controls the level:
    //   RUST_LOG=debug cargo run --bin replay-server

    let host = std::env::var("HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port = env_or("PORT", 8000u16);
    let data_dir = std::env::var("DATA_DIR").ok().map(PathBuf::from);

    // DATABASE_PATH switches to the SQLite store; DATA_DIR then seeds it
    let data_source = match std::env::var("DATABASE_PATH") {
        Ok(path) => DataSource::Sqlite {
            path: PathBuf::from(path),
            import_dir: data_dir,
        },
        Err(_) => DataSource::Csv(data_dir.unwrap_or_else(|| PathBuf::from("data"))),
    };

    let config = ServerConfig::new(host, port, data_source)
        .with_max_sessions(env_or("MAX_SESSIONS", 10usize))
        .with_heartbeat_interval(Duration::from_secs(env_or("HEARTBEAT_SECS", 30u64)));

    println!("Starting Market Replay Server...");
    println!("   Address: http://{}:{}", config.host, config.port);
    println!("   Data: {:?}", config.data_source);
    println!();
    println!("Available endpoints:");
    println!("  GET /health                          - Health check");
    println!("  GET /commodities/symbols             - List symbols");
    println!("  GET /commodities/timeframes          - List timeframes");
    println!("  GET /commodities/:symbol             - Bars (timeframe, limit)");
    println!("  GET /commodities/:symbol/range       - Bars in a date range");
    println!("  GET /commodities/:symbol/stats       - Price statistics");
    println!("  GET /ws/:symbol                      - WebSocket replay stream");
    println!();

    run_server(config).await?;

    Ok(())
}
