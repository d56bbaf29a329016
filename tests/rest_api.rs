mod common;

use chrono::NaiveDate;
use common::{gold_provider, hourly_bars, spawn_server};
use market_replay::server::AppState;
use market_replay::{
    ClientConfig, ClientError, InMemoryBarProvider, MarketDataClient, SqliteBarStore, Timeframe,
};

async fn client_for(state: AppState) -> MarketDataClient {
    let addr = spawn_server(state).await;
    MarketDataClient::with_config(ClientConfig::new(format!("http://{}/commodities", addr)))
        .unwrap()
}

fn series() -> Vec<f64> {
    (0..72).map(|i| 100.0 + i as f64).collect()
}

#[tokio::test]
async fn lists_symbols_and_timeframes() {
    common::init_logging();
    let mut provider = gold_provider(&series());
    provider.add_bars("oil", hourly_bars(&[70.0, 71.0]));
    let client = client_for(AppState::new(provider)).await;

    let symbols = client.symbols().await.unwrap();
    let names: Vec<&str> = symbols.iter().map(|s| s.symbol.as_str()).collect();
    assert_eq!(names, vec!["GOLD", "OIL"]);
    assert_eq!(symbols[0].total_bars, 72);
    assert_eq!(symbols[1].last_price, 71.0);

    let timeframes = client.timeframes().await.unwrap();
    assert_eq!(timeframes.default, Timeframe::OneHour);
    assert_eq!(timeframes.timeframes.len(), 6);
}

#[tokio::test]
async fn symbol_data_range_and_stats() {
    common::init_logging();
    let client = client_for(AppState::new(gold_provider(&series()))).await;

    let latest = client
        .symbol_data("gold", Timeframe::OneHour, Some(5))
        .await
        .unwrap();
    assert_eq!(latest.count, 5);
    assert_eq!(latest.data.last().unwrap().close, 171.0);

    let daily = client
        .symbol_data("GOLD", Timeframe::OneDay, None)
        .await
        .unwrap();
    assert_eq!(daily.count, 3);

    let range = client
        .symbol_data_range(
            "GOLD",
            Timeframe::FourHours,
            NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
            NaiveDate::from_ymd_opt(2024, 1, 2),
        )
        .await
        .unwrap();
    assert_eq!(range.count, 6);
    assert_eq!(range.data[0].open, 124.0);

    let stats = client.symbol_stats("GOLD", Timeframe::OneHour).await.unwrap();
    assert_eq!(stats.current_price, 171.0);
    assert_eq!(stats.price_change, 1.0);
    assert_eq!(stats.high_24h, 172.0);
    assert_eq!(stats.low_24h, 147.0);
}

#[tokio::test]
async fn errors_carry_status_and_message() {
    common::init_logging();
    let client = client_for(AppState::new(gold_provider(&series()))).await;

    match client.symbol_data("SILVER", Timeframe::OneHour, None).await {
        Err(ClientError::ApiError { status, message }) => {
            assert_eq!(status, 404);
            assert!(message.contains("SILVER"));
        }
        other => panic!("expected 404, got {:?}", other),
    }

    assert!(matches!(
        client.symbol_data("GOLD", Timeframe::OneHour, Some(0)).await,
        Err(ClientError::ApiError { status: 400, .. })
    ));

    assert!(matches!(
        client
            .symbol_data_range(
                "GOLD",
                Timeframe::OneHour,
                NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
                NaiveDate::from_ymd_opt(2024, 1, 1),
            )
            .await,
        Err(ClientError::ApiError { status: 400, .. })
    ));

    let empty = client_for(AppState::new(InMemoryBarProvider::new())).await;
    assert!(matches!(
        empty.symbols().await,
        Err(ClientError::ApiError { status: 404, .. })
    ));
}

#[tokio::test]
async fn sqlite_store_serves_the_same_api() {
    common::init_logging();
    let mut store = SqliteBarStore::new_in_memory().unwrap();
    store.import_from(&gold_provider(&series())).unwrap();
    let client = client_for(AppState::new(store)).await;

    let data = client
        .symbol_data("GOLD", Timeframe::OneHour, Some(3))
        .await
        .unwrap();
    let closes: Vec<f64> = data.data.iter().map(|b| b.close).collect();
    assert_eq!(closes, vec![169.0, 170.0, 171.0]);

    let range = client
        .symbol_data_range(
            "GOLD",
            Timeframe::OneHour,
            NaiveDate::from_ymd_opt(2024, 1, 3).unwrap(),
            None,
        )
        .await
        .unwrap();
    assert_eq!(range.count, 24);
}
