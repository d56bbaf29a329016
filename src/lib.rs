pub mod bar;
pub mod bar_series;
pub mod position;
pub mod replay;
pub mod protocol;
pub mod transport;
pub mod market_data;
pub mod provider;
pub mod sqlite_provider;
pub mod api_client;
pub mod server;

pub use bar::{resample, Bar, BarError, Timeframe};
pub use bar_series::{BarSeriesStore, BarUpdate, ChartSink, SeriesError};
pub use position::{Position, PositionCallback, PositionError, PositionSide, PositionTracker};
pub use replay::remote::{RemoteReplay, RemoteReplayError};
pub use replay::timer::{ReplayControl, ReplayTimer, ReplayTimerHandle, SharedEngine};
pub use replay::{
    ReplayConfig, ReplayEngine, ReplayError, ReplayMode, ReplaySession, ReplayState,
    ReplayStatus, SessionPnl, TickOutcome,
};
pub use protocol::{ReplayCommand, ReplayEvent};
pub use transport::{
    ConnectionStatus, ShutdownOutcome, StreamingTransport, TransportConfig, TransportError,
    TransportEvent,
};
pub use market_data::{DateSpan, MarketDataResponse, SymbolInfo, SymbolStats, TimeframesResponse};
pub use provider::{BarProvider, CsvBarProvider, DateRange, InMemoryBarProvider, ProviderError};
pub use sqlite_provider::SqliteBarStore;
pub use api_client::{ClientConfig, ClientError, MarketDataClient};
pub use server::{run_server, ApiError, AppState, DataSource, ServerConfig};
