//! REST API and WebSocket replay server

mod error;
mod handlers;
mod replay_ws;
mod routes;
mod state;

pub use error::ApiError;
pub use handlers::MAX_LIMIT;
pub use replay_ws::ReplayConnection;
pub use routes::create_router;
pub use state::{AppState, SessionGuard, DEFAULT_HEARTBEAT_INTERVAL, DEFAULT_MAX_SESSIONS};

use crate::provider::CsvBarProvider;
use crate::sqlite_provider::SqliteBarStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Where the server reads bars from
#[derive(Debug, Clone, PartialEq)]
pub enum DataSource {
    /// `<dir>/<symbol>/<symbol>_1h.csv` files
    Csv(PathBuf),
    /// SQLite bar store, optionally seeded from a CSV directory on startup
    Sqlite {
        path: PathBuf,
        import_dir: Option<PathBuf>,
    },
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Server host address (default: "127.0.0.1")
    pub host: String,
    /// Server port (default: 8000)
    pub port: u16,
    /// Bar source (default: CSV files under `data`)
    pub data_source: DataSource,
    /// Idle period before a heartbeat on replay streams (default: 30s)
    pub heartbeat_interval: Duration,
    /// Maximum concurrent replay streams (default: 10)
    pub max_sessions: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8000,
            data_source: DataSource::Csv(PathBuf::from("data")),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

impl ServerConfig {
    /// Creates a new server configuration
    pub fn new(host: impl Into<String>, port: u16, data_source: DataSource) -> Self {
        ServerConfig {
            host: host.into(),
            port,
            data_source,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Opens the configured data source and builds the application state.
    ///
    /// # Errors
    /// Returns an error if the SQLite store cannot be opened or the CSV
    /// import fails.
    pub fn build_state(&self) -> Result<AppState, Box<dyn std::error::Error>> {
        let state = match &self.data_source {
            DataSource::Csv(dir) => {
                tracing::info!("Serving CSV data from {}", dir.display());
                AppState::new(CsvBarProvider::new(dir))
            }
            DataSource::Sqlite { path, import_dir } => {
                let mut store = SqliteBarStore::new(path)?;
                if let Some(dir) = import_dir {
                    let imported = store.import_from(&CsvBarProvider::new(dir))?;
                    tracing::info!("Imported {} bars from {}", imported, dir.display());
                }
                tracing::info!("Serving SQLite data from {}", path.display());
                AppState::new(store)
            }
        };

        Ok(state
            .with_heartbeat_interval(self.heartbeat_interval)
            .with_max_sessions(self.max_sessions))
    }
}

/// Serves the router on an already bound listener until the task is dropped.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> std::io::Result<()> {
    let app = create_router(state);
    axum::serve(listener, app).await
}

/// Runs the API server
///
/// # Arguments
/// * `config` - Server configuration
///
/// # Returns
/// Returns an error if the server fails to start or encounters a fatal error
///
/// # Example
/// ```rust,no_run
/// use market_replay::server::{run_server, ServerConfig};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ServerConfig::default();
///     run_server(config).await?;
///     Ok(())
/// }
/// ```
pub async fn run_server(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();

    let state = Arc::new(config.build_state()?);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr).await?;

    tracing::info!("Server listening on http://{}", addr);

    serve(listener, state).await?;

    Ok(())
}
