//! Shared application state for the replay server

use crate::provider::BarProvider;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Default idle period before a heartbeat is sent on a replay stream
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of concurrent replay streams
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Shared application state
pub struct AppState {
    /// Bar source for REST queries and replay streams.
    /// Wrapped in Mutex because SQLite connections are not thread-safe
    pub provider: Arc<Mutex<Box<dyn BarProvider + Send>>>,
    /// Idle period after which a replay stream sends a heartbeat
    pub heartbeat_interval: Duration,
    /// Maximum number of concurrent replay streams
    pub max_sessions: usize,
    active_sessions: Arc<AtomicUsize>,
}

impl AppState {
    /// Creates a new application state
    pub fn new<P: BarProvider + Send + 'static>(provider: P) -> Self {
        AppState {
            provider: Arc::new(Mutex::new(Box::new(provider))),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_sessions: DEFAULT_MAX_SESSIONS,
            active_sessions: Arc::new(AtomicUsize::new(0)),
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

    /// Reserves a replay stream slot, `None` when the limit is reached.
    pub fn try_acquire_session(&self) -> Option<SessionGuard> {
        let acquired = self
            .active_sessions
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |active| {
                (active < self.max_sessions).then_some(active + 1)
            })
            .is_ok();

        acquired.then(|| SessionGuard {
            active_sessions: Arc::clone(&self.active_sessions),
        })
    }

    /// Number of open replay streams
    pub fn active_sessions(&self) -> usize {
        self.active_sessions.load(Ordering::SeqCst)
    }
}

/// Releases its replay stream slot on drop
#[derive(Debug)]
pub struct SessionGuard {
    active_sessions: Arc<AtomicUsize>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.active_sessions.fetch_sub(1, Ordering::SeqCst);
    }
}
