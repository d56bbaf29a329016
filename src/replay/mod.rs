//! Bar-by-bar market replay
//!
//! The [`ReplayEngine`] is a deterministic state machine
//! (`STOPPED -> RUNNING <-> PAUSED -> STOPPED`) that feeds historical bars
//! into a [`BarSeriesStore`] one at a time and marks the simulated position
//! to market after each bar, auto-closing it when the stop loss is hit.
//!
//! The engine never sleeps. Time is supplied from outside:
//! - [`timer`] drives a local replay from a tokio task, one [`ReplayEngine::tick`]
//!   per period.
//! - [`remote`] applies bars streamed by the replay server through
//!   [`ReplayEngine::ingest`].
//!
//! Whenever a run ends (completion, abort or explicit stop) the chart is put
//! back to the series that was loaded before the run started.

pub mod remote;
pub mod timer;

use crate::bar::{Bar, BarError, Timeframe};
use crate::bar_series::{BarSeriesStore, ChartSink, SeriesError};
use crate::position::{Position, PositionError, PositionSide, PositionTracker};
use chrono::{DateTime, Utc};
use std::fmt;
use std::time::Duration;

/// Highest accepted speed multiplier
pub const MAX_SPEED: f64 = 10.0;

/// Errors that can occur while controlling a replay
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayError {
    /// No bars at or after the requested start time
    NoReplayData,
    /// The operation needs an active session
    NotRunning,
    /// A session is already active
    AlreadyRunning,
    /// No bar has been loaded, so there is no price to trade at
    NoPrice,
    /// Speed outside `0 < speed <= MAX_SPEED`
    InvalidSpeed(f64),
    /// A replayed bar failed validation; the run was aborted
    MalformedBar(BarError),
    /// A streamed bar is older than the session's start time
    BarBeforeStart(DateTime<Utc>),
    /// The series store rejected a bar
    Series(SeriesError),
    /// The position tracker rejected an operation
    Position(PositionError),
}

impl fmt::Display for ReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayError::NoReplayData => write!(f, "No data available for replay from the selected date"),
            ReplayError::NotRunning => write!(f, "No replay is running"),
            ReplayError::AlreadyRunning => write!(f, "A replay is already running"),
            ReplayError::NoPrice => write!(f, "No price available"),
            ReplayError::InvalidSpeed(speed) => write!(
                f,
                "Invalid speed {}: must be greater than 0 and at most {}",
                speed, MAX_SPEED
            ),
            ReplayError::MalformedBar(err) => write!(f, "Malformed bar: {}", err),
            ReplayError::BarBeforeStart(time) => {
                write!(f, "Bar at {} is before the replay start", time.to_rfc3339())
            }
            ReplayError::Series(err) => write!(f, "{}", err),
            ReplayError::Position(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for ReplayError {}

impl From<BarError> for ReplayError {
    fn from(err: BarError) -> Self {
        ReplayError::MalformedBar(err)
    }
}

impl From<SeriesError> for ReplayError {
    fn from(err: SeriesError) -> Self {
        ReplayError::Series(err)
    }
}

impl From<PositionError> for ReplayError {
    fn from(err: PositionError) -> Self {
        ReplayError::Position(err)
    }
}

/// Checks `0 < speed <= MAX_SPEED`.
pub fn validate_speed(speed: f64) -> Result<f64, ReplayError> {
    if speed.is_finite() && speed > 0.0 && speed <= MAX_SPEED {
        Ok(speed)
    } else {
        Err(ReplayError::InvalidSpeed(speed))
    }
}

/// Lifecycle of a replay session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayState {
    Stopped,
    Running,
    Paused,
}

impl fmt::Display for ReplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayState::Stopped => write!(f, "STOPPED"),
            ReplayState::Running => write!(f, "RUNNING"),
            ReplayState::Paused => write!(f, "PAUSED"),
        }
    }
}

/// Where the replayed bars come from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// Bars are taken from the loaded series by [`ReplayEngine::tick`]
    Local,
    /// Bars arrive from the replay server through [`ReplayEngine::ingest`]
    Remote,
}

/// Engine timing configuration
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Tick period at speed 1.0
    pub base_interval: Duration,
    /// Delay between completion and restoring the original series
    pub restore_grace: Duration,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        ReplayConfig {
            base_interval: Duration::from_millis(1000),
            restore_grace: Duration::from_millis(500),
        }
    }
}

impl ReplayConfig {
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    pub fn with_restore_grace(mut self, grace: Duration) -> Self {
        self.restore_grace = grace;
        self
    }
}

/// State of the active replay run
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaySession {
    pub symbol: String,
    pub timeframe: Timeframe,
    pub start_time: Option<DateTime<Utc>>,
    pub speed_multiplier: f64,
    pub status: ReplayState,
    /// Number of bars applied so far in this run
    pub cursor_index: usize,
    pub mode: ReplayMode,
}

/// Realized results accumulated over one replay run
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SessionPnl {
    pub realized_pnl: f64,
    pub closed_trades: u32,
    pub stop_loss_hits: u32,
}

impl SessionPnl {
    fn realize(&mut self, position: &Position) {
        self.realized_pnl += position.unrealized_pnl;
        self.closed_trades += 1;
    }
}

/// Status events published to subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum ReplayStatus {
    Started {
        bars_queued: usize,
    },
    Paused,
    Resumed,
    SpeedChanged(f64),
    BarApplied {
        bar: Bar,
        cursor_index: usize,
    },
    StopLossTriggered {
        position: Position,
        realized_pnl: f64,
    },
    PositionClosed(Position),
    Completed {
        bars_replayed: usize,
    },
    Stopped,
    Restored {
        bars: usize,
    },
    Error(String),
}

impl fmt::Display for ReplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayStatus::Started { bars_queued } => {
                write!(f, "Replay started ({} bars)", bars_queued)
            }
            ReplayStatus::Paused => write!(f, "Replay paused"),
            ReplayStatus::Resumed => write!(f, "Replay resumed"),
            ReplayStatus::SpeedChanged(speed) => write!(f, "Replay speed {}x", speed),
            ReplayStatus::BarApplied { bar, cursor_index } => write!(
                f,
                "Bar {} at {} close {}",
                cursor_index,
                bar.time.format("%Y-%m-%d %H:%M"),
                bar.close
            ),
            ReplayStatus::StopLossTriggered { position, .. } => write!(
                f,
                "Stop loss hit on {} {} at {:?}: P&L {:.2}",
                position.side, position.symbol, position.current_price, position.unrealized_pnl
            ),
            ReplayStatus::PositionClosed(position) => write!(
                f,
                "Closed {} {}: P&L {:.2}",
                position.side, position.symbol, position.unrealized_pnl
            ),
            ReplayStatus::Completed { bars_replayed } => {
                write!(f, "Replay completed ({} bars)", bars_replayed)
            }
            ReplayStatus::Stopped => write!(f, "Replay stopped"),
            ReplayStatus::Restored { bars } => write!(f, "Restored {} bars", bars),
            ReplayStatus::Error(message) => write!(f, "Replay error: {}", message),
        }
    }
}

/// Result of a single [`ReplayEngine::tick`]
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// The next bar was applied
    Applied(Bar),
    /// The queue was exhausted; the session has ended
    Completed,
    /// Nothing to do (paused or remote session)
    Idle,
}

pub type StatusCallback = Box<dyn Fn(&ReplayStatus) + Send + Sync>;

/// Replay engine for one chart view
///
/// # Example
///
/// ```rust,no_run
/// use market_replay::{Bar, PositionSide, ReplayEngine, Timeframe};
/// use chrono::{TimeZone, Utc};
///
/// # fn example(bars: Vec<Bar>) -> Result<(), Box<dyn std::error::Error>> {
/// let mut engine = ReplayEngine::default();
/// engine.load("GOLD", Timeframe::OneHour, bars)?;
///
/// let start = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
/// engine.start(start, 2.0, true)?;
/// engine.open_position(PositionSide::Long, 1.0, Some(1990.0))?;
///
/// while let market_replay::TickOutcome::Applied(bar) = engine.tick()? {
///     println!("{} close {}", bar.time, bar.close);
/// }
/// println!("{:?}", engine.session_pnl());
/// # Ok(())
/// # }
/// ```
pub struct ReplayEngine {
    config: ReplayConfig,
    symbol: String,
    timeframe: Timeframe,
    /// Series as loaded, restored after every run
    original: Vec<Bar>,
    store: BarSeriesStore,
    positions: PositionTracker,
    session: Option<ReplaySession>,
    queue: Vec<Bar>,
    pnl: SessionPnl,
    /// Set once the stop loss fired in this run; re-armed by a new position
    stop_loss_fired: bool,
    restore_pending: bool,
    status_callbacks: Vec<StatusCallback>,
}

impl Default for ReplayEngine {
    fn default() -> Self {
        ReplayEngine::new(ReplayConfig::default())
    }
}

impl ReplayEngine {
    pub fn new(config: ReplayConfig) -> Self {
        ReplayEngine {
            config,
            symbol: String::new(),
            timeframe: Timeframe::default(),
            original: Vec::new(),
            store: BarSeriesStore::new(),
            positions: PositionTracker::new(),
            session: None,
            queue: Vec::new(),
            pnl: SessionPnl::default(),
            stop_loss_fired: false,
            restore_pending: false,
            status_callbacks: Vec::new(),
        }
    }

    /// Registers a subscriber for replay status events.
    pub fn subscribe_status<F>(&mut self, callback: F)
    where
        F: Fn(&ReplayStatus) + Send + Sync + 'static,
    {
        self.status_callbacks.push(Box::new(callback));
    }

    /// Registers a subscriber for position changes.
    pub fn subscribe_positions<F>(&mut self, callback: F)
    where
        F: Fn(&str, Option<&Position>) + Send + Sync + 'static,
    {
        self.positions.subscribe(callback);
    }

    /// Attaches a chart renderer to the series store.
    pub fn add_chart_sink(&mut self, sink: Box<dyn ChartSink>) {
        self.store.add_sink(sink);
    }

    /// Loads the series for a symbol/timeframe view.
    ///
    /// Bars are sorted by time and duplicate timestamps keep the last bar.
    /// An active run is stopped first.
    ///
    /// # Errors
    /// Returns `MalformedBar` (and keeps the current series) if any bar fails
    /// validation.
    pub fn load(
        &mut self,
        symbol: &str,
        timeframe: Timeframe,
        mut bars: Vec<Bar>,
    ) -> Result<usize, ReplayError> {
        for bar in &bars {
            bar.validate()?;
        }

        if self.session.is_some() {
            log::info!("Switching view to {} {}, stopping replay", symbol, timeframe);
            self.stop();
        }

        // Stable sort, then keep the later duplicate
        bars.sort_by_key(|bar| bar.time);
        bars.reverse();
        bars.dedup_by_key(|bar| bar.time);
        bars.reverse();

        self.store.set(bars.clone())?;
        self.symbol = symbol.to_string();
        self.timeframe = timeframe;
        self.original = bars;
        self.restore_pending = false;

        log::info!(
            "Loaded {} bars for {} {}",
            self.original.len(),
            self.symbol,
            self.timeframe
        );
        Ok(self.original.len())
    }

    /// Starts a local replay from `start_time`.
    ///
    /// Bars before `start_time` are historical; the rest are queued for
    /// replay. With `show_historical` the chart keeps the historical bars,
    /// otherwise it starts empty.
    ///
    /// # Errors
    /// - `AlreadyRunning` if a session is active
    /// - `InvalidSpeed` if `speed` is out of range
    /// - `NoReplayData` if no bar is at or after `start_time` (engine stays STOPPED)
    pub fn start(
        &mut self,
        start_time: DateTime<Utc>,
        speed: f64,
        show_historical: bool,
    ) -> Result<(), ReplayError> {
        if self.session.is_some() {
            return Err(ReplayError::AlreadyRunning);
        }
        let speed = validate_speed(speed)?;

        let split = self.original.partition_point(|bar| bar.time < start_time);
        if split == self.original.len() {
            log::warn!(
                "No bars for {} from {}",
                self.symbol,
                start_time.to_rfc3339()
            );
            return Err(ReplayError::NoReplayData);
        }

        let historical = if show_historical {
            self.original[..split].to_vec()
        } else {
            Vec::new()
        };
        self.store.set(historical)?;
        self.queue = self.original[split..].to_vec();

        self.begin_session(Some(start_time), speed, ReplayMode::Local);
        self.emit(ReplayStatus::Started {
            bars_queued: self.queue.len(),
        });
        Ok(())
    }

    /// Starts a session whose bars arrive from the replay server.
    ///
    /// With `show_historical` the chart is seeded with the loaded bars before
    /// `start_time`; without a start time the chart starts empty.
    pub fn start_remote(
        &mut self,
        start_time: Option<DateTime<Utc>>,
        speed: f64,
        show_historical: bool,
    ) -> Result<(), ReplayError> {
        if self.session.is_some() {
            return Err(ReplayError::AlreadyRunning);
        }
        let speed = validate_speed(speed)?;

        let historical = match (show_historical, start_time) {
            (false, _) => Vec::new(),
            (true, Some(start)) => self
                .original
                .iter()
                .take_while(|bar| bar.time < start)
                .copied()
                .collect(),
            (true, None) => Vec::new(),
        };
        self.store.set(historical)?;
        self.queue.clear();

        self.begin_session(start_time, speed, ReplayMode::Remote);
        self.emit(ReplayStatus::Started { bars_queued: 0 });
        Ok(())
    }

    fn begin_session(&mut self, start_time: Option<DateTime<Utc>>, speed: f64, mode: ReplayMode) {
        self.pnl = SessionPnl::default();
        self.stop_loss_fired = false;
        self.restore_pending = false;
        self.session = Some(ReplaySession {
            symbol: self.symbol.clone(),
            timeframe: self.timeframe,
            start_time,
            speed_multiplier: speed,
            status: ReplayState::Running,
            cursor_index: 0,
            mode,
        });

        log::info!(
            "Replay started for {} {} at {}x ({:?})",
            self.symbol,
            self.timeframe,
            speed,
            mode
        );
    }

    /// RUNNING -> PAUSED. Pausing a paused session is a no-op.
    pub fn pause(&mut self) -> Result<(), ReplayError> {
        let session = self.session.as_mut().ok_or(ReplayError::NotRunning)?;
        if session.status == ReplayState::Paused {
            return Ok(());
        }
        session.status = ReplayState::Paused;
        log::info!("Replay paused at bar {}", session.cursor_index);
        self.emit(ReplayStatus::Paused);
        Ok(())
    }

    /// PAUSED -> RUNNING, continuing from the same cursor.
    pub fn resume(&mut self) -> Result<(), ReplayError> {
        let session = self.session.as_mut().ok_or(ReplayError::NotRunning)?;
        if session.status == ReplayState::Running {
            return Ok(());
        }
        session.status = ReplayState::Running;
        log::info!("Replay resumed at bar {}", session.cursor_index);
        self.emit(ReplayStatus::Resumed);
        Ok(())
    }

    /// Changes the speed multiplier without touching the cursor.
    pub fn set_speed(&mut self, speed: f64) -> Result<(), ReplayError> {
        let speed = validate_speed(speed)?;
        let session = self.session.as_mut().ok_or(ReplayError::NotRunning)?;
        session.speed_multiplier = speed;
        log::debug!("Replay speed set to {}x", speed);
        self.emit(ReplayStatus::SpeedChanged(speed));
        Ok(())
    }

    /// Period between ticks at the current speed, `None` without a session.
    pub fn tick_interval(&self) -> Option<Duration> {
        self.session
            .as_ref()
            .map(|session| self.config.base_interval.div_f64(session.speed_multiplier))
    }

    /// Advances a local replay by one bar.
    ///
    /// Returns `Completed` on the tick after the last bar: the session ends
    /// and the original series restore becomes pending (see
    /// [`restore_if_pending`](Self::restore_if_pending)).
    ///
    /// # Errors
    /// `NotRunning` without a session. A malformed bar aborts the run,
    /// restores the original series and returns `MalformedBar`.
    pub fn tick(&mut self) -> Result<TickOutcome, ReplayError> {
        let session = self.session.as_ref().ok_or(ReplayError::NotRunning)?;
        if session.status == ReplayState::Paused || session.mode == ReplayMode::Remote {
            return Ok(TickOutcome::Idle);
        }

        let Some(bar) = self.queue.get(session.cursor_index).copied() else {
            self.complete();
            return Ok(TickOutcome::Completed);
        };

        self.apply_bar(bar)?;
        Ok(TickOutcome::Applied(bar))
    }

    /// Applies a bar received from the replay server.
    ///
    /// Bars older than the session's start time belong to an earlier run and
    /// are rejected without touching the chart.
    pub fn ingest(&mut self, bar: Bar) -> Result<(), ReplayError> {
        match &self.session {
            Some(session) if session.mode == ReplayMode::Remote => {
                if session.start_time.map_or(false, |start| bar.time < start) {
                    return Err(ReplayError::BarBeforeStart(bar.time));
                }
                self.apply_bar(bar)
            }
            _ => Err(ReplayError::NotRunning),
        }
    }

    /// Ends a remote session after the server reported it finished.
    pub fn finish_remote(&mut self) -> Result<(), ReplayError> {
        if self.session.is_none() {
            return Err(ReplayError::NotRunning);
        }
        self.complete();
        Ok(())
    }

    fn apply_bar(&mut self, bar: Bar) -> Result<(), ReplayError> {
        if let Err(err) = bar.validate() {
            log::warn!("Aborting replay of {}: {}", self.symbol, err);
            self.abort(&err.to_string());
            return Err(ReplayError::MalformedBar(err));
        }

        self.store.append_or_replace_last(bar)?;

        let cursor_index = match self.session.as_mut() {
            Some(session) => {
                session.cursor_index += 1;
                session.cursor_index
            }
            None => 0,
        };

        self.positions.update_current_price(&self.symbol, bar.close);
        self.check_stop_loss();

        self.emit(ReplayStatus::BarApplied { bar, cursor_index });
        Ok(())
    }

    fn check_stop_loss(&mut self) {
        if self.stop_loss_fired || !self.positions.is_stop_loss_breached(&self.symbol) {
            return;
        }
        self.stop_loss_fired = true;

        let Some(position) = self.positions.close_position(&self.symbol) else {
            return;
        };
        self.pnl.realize(&position);
        self.pnl.stop_loss_hits += 1;

        log::info!(
            "Stop loss triggered on {} at {:?}, P&L {:.2}",
            self.symbol,
            position.current_price,
            position.unrealized_pnl
        );
        let realized_pnl = position.unrealized_pnl;
        self.emit(ReplayStatus::StopLossTriggered {
            position,
            realized_pnl,
        });
    }

    fn complete(&mut self) {
        let bars_replayed = self
            .session
            .take()
            .map(|session| session.cursor_index)
            .unwrap_or(0);
        self.queue.clear();
        self.restore_pending = true;

        log::info!(
            "Replay of {} completed after {} bars",
            self.symbol,
            bars_replayed
        );
        self.emit(ReplayStatus::Completed { bars_replayed });
    }

    /// Ends the run after an unrecoverable failure and restores the original
    /// series immediately.
    pub fn abort(&mut self, message: &str) {
        self.session = None;
        self.queue.clear();
        self.emit(ReplayStatus::Error(message.to_string()));
        self.restore_original();
    }

    /// Restores the original series if a completed run left it pending.
    ///
    /// Returns true when a restore happened.
    pub fn restore_if_pending(&mut self) -> bool {
        if !self.restore_pending {
            return false;
        }
        self.restore_original();
        true
    }

    fn restore_original(&mut self) {
        self.restore_pending = false;
        if let Err(err) = self.store.set(self.original.clone()) {
            log::warn!("Failed to restore original series: {}", err);
            return;
        }
        let bars = self.original.len();
        log::debug!("Restored {} original bars for {}", bars, self.symbol);
        self.emit(ReplayStatus::Restored { bars });
    }

    /// Stops the run (if any), resets session P&L and restores the original
    /// series. Also valid after completion, to restore without waiting for
    /// the grace delay.
    pub fn stop(&mut self) {
        if let Some(session) = self.session.take() {
            log::info!(
                "Replay of {} stopped at bar {}",
                session.symbol,
                session.cursor_index
            );
        }
        self.queue.clear();
        self.pnl = SessionPnl::default();
        self.emit(ReplayStatus::Stopped);
        self.restore_original();
    }

    /// Opens a position on the current symbol at the latest close.
    ///
    /// # Errors
    /// `NoPrice` when the chart is empty, otherwise any [`PositionError`].
    pub fn open_position(
        &mut self,
        side: PositionSide,
        size: f64,
        stop_loss: Option<f64>,
    ) -> Result<Position, ReplayError> {
        let price = self.store.latest_close().ok_or(ReplayError::NoPrice)?;
        let symbol = self.symbol.clone();

        self.positions
            .open_position(&symbol, side, size, price, stop_loss)?;
        self.stop_loss_fired = false;
        self.positions.update_current_price(&symbol, price);

        self.positions
            .get_position(&symbol)
            .cloned()
            .ok_or(ReplayError::NoPrice)
    }

    /// Closes the current position, realizing its P&L into the session totals.
    pub fn close_position(&mut self) -> Option<Position> {
        let position = self.positions.close_position(&self.symbol)?;
        self.pnl.realize(&position);
        self.emit(ReplayStatus::PositionClosed(position.clone()));
        Some(position)
    }

    pub fn update_stop_loss(&mut self, stop_loss: Option<f64>) {
        let symbol = self.symbol.clone();
        self.positions.update_stop_loss(&symbol, stop_loss);
    }

    pub fn state(&self) -> ReplayState {
        self.session
            .as_ref()
            .map(|session| session.status)
            .unwrap_or(ReplayState::Stopped)
    }

    pub fn session(&self) -> Option<&ReplaySession> {
        self.session.as_ref()
    }

    pub fn session_pnl(&self) -> SessionPnl {
        self.pnl
    }

    pub fn position(&self) -> Option<&Position> {
        self.positions.get_position(&self.symbol)
    }

    pub fn positions(&self) -> &PositionTracker {
        &self.positions
    }

    pub fn store(&self) -> &BarSeriesStore {
        &self.store
    }

    pub fn original_bars(&self) -> &[Bar] {
        &self.original
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn is_restore_pending(&self) -> bool {
        self.restore_pending
    }

    /// Bars left in a local replay queue.
    pub fn remaining(&self) -> usize {
        let cursor = self.session.as_ref().map(|s| s.cursor_index).unwrap_or(0);
        self.queue.len().saturating_sub(cursor)
    }

    fn emit(&self, status: ReplayStatus) {
        for callback in &self.status_callbacks {
            callback(&status);
        }
    }
}

impl fmt::Debug for ReplayEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayEngine")
            .field("symbol", &self.symbol)
            .field("timeframe", &self.timeframe)
            .field("original", &self.original.len())
            .field("session", &self.session)
            .field("pnl", &self.pnl)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::bar::Bar;
    use chrono::{Duration, TimeZone, Utc};

    /// Hourly bars starting 2024-01-02 00:00 UTC with the given closes.
    pub fn bars_with_closes(closes: &[f64]) -> Vec<Bar> {
        let base = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
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
}

#[cfg(test)]
mod tests {
    use super::test_support::bars_with_closes;
    use super::*;
    use crate::bar_series::testing::{RecordingSink, SinkCall};
    use chrono::{Duration as ChronoDuration, TimeZone};
    use std::sync::{Arc, Mutex};

    fn loaded_engine(closes: &[f64]) -> ReplayEngine {
        let mut engine = ReplayEngine::default();
        engine
            .load("GOLD", Timeframe::OneHour, bars_with_closes(closes))
            .unwrap();
        engine
    }

    fn hour(n: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap() + ChronoDuration::hours(n)
    }

    fn record_status(engine: &mut ReplayEngine) -> Arc<Mutex<Vec<ReplayStatus>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        engine.subscribe_status(move |status| sink.lock().unwrap().push(status.clone()));
        events
    }

    fn drain(engine: &mut ReplayEngine) -> usize {
        let mut applied = 0;
        while let TickOutcome::Applied(_) = engine.tick().unwrap() {
            applied += 1;
        }
        applied
    }

    #[test]
    fn test_start_splits_historical_and_queue() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0, 4.0, 5.0]);

        engine.start(hour(3), 1.0, true).unwrap();

        assert_eq!(engine.state(), ReplayState::Running);
        assert_eq!(engine.store().len(), 3);
        assert_eq!(engine.remaining(), 2);
    }

    #[test]
    fn test_start_without_historical_clears_chart() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0]);
        engine.start(hour(1), 1.0, false).unwrap();
        assert!(engine.store().is_empty());
    }

    #[test]
    fn test_start_after_last_bar_is_no_replay_data() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0]);
        let before = engine.store().snapshot();

        let result = engine.start(hour(10), 1.0, true);

        assert_eq!(result, Err(ReplayError::NoReplayData));
        assert_eq!(engine.state(), ReplayState::Stopped);
        assert_eq!(engine.store().bars(), before.as_slice());
    }

    #[test]
    fn test_start_validates_speed_and_single_session() {
        let mut engine = loaded_engine(&[1.0, 2.0]);
        assert_eq!(
            engine.start(hour(0), 0.0, true),
            Err(ReplayError::InvalidSpeed(0.0))
        );
        assert_eq!(
            engine.start(hour(0), 11.0, true),
            Err(ReplayError::InvalidSpeed(11.0))
        );

        engine.start(hour(0), 10.0, true).unwrap();
        assert_eq!(
            engine.start(hour(0), 1.0, true),
            Err(ReplayError::AlreadyRunning)
        );
    }

    #[test]
    fn test_tick_interval_follows_speed() {
        let mut engine = loaded_engine(&[1.0, 2.0]);
        assert_eq!(engine.tick_interval(), None);

        engine.start(hour(0), 4.0, true).unwrap();
        assert_eq!(engine.tick_interval(), Some(Duration::from_millis(250)));

        engine.set_speed(0.5).unwrap();
        assert_eq!(engine.tick_interval(), Some(Duration::from_millis(2000)));
        assert_eq!(engine.session().unwrap().cursor_index, 0);
    }

    #[test]
    fn test_pause_resume_keeps_cursor() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0, 4.0]);
        engine.start(hour(0), 1.0, false).unwrap();

        engine.tick().unwrap();
        engine.tick().unwrap();
        engine.pause().unwrap();

        assert_eq!(engine.state(), ReplayState::Paused);
        assert_eq!(engine.tick().unwrap(), TickOutcome::Idle);
        assert_eq!(engine.session().unwrap().cursor_index, 2);

        engine.resume().unwrap();
        let next = engine.tick().unwrap();
        assert_eq!(next, TickOutcome::Applied(engine.original_bars()[2]));

        let closes: Vec<f64> = engine.store().bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_controls_require_session() {
        let mut engine = loaded_engine(&[1.0]);
        assert_eq!(engine.pause(), Err(ReplayError::NotRunning));
        assert_eq!(engine.resume(), Err(ReplayError::NotRunning));
        assert_eq!(engine.set_speed(2.0), Err(ReplayError::NotRunning));
        assert_eq!(engine.tick(), Err(ReplayError::NotRunning));
    }

    #[test]
    fn test_completion_then_stop_restores_original() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0]);
        let original = engine.store().snapshot();
        let events = record_status(&mut engine);

        engine.start(hour(1), 1.0, false).unwrap();
        assert_eq!(drain(&mut engine), 2);

        assert_eq!(engine.state(), ReplayState::Stopped);
        assert!(engine.is_restore_pending());
        assert!(events
            .lock()
            .unwrap()
            .contains(&ReplayStatus::Completed { bars_replayed: 2 }));

        engine.stop();
        assert_eq!(engine.store().bars(), original.as_slice());
        assert!(!engine.is_restore_pending());
    }

    #[test]
    fn test_restore_if_pending_after_completion() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0]);
        engine.start(hour(0), 1.0, false).unwrap();
        drain(&mut engine);

        assert_eq!(engine.store().len(), 3);
        assert!(engine.restore_if_pending());
        assert!(!engine.restore_if_pending());
        assert_eq!(engine.store().bars(), engine.original_bars());
    }

    #[test]
    fn test_stop_loss_auto_closes_exactly_once() {
        let mut engine = loaded_engine(&[100.0, 105.0, 100.0, 94.0, 93.0, 90.0]);
        let events = record_status(&mut engine);
        let updates = Arc::new(Mutex::new(Vec::new()));
        let seen = updates.clone();
        engine.subscribe_positions(move |_, position| {
            seen.lock().unwrap().push(position.map(|p| p.current_price));
        });

        engine.start(hour(1), 1.0, true).unwrap();
        engine
            .open_position(PositionSide::Long, 1.0, Some(95.0))
            .unwrap();

        // 105, 100, 94 -> breach on the third bar
        engine.tick().unwrap();
        engine.tick().unwrap();
        assert!(engine.position().is_some());
        engine.tick().unwrap();
        assert!(engine.position().is_none());

        let updates_at_close = updates.lock().unwrap().len();
        drain(&mut engine);

        let triggered: Vec<_> = events
            .lock()
            .unwrap()
            .iter()
            .filter(|s| matches!(s, ReplayStatus::StopLossTriggered { .. }))
            .cloned()
            .collect();
        assert_eq!(triggered.len(), 1);
        if let ReplayStatus::StopLossTriggered { realized_pnl, .. } = &triggered[0] {
            assert_eq!(*realized_pnl, -6.0);
        }

        assert_eq!(updates.lock().unwrap().len(), updates_at_close);
        assert_eq!(updates.lock().unwrap().last(), Some(&None));

        let pnl = engine.session_pnl();
        assert_eq!(pnl.realized_pnl, -6.0);
        assert_eq!(pnl.closed_trades, 1);
        assert_eq!(pnl.stop_loss_hits, 1);
    }

    #[test]
    fn test_new_position_rearms_stop_loss() {
        let mut engine = loaded_engine(&[100.0, 94.0, 100.0, 120.0]);
        engine.start(hour(1), 1.0, true).unwrap();
        engine
            .open_position(PositionSide::Long, 1.0, Some(95.0))
            .unwrap();
        engine.tick().unwrap();
        assert!(engine.position().is_none());

        engine.tick().unwrap();
        engine
            .open_position(PositionSide::Short, 2.0, Some(110.0))
            .unwrap();
        engine.tick().unwrap();

        assert!(engine.position().is_none());
        assert_eq!(engine.session_pnl().stop_loss_hits, 2);
        assert_eq!(engine.session_pnl().realized_pnl, -6.0 - 40.0);
    }

    #[test]
    fn test_manual_close_realizes_pnl_and_stop_resets() {
        let mut engine = loaded_engine(&[100.0, 110.0]);
        engine.start(hour(1), 1.0, true).unwrap();
        engine.open_position(PositionSide::Short, 2.0, None).unwrap();
        engine.tick().unwrap();

        let closed = engine.close_position().unwrap();
        assert_eq!(closed.unrealized_pnl, -20.0);
        assert_eq!(engine.session_pnl().realized_pnl, -20.0);

        engine.stop();
        assert_eq!(engine.session_pnl(), SessionPnl::default());
    }

    #[test]
    fn test_open_position_needs_a_price() {
        let mut engine = ReplayEngine::default();
        assert_eq!(
            engine.open_position(PositionSide::Long, 1.0, None),
            Err(ReplayError::NoPrice)
        );
    }

    #[test]
    fn test_malformed_bar_aborts_and_restores() {
        let mut engine = loaded_engine(&[1.0, 2.0]);
        let original = engine.store().snapshot();
        let events = record_status(&mut engine);

        engine.start_remote(None, 1.0, false).unwrap();
        engine.ingest(bars_with_closes(&[5.0])[0]).unwrap();

        let mut bad = bars_with_closes(&[0.0, 6.0])[1];
        bad.high = bad.low - 1.0;
        let result = engine.ingest(bad);

        assert!(matches!(result, Err(ReplayError::MalformedBar(_))));
        assert_eq!(engine.state(), ReplayState::Stopped);
        assert_eq!(engine.store().bars(), original.as_slice());
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|s| matches!(s, ReplayStatus::Error(_))));
    }

    #[test]
    fn test_remote_session_ignores_tick_and_finishes() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0]);
        engine.start_remote(Some(hour(1)), 2.0, true).unwrap();
        assert_eq!(engine.store().len(), 1);
        assert_eq!(engine.tick().unwrap(), TickOutcome::Idle);

        for bar in bars_with_closes(&[1.0, 2.0, 3.0]).into_iter().skip(1) {
            engine.ingest(bar).unwrap();
        }
        engine.finish_remote().unwrap();

        assert_eq!(engine.state(), ReplayState::Stopped);
        assert!(engine.restore_if_pending());
        assert_eq!(engine.store().len(), 3);
    }

    #[test]
    fn test_ingest_rejects_bars_before_start() {
        let mut engine = loaded_engine(&[1.0, 2.0, 3.0]);
        let start = engine.original_bars()[2].time;
        engine.start_remote(Some(start), 1.0, true).unwrap();
        let before = engine.store().len();

        let stale = engine.original_bars()[0];
        assert_eq!(
            engine.ingest(stale),
            Err(ReplayError::BarBeforeStart(stale.time))
        );
        assert_eq!(engine.store().len(), before);
        assert_eq!(engine.state(), ReplayState::Running);

        let fresh = engine.original_bars()[2];
        engine.ingest(fresh).unwrap();
        assert_eq!(engine.store().bars().last(), Some(&fresh));
    }

    #[test]
    fn test_ingest_requires_remote_session() {
        let mut engine = loaded_engine(&[1.0]);
        let bar = engine.original_bars()[0];
        assert_eq!(engine.ingest(bar), Err(ReplayError::NotRunning));
    }

    #[test]
    fn test_load_sorts_and_dedups() {
        let mut bars = bars_with_closes(&[1.0, 2.0, 3.0]);
        let mut replacement = bars[1];
        replacement.close = 2.5;
        replacement.high = 3.5;
        bars.push(replacement);
        bars.swap(0, 2);

        let mut engine = ReplayEngine::default();
        let loaded = engine.load("GOLD", Timeframe::OneHour, bars).unwrap();

        assert_eq!(loaded, 3);
        let closes: Vec<f64> = engine.store().bars().iter().map(|b| b.close).collect();
        assert_eq!(closes, vec![1.0, 2.5, 3.0]);
    }

    #[test]
    fn test_load_rejects_invalid_bar() {
        let mut engine = loaded_engine(&[1.0]);
        let mut bars = bars_with_closes(&[1.0, 2.0]);
        bars[1].low = f64::INFINITY;

        assert!(matches!(
            engine.load("OIL", Timeframe::OneDay, bars),
            Err(ReplayError::MalformedBar(_))
        ));
        assert_eq!(engine.symbol(), "GOLD");
    }

    #[test]
    fn test_chart_sink_sees_replay_and_restore() {
        let sink = RecordingSink::default();
        let mut engine = ReplayEngine::default();
        engine.add_chart_sink(Box::new(sink.clone()));
        engine
            .load("GOLD", Timeframe::OneHour, bars_with_closes(&[1.0, 2.0]))
            .unwrap();

        engine.start(hour(1), 1.0, true).unwrap();
        engine.tick().unwrap();
        engine.stop();

        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Snapshot(2),
                SinkCall::Snapshot(1),
                SinkCall::Bar {
                    close: 2.0,
                    replaced: false
                },
                SinkCall::Snapshot(2),
            ]
        );
    }
}
