//! Replay driven by the server stream.
//!
//! [`RemoteReplay`] pairs a [`ReplayEngine`] in remote mode with a
//! [`StreamingTransport`]. Commands go out through the transport; a consumer
//! task applies incoming events to the engine with the same per-bar logic as
//! a local replay.

use super::timer::{lock, wait_until, SharedEngine};
use super::{ReplayEngine, ReplayError, ReplayState};
use crate::bar::Timeframe;
use crate::protocol::{ReplayCommand, ReplayEvent};
use crate::transport::{
    ConnectionStatus, ShutdownOutcome, StreamingTransport, TransportConfig, TransportError,
    TransportEvent,
};
use chrono::NaiveDate;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

/// Errors from [`RemoteReplay`] operations
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteReplayError {
    Replay(ReplayError),
    Transport(TransportError),
}

impl fmt::Display for RemoteReplayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteReplayError::Replay(err) => write!(f, "{}", err),
            RemoteReplayError::Transport(err) => write!(f, "{}", err),
        }
    }
}

impl std::error::Error for RemoteReplayError {}

impl From<ReplayError> for RemoteReplayError {
    fn from(err: ReplayError) -> Self {
        RemoteReplayError::Replay(err)
    }
}

impl From<TransportError> for RemoteReplayError {
    fn from(err: TransportError) -> Self {
        RemoteReplayError::Transport(err)
    }
}

/// Stop commands sent to the server that it has not answered yet.
///
/// While a stop is pending, run-scoped events (bars, pause and resume
/// replies, `finished`) still belong to the abandoned server run and are
/// dropped. Each `stopped` reply settles one pending stop.
#[derive(Debug, Default)]
pub struct PendingStops(AtomicUsize);

impl PendingStops {
    pub fn new() -> Self {
        PendingStops::default()
    }

    /// Records a stop about to be sent.
    pub fn expect(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    /// Settles one pending stop. Returns false if none was pending.
    pub fn settle(&self) -> bool {
        self.0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::SeqCst) > 0
    }

    /// Forgets every pending stop; the server run died with the socket.
    pub fn clear(&self) {
        self.0.store(0, Ordering::SeqCst);
    }
}

/// What the consumer should do after an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Continue,
    /// The run completed; restore the original series after the grace delay
    ScheduleRestore,
    /// The run was aborted locally and a stop is now pending; the server run
    /// must be stopped too
    SendStop,
}

/// Applies one transport event to the engine.
pub fn apply_event(
    engine: &Mutex<ReplayEngine>,
    pending: &PendingStops,
    event: &TransportEvent,
) -> EventAction {
    let mut engine = lock(engine);

    if let TransportEvent::Message(message) = event {
        let run_scoped = matches!(
            message,
            ReplayEvent::Bar { .. }
                | ReplayEvent::Paused { .. }
                | ReplayEvent::Resumed { .. }
                | ReplayEvent::Finished { .. }
        );
        if run_scoped && pending.is_pending() {
            log::debug!("Dropping {:?} from a stopped server run", message);
            return EventAction::Continue;
        }
    }

    match event {
        TransportEvent::Message(ReplayEvent::Bar { bar, .. }) => match engine.ingest(*bar) {
            Ok(()) => {}
            Err(ReplayError::NotRunning) => {
                log::debug!("Dropping bar {} outside a session", bar.time.to_rfc3339());
            }
            Err(ReplayError::BarBeforeStart(time)) => {
                log::debug!("Dropping stale bar {}", time.to_rfc3339());
            }
            Err(ReplayError::MalformedBar(err)) => {
                log::warn!("Streamed bar aborted the replay: {}", err);
                pending.expect();
                return EventAction::SendStop;
            }
            Err(err) => log::warn!("Rejected streamed bar: {}", err),
        },
        TransportEvent::Message(ReplayEvent::Paused { .. }) => {
            if let Err(err) = engine.pause() {
                log::debug!("Ignoring paused event: {}", err);
            }
        }
        TransportEvent::Message(ReplayEvent::Resumed { .. }) => {
            if let Err(err) = engine.resume() {
                log::debug!("Ignoring resumed event: {}", err);
            }
        }
        TransportEvent::Message(ReplayEvent::Finished { .. }) => {
            if engine.finish_remote().is_ok() {
                return EventAction::ScheduleRestore;
            }
        }
        TransportEvent::Message(ReplayEvent::Stopped { .. }) => {
            if pending.settle() {
                log::debug!("Server acknowledged stop");
            } else if engine.state() != ReplayState::Stopped {
                engine.stop();
            }
        }
        TransportEvent::Message(ReplayEvent::Error { message }) => {
            log::warn!("Server reported replay error: {}", message);
            if engine.state() != ReplayState::Stopped {
                pending.expect();
                engine.abort(message);
                return EventAction::SendStop;
            }
        }
        TransportEvent::Message(ReplayEvent::Connected { message, .. }) => {
            log::info!("{}", message);
        }
        TransportEvent::Message(ReplayEvent::Heartbeat { .. }) => {}
        TransportEvent::Status(status) => match status {
            ConnectionStatus::Disconnected { .. } | ConnectionStatus::Failed { .. } => {
                // The server run dies with the socket
                pending.clear();
                if engine.state() != ReplayState::Stopped {
                    engine.abort(&status.to_string());
                }
            }
            _ => log::debug!("Transport status: {}", status),
        },
    }

    EventAction::Continue
}

async fn consume(
    engine: SharedEngine,
    pending: Arc<PendingStops>,
    commands: mpsc::Sender<ReplayCommand>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
    grace: Duration,
) {
    let mut restore_at: Option<Instant> = None;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                match apply_event(&engine, &pending, &event) {
                    EventAction::Continue => {}
                    EventAction::ScheduleRestore => {
                        restore_at = Some(Instant::now() + grace);
                    }
                    EventAction::SendStop => {
                        if let Err(err) = commands.try_send(ReplayCommand::Stop) {
                            log::warn!("Could not stop the server run: {}", err);
                            pending.settle();
                        }
                    }
                }
            }
            _ = wait_until(restore_at) => {
                lock(&engine).restore_if_pending();
                restore_at = None;
            }
        }
    }

    // Transport gone; make sure a completed run does not stay on the chart
    lock(&engine).restore_if_pending();
}

/// Remote replay session for one symbol
pub struct RemoteReplay {
    engine: SharedEngine,
    pending: Arc<PendingStops>,
    transport: StreamingTransport,
    consumer: Option<JoinHandle<()>>,
}

impl RemoteReplay {
    /// Opens the stream for the engine's symbol and starts consuming events.
    pub fn connect(engine: SharedEngine, config: TransportConfig) -> Self {
        let (symbol, grace) = {
            let engine = lock(&engine);
            (engine.symbol().to_string(), engine.config().restore_grace)
        };

        let (transport, events) = StreamingTransport::connect(&symbol, config);
        let pending = Arc::new(PendingStops::new());
        let consumer = tokio::spawn(consume(
            engine.clone(),
            Arc::clone(&pending),
            transport.command_sender(),
            events,
            grace,
        ));

        RemoteReplay {
            engine,
            pending,
            transport,
            consumer: Some(consumer),
        }
    }

    /// Starts a server replay from `start_date`.
    ///
    /// If the command cannot be delivered the local session is aborted and the
    /// original series restored.
    pub async fn start(
        &self,
        timeframe: Timeframe,
        speed: f64,
        start_date: Option<NaiveDate>,
        show_historical: bool,
    ) -> Result<(), RemoteReplayError> {
        let start_time = start_date
            .and_then(|date| date.and_hms_opt(0, 0, 0))
            .map(|naive| naive.and_utc());
        lock(&self.engine).start_remote(start_time, speed, show_historical)?;

        let command = ReplayCommand::Start {
            timeframe,
            speed,
            start_date,
        };
        if let Err(err) = self.transport.send_command(command).await {
            lock(&self.engine).abort(&err.to_string());
            return Err(err.into());
        }
        Ok(())
    }

    pub async fn pause(&self) -> Result<(), RemoteReplayError> {
        Ok(self.transport.send_command(ReplayCommand::Pause).await?)
    }

    pub async fn resume(&self) -> Result<(), RemoteReplayError> {
        Ok(self.transport.send_command(ReplayCommand::Resume).await?)
    }

    /// Stops the local session right away and asks the server to stop.
    ///
    /// Events of the stopped server run that arrive before its `stopped`
    /// reply are dropped, so a `start` right after `stop` is not disturbed.
    pub async fn stop(&self) -> Result<(), RemoteReplayError> {
        self.pending.expect();
        lock(&self.engine).stop();
        if let Err(err) = self.transport.send_command(ReplayCommand::Stop).await {
            self.pending.settle();
            return Err(err.into());
        }
        Ok(())
    }

    /// True while a stop sent to the server is still unanswered.
    pub fn stop_pending(&self) -> bool {
        self.pending.is_pending()
    }

    pub fn engine(&self) -> &SharedEngine {
        &self.engine
    }

    pub fn transport(&self) -> &StreamingTransport {
        &self.transport
    }

    /// Shuts the transport down, then waits for the consumer to drain.
    pub async fn shutdown(&mut self) -> ShutdownOutcome {
        let outcome = self.transport.shutdown(true).await;

        if let Some(mut consumer) = self.consumer.take() {
            if timeout(Duration::from_secs(1), &mut consumer).await.is_err() {
                consumer.abort();
            }
        }

        let mut engine = lock(&self.engine);
        if engine.state() != ReplayState::Stopped {
            engine.stop();
        }
        outcome
    }
}

impl Drop for RemoteReplay {
    fn drop(&mut self) {
        if let Some(consumer) = self.consumer.take() {
            consumer.abort();
        }
    }
}
