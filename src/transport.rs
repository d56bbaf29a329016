//! WebSocket client for the replay stream.
//!
//! A dedicated tokio task owns the socket. Callers only enqueue
//! [`ReplayCommand`]s and consume [`TransportEvent`]s from a channel; they
//! never touch the socket directly.

use crate::protocol::{decode_event, MalformedMessage, ReplayCommand, ReplayEvent};
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Errors surfaced to transport callers
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The socket could not be opened
    ConnectionError(String),
    /// The worker has exited and can no longer carry commands
    ConnectionClosed,
    /// A frame could not be decoded
    MalformedMessage(String),
    /// The command queue did not accept the command in time
    CommandTimeout,
    /// No connection became ready within the readiness timeout
    NotReady,
    /// The transport has been shut down
    NotRunning,
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectionError(msg) => write!(f, "Connection error: {}", msg),
            TransportError::ConnectionClosed => write!(f, "Connection closed"),
            TransportError::MalformedMessage(msg) => write!(f, "Malformed message: {}", msg),
            TransportError::CommandTimeout => write!(f, "Timed out queueing command"),
            TransportError::NotReady => write!(f, "Connection not ready"),
            TransportError::NotRunning => write!(f, "Transport is not running"),
        }
    }
}

impl std::error::Error for TransportError {}

impl From<MalformedMessage> for TransportError {
    fn from(err: MalformedMessage) -> Self {
        TransportError::MalformedMessage(err.reason)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::ConnectionError(err.to_string())
    }
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Server base URL, e.g. `ws://localhost:8000`
    pub url: String,
    /// Consecutive failures before giving up
    pub max_reconnect_attempts: u32,
    /// Fixed delay between attempts
    pub reconnect_delay: Duration,
    /// Bound on the handshake and on callers waiting for readiness
    pub ready_timeout: Duration,
    /// Bound on enqueueing a command
    pub send_timeout: Duration,
    /// Bound on joining the worker at shutdown
    pub join_timeout: Duration,
    /// Silence after which the connection is considered dead
    pub stale_timeout: Duration,
    /// Command queue capacity
    pub command_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            url: "ws://localhost:8000".to_string(),
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(2),
            ready_timeout: Duration::from_secs(10),
            send_timeout: Duration::from_secs(5),
            join_timeout: Duration::from_secs(8),
            stale_timeout: Duration::from_secs(60),
            command_buffer: 64,
        }
    }
}

impl TransportConfig {
    pub fn new(url: impl Into<String>) -> Self {
        TransportConfig {
            url: url.into(),
            ..TransportConfig::default()
        }
    }

    pub fn with_reconnect(mut self, max_attempts: u32, delay: Duration) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self.reconnect_delay = delay;
        self
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_stale_timeout(mut self, stale_timeout: Duration) -> Self {
        self.stale_timeout = stale_timeout;
        self
    }

    /// WebSocket URL of the replay stream for `symbol`.
    pub fn endpoint(&self, symbol: &str) -> String {
        format!("{}/ws/{}", self.url.trim_end_matches('/'), symbol)
    }
}

/// Connection lifecycle as reported to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionStatus {
    Connecting { attempt: u32 },
    Connected,
    Disconnected { reason: String },
    Reconnecting { attempt: u32, delay: Duration },
    /// Terminal: the attempt ceiling was reached, no further retries
    Failed { attempts: u32 },
    /// Terminal: the worker exited
    Closed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Connecting { attempt } => write!(f, "Connecting (attempt {})", attempt),
            ConnectionStatus::Connected => write!(f, "Connected"),
            ConnectionStatus::Disconnected { reason } => write!(f, "Disconnected: {}", reason),
            ConnectionStatus::Reconnecting { attempt, delay } => write!(
                f,
                "Reconnecting (attempt {}) in {:.1}s",
                attempt,
                delay.as_secs_f64()
            ),
            ConnectionStatus::Failed { attempts } => {
                write!(f, "Connection failed after {} attempts", attempts)
            }
            ConnectionStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// Items delivered to the consumer
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Status(ConnectionStatus),
    Message(ReplayEvent),
}

/// How [`StreamingTransport::shutdown`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The worker exited within the join timeout
    Graceful,
    /// The worker was aborted
    Aborted,
}

/// Client side of the replay stream for one symbol
pub struct StreamingTransport {
    symbol: String,
    config: TransportConfig,
    commands: mpsc::Sender<ReplayCommand>,
    ready: watch::Receiver<bool>,
    shutdown: watch::Sender<bool>,
    running: Arc<AtomicBool>,
    reconnect_attempts: Arc<AtomicU32>,
    task: Option<JoinHandle<()>>,
}

impl StreamingTransport {
    /// Spawns the connection worker for `symbol`.
    ///
    /// Must be called within a tokio runtime. Returns the transport handle and
    /// the event receiver; the receiver yields `Status(Closed)` last and then
    /// ends.
    pub fn connect(
        symbol: &str,
        config: TransportConfig,
    ) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let running = Arc::new(AtomicBool::new(true));
        let reconnect_attempts = Arc::new(AtomicU32::new(0));

        let worker = Worker {
            endpoint: config.endpoint(symbol),
            config: config.clone(),
            commands: command_rx,
            events: event_tx,
            ready: ready_tx,
            shutdown: shutdown_rx,
            running: Arc::clone(&running),
            attempts: Arc::clone(&reconnect_attempts),
        };
        let task = tokio::spawn(worker.run());

        let transport = StreamingTransport {
            symbol: symbol.to_string(),
            config,
            commands: command_tx,
            ready: ready_rx,
            shutdown: shutdown_tx,
            running,
            reconnect_attempts,
            task: Some(task),
        };
        (transport, event_rx)
    }

    /// Queues a command for the worker.
    ///
    /// Waits up to `ready_timeout` for an open connection, then up to
    /// `send_timeout` for queue space.
    ///
    /// # Errors
    /// `NotRunning` after shutdown or terminal failure, `NotReady` when no
    /// connection came up in time, `CommandTimeout` when the queue stayed
    /// full, `ConnectionClosed` when the worker is gone.
    pub async fn send_command(&self, command: ReplayCommand) -> Result<(), TransportError> {
        if !self.is_running() {
            return Err(TransportError::NotRunning);
        }

        let mut ready = self.ready.clone();
        match timeout(self.config.ready_timeout, ready.wait_for(|ready| *ready)).await {
            Ok(Ok(_)) => {}
            Ok(Err(_)) => return Err(TransportError::ConnectionClosed),
            Err(_) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    command = command.name(),
                    "Connection not ready after {:?}",
                    self.config.ready_timeout
                );
                return Err(TransportError::NotReady);
            }
        }

        match timeout(self.config.send_timeout, self.commands.send(command)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::ConnectionClosed),
            Err(_) => Err(TransportError::CommandTimeout),
        }
    }

    /// Handle for queueing commands without waiting for readiness.
    ///
    /// Commands queued while disconnected are sent once a connection opens.
    pub fn command_sender(&self) -> mpsc::Sender<ReplayCommand> {
        self.commands.clone()
    }

    /// True while a connection is open.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// False after shutdown or once the worker gave up.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Consecutive failed attempts since the last successful handshake.
    pub fn reconnect_attempts(&self) -> u32 {
        self.reconnect_attempts.load(Ordering::SeqCst)
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Stops the worker.
    ///
    /// Clears the running flag, optionally queues a final `stop` command
    /// (flushed if a connection is open), then joins the worker for at most
    /// `join_timeout` before aborting it.
    pub async fn shutdown(&mut self, send_stop: bool) -> ShutdownOutcome {
        self.running.store(false, Ordering::SeqCst);

        if send_stop {
            if let Err(err) = self.commands.try_send(ReplayCommand::Stop) {
                tracing::debug!(symbol = %self.symbol, "Could not queue stop: {}", err);
            }
        }
        self.shutdown.send_replace(true);

        let Some(mut task) = self.task.take() else {
            return ShutdownOutcome::Graceful;
        };

        match timeout(self.config.join_timeout, &mut task).await {
            Ok(_) => ShutdownOutcome::Graceful,
            Err(_) => {
                tracing::warn!(
                    symbol = %self.symbol,
                    "Worker did not exit within {:?}, aborting",
                    self.config.join_timeout
                );
                task.abort();
                ShutdownOutcome::Aborted
            }
        }
    }
}

impl Drop for StreamingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for StreamingTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingTransport")
            .field("symbol", &self.symbol)
            .field("running", &self.is_running())
            .field("ready", &self.is_ready())
            .field("reconnect_attempts", &self.reconnect_attempts())
            .finish()
    }
}

/// Why a connected session ended
enum SessionEnd {
    Shutdown,
    Lost(String),
}

struct Worker {
    endpoint: String,
    config: TransportConfig,
    commands: mpsc::Receiver<ReplayCommand>,
    events: mpsc::UnboundedSender<TransportEvent>,
    ready: watch::Sender<bool>,
    shutdown: watch::Receiver<bool>,
    running: Arc<AtomicBool>,
    attempts: Arc<AtomicU32>,
}

impl Worker {
    async fn run(mut self) {
        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let attempt = self.attempts.load(Ordering::SeqCst) + 1;
            self.status(ConnectionStatus::Connecting { attempt });
            tracing::debug!(endpoint = %self.endpoint, attempt, "Connecting");

            let connected = tokio::select! {
                result = timeout(self.config.ready_timeout, connect_async(self.endpoint.as_str())) => result,
                _ = self.shutdown.changed() => break,
            };

            match connected {
                Ok(Ok((socket, _))) => {
                    self.attempts.store(0, Ordering::SeqCst);
                    self.ready.send_replace(true);
                    self.status(ConnectionStatus::Connected);
                    tracing::info!(endpoint = %self.endpoint, "Connected");

                    let end = self.session(socket).await;
                    self.ready.send_replace(false);

                    match end {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            tracing::info!(endpoint = %self.endpoint, "Connection lost: {}", reason);
                            self.status(ConnectionStatus::Disconnected { reason });
                        }
                    }
                }
                Ok(Err(err)) => {
                    tracing::warn!(endpoint = %self.endpoint, "Connection failed: {}", err);
                }
                Err(_) => {
                    tracing::warn!(endpoint = %self.endpoint, "Connection attempt timed out");
                }
            }

            let failures = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if failures >= self.config.max_reconnect_attempts {
                tracing::error!(
                    endpoint = %self.endpoint,
                    "Giving up after {} failed attempts",
                    failures
                );
                self.status(ConnectionStatus::Failed { attempts: failures });
                break;
            }

            self.status(ConnectionStatus::Reconnecting {
                attempt: failures + 1,
                delay: self.config.reconnect_delay,
            });
            tokio::select! {
                _ = sleep(self.config.reconnect_delay) => {}
                _ = self.shutdown.changed() => break,
            }
        }

        self.running.store(false, Ordering::SeqCst);
        self.status(ConnectionStatus::Closed);
    }

    async fn session(&mut self, socket: Socket) -> SessionEnd {
        let (mut write, mut read) = socket.split();
        let mut last_inbound = Instant::now();

        let end = loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break SessionEnd::Shutdown;
                    };
                    if let Err(err) = send_command(&mut write, &command).await {
                        break SessionEnd::Lost(err.to_string());
                    }
                }

                frame = read.next() => {
                    last_inbound = Instant::now();
                    match frame {
                        Some(Ok(Message::Text(text))) => self.deliver(&text),
                        Some(Ok(Message::Binary(_))) => {
                            tracing::warn!("Skipping binary frame");
                        }
                        Some(Ok(Message::Close(_))) => {
                            break SessionEnd::Lost("closed by server".to_string());
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => break SessionEnd::Lost(err.to_string()),
                        None => break SessionEnd::Lost("stream ended".to_string()),
                    }
                }

                _ = sleep_until(last_inbound + self.config.stale_timeout) => {
                    tracing::warn!(
                        "No messages received for {:?}, connection may be stale",
                        self.config.stale_timeout
                    );
                    break SessionEnd::Lost("stale connection".to_string());
                }

                _ = self.shutdown.changed() => break SessionEnd::Shutdown,
            }
        };

        if let SessionEnd::Shutdown = end {
            while let Ok(command) = self.commands.try_recv() {
                if let Err(err) = send_command(&mut write, &command).await {
                    tracing::debug!("Dropping {} during shutdown: {}", command.name(), err);
                    break;
                }
            }
            if let Err(err) = write.send(Message::Close(None)).await {
                tracing::debug!("Error closing socket: {}", err);
            }
        }

        end
    }

    fn deliver(&self, text: &str) {
        match decode_event(text) {
            Ok(event) => {
                if self.events.send(TransportEvent::Message(event)).is_err() {
                    tracing::debug!("Event receiver dropped");
                }
            }
            Err(err) => {
                let err = TransportError::from(err);
                tracing::warn!("Skipping frame: {}", err);
            }
        }
    }

    fn status(&self, status: ConnectionStatus) {
        let _ = self.events.send(TransportEvent::Status(status));
    }
}

async fn send_command<S>(write: &mut S, command: &ReplayCommand) -> Result<(), TransportError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    let json = serde_json::to_string(command)
        .map_err(|err| TransportError::MalformedMessage(err.to_string()))?;
    write.send(Message::Text(json)).await?;
    tracing::debug!("Sent {} command", command.name());
    Ok(())
}
