//! WebSocket replay stream (`GET /ws/{symbol}`).
//!
//! Each socket owns one [`ReplayConnection`]. A `start` command spawns a
//! producer task that paces bars at `1 / speed` seconds and feeds them back
//! to the socket loop through a bounded channel. `pause` closes a watch gate
//! the producer checks before every send; a new `start` aborts the producer.
//! `stop` also drops the bars it had buffered, so `stopped` is the last event
//! of that run. The socket loop also sends a heartbeat whenever the client has
//! been silent for the configured interval.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::Response,
};
use async_stream::stream;
use chrono::{NaiveDate, Utc};
use futures::stream::{SplitSink, Stream};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, Instant};
use uuid::Uuid;

use super::error::ApiError;
use super::state::{AppState, SessionGuard};
use crate::bar::{Bar, Timeframe};
use crate::protocol::{decode_command, ReplayCommand, ReplayEvent};

/// Capacity of the producer to socket channel
const EVENT_BUFFER: usize = 256;

/// GET /ws/{symbol} - Upgrade to a replay stream
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> Result<Response, ApiError> {
    let guard = state.try_acquire_session().ok_or_else(|| {
        tracing::warn!(symbol = %symbol, "Rejecting replay stream: session limit reached");
        ApiError::SessionLimitReached
    })?;

    Ok(ws.on_upgrade(move |socket| handle_socket(socket, state, symbol, guard)))
}

/// Paces `bars` at one per `1 / speed` seconds, holding while `paused` is set.
///
/// Ends early if the pause gate's sender is dropped.
fn paced_bars(
    bars: Vec<Bar>,
    speed: f64,
    mut paused: watch::Receiver<bool>,
) -> impl Stream<Item = Bar> {
    let delay = Duration::from_secs_f64(1.0 / speed);

    stream! {
        for bar in bars {
            let open = paused.wait_for(|paused| !*paused).await.is_ok();
            if !open {
                break;
            }
            yield bar;
            sleep(delay).await;
        }
    }
}

async fn produce(
    symbol: String,
    timeframe: Timeframe,
    bars: Vec<Bar>,
    speed: f64,
    paused: watch::Receiver<bool>,
    events: mpsc::Sender<ReplayEvent>,
) {
    let total = bars.len();
    let stream = paced_bars(bars, speed, paused);
    futures::pin_mut!(stream);

    while let Some(bar) = stream.next().await {
        let event = ReplayEvent::Bar {
            symbol: symbol.clone(),
            timeframe,
            bar,
        };
        if events.send(event).await.is_err() {
            tracing::debug!(symbol = %symbol, "Socket gone, stopping producer");
            return;
        }
    }

    tracing::info!(symbol = %symbol, bars = total, "Replay completed");
    if events.send(ReplayEvent::finished(&symbol)).await.is_err() {
        tracing::debug!(symbol = %symbol, "Socket gone before finished event");
    }
}

/// Replay state of one WebSocket connection
pub struct ReplayConnection {
    id: Uuid,
    symbol: String,
    state: Arc<AppState>,
    paused: watch::Sender<bool>,
    producer: Option<JoinHandle<()>>,
    events: mpsc::Sender<ReplayEvent>,
}

impl ReplayConnection {
    pub fn new(symbol: &str, state: Arc<AppState>, events: mpsc::Sender<ReplayEvent>) -> Self {
        let (paused, _) = watch::channel(false);
        ReplayConnection {
            id: Uuid::new_v4(),
            symbol: symbol.to_uppercase(),
            state,
            paused,
            producer: None,
            events,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// True while a producer is still sending bars.
    pub fn is_streaming(&self) -> bool {
        self.producer
            .as_ref()
            .map_or(false, |producer| !producer.is_finished())
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    /// Decodes and applies one text frame, returning the direct reply.
    pub async fn handle_text(&mut self, raw: &str) -> Option<ReplayEvent> {
        match decode_command(raw) {
            Ok(command) => self.handle_command(command).await,
            Err(err) => {
                tracing::warn!(id = %self.id, "{}", err);
                Some(ReplayEvent::error(format!("Invalid message: {}", err.reason)))
            }
        }
    }

    /// Applies a command. `start` replies only on failure; bars and the
    /// final `finished` arrive through the event channel.
    pub async fn handle_command(&mut self, command: ReplayCommand) -> Option<ReplayEvent> {
        tracing::debug!(id = %self.id, command = command.name(), "Replay command");
        if let Err(err) = command.validate() {
            return Some(ReplayEvent::error(err.to_string()));
        }

        match command {
            ReplayCommand::Start {
                timeframe,
                speed,
                start_date,
            } => self
                .start(timeframe, speed, start_date)
                .await
                .err()
                .map(ReplayEvent::error),
            ReplayCommand::Pause => {
                self.paused.send_replace(true);
                Some(ReplayEvent::paused())
            }
            ReplayCommand::Resume => {
                self.paused.send_replace(false);
                Some(ReplayEvent::resumed())
            }
            ReplayCommand::Stop => {
                self.halt().await;
                Some(ReplayEvent::stopped())
            }
        }
    }

    async fn start(
        &mut self,
        timeframe: Timeframe,
        speed: f64,
        start_date: Option<NaiveDate>,
    ) -> Result<(), String> {
        self.halt().await;

        let bars = {
            let provider = self.state.provider.lock().await;
            provider
                .bars(&self.symbol, timeframe)
                .map_err(|e| e.to_string())?
        };
        let bars: Vec<Bar> = match start_date {
            Some(date) => bars
                .into_iter()
                .filter(|bar| bar.time.date_naive() >= date)
                .collect(),
            None => bars,
        };
        if bars.is_empty() {
            return Err("No data available for replay".to_string());
        }

        tracing::info!(
            id = %self.id,
            symbol = %self.symbol,
            timeframe = %timeframe,
            speed,
            bars = bars.len(),
            "Starting replay"
        );

        self.paused.send_replace(false);
        self.producer = Some(tokio::spawn(produce(
            self.symbol.clone(),
            timeframe,
            bars,
            speed,
            self.paused.subscribe(),
            self.events.clone(),
        )));
        Ok(())
    }

    /// Aborts the running producer and waits until it can send no more.
    pub async fn halt(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
            if let Err(err) = producer.await {
                if !err.is_cancelled() {
                    tracing::warn!(id = %self.id, "Producer failed: {}", err);
                }
            }
        }
    }

    /// Aborts the running producer, if any.
    pub fn cancel(&mut self) {
        if let Some(producer) = self.producer.take() {
            producer.abort();
        }
    }
}

impl Drop for ReplayConnection {
    fn drop(&mut self) {
        self.cancel();
    }
}

async fn send_event(
    sink: &mut SplitSink<WebSocket, Message>,
    event: &ReplayEvent,
) -> Result<(), axum::Error> {
    match serde_json::to_string(event) {
        Ok(text) => sink.send(Message::Text(text)).await,
        Err(err) => {
            tracing::error!("Failed to encode event: {}", err);
            Ok(())
        }
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, symbol: String, _guard: SessionGuard) {
    let heartbeat = state.heartbeat_interval;
    let (events_tx, mut events_rx) = mpsc::channel(EVENT_BUFFER);
    let mut connection = ReplayConnection::new(&symbol, state, events_tx);
    let (mut sink, mut frames) = socket.split();

    tracing::info!(id = %connection.id(), symbol = %connection.symbol(), "Replay stream opened");

    if send_event(&mut sink, &ReplayEvent::connected(connection.symbol()))
        .await
        .is_err()
    {
        return;
    }

    let mut idle_deadline = Instant::now() + heartbeat;

    loop {
        tokio::select! {
            frame = frames.next() => {
                idle_deadline = Instant::now() + heartbeat;
                let reply = match frame {
                    Some(Ok(Message::Text(text))) => connection.handle_text(&text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => None,
                    Some(Err(err)) => {
                        tracing::debug!(id = %connection.id(), "Socket error: {}", err);
                        break;
                    }
                };
                if let Some(reply) = reply {
                    if let ReplayEvent::Stopped { .. } = reply {
                        // The stopped run ends with this reply
                        let mut discarded = 0;
                        while events_rx.try_recv().is_ok() {
                            discarded += 1;
                        }
                        if discarded > 0 {
                            tracing::debug!(id = %connection.id(), discarded, "Discarded buffered events");
                        }
                    }
                    if send_event(&mut sink, &reply).await.is_err() {
                        break;
                    }
                }
            }

            Some(event) = events_rx.recv() => {
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }

            _ = sleep_until(idle_deadline) => {
                idle_deadline = Instant::now() + heartbeat;
                let event = ReplayEvent::Heartbeat {
                    timestamp: Utc::now().to_rfc3339(),
                };
                if send_event(&mut sink, &event).await.is_err() {
                    break;
                }
            }
        }
    }

    connection.cancel();
    tracing::info!(id = %connection.id(), symbol = %connection.symbol(), "Replay stream closed");
}
