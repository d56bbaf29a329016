//! JSON messages exchanged over the replay WebSocket.
//!
//! Client commands are tagged by `command`, server events by `type`:
//!
//! ```json
//! {"command": "start", "timeframe": "1h", "speed": 2.0, "start_date": "2024-03-01"}
//! {"type": "bar", "symbol": "GOLD", "timeframe": "1h", "bar": {"time": "...", "open": 1.0, ...}}
//! ```

use crate::bar::{Bar, Timeframe};
use crate::replay::{validate_speed, ReplayError};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

fn default_speed() -> f64 {
    1.0
}

/// Commands sent by the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum ReplayCommand {
    /// Start (or restart) streaming bars from `start_date`
    Start {
        #[serde(default)]
        timeframe: Timeframe,
        #[serde(default = "default_speed")]
        speed: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        start_date: Option<NaiveDate>,
    },
    Pause,
    Resume,
    Stop,
}

impl ReplayCommand {
    /// Start command with default timeframe and speed.
    pub fn start() -> Self {
        ReplayCommand::Start {
            timeframe: Timeframe::default(),
            speed: default_speed(),
            start_date: None,
        }
    }

    /// Checks argument ranges (`0 < speed <= 10`).
    pub fn validate(&self) -> Result<(), ReplayError> {
        if let ReplayCommand::Start { speed, .. } = self {
            validate_speed(*speed)?;
        }
        Ok(())
    }

    pub fn name(&self) -> &'static str {
        match self {
            ReplayCommand::Start { .. } => "start",
            ReplayCommand::Pause => "pause",
            ReplayCommand::Resume => "resume",
            ReplayCommand::Stop => "stop",
        }
    }
}

/// Events sent by the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ReplayEvent {
    Connected {
        symbol: String,
        #[serde(default)]
        message: String,
    },
    Bar {
        #[serde(default)]
        symbol: String,
        #[serde(default)]
        timeframe: Timeframe,
        bar: Bar,
    },
    Paused {
        #[serde(default)]
        message: String,
    },
    Resumed {
        #[serde(default)]
        message: String,
    },
    Stopped {
        #[serde(default)]
        message: String,
    },
    Finished {
        #[serde(default)]
        symbol: String,
        #[serde(default)]
        message: String,
    },
    Error {
        message: String,
    },
    Heartbeat {
        #[serde(default)]
        timestamp: String,
    },
}

impl ReplayEvent {
    pub fn connected(symbol: &str) -> Self {
        ReplayEvent::Connected {
            symbol: symbol.to_string(),
            message: format!("Connected to {} replay stream", symbol),
        }
    }

    pub fn paused() -> Self {
        ReplayEvent::Paused {
            message: "Replay paused".to_string(),
        }
    }

    pub fn resumed() -> Self {
        ReplayEvent::Resumed {
            message: "Replay resumed".to_string(),
        }
    }

    pub fn stopped() -> Self {
        ReplayEvent::Stopped {
            message: "Replay stopped".to_string(),
        }
    }

    pub fn finished(symbol: &str) -> Self {
        ReplayEvent::Finished {
            symbol: symbol.to_string(),
            message: "Replay completed".to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ReplayEvent::Error {
            message: message.into(),
        }
    }
}

/// Frame that could not be decoded
#[derive(Debug, Clone, PartialEq)]
pub struct MalformedMessage {
    pub raw: String,
    pub reason: String,
}

impl fmt::Display for MalformedMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Malformed message ({}): {}", self.reason, self.raw)
    }
}

impl std::error::Error for MalformedMessage {}

fn decode<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T, MalformedMessage> {
    serde_json::from_str(raw).map_err(|err| MalformedMessage {
        raw: raw.chars().take(200).collect(),
        reason: err.to_string(),
    })
}

pub fn decode_command(raw: &str) -> Result<ReplayCommand, MalformedMessage> {
    decode(raw)
}

pub fn decode_event(raw: &str) -> Result<ReplayEvent, MalformedMessage> {
    decode(raw)
}
