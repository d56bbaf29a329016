//! Simulated position tracking
//!
//! Holds at most one open position per symbol, recomputes unrealized P&L on
//! every price update and answers stop-loss breach queries. Subscribers are
//! notified synchronously after each committed change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Direction of a simulated position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PositionSide {
    Long,
    Short,
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionSide::Long => write!(f, "LONG"),
            PositionSide::Short => write!(f, "SHORT"),
        }
    }
}

/// Errors raised by [`PositionTracker`] operations
#[derive(Debug, Clone, PartialEq)]
pub enum PositionError {
    /// Stop loss is on the profit side of the entry price
    InvalidStopLoss {
        side: PositionSide,
        entry_price: f64,
        stop_loss: f64,
    },
    /// The symbol already has an open position
    PositionAlreadyExists(String),
    /// Size is zero, negative or not finite
    InvalidSize(f64),
    /// A price is not finite
    InvalidPrice(f64),
}

impl fmt::Display for PositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PositionError::InvalidStopLoss {
                side,
                entry_price,
                stop_loss,
            } => match side {
                PositionSide::Long => write!(
                    f,
                    "Stop loss {} must be below entry price {} for a LONG position",
                    stop_loss, entry_price
                ),
                PositionSide::Short => write!(
                    f,
                    "Stop loss {} must be above entry price {} for a SHORT position",
                    stop_loss, entry_price
                ),
            },
            PositionError::PositionAlreadyExists(symbol) => {
                write!(f, "Position already exists for {}", symbol)
            }
            PositionError::InvalidSize(size) => {
                write!(f, "Position size must be positive, got {}", size)
            }
            PositionError::InvalidPrice(price) => write!(f, "Invalid price: {}", price),
        }
    }
}

impl std::error::Error for PositionError {}

/// A simulated open position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub stop_loss: Option<f64>,
    pub current_price: Option<f64>,
    pub unrealized_pnl: f64,
    pub entry_time: DateTime<Utc>,
}

impl Position {
    /// Sets the current price and recomputes unrealized P&L.
    ///
    /// LONG: `(price - entry) * size`, SHORT: `(entry - price) * size`.
    pub fn update_pnl(&mut self, price: f64) {
        self.current_price = Some(price);
        self.unrealized_pnl = match self.side {
            PositionSide::Long => (price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - price) * self.size,
        };
    }

    /// True when the current price has reached the stop loss.
    ///
    /// False without a stop loss or before the first price update.
    pub fn is_stop_loss_breached(&self) -> bool {
        match (self.stop_loss, self.current_price) {
            (Some(stop_loss), Some(price)) => match self.side {
                PositionSide::Long => price <= stop_loss,
                PositionSide::Short => price >= stop_loss,
            },
            _ => false,
        }
    }
}

/// Subscriber invoked with the symbol and the new position state
/// (`None` once the position is closed).
pub type PositionCallback = Box<dyn Fn(&str, Option<&Position>) + Send + Sync>;

/// Tracks zero or one position per symbol.
#[derive(Default)]
pub struct PositionTracker {
    positions: HashMap<String, Position>,
    subscribers: Vec<PositionCallback>,
}

impl PositionTracker {
    pub fn new() -> Self {
        PositionTracker {
            positions: HashMap::new(),
            subscribers: Vec::new(),
        }
    }

    /// Registers a subscriber for position changes.
    pub fn subscribe<F>(&mut self, callback: F)
    where
        F: Fn(&str, Option<&Position>) + Send + Sync + 'static,
    {
        self.subscribers.push(Box::new(callback));
    }

    /// Opens a new position.
    ///
    /// # Errors
    /// - `InvalidSize` if `size` is not a positive finite number
    /// - `InvalidPrice` if the entry price or stop loss is not finite
    /// - `InvalidStopLoss` if the stop loss is not on the loss side of entry
    /// - `PositionAlreadyExists` if `symbol` already has a position
    pub fn open_position(
        &mut self,
        symbol: &str,
        side: PositionSide,
        size: f64,
        entry_price: f64,
        stop_loss: Option<f64>,
    ) -> Result<Position, PositionError> {
        if !size.is_finite() || size <= 0.0 {
            return Err(PositionError::InvalidSize(size));
        }
        if !entry_price.is_finite() {
            return Err(PositionError::InvalidPrice(entry_price));
        }
        if let Some(stop_loss) = stop_loss {
            if !stop_loss.is_finite() {
                return Err(PositionError::InvalidPrice(stop_loss));
            }
            let on_loss_side = match side {
                PositionSide::Long => stop_loss < entry_price,
                PositionSide::Short => stop_loss > entry_price,
            };
            if !on_loss_side {
                return Err(PositionError::InvalidStopLoss {
                    side,
                    entry_price,
                    stop_loss,
                });
            }
        }
        if self.positions.contains_key(symbol) {
            return Err(PositionError::PositionAlreadyExists(symbol.to_string()));
        }

        let position = Position {
            symbol: symbol.to_string(),
            side,
            size,
            entry_price,
            stop_loss,
            current_price: None,
            unrealized_pnl: 0.0,
            entry_time: Utc::now(),
        };

        log::info!(
            "Opened {} position on {}: size {} @ {} (stop loss {:?})",
            side,
            symbol,
            size,
            entry_price,
            stop_loss
        );

        self.positions.insert(symbol.to_string(), position.clone());
        self.notify(symbol);
        Ok(position)
    }

    /// Updates the market price for `symbol`. No-op without a position.
    pub fn update_current_price(&mut self, symbol: &str, price: f64) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        position.update_pnl(price);
        self.notify(symbol);
    }

    /// Moves the stop loss. No-op without a position.
    ///
    /// Unlike [`open_position`](Self::open_position) no side check is made:
    /// a stop can be trailed past entry once the trade is in profit.
    pub fn update_stop_loss(&mut self, symbol: &str, stop_loss: Option<f64>) {
        let Some(position) = self.positions.get_mut(symbol) else {
            return;
        };
        position.stop_loss = stop_loss;
        log::debug!("Stop loss for {} set to {:?}", symbol, stop_loss);
        self.notify(symbol);
    }

    /// Removes and returns the position for `symbol`, if any.
    pub fn close_position(&mut self, symbol: &str) -> Option<Position> {
        let closed = self.positions.remove(symbol)?;
        log::info!(
            "Closed {} position on {} with P&L {:.2}",
            closed.side,
            symbol,
            closed.unrealized_pnl
        );
        self.notify(symbol);
        Some(closed)
    }

    /// Whether the position for `symbol` has hit its stop loss.
    pub fn is_stop_loss_breached(&self, symbol: &str) -> bool {
        self.positions
            .get(symbol)
            .map(Position::is_stop_loss_breached)
            .unwrap_or(false)
    }

    pub fn get_position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    fn notify(&self, symbol: &str) {
        let position = self.positions.get(symbol);
        for subscriber in &self.subscribers {
            subscriber(symbol, position);
        }
    }
}

impl fmt::Debug for PositionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PositionTracker")
            .field("positions", &self.positions)
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}
