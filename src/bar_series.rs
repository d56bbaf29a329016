//! Canonical time-ordered bar series backing a chart view.

use crate::bar::Bar;
use chrono::{DateTime, Utc};
use std::fmt;

/// Receiver of series mutations (the chart renderer).
///
/// `on_snapshot` means "redraw everything", `on_bar` means "update or add
/// the last candle".
pub trait ChartSink: Send {
    /// Called after the whole series was replaced.
    fn on_snapshot(&mut self, bars: &[Bar]);

    /// Called after a single bar was appended (`replaced == false`) or
    /// replaced the last bar (`replaced == true`).
    fn on_bar(&mut self, bar: &Bar, replaced: bool);
}

/// Errors raised by [`BarSeriesStore`] mutations.
#[derive(Debug, Clone, PartialEq)]
pub enum SeriesError {
    /// Bar time is earlier than the last stored bar (or not strictly
    /// increasing within a bulk set)
    OutOfOrderBar {
        time: DateTime<Utc>,
        last_time: DateTime<Utc>,
    },
}

impl fmt::Display for SeriesError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeriesError::OutOfOrderBar { time, last_time } => write!(
                f,
                "Out of order bar: {} is not after {}",
                time.to_rfc3339(),
                last_time.to_rfc3339()
            ),
        }
    }
}

impl std::error::Error for SeriesError {}

/// What [`BarSeriesStore::append_or_replace_last`] did with a bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarUpdate {
    Appended,
    Replaced,
}

/// Ordered OHLC sequence for one symbol/timeframe view.
///
/// Times are strictly increasing. Only the most recent bar may change, via
/// replace-by-timestamp.
#[derive(Default)]
pub struct BarSeriesStore {
    bars: Vec<Bar>,
    sinks: Vec<Box<dyn ChartSink>>,
}

impl BarSeriesStore {
    /// Creates an empty store with no sinks.
    pub fn new() -> Self {
        BarSeriesStore {
            bars: Vec::new(),
            sinks: Vec::new(),
        }
    }

    /// Registers a sink that receives every subsequent mutation.
    pub fn add_sink(&mut self, sink: Box<dyn ChartSink>) {
        self.sinks.push(sink);
    }

    /// Replaces the whole series.
    ///
    /// Callers sort before calling; the input must be strictly increasing in
    /// time or it is rejected and the current series is left untouched.
    /// An empty input clears the chart.
    pub fn set(&mut self, bars: Vec<Bar>) -> Result<(), SeriesError> {
        if let Some(pair) = bars.windows(2).find(|w| w[1].time <= w[0].time) {
            return Err(SeriesError::OutOfOrderBar {
                time: pair[1].time,
                last_time: pair[0].time,
            });
        }

        self.bars = bars;
        log::debug!("Series set with {} bars", self.bars.len());

        for sink in self.sinks.iter_mut() {
            sink.on_snapshot(&self.bars);
        }
        Ok(())
    }

    /// Appends `bar`, or replaces the last bar when the timestamps match.
    ///
    /// A bar older than the last stored bar is rejected with
    /// [`SeriesError::OutOfOrderBar`] and nothing changes.
    pub fn append_or_replace_last(&mut self, bar: Bar) -> Result<BarUpdate, SeriesError> {
        let update = match self.bars.last_mut() {
            Some(last) if bar.time == last.time => {
                *last = bar;
                BarUpdate::Replaced
            }
            Some(last) if bar.time < last.time => {
                log::warn!(
                    "Rejecting out of order bar {} (last is {})",
                    bar.time.to_rfc3339(),
                    last.time.to_rfc3339()
                );
                return Err(SeriesError::OutOfOrderBar {
                    time: bar.time,
                    last_time: last.time,
                });
            }
            _ => {
                self.bars.push(bar);
                BarUpdate::Appended
            }
        };

        let replaced = update == BarUpdate::Replaced;
        for sink in self.sinks.iter_mut() {
            sink.on_bar(&bar, replaced);
        }
        Ok(update)
    }

    /// Close of the most recent bar, if any.
    pub fn latest_close(&self) -> Option<f64> {
        self.bars.last().map(|bar| bar.close)
    }

    /// Most recent bar, if any.
    pub fn last(&self) -> Option<&Bar> {
        self.bars.last()
    }

    /// All stored bars, oldest first.
    pub fn bars(&self) -> &[Bar] {
        &self.bars
    }

    /// Copy of the current series, suitable for a later [`set`](Self::set).
    pub fn snapshot(&self) -> Vec<Bar> {
        self.bars.clone()
    }

    pub fn len(&self) -> usize {
        self.bars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bars.is_empty()
    }
}

impl fmt::Debug for BarSeriesStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BarSeriesStore")
            .field("len", &self.bars.len())
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

/// Test helper sink that records every notification.
#[cfg(test)]
pub(crate) mod testing {
    use super::ChartSink;
    use crate::bar::Bar;
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone, PartialEq)]
    pub enum SinkCall {
        Snapshot(usize),
        Bar { close: f64, replaced: bool },
    }

    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub calls: Arc<Mutex<Vec<SinkCall>>>,
    }

    impl RecordingSink {
        pub fn calls(&self) -> Vec<SinkCall> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl ChartSink for RecordingSink {
        fn on_snapshot(&mut self, bars: &[Bar]) {
            self.calls.lock().unwrap().push(SinkCall::Snapshot(bars.len()));
        }

        fn on_bar(&mut self, bar: &Bar, replaced: bool) {
            self.calls.lock().unwrap().push(SinkCall::Bar {
                close: bar.close,
                replaced,
            });
        }
    }
}
