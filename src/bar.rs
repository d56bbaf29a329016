//! OHLC bar model, wire timestamp handling and timeframe resampling.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single OHLC candle.
///
/// On the wire the timestamp is accepted under either `time` or `timestamp`
/// and is always written back as `time` in RFC 3339 form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    /// Bar open time
    #[serde(alias = "timestamp", with = "iso_time")]
    pub time: DateTime<Utc>,
    /// Opening price
    pub open: f64,
    /// Highest price
    pub high: f64,
    /// Lowest price
    pub low: f64,
    /// Closing price
    pub close: f64,
}

impl Bar {
    /// Creates a new Bar. No validation is performed; see [`Bar::validate`].
    pub fn new(time: DateTime<Utc>, open: f64, high: f64, low: f64, close: f64) -> Self {
        Bar {
            time,
            open,
            high,
            low,
            close,
        }
    }

    /// Checks that all prices are finite and that
    /// `low <= min(open, close) <= max(open, close) <= high`.
    pub fn validate(&self) -> Result<(), BarError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite()) {
            return Err(BarError::NonFinitePrice(self.time));
        }

        let body_low = self.open.min(self.close);
        let body_high = self.open.max(self.close);
        if self.low > body_low || body_high > self.high {
            return Err(BarError::InconsistentRange(self.time));
        }

        Ok(())
    }
}

/// Errors raised while validating or parsing bar data.
#[derive(Debug, Clone, PartialEq)]
pub enum BarError {
    /// One of the prices is NaN or infinite
    NonFinitePrice(DateTime<Utc>),
    /// High/low do not bracket open and close
    InconsistentRange(DateTime<Utc>),
    /// Timestamp string could not be parsed
    InvalidTimestamp(String),
    /// Unknown timeframe identifier
    UnknownTimeframe(String),
}

impl fmt::Display for BarError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BarError::NonFinitePrice(time) => {
                write!(f, "Bar at {} has a non-finite price", time.to_rfc3339())
            }
            BarError::InconsistentRange(time) => write!(
                f,
                "Bar at {} violates low <= open/close <= high",
                time.to_rfc3339()
            ),
            BarError::InvalidTimestamp(raw) => write!(f, "Invalid timestamp: {}", raw),
            BarError::UnknownTimeframe(raw) => write!(
                f,
                "Timeframe '{}' not supported. Available: {}",
                raw,
                Timeframe::all()
                    .iter()
                    .map(|tf| tf.as_str())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }
    }
}

impl std::error::Error for BarError {}

/// Parses an ISO-8601 timestamp into UTC.
///
/// Accepts RFC 3339 (`2024-01-02T10:00:00Z`, `+00:00` offsets), the
/// space-separated form with an offset, naive date-times (interpreted as UTC)
/// and bare dates (midnight UTC).
pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, BarError> {
    let raw = raw.trim();

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f%:z") {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Ok(naive.and_utc());
        }
    }

    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(naive.and_utc());
        }
    }

    Err(BarError::InvalidTimestamp(raw.to_string()))
}

/// Serde adapter writing RFC 3339 and reading anything [`parse_timestamp`] accepts.
pub mod iso_time {
    use super::parse_timestamp;
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(time: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&time.to_rfc3339())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        parse_timestamp(&raw).map_err(serde::de::Error::custom)
    }
}

/// Supported bar intervals. Source data is stored at one hour; larger
/// timeframes are produced by [`resample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1mo")]
    OneMonth,
}

impl Timeframe {
    /// All timeframes, smallest first.
    pub fn all() -> &'static [Timeframe] {
        &[
            Timeframe::OneHour,
            Timeframe::TwoHours,
            Timeframe::FourHours,
            Timeframe::OneDay,
            Timeframe::OneWeek,
            Timeframe::OneMonth,
        ]
    }

    /// Wire identifier (`"1h"`, `"1d"`, ...).
    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::OneHour => "1h",
            Timeframe::TwoHours => "2h",
            Timeframe::FourHours => "4h",
            Timeframe::OneDay => "1d",
            Timeframe::OneWeek => "1w",
            Timeframe::OneMonth => "1mo",
        }
    }

    /// Human readable label.
    pub fn label(&self) -> &'static str {
        match self {
            Timeframe::OneHour => "1 Hour",
            Timeframe::TwoHours => "2 Hours",
            Timeframe::FourHours => "4 Hours",
            Timeframe::OneDay => "1 Day",
            Timeframe::OneWeek => "1 Week",
            Timeframe::OneMonth => "1 Month",
        }
    }

    /// Number of base (one hour) bars per bar of this timeframe.
    pub fn hours(&self) -> i64 {
        match self {
            Timeframe::OneHour => 1,
            Timeframe::TwoHours => 2,
            Timeframe::FourHours => 4,
            Timeframe::OneDay => 24,
            Timeframe::OneWeek => 168,
            Timeframe::OneMonth => 720,
        }
    }

    /// Bucket length in seconds.
    pub fn seconds(&self) -> i64 {
        self.hours() * 3600
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = BarError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_lowercase();
        Timeframe::all()
            .iter()
            .copied()
            .find(|tf| tf.as_str() == lowered)
            .ok_or_else(|| BarError::UnknownTimeframe(s.to_string()))
    }
}

/// Aggregates time-ordered one hour bars into `timeframe` buckets.
///
/// Buckets start at midnight UTC of the first bar's day and are
/// `timeframe` long. Each output bar takes the first open, the highest high,
/// the lowest low and the last close of its bucket, and is stamped with the
/// bucket start. Empty buckets produce no bar.
pub fn resample(bars: &[Bar], timeframe: Timeframe) -> Vec<Bar> {
    if timeframe == Timeframe::OneHour {
        return bars.to_vec();
    }
    let Some(first) = bars.first() else {
        return Vec::new();
    };

    let bucket_secs = timeframe.seconds();
    let origin = first.time.timestamp().div_euclid(86_400) * 86_400;
    let mut out: Vec<Bar> = Vec::new();
    let mut current_bucket: Option<i64> = None;

    for bar in bars {
        let offset = bar.time.timestamp() - origin;
        let bucket = origin + offset.div_euclid(bucket_secs) * bucket_secs;

        match (current_bucket, out.last_mut()) {
            (Some(current), Some(last)) if current == bucket => {
                last.high = last.high.max(bar.high);
                last.low = last.low.min(bar.low);
                last.close = bar.close;
            }
            _ => {
                let Some(start) = DateTime::from_timestamp(bucket, 0) else {
                    log::warn!("Skipping bar with out-of-range bucket {}", bucket);
                    continue;
                };
                out.push(Bar::new(start, bar.open, bar.high, bar.low, bar.close));
                current_bucket = Some(bucket);
            }
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn hourly(hour: u32, open: f64, high: f64, low: f64, close: f64) -> Bar {
        Bar::new(
            Utc.with_ymd_and_hms(2024, 1, 2, hour, 0, 0).unwrap(),
            open,
            high,
            low,
            close,
        )
    }

    #[test]
    fn test_validate_accepts_consistent_bar() {
        let bar = hourly(0, 100.0, 105.0, 98.0, 102.0);
        assert!(bar.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_high_below_close() {
        let bar = hourly(0, 100.0, 101.0, 98.0, 102.0);
        assert!(matches!(
            bar.validate(),
            Err(BarError::InconsistentRange(_))
        ));
    }

    #[test]
    fn test_validate_rejects_nan() {
        let bar = hourly(0, f64::NAN, 101.0, 98.0, 100.0);
        assert!(matches!(bar.validate(), Err(BarError::NonFinitePrice(_))));
    }

    #[test]
    fn test_parse_timestamp_variants() {
        let expected = Utc.with_ymd_and_hms(2024, 3, 1, 14, 0, 0).unwrap();
        assert_eq!(parse_timestamp("2024-03-01T14:00:00Z").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T14:00:00+00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01 14:00:00+00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01T14:00:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-03-01 14:00:00").unwrap(), expected);
        assert_eq!(
            parse_timestamp("2024-03-01").unwrap(),
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
        );
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_bar_deserializes_time_or_timestamp() {
        let with_time: Bar = serde_json::from_str(
            r#"{"time":"2024-01-02T10:00:00","open":1.0,"high":2.0,"low":0.5,"close":1.5}"#,
        )
        .unwrap();
        let with_timestamp: Bar = serde_json::from_str(
            r#"{"timestamp":"2024-01-02T10:00:00+00:00","open":1.0,"high":2.0,"low":0.5,"close":1.5}"#,
        )
        .unwrap();
        assert_eq!(with_time, with_timestamp);

        let json = serde_json::to_value(with_time).unwrap();
        assert_eq!(json["time"], "2024-01-02T10:00:00+00:00");
    }

    #[test]
    fn test_timeframe_parse_and_display() {
        assert_eq!("4h".parse::<Timeframe>().unwrap(), Timeframe::FourHours);
        assert_eq!("1D".parse::<Timeframe>().unwrap(), Timeframe::OneDay);
        assert_eq!(Timeframe::OneMonth.to_string(), "1mo");
        assert!("3h".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_resample_four_hours() {
        let bars = vec![
            hourly(0, 10.0, 12.0, 9.0, 11.0),
            hourly(1, 11.0, 15.0, 10.0, 14.0),
            hourly(2, 14.0, 14.5, 8.0, 9.0),
            hourly(3, 9.0, 10.0, 8.5, 9.5),
            hourly(4, 9.5, 11.0, 9.0, 10.5),
        ];

        let resampled = resample(&bars, Timeframe::FourHours);
        assert_eq!(resampled.len(), 2);

        let first = resampled[0];
        assert_eq!(first.time, Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap());
        assert_eq!(first.open, 10.0);
        assert_eq!(first.high, 15.0);
        assert_eq!(first.low, 8.0);
        assert_eq!(first.close, 9.5);

        assert_eq!(resampled[1].time, Utc.with_ymd_and_hms(2024, 1, 2, 4, 0, 0).unwrap());
        assert_eq!(resampled[1].close, 10.5);
    }

    #[test]
    fn test_resample_weeks_start_on_first_day() {
        // 2024-01-03 is a Wednesday
        let start = Utc.with_ymd_and_hms(2024, 1, 3, 5, 0, 0).unwrap();
        let bars: Vec<Bar> = (0..(8 * 24))
            .map(|h| {
                let close = 100.0 + h as f64;
                Bar::new(
                    start + chrono::Duration::hours(h),
                    close,
                    close + 1.0,
                    close - 1.0,
                    close,
                )
            })
            .collect();

        let weekly = resample(&bars, Timeframe::OneWeek);
        assert_eq!(weekly.len(), 2);
        assert_eq!(weekly[0].time, Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap());
        assert_eq!(weekly[1].time, Utc.with_ymd_and_hms(2024, 1, 10, 0, 0, 0).unwrap());
        assert_eq!(weekly[0].open, 100.0);
        // 7 * 24 - 5 hours land in the first week
        assert_eq!(weekly[1].open, 100.0 + 163.0);

        let monthly = resample(&bars, Timeframe::OneMonth);
        assert_eq!(monthly.len(), 1);
        assert_eq!(monthly[0].time, weekly[0].time);
    }

    #[test]
    fn test_resample_one_hour_is_identity() {
        let bars = vec![hourly(0, 1.0, 2.0, 0.5, 1.5), hourly(1, 1.5, 2.5, 1.0, 2.0)];
        assert_eq!(resample(&bars, Timeframe::OneHour), bars);
    }
}
