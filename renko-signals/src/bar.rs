//! OHLC bars, candle intervals and the historical candle row wire format.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, TimeDelta, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::Error as DeError};
use serde_json::Value;

const MINUTE_MS: i64 = 60_000;

/// Candle timeframe maintained per instrument.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Interval {
    #[serde(alias = "1minute")]
    Minute,
    #[serde(alias = "days")]
    Day,
    #[serde(alias = "weeks")]
    Week,
}

impl Interval {
    pub const ALL: [Interval; 3] = [Interval::Minute, Interval::Day, Interval::Week];

    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Minute => "minute",
            Interval::Day => "day",
            Interval::Week => "week",
        }
    }

    /// Start of the candle bucket containing `time`.
    ///
    /// Minute buckets are plain epoch arithmetic. Day and week buckets start at local midnight
    /// (week buckets on Monday) in the exchange timezone `offset`.
    pub fn bucket_start(&self, time: DateTime<Utc>, offset: FixedOffset) -> DateTime<Utc> {
        match self {
            Interval::Minute => {
                let millis = time.timestamp_millis().div_euclid(MINUTE_MS) * MINUTE_MS;
                DateTime::from_timestamp_millis(millis).unwrap_or(time)
            }
            Interval::Day => local_midnight(time, offset, 0),
            Interval::Week => {
                let local = time.with_timezone(&offset);
                let days_since_monday = local.weekday().num_days_from_monday();
                local_midnight(time, offset, i64::from(days_since_monday))
            }
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

fn local_midnight(time: DateTime<Utc>, offset: FixedOffset, days_back: i64) -> DateTime<Utc> {
    let local_date = time.with_timezone(&offset).date_naive();
    let local_midnight = local_date.and_time(NaiveTime::MIN) - TimeDelta::days(days_back);
    (local_midnight - TimeDelta::seconds(i64::from(offset.local_minus_utc()))).and_utc()
}

/// OHLC record. Volume is carried through from the data source but unused downstream.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct Bar {
    pub time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
}

impl Bar {
    /// Fresh candle opened by a single tick.
    pub fn from_price(time: DateTime<Utc>, price: f64) -> Self {
        Self {
            time,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: None,
        }
    }

    /// `(open + high + low + close) / 4`
    pub fn four_point_average(&self) -> f64 {
        (self.open + self.high + self.low + self.close) / 4.0
    }

    /// Apply a tick to this candle in place.
    pub fn apply(&mut self, price: f64) {
        self.high = self.high.max(price);
        self.low = self.low.min(price);
        self.close = price;
    }

    /// Merge consecutive bars (oldest-first) into one candle stamped with `time`.
    ///
    /// Returns `None` for an empty slice.
    pub fn roll_up(bars: &[Bar], time: DateTime<Utc>) -> Option<Bar> {
        let first = bars.first()?;
        let mut rolled = Bar {
            time,
            open: first.open,
            high: first.high,
            low: first.low,
            close: first.close,
            volume: first.volume,
        };

        for bar in &bars[1..] {
            rolled.high = rolled.high.max(bar.high);
            rolled.low = rolled.low.min(bar.low);
            rolled.close = bar.close;
            rolled.volume = match (rolled.volume, bar.volume) {
                (Some(acc), Some(volume)) => Some(acc + volume),
                (acc, volume) => acc.or(volume),
            };
        }

        Some(rolled)
    }
}

/// Historical candle as delivered by the market data REST API:
/// `[time, open, high, low, close, volume, open_interest]`.
///
/// ### Raw Payload Examples
///```json
/// ["2025-01-10T09:15:00+05:30", 1291.5, 1294.0, 1288.1, 1290.0, 184320, 0]
/// [1736480700000, 1291.5, 1294.0, 1288.1, 1290.0]
/// ```
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct CandleRow(pub Bar);

impl<'de> Deserialize<'de> for CandleRow {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;
        let row = value
            .as_array()
            .ok_or_else(|| D::Error::custom("candle row must be an array"))?;

        if row.len() < 5 {
            return Err(D::Error::custom(format!(
                "candle row requires [time, open, high, low, close], got {} fields",
                row.len()
            )));
        }

        let time = match &row[0] {
            Value::String(time) => DateTime::parse_from_rfc3339(time)
                .map_err(D::Error::custom)?
                .with_timezone(&Utc),
            Value::Number(millis) => millis
                .as_i64()
                .and_then(DateTime::from_timestamp_millis)
                .ok_or_else(|| D::Error::custom("candle row time is not epoch millis"))?,
            other => {
                return Err(D::Error::custom(format!(
                    "candle row time must be a string or number, got {other}"
                )));
            }
        };

        let price = |index: usize| -> Result<f64, D::Error> {
            row[index].as_f64().ok_or_else(|| {
                D::Error::custom(format!("candle row field {index} is not a number"))
            })
        };

        Ok(CandleRow(Bar {
            time,
            open: price(1)?,
            high: price(2)?,
            low: price(3)?,
            close: price(4)?,
            volume: row.get(5).and_then(Value::as_f64),
        }))
    }
}

impl From<CandleRow> for Bar {
    fn from(row: CandleRow) -> Self {
        row.0
    }
}
