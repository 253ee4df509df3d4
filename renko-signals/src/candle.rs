//! Rolling OHLC candles per timeframe built from live ticks.
//!
//! Uses tick timestamps (not wall clock) for bucket boundaries so replayed or buffered ticks
//! land in the candle they belong to.

use crate::bar::{Bar, Interval};
use chrono::{DateTime, FixedOffset, Utc};
use serde::Serialize;
use std::collections::VecDeque;

/// What a tick did to a [`CandleSeries`].
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CandleUpdate {
    /// Tick opened a new candle at the head of the series.
    Opened,
    /// Tick updated the newest candle in place.
    Updated,
    /// Tick was ignored (non-finite or non-positive price).
    Ignored,
}

/// Newest-first candle history for one [`Interval`].
#[derive(Clone, PartialEq, Debug, Serialize)]
pub struct CandleSeries {
    interval: Interval,
    candles: VecDeque<Bar>,
    capacity: usize,
}

impl CandleSeries {
    pub fn new(interval: Interval, capacity: usize) -> Self {
        Self {
            interval,
            candles: VecDeque::with_capacity(capacity.min(4096)),
            capacity: capacity.max(1),
        }
    }

    /// Replace the history with `bars` ordered oldest to newest.
    pub fn seed(&mut self, bars: impl IntoIterator<Item = Bar>) {
        self.candles.clear();
        for bar in bars {
            self.push_newest(bar);
        }
    }

    /// Prepend a candle as the newest, evicting the oldest beyond capacity.
    pub fn push_newest(&mut self, bar: Bar) {
        self.candles.push_front(bar);
        self.candles.truncate(self.capacity);
    }

    /// Apply a tick at `time` to the series.
    ///
    /// Opens `(bucket, p, p, p, p)` when the newest candle belongs to a different bucket,
    /// otherwise updates its high, low and close.
    pub fn update(&mut self, price: f64, time: DateTime<Utc>, offset: FixedOffset) -> CandleUpdate {
        if !price.is_finite() || price <= 0.0 {
            return CandleUpdate::Ignored;
        }

        let bucket = self.interval.bucket_start(time, offset);

        match self.candles.front_mut() {
            Some(newest) if newest.time == bucket => {
                newest.apply(price);
                CandleUpdate::Updated
            }
            _ => {
                self.push_newest(Bar::from_price(bucket, price));
                CandleUpdate::Opened
            }
        }
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn newest(&self) -> Option<&Bar> {
        self.candles.front()
    }

    pub fn get(&self, index: usize) -> Option<&Bar> {
        self.candles.get(index)
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    /// Contiguous newest-first view of the candles.
    pub fn as_slice(&mut self) -> &[Bar] {
        self.candles.make_contiguous()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bar> {
        self.candles.iter()
    }

    /// Newest-first closes.
    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|bar| bar.close).collect()
    }

    /// Newest-first lows.
    pub fn lows(&self) -> Vec<f64> {
        self.candles.iter().map(|bar| bar.low).collect()
    }
}
