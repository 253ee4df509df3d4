//! Oscillators and volatility measures over newest-first brick and candle windows.
//!
//! Every indicator returns `None` when the history is too short to compute it.

use crate::bar::Bar;
use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

/// Round to 2 decimal places.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Relative strength of `series[offset..offset + window]`, where index 0 is the most recent.
///
/// `avg_loss == 0` yields 100. Needs `window >= 2` and `offset + window` elements.
pub fn rsi(series: &[f64], offset: usize, window: usize) -> Option<f64> {
    if window < 2 {
        return None;
    }
    let sample = series.get(offset..offset.checked_add(window)?)?;

    let (gains, losses) = sample
        .iter()
        .tuple_windows()
        .fold((0.0, 0.0), |(gains, losses), (newer, older)| {
            let change = newer - older;
            if change > 0.0 {
                (gains + change, losses)
            } else {
                (gains, losses + change.abs())
            }
        });

    let period = (window - 1) as f64;
    let avg_gain = gains / period;
    let avg_loss = losses / period;

    if avg_loss == 0.0 {
        return Some(100.0);
    }

    let relative_strength = avg_gain / avg_loss;
    Some(round2(100.0 - 100.0 / (1.0 + relative_strength)))
}

/// Quantise candle closes into renko levels using a per-candle brick of `brick_pct` percent of
/// the candle's four-point average, rounded to the nearest 0.05.
///
/// The first level snaps the close down to a brick multiple. Subsequent levels move by whole
/// bricks once the close is at least one brick away. Candles whose brick rounds to zero leave
/// the level unchanged.
pub fn quantise_closes(candles: &[Bar], brick_pct: f64) -> Vec<f64> {
    let mut levels = Vec::with_capacity(candles.len());
    let mut level: Option<f64> = None;

    for candle in candles {
        let brick = (round2(candle.four_point_average() * brick_pct / 100.0) * 20.0).round() / 20.0;

        if brick.is_finite() && brick > 0.0 {
            level = match level {
                None if candle.close.abs() >= brick => Some((candle.close / brick).floor() * brick),
                Some(current) if (candle.close - current).abs() >= brick => {
                    Some(current + ((candle.close - current) / brick).floor() * brick)
                }
                unchanged => unchanged,
            };
        }

        if let Some(level) = level {
            levels.push(level);
        }
    }

    levels
}

/// RSI over renko levels quantised from `candles[offset..offset + window]` (newest-first).
pub fn candle_rsi(candles: &[Bar], offset: usize, window: usize, brick_pct: f64) -> Option<f64> {
    if window < 2 {
        return None;
    }
    let sample = candles.get(offset..offset.checked_add(window)?)?;
    let levels = quantise_closes(sample, brick_pct);

    rsi(&levels, 0, levels.len())
}

/// Volatility as a percent of `price`: mean `max - min` over consecutive full batches of
/// `batch_size` bricks.
pub fn atr_percent_bricks(bricks: &[f64], batch_size: usize, price: f64) -> Option<f64> {
    if batch_size == 0 || !price.is_finite() || price <= 0.0 {
        return None;
    }

    let ranges = bricks
        .chunks_exact(batch_size)
        .filter_map(|batch| match batch.iter().minmax_by(|a, b| a.total_cmp(b)) {
            MinMaxResult::MinMax(min, max) => Some(max - min),
            MinMaxResult::OneElement(_) => Some(0.0),
            MinMaxResult::NoElements => None,
        })
        .collect::<Vec<_>>();

    if ranges.is_empty() {
        return None;
    }

    let atr = ranges.iter().sum::<f64>() / ranges.len() as f64;
    Some(round2(atr / price * 100.0))
}

/// Classic average true range over the newest `lbp` candles as a percent of `price`.
///
/// True range is `max(H - L, |H - Cprev|, |L - Cprev|)`, so `lbp + 1` candles are required.
pub fn atr_percent_candles(candles: &[Bar], lbp: usize, price: f64) -> Option<f64> {
    if lbp == 0 || candles.len() <= lbp || !price.is_finite() || price <= 0.0 {
        return None;
    }

    let sum = candles[..=lbp]
        .iter()
        .tuple_windows()
        .map(|(current, previous)| {
            (current.high - current.low)
                .max((current.high - previous.close).abs())
                .max((current.low - previous.close).abs())
        })
        .sum::<f64>();

    let atr = sum / lbp as f64;
    Some(round2(atr / price * 100.0))
}

/// Donchian low of the window preceding the most recent candles: the minimum low over indices
/// `[lbp - 1, 2 * lbp - 1]`.
pub fn dc_low(candles: &[Bar], lbp: usize) -> Option<f64> {
    let end = lbp.checked_mul(2)?;
    if lbp == 0 || candles.len() < end {
        return None;
    }

    candles[lbp - 1..end]
        .iter()
        .map(|candle| candle.low)
        .min_by(|a, b| a.total_cmp(b))
}

/// Latest indicator values for an instrument. Absent values have not been computed yet.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
pub struct IndicatorSnapshot {
    pub week_rsi: Option<f64>,
    pub day_rsi: Option<f64>,
    pub minute_rsi: Option<f64>,
    pub prev_minute_rsi: Option<f64>,
    pub day_atr: Option<f64>,
    pub dc_low: Option<f64>,
    pub change: Option<f64>,
    pub percentage: Option<f64>,
    pub atr_diff: Option<f64>,
}

impl IndicatorSnapshot {
    /// Derive the tick change, percentage change and ATR distance from `price` and
    /// `previous_close`.
    ///
    /// `percentage` uses the rounded `change`. Nothing is derived for a non-positive previous
    /// close.
    pub fn apply_tick(&mut self, price: f64, previous_close: f64, atr_multiplier: f64) {
        if !previous_close.is_finite() || previous_close <= 0.0 || !price.is_finite() {
            self.change = None;
            self.percentage = None;
            self.atr_diff = None;
            return;
        }

        let change = round2(price - previous_close);
        let percentage = round2(100.0 / previous_close * change);

        self.change = Some(change);
        self.percentage = Some(percentage);
        self.atr_diff = self
            .day_atr
            .map(|day_atr| round2(-(day_atr * atr_multiplier) - percentage));
    }
}
