//! Fixed-size Renko brick aggregation.
//!
//! A [`BrickSeries`] quantises a price stream into bricks of a constant `brick_size`, stored
//! newest-first. The brick size is derived once from the bulk history and stays frozen until
//! the next full reload.

use crate::bar::Bar;
use serde::Serialize;
use std::collections::VecDeque;

/// Maximum number of bricks retained per instrument.
pub const MAX_BRICKS: usize = 3750;

/// Upper bound on bricks emitted by a single price move.
pub const MAX_BRICKS_PER_MOVE: usize = 1000;

/// Brick size as a fraction of the average price.
pub const BRICK_SIZE_RATIO: f64 = 0.001;

/// Brick sizes are rounded to the nearest 1 / `PRICE_STEPS` (ie/ 0.05).
const PRICE_STEPS: f64 = 20.0;

/// Bricks emitted when price moves from `prev` to `price`, ordered in the direction of travel
/// (oldest first).
///
/// A non-finite move or a non-positive brick size yields no bricks.
pub fn renko_steps(prev: f64, price: f64, brick_size: f64) -> Vec<f64> {
    let diff = price - prev;
    if !diff.is_finite() || !brick_size.is_finite() || brick_size <= 0.0 {
        return Vec::new();
    }

    let direction = if diff >= 0.0 { 1.0 } else { -1.0 };
    let count = ((diff.abs() / brick_size).floor() as usize).min(MAX_BRICKS_PER_MOVE);

    (1..=count)
        .map(|step| prev + direction * step as f64 * brick_size)
        .collect()
}

/// Brick size for the first `lookback` bars: 0.1% of the mean four-point average, rounded to
/// the nearest 0.05.
///
/// Returns `None` if fewer than `lookback` bars are available.
pub fn brick_size(bars: &[Bar], lookback: usize) -> Option<f64> {
    if lookback == 0 || bars.len() < lookback {
        return None;
    }

    let avg_price = bars[..lookback]
        .iter()
        .map(Bar::four_point_average)
        .sum::<f64>()
        / lookback as f64;

    Some((avg_price * BRICK_SIZE_RATIO * PRICE_STEPS).round() / PRICE_STEPS)
}

/// Newest-first brick history with a frozen brick size.
#[derive(Clone, PartialEq, Debug, Default, Serialize)]
pub struct BrickSeries {
    bricks: VecDeque<f64>,
    brick_size: f64,
}

impl BrickSeries {
    /// Build the brick history from `bars` ordered oldest to newest, using the first `lookback`
    /// bars.
    ///
    /// Returns an empty series with a zero brick size when history is insufficient or the
    /// derived brick size is not positive.
    pub fn build(bars: &[Bar], lookback: usize) -> Self {
        let brick_size = match brick_size(bars, lookback) {
            Some(size) if size.is_finite() && size > 0.0 => size,
            _ => return Self::default(),
        };

        let mut accumulated = VecDeque::with_capacity(MAX_BRICKS);
        let mut reference = bars[0].close;

        for bar in &bars[..lookback] {
            let steps = renko_steps(reference, bar.close, brick_size);
            if let Some(last) = steps.last() {
                reference = *last;
            }
            accumulated.extend(steps);

            if accumulated.len() > MAX_BRICKS {
                accumulated.drain(..accumulated.len() - MAX_BRICKS);
            }
        }

        // Stored newest-first
        let bricks = accumulated.into_iter().rev().collect();

        Self { bricks, brick_size }
    }

    /// Series from explicit newest-first bricks, eg/ restored from a snapshot.
    pub fn from_newest_first(bricks: impl IntoIterator<Item = f64>, brick_size: f64) -> Self {
        let mut bricks: VecDeque<f64> = bricks.into_iter().collect();
        bricks.truncate(MAX_BRICKS);
        Self { bricks, brick_size }
    }

    /// Step the series towards `price` from the newest brick, returning the number of bricks
    /// added.
    ///
    /// No-op on an unseeded series.
    pub fn push_price(&mut self, price: f64) -> usize {
        if !self.is_seeded() {
            return 0;
        }
        let Some(&newest) = self.bricks.front() else {
            return 0;
        };

        let steps = renko_steps(newest, price, self.brick_size);
        for brick in &steps {
            self.bricks.push_front(*brick);
        }
        self.bricks.truncate(MAX_BRICKS);

        steps.len()
    }

    /// Bricks and a positive brick size are present.
    pub fn is_seeded(&self) -> bool {
        self.brick_size > 0.0 && !self.bricks.is_empty()
    }

    pub fn brick_size(&self) -> f64 {
        self.brick_size
    }

    pub fn newest(&self) -> Option<f64> {
        self.bricks.front().copied()
    }

    pub fn len(&self) -> usize {
        self.bricks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bricks.is_empty()
    }

    /// Contiguous newest-first view of the bricks.
    pub fn as_slice(&mut self) -> &[f64] {
        self.bricks.make_contiguous()
    }

    pub fn iter(&self) -> impl Iterator<Item = &f64> {
        self.bricks.iter()
    }
}
