use crate::{bar::Interval, error::EngineError};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete engine configuration, deserialised from the JSON settings document.
///
/// ### Raw Payload Examples
/// ```json
/// {
///   "entryConditions": {
///     "day_atr_entry_multiplier": 1.0,
///     "week_rsi_entry_threshold": 60,
///     "day_rsi_entry_threshold": 60,
///     "min_rsi_entry_threshold": 60,
///     "pev_min_rsi_entry_threshold_look_back": 16
///   },
///   "strategyInputs": {
///     "brick_size": 0.1,
///     "dc_low_lbp": 0,
///     "time_frame1": { "interval": "weeks", "lbp": 7 },
///     "time_frame2": { "interval": "days", "lbp": 7 },
///     "time_frame3": { "interval": "1minute", "lbp": 7 }
///   }
/// }
/// ```
#[derive(Clone, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyConfig {
    pub entry_conditions: EntryConditions,
    pub strategy_inputs: StrategyInputs,
    #[serde(default)]
    pub indicators: IndicatorSources,
    #[serde(default)]
    pub market: MarketConfig,
    #[serde(default)]
    pub seed: SeedConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Thresholds of the BUY entry rule.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct EntryConditions {
    pub day_atr_entry_multiplier: f64,
    pub week_rsi_entry_threshold: f64,
    pub day_rsi_entry_threshold: f64,
    pub min_rsi_entry_threshold: f64,
    /// Shift of the previous-minute RSI window is this value minus one.
    #[serde(default = "default_prev_minute_look_back")]
    pub pev_min_rsi_entry_threshold_look_back: usize,
}

impl Default for EntryConditions {
    fn default() -> Self {
        Self {
            day_atr_entry_multiplier: 1.0,
            week_rsi_entry_threshold: 60.0,
            day_rsi_entry_threshold: 60.0,
            min_rsi_entry_threshold: 60.0,
            pev_min_rsi_entry_threshold_look_back: default_prev_minute_look_back(),
        }
    }
}

fn default_prev_minute_look_back() -> usize {
    16
}

/// Candle timeframes and quantisation inputs.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
pub struct StrategyInputs {
    /// Candle quantisation brick as a percent of the candle's four-point average.
    #[serde(default = "default_brick_pct")]
    pub brick_size: f64,
    /// Donchian low lookback, 0 disables the price > dcLow check.
    #[serde(default)]
    pub dc_low_lbp: usize,
    pub time_frame1: TimeFrame,
    pub time_frame2: TimeFrame,
    pub time_frame3: TimeFrame,
}

impl Default for StrategyInputs {
    fn default() -> Self {
        Self {
            brick_size: default_brick_pct(),
            dc_low_lbp: 0,
            time_frame1: TimeFrame::new(Interval::Week, 7),
            time_frame2: TimeFrame::new(Interval::Day, 7),
            time_frame3: TimeFrame::new(Interval::Minute, 7),
        }
    }
}

fn default_brick_pct() -> f64 {
    0.1
}

impl StrategyInputs {
    pub fn time_frames(&self) -> [TimeFrame; 3] {
        [self.time_frame1, self.time_frame2, self.time_frame3]
    }

    /// Configured timeframe for `interval`, if any.
    pub fn time_frame(&self, interval: Interval) -> Option<TimeFrame> {
        self.time_frames()
            .into_iter()
            .find(|time_frame| time_frame.interval == interval)
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
pub struct TimeFrame {
    pub interval: Interval,
    pub lbp: usize,
}

impl TimeFrame {
    pub fn new(interval: Interval, lbp: usize) -> Self {
        Self { interval, lbp }
    }
}

/// Where an RSI reading is computed from.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum RsiSource {
    /// The newest `window` renko bricks.
    Bricks { window: usize },
    /// Quantised closes of the newest `lbp` candles of the timeframe with this interval.
    Candles { interval: Interval },
    Disabled,
}

/// Where the day ATR is computed from.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum AtrSource {
    /// Mean range of full batches of `batch_size` bricks.
    Bricks { batch_size: usize },
    /// Classic true range over the newest `lbp` candles of the timeframe with this interval.
    Candles { interval: Interval },
    Disabled,
}

/// Indicator sources. The previous-minute RSI always follows `minute_rsi`.
#[derive(Clone, Copy, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct IndicatorSources {
    pub week_rsi: RsiSource,
    pub day_rsi: RsiSource,
    pub minute_rsi: RsiSource,
    pub day_atr: AtrSource,
    /// Candle interval the Donchian low is taken over.
    pub dc_low_interval: Interval,
    /// Minute bars requested to build the brick history.
    pub brick_history_bars: usize,
}

impl Default for IndicatorSources {
    fn default() -> Self {
        Self {
            week_rsi: RsiSource::Candles {
                interval: Interval::Week,
            },
            day_rsi: RsiSource::Bricks { window: 376 },
            minute_rsi: RsiSource::Bricks { window: 16 },
            day_atr: AtrSource::Bricks { batch_size: 376 },
            dc_low_interval: Interval::Minute,
            brick_history_bars: 3750,
        }
    }
}

impl IndicatorSources {
    fn rsi_sources(&self) -> [(&'static str, RsiSource); 3] {
        [
            ("week_rsi", self.week_rsi),
            ("day_rsi", self.day_rsi),
            ("minute_rsi", self.minute_rsi),
        ]
    }

    /// Any indicator reads the brick history.
    pub fn uses_bricks(&self) -> bool {
        self.rsi_sources()
            .iter()
            .any(|(_, source)| matches!(source, RsiSource::Bricks { .. }))
            || matches!(self.day_atr, AtrSource::Bricks { .. })
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Exchange timezone used for day and week buckets and the trading day.
    pub utc_offset_minutes: i32,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 330,
        }
    }
}

impl MarketConfig {
    pub fn offset(&self) -> Result<FixedOffset, EngineError> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .ok_or_else(|| {
                EngineError::Config(format!(
                    "market.utc_offset_minutes out of range: {}",
                    self.utc_offset_minutes
                ))
            })
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SeedConfig {
    /// Sleep after this many instruments, 0 never sleeps.
    pub throttle_every: usize,
    pub throttle_delay_ms: u64,
}

impl Default for SeedConfig {
    fn default() -> Self {
        Self {
            throttle_every: 10,
            throttle_delay_ms: 1200,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub max_buffered_ticks: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_buffered_ticks: 1024,
        }
    }
}

#[derive(Clone, Copy, Eq, PartialEq, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay_ms: 500,
        }
    }
}

/// Largest accepted candle lookback, Donchian lookback or previous-minute look back.
pub const MAX_LOOKBACK: usize = 100_000;

impl StrategyConfig {
    /// Read, parse and validate the configuration file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, EngineError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|error| {
            EngineError::Config(format!("failed to read {}: {error}", path.display()))
        })?;

        Self::from_json(&contents).map_err(|error| match error {
            EngineError::Config(message) => {
                EngineError::Config(format!("{}: {message}", path.display()))
            }
            other => other,
        })
    }

    /// Parse and validate a JSON configuration document.
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        let config = serde_json::from_str::<Self>(json)
            .map_err(|error| EngineError::Config(error.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration is internally consistent.
    pub fn validate(&self) -> Result<(), EngineError> {
        let conditions = &self.entry_conditions;
        for (name, value) in [
            ("day_atr_entry_multiplier", conditions.day_atr_entry_multiplier),
            ("week_rsi_entry_threshold", conditions.week_rsi_entry_threshold),
            ("day_rsi_entry_threshold", conditions.day_rsi_entry_threshold),
            ("min_rsi_entry_threshold", conditions.min_rsi_entry_threshold),
        ] {
            if !value.is_finite() {
                return Err(EngineError::Config(format!("{name} must be finite")));
            }
        }

        if conditions.pev_min_rsi_entry_threshold_look_back == 0 {
            return Err(EngineError::Config(
                "pev_min_rsi_entry_threshold_look_back must be >= 1".to_string(),
            ));
        }

        for (name, value) in [
            (
                "pev_min_rsi_entry_threshold_look_back",
                conditions.pev_min_rsi_entry_threshold_look_back,
            ),
            ("dc_low_lbp", self.strategy_inputs.dc_low_lbp),
        ] {
            if value > MAX_LOOKBACK {
                return Err(EngineError::Config(format!(
                    "{name} must be <= {MAX_LOOKBACK}"
                )));
            }
        }

        let time_frames = self.strategy_inputs.time_frames();
        for (index, time_frame) in time_frames.iter().enumerate() {
            if !(2..=MAX_LOOKBACK).contains(&time_frame.lbp) {
                return Err(EngineError::Config(format!(
                    "time_frame{}.lbp must be in 2..={MAX_LOOKBACK}",
                    index + 1
                )));
            }
            if time_frames[..index]
                .iter()
                .any(|other| other.interval == time_frame.interval)
            {
                return Err(EngineError::Config(format!(
                    "time_frame{} repeats interval {}",
                    index + 1,
                    time_frame.interval
                )));
            }
        }

        for (name, source) in self.indicators.rsi_sources() {
            match source {
                RsiSource::Bricks { window } if window < 2 => {
                    return Err(EngineError::Config(format!("{name} window must be > 1")));
                }
                RsiSource::Candles { interval } => {
                    self.require_time_frame(name, interval)?;
                    let brick_pct = self.strategy_inputs.brick_size;
                    if !brick_pct.is_finite() || brick_pct <= 0.0 {
                        return Err(EngineError::Config(
                            "brick_size must be > 0 for candle RSI".to_string(),
                        ));
                    }
                }
                _ => {}
            }
        }

        match self.indicators.day_atr {
            AtrSource::Bricks { batch_size: 0 } => {
                return Err(EngineError::Config(
                    "day_atr batch_size must be > 0".to_string(),
                ));
            }
            AtrSource::Candles { interval } => self.require_time_frame("day_atr", interval)?,
            _ => {}
        }

        self.market.offset()?;

        Ok(())
    }

    fn require_time_frame(&self, name: &str, interval: Interval) -> Result<(), EngineError> {
        match self.strategy_inputs.time_frame(interval) {
            Some(_) => Ok(()),
            None => Err(EngineError::Config(format!(
                "{name} reads {interval} candles but no time_frame uses that interval"
            ))),
        }
    }

    /// Window shift of the previous-minute RSI.
    pub fn prev_minute_offset(&self) -> usize {
        self.entry_conditions
            .pev_min_rsi_entry_threshold_look_back
            .saturating_sub(1)
    }

    /// Lookback of the timeframe with `interval`.
    pub fn lbp(&self, interval: Interval) -> Option<usize> {
        self.strategy_inputs
            .time_frame(interval)
            .map(|time_frame| time_frame.lbp)
    }

    /// Candles retained per instrument for `interval`.
    pub fn candle_capacity(&self, interval: Interval) -> usize {
        let mut capacity = self.lbp(interval).map_or(2, |lbp| lbp.saturating_add(1));

        if let RsiSource::Candles { interval: source } = self.indicators.minute_rsi {
            if source == interval {
                let lbp = self.lbp(interval).unwrap_or_default();
                capacity = capacity.max(
                    self.prev_minute_offset()
                        .saturating_add(lbp)
                        .saturating_add(1),
                );
            }
        }

        if self.indicators.dc_low_interval == interval {
            capacity = capacity.max(self.strategy_inputs.dc_low_lbp.saturating_mul(2));
        }

        capacity.max(2)
    }

    /// Historical bars requested per instrument for `interval`.
    pub fn history_lookback(&self, interval: Interval) -> usize {
        let capacity = self.candle_capacity(interval);
        match interval {
            Interval::Minute if self.indicators.uses_bricks() => {
                capacity.max(self.indicators.brick_history_bars)
            }
            _ => capacity,
        }
    }
}
