use crate::{
    bar::{Bar, Interval},
    candle::CandleSeries,
    config::{AtrSource, RsiSource, StrategyConfig},
    indicator::{self, IndicatorSnapshot},
    instrument::{Instrument, InstrumentKey},
    renko::BrickSeries,
    signal::{SignalKind, SignalState},
};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize, de::Error as DeError};
use serde_json::Value;

/// Live market data tick for one instrument.
///
/// ### Raw Payload Examples
/// ```json
/// {"instrument_key": "NSE_EQ|INE155A01022", "ltp": 412.35, "cp": 418.1, "ltt": "1736481912000"}
/// ```
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct Tick {
    pub instrument_key: InstrumentKey,
    #[serde(alias = "ltp")]
    pub price: f64,
    #[serde(alias = "cp")]
    pub previous_close: f64,
    #[serde(
        alias = "ltt",
        deserialize_with = "de_epoch_millis",
        serialize_with = "chrono::serde::ts_milliseconds::serialize"
    )]
    pub time: DateTime<Utc>,
}

/// Deserialize epoch milliseconds delivered either as a JSON number or a numeric string.
fn de_epoch_millis<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let millis = match Value::deserialize(deserializer)? {
        Value::Number(number) => number
            .as_i64()
            .ok_or_else(|| D::Error::custom(format!("invalid epoch millis: {number}")))?,
        Value::String(string) => string.parse::<i64>().map_err(D::Error::custom)?,
        other => {
            return Err(D::Error::custom(format!(
                "epoch millis must be a number or string, got {other}"
            )));
        }
    };

    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| D::Error::custom(format!("epoch millis out of range: {millis}")))
}

impl Tick {
    pub fn new(
        instrument_key: impl Into<InstrumentKey>,
        price: f64,
        previous_close: f64,
        time: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_key: instrument_key.into(),
            price,
            previous_close,
            time,
        }
    }

    /// Price is usable by the aggregators.
    pub fn has_valid_price(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }

    /// Local calendar date of the tick in the exchange timezone.
    pub fn trading_day(&self, offset: FixedOffset) -> NaiveDate {
        self.time.with_timezone(&offset).date_naive()
    }
}

/// History fetched for one instrument, every series ordered oldest to newest.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SeedHistory {
    pub week: Vec<Bar>,
    pub day: Vec<Bar>,
    pub minute: Vec<Bar>,
    /// Today's intraday minute bars.
    pub intraday: Vec<Bar>,
}

/// Everything the engine tracks for one watched instrument.
#[derive(Clone, PartialEq, Debug)]
pub struct InstrumentState {
    pub instrument: Instrument,
    pub week: CandleSeries,
    pub day: CandleSeries,
    pub minute: CandleSeries,
    pub bricks: BrickSeries,
    pub indicators: IndicatorSnapshot,
    pub signal: SignalState,
    pub last_tick: Option<Tick>,
}

impl InstrumentState {
    /// Build the candle series and brick history from `history`.
    ///
    /// Today's intraday bars are appended to the minute history and rolled up into today's day
    /// candle, replacing a partial day candle from the daily history.
    pub fn seed(
        instrument: Instrument,
        history: SeedHistory,
        config: &StrategyConfig,
        offset: FixedOffset,
    ) -> Self {
        let SeedHistory {
            week,
            mut day,
            mut minute,
            intraday,
        } = history;

        if let Some(newest) = intraday.last() {
            let today = Interval::Day.bucket_start(newest.time, offset);
            if let Some(rolled) = Bar::roll_up(&intraday, today) {
                if day
                    .last()
                    .is_some_and(|bar| Interval::Day.bucket_start(bar.time, offset) == today)
                {
                    day.pop();
                }
                day.push(rolled);
            }

            let cutoff = intraday[0].time;
            minute.retain(|bar| bar.time < cutoff);
            minute.extend(intraday);
        }

        let bricks = if config.indicators.uses_bricks() {
            BrickSeries::build(&minute, minute.len())
        } else {
            BrickSeries::default()
        };

        let mut state = Self {
            instrument,
            week: CandleSeries::new(Interval::Week, config.candle_capacity(Interval::Week)),
            day: CandleSeries::new(Interval::Day, config.candle_capacity(Interval::Day)),
            minute: CandleSeries::new(Interval::Minute, config.candle_capacity(Interval::Minute)),
            bricks,
            indicators: IndicatorSnapshot::default(),
            signal: SignalState::NoSignal,
            last_tick: None,
        };

        state.week.seed(week);
        state.day.seed(day);
        state.minute.seed(minute);
        state
    }

    pub fn key(&self) -> &InstrumentKey {
        &self.instrument.instrument_key
    }

    pub fn candles(&self, interval: Interval) -> &CandleSeries {
        match interval {
            Interval::Minute => &self.minute,
            Interval::Day => &self.day,
            Interval::Week => &self.week,
        }
    }

    pub fn candles_mut(&mut self, interval: Interval) -> &mut CandleSeries {
        match interval {
            Interval::Minute => &mut self.minute,
            Interval::Day => &mut self.day,
            Interval::Week => &mut self.week,
        }
    }

    /// Apply a tick to every candle series and the brick history. Returns the number of new
    /// bricks.
    pub fn apply_tick(&mut self, tick: &Tick, offset: FixedOffset) -> usize {
        for interval in Interval::ALL {
            self.candles_mut(interval)
                .update(tick.price, tick.time, offset);
        }
        self.last_tick = Some(tick.clone());
        self.bricks.push_price(tick.price)
    }

    /// Recompute every configured indicator at `price`.
    pub fn refresh_indicators(&mut self, config: &StrategyConfig, price: f64) {
        let sources = &config.indicators;
        let prev_offset = config.prev_minute_offset();

        let week_rsi = self.rsi(config, sources.week_rsi, 0);
        let day_rsi = self.rsi(config, sources.day_rsi, 0);
        let minute_rsi = self.rsi(config, sources.minute_rsi, 0);
        let prev_minute_rsi = self.rsi(config, sources.minute_rsi, prev_offset);

        let day_atr = match sources.day_atr {
            AtrSource::Bricks { batch_size } => {
                indicator::atr_percent_bricks(self.bricks.as_slice(), batch_size, price)
            }
            AtrSource::Candles { interval } => config.lbp(interval).and_then(|lbp| {
                indicator::atr_percent_candles(self.candles_mut(interval).as_slice(), lbp, price)
            }),
            AtrSource::Disabled => None,
        };

        let dc_low = indicator::dc_low(
            self.candles_mut(sources.dc_low_interval).as_slice(),
            config.strategy_inputs.dc_low_lbp,
        );

        self.indicators = IndicatorSnapshot {
            week_rsi,
            day_rsi,
            minute_rsi,
            prev_minute_rsi,
            day_atr,
            dc_low,
            ..IndicatorSnapshot::default()
        };
    }

    fn rsi(&mut self, config: &StrategyConfig, source: RsiSource, offset: usize) -> Option<f64> {
        match source {
            RsiSource::Bricks { window } => indicator::rsi(self.bricks.as_slice(), offset, window),
            RsiSource::Candles { interval } => {
                let lbp = config.lbp(interval)?;
                let brick_pct = config.strategy_inputs.brick_size;
                indicator::candle_rsi(self.candles_mut(interval).as_slice(), offset, lbp, brick_pct)
            }
            RsiSource::Disabled => None,
        }
    }

    /// Serialisable view of the current state.
    pub fn snapshot(&self) -> InstrumentSnapshot {
        let (signal, buy_at, signaled_on) = match self.signal {
            SignalState::BuyActive { price, at, .. } => (Some(SignalKind::Buy), Some(price), Some(at)),
            SignalState::NoSignal => (None, None, None),
        };

        InstrumentSnapshot {
            instrument_key: self.instrument.instrument_key.clone(),
            name: self.instrument.name.clone(),
            symbol: self.instrument.symbol.clone(),
            price: self.last_tick.as_ref().map(|tick| tick.price),
            previous_close: self.last_tick.as_ref().map(|tick| tick.previous_close),
            time: self.last_tick.as_ref().map(|tick| tick.time),
            indicators: self.indicators,
            signal,
            buy_at,
            signaled_on,
            brick_count: self.bricks.len(),
            brick_size: self.bricks.brick_size(),
        }
    }
}

/// Per-tick view of an instrument handed to broadcast and order collaborators.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct InstrumentSnapshot {
    pub instrument_key: InstrumentKey,
    pub name: String,
    pub symbol: String,
    pub price: Option<f64>,
    pub previous_close: Option<f64>,
    pub time: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub indicators: IndicatorSnapshot,
    pub signal: Option<SignalKind>,
    pub buy_at: Option<f64>,
    pub signaled_on: Option<DateTime<Utc>>,
    pub brick_count: usize,
    pub brick_size: f64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, TimeZone};

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    fn instrument() -> Instrument {
        Instrument::new(
            InstrumentKey::from("NSE_EQ|INE155A01022"),
            "TATA POWER CO LTD".to_string(),
            "TATAPOWER".to_string(),
        )
    }

    fn bar(time: DateTime<Utc>, close: f64) -> Bar {
        Bar::from_price(time, close)
    }

    #[test]
    fn test_de_tick() {
        struct TestCase {
            input: &'static str,
            expected: Option<Tick>,
        }

        let time = Utc.with_ymd_and_hms(2025, 1, 10, 4, 5, 12).unwrap();

        let tests = vec![
            TestCase {
                // TC0: feed aliases with string epoch millis
                input: r#"{"instrument_key": "NSE_EQ|INE155A01022", "ltp": 412.35, "cp": 418.1, "ltt": "1736481912000"}"#,
                expected: Some(Tick::new("NSE_EQ|INE155A01022", 412.35, 418.1, time)),
            },
            TestCase {
                // TC1: canonical names with numeric epoch millis
                input: r#"{"instrument_key": "NSE_EQ|INE155A01022", "price": 412.35, "previous_close": 418.1, "time": 1736481912000}"#,
                expected: Some(Tick::new("NSE_EQ|INE155A01022", 412.35, 418.1, time)),
            },
            TestCase {
                // TC2: non numeric time
                input: r#"{"instrument_key": "NSE_EQ|INE155A01022", "price": 412.35, "cp": 418.1, "ltt": "soon"}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<Tick>(test.input).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_tick_trading_day_uses_exchange_offset() {
        // 20:00 UTC on the 9th is 01:30 IST on the 10th
        let tick = Tick::new(
            "NSE_EQ|X",
            1.0,
            1.0,
            Utc.with_ymd_and_hms(2025, 1, 9, 20, 0, 0).unwrap(),
        );
        assert_eq!(
            tick.trading_day(ist()),
            NaiveDate::from_ymd_opt(2025, 1, 10).unwrap()
        );
    }

    #[test]
    fn test_seed_rolls_intraday_into_day_candle() {
        let config = StrategyConfig::default();
        let yesterday = Utc.with_ymd_and_hms(2025, 1, 8, 18, 30, 0).unwrap();
        let today = Utc.with_ymd_and_hms(2025, 1, 9, 18, 30, 0).unwrap();
        let open = Utc.with_ymd_and_hms(2025, 1, 10, 3, 45, 0).unwrap();

        let history = SeedHistory {
            week: vec![],
            // Partial day candle for today already present in the daily history
            day: vec![bar(yesterday, 100.0), bar(today, 101.0)],
            minute: vec![bar(open - TimeDelta::days(1), 99.0), bar(open, 101.0)],
            intraday: vec![
                Bar { high: 103.0, ..bar(open, 101.0) },
                Bar { low: 98.5, ..bar(open + TimeDelta::minutes(1), 102.0) },
                bar(open + TimeDelta::minutes(2), 102.5),
            ],
        };

        let state = InstrumentState::seed(instrument(), history, &config, ist());

        assert_eq!(state.day.len(), 2);
        let rolled = state.day.newest().unwrap();
        assert_eq!(rolled.time, today);
        assert_eq!(rolled.open, 101.0);
        assert_eq!(rolled.high, 103.0);
        assert_eq!(rolled.low, 98.5);
        assert_eq!(rolled.close, 102.5);

        // Overlapping minute bar replaced by the intraday bars
        assert_eq!(state.minute.len(), 4);
        assert_eq!(state.minute.closes(), vec![102.5, 102.0, 101.0, 99.0]);
    }

    #[test]
    fn test_apply_tick_updates_all_series() {
        let config = StrategyConfig::default();
        let start = Utc.with_ymd_and_hms(2025, 1, 10, 3, 45, 0).unwrap();
        let minute = (0..20)
            .map(|index| bar(start + TimeDelta::minutes(index), 1000.0 + index as f64))
            .collect();

        let mut state = InstrumentState::seed(
            instrument(),
            SeedHistory {
                minute,
                ..Default::default()
            },
            &config,
            ist(),
        );
        assert_eq!(state.bricks.brick_size(), 1.0);
        let bricks_before = state.bricks.len();

        let tick = Tick::new("NSE_EQ|INE155A01022", 1022.4, 1000.0, start + TimeDelta::minutes(20));
        let added = state.apply_tick(&tick, ist());

        assert_eq!(added, 3);
        assert_eq!(state.bricks.len(), bricks_before + 3);
        assert_eq!(state.minute.newest().unwrap().close, 1022.4);
        assert_eq!(state.day.newest().unwrap().close, 1022.4);
        assert_eq!(state.week.newest().unwrap().close, 1022.4);
        assert_eq!(state.last_tick, Some(tick));
    }

    #[test]
    fn test_refresh_indicators_from_bricks() {
        let mut config = StrategyConfig::default();
        config.indicators.day_rsi = RsiSource::Bricks { window: 5 };
        config.indicators.minute_rsi = RsiSource::Bricks { window: 3 };
        config.indicators.day_atr = AtrSource::Bricks { batch_size: 4 };
        config.entry_conditions.pev_min_rsi_entry_threshold_look_back = 3;

        let mut state = InstrumentState::seed(instrument(), SeedHistory::default(), &config, ist());
        // Newest-first: rising for the last two bricks, falling before that
        state.bricks = BrickSeries::from_newest_first([102.0, 101.0, 100.0, 101.0, 102.0, 103.0], 1.0);

        state.refresh_indicators(&config, 100.0);

        assert_eq!(state.indicators.minute_rsi, Some(100.0));
        // Shifted by 2: [100, 101, 102] is falling
        assert_eq!(state.indicators.prev_minute_rsi, Some(0.0));
        // [102, 101, 100, 101, 102]: gains 2, losses 2
        assert_eq!(state.indicators.day_rsi, Some(50.0));
        // Batch [102, 101, 100, 101] range 2 => 2% of 100
        assert_eq!(state.indicators.day_atr, Some(2.0));
        // No week candles
        assert_eq!(state.indicators.week_rsi, None);
        assert_eq!(state.indicators.dc_low, None);
    }

    #[test]
    fn test_snapshot_reflects_signal() {
        let config = StrategyConfig::default();
        let mut state = InstrumentState::seed(instrument(), SeedHistory::default(), &config, ist());
        let at = Utc.with_ymd_and_hms(2025, 1, 10, 4, 0, 0).unwrap();
        state.signal = SignalState::BuyActive {
            price: 412.5,
            at,
            trading_day: NaiveDate::from_ymd_opt(2025, 1, 10).unwrap(),
        };

        let snapshot = state.snapshot();
        assert_eq!(snapshot.signal, Some(SignalKind::Buy));
        assert_eq!(snapshot.buy_at, Some(412.5));
        assert_eq!(snapshot.signaled_on, Some(at));
        assert_eq!(snapshot.price, None);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["signal"], "BUY");
        assert_eq!(json["symbol"], "TATAPOWER");
        assert!(json.get("week_rsi").is_some());
    }
}
