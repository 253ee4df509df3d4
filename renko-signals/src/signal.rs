//! Latched BUY entry rule and the day-scoped signal cache.

use crate::{config::EntryConditions, indicator::IndicatorSnapshot, instrument::InstrumentKey};
use chrono::{DateTime, NaiveDate, Utc};
use derive_more::Display;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display, Deserialize, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalKind {
    #[display("BUY")]
    Buy,
    #[display("SELL")]
    Sell,
}

/// Persisted signal row. At most one active record per instrument per trading day.
#[derive(Clone, PartialEq, Debug, Deserialize, Serialize)]
pub struct SignalRecord {
    pub instrument_key: InstrumentKey,
    pub signal: SignalKind,
    /// Serialised instrument snapshot at the time of the signal.
    #[serde(default)]
    pub signal_data: Value,
    pub at_price: f64,
    pub created_at: DateTime<Utc>,
}

impl SignalRecord {
    pub fn buy(
        instrument_key: InstrumentKey,
        signal_data: Value,
        at_price: f64,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument_key,
            signal: SignalKind::Buy,
            signal_data,
            at_price,
            created_at,
        }
    }
}

/// Per-instrument signal state.
#[derive(Clone, Copy, PartialEq, Debug, Default, Deserialize, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum SignalState {
    #[default]
    NoSignal,
    /// Latched until the trading day rolls over.
    BuyActive {
        price: f64,
        at: DateTime<Utc>,
        trading_day: NaiveDate,
    },
}

impl SignalState {
    pub fn is_buy_active(&self) -> bool {
        matches!(self, SignalState::BuyActive { .. })
    }
}

/// Result of evaluating one tick against the entry rule.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum Evaluation {
    /// BUY already active today.
    Latched,
    /// BUY restored from the signal cache.
    Restored,
    /// Entry rule fired on this tick.
    Triggered,
    NoEntry,
}

/// Outcome of each gate of the entry rule.
#[derive(Clone, Copy, Eq, PartialEq, Debug, Default)]
pub struct EntryGates {
    /// `-(day_atr * multiplier) > percentage`
    pub dip: bool,
    /// `week_rsi > threshold || day_rsi > threshold`
    pub momentum: bool,
    /// `minute_rsi > prev_minute_rsi && minute_rsi > threshold && price > dc_low`
    pub confirmation: bool,
}

impl EntryGates {
    /// Evaluate each gate. An absent indicator fails the gate that needs it, except an absent
    /// Donchian low which passes when `dc_low_enabled` is false.
    pub fn evaluate(
        conditions: &EntryConditions,
        indicators: &IndicatorSnapshot,
        price: f64,
        dc_low_enabled: bool,
    ) -> Self {
        let dip = match (indicators.day_atr, indicators.percentage) {
            (Some(day_atr), Some(percentage)) => {
                -(day_atr * conditions.day_atr_entry_multiplier) > percentage
            }
            _ => false,
        };

        let week = indicators
            .week_rsi
            .is_some_and(|rsi| rsi > conditions.week_rsi_entry_threshold);
        let day = indicators
            .day_rsi
            .is_some_and(|rsi| rsi > conditions.day_rsi_entry_threshold);

        let minute = match (indicators.minute_rsi, indicators.prev_minute_rsi) {
            (Some(minute), Some(prev_minute)) => {
                minute > prev_minute && minute > conditions.min_rsi_entry_threshold
            }
            _ => false,
        };
        let breakout = match indicators.dc_low {
            Some(dc_low) => price > dc_low,
            None => !dc_low_enabled,
        };

        Self {
            dip,
            momentum: week || day,
            confirmation: minute && breakout,
        }
    }

    pub fn all(&self) -> bool {
        self.dip && self.momentum && self.confirmation
    }
}

/// Advance `state` for a tick at `now` on `trading_day`.
///
/// A BUY latched on an earlier trading day is reset first. A cached BUY for today snaps the
/// state to active without evaluating the gates.
pub fn evaluate(
    state: &mut SignalState,
    cached: Option<&SignalRecord>,
    gates: EntryGates,
    price: f64,
    now: DateTime<Utc>,
    trading_day: NaiveDate,
) -> Evaluation {
    if let SignalState::BuyActive { trading_day: day, .. } = state {
        if *day < trading_day {
            *state = SignalState::NoSignal;
        }
    }

    if state.is_buy_active() {
        return Evaluation::Latched;
    }

    if let Some(record) = cached.filter(|record| record.signal == SignalKind::Buy) {
        *state = SignalState::BuyActive {
            price: record.at_price,
            at: record.created_at,
            trading_day,
        };
        return Evaluation::Restored;
    }

    if gates.all() {
        *state = SignalState::BuyActive {
            price,
            at: now,
            trading_day,
        };
        Evaluation::Triggered
    } else {
        Evaluation::NoEntry
    }
}

/// Signals recorded for the current trading day, keyed by instrument.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SignalCache {
    day: Option<NaiveDate>,
    records: FnvHashMap<InstrumentKey, SignalRecord>,
}

impl SignalCache {
    /// Replace the cache with `records` for `day`.
    pub fn restore(&mut self, day: NaiveDate, records: FnvHashMap<InstrumentKey, SignalRecord>) {
        self.day = Some(day);
        self.records = records;
    }

    /// Cached record for `key`, only if the cache holds `day`.
    pub fn get(&self, key: &InstrumentKey, day: NaiveDate) -> Option<&SignalRecord> {
        if self.day != Some(day) {
            return None;
        }
        self.records.get(key)
    }

    /// Insert `record` for `day`, discarding records of any other day.
    pub fn insert(&mut self, day: NaiveDate, record: SignalRecord) {
        if self.day != Some(day) {
            self.day = Some(day);
            self.records.clear();
        }
        self.records.insert(record.instrument_key.clone(), record);
    }

    pub fn day(&self) -> Option<NaiveDate> {
        self.day
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn conditions() -> EntryConditions {
        EntryConditions {
            day_atr_entry_multiplier: 1.0,
            week_rsi_entry_threshold: 60.0,
            day_rsi_entry_threshold: 60.0,
            min_rsi_entry_threshold: 50.0,
            pev_min_rsi_entry_threshold_look_back: 16,
        }
    }

    fn qualifying() -> IndicatorSnapshot {
        IndicatorSnapshot {
            week_rsi: Some(70.0),
            day_rsi: Some(40.0),
            minute_rsi: Some(65.0),
            prev_minute_rsi: Some(55.0),
            day_atr: Some(2.0),
            dc_low: Some(95.0),
            change: Some(-3.0),
            percentage: Some(-3.0),
            atr_diff: Some(1.0),
        }
    }

    fn day(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 1, day).unwrap()
    }

    fn time(day: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, day, 5, 0, 0).unwrap()
    }

    #[test]
    fn test_entry_gates() {
        struct TestCase {
            indicators: IndicatorSnapshot,
            price: f64,
            dc_low_enabled: bool,
            expected: EntryGates,
        }

        let all = EntryGates {
            dip: true,
            momentum: true,
            confirmation: true,
        };

        let tests = vec![
            TestCase {
                // TC0: all gates pass
                indicators: qualifying(),
                price: 97.0,
                dc_low_enabled: true,
                expected: all,
            },
            TestCase {
                // TC1: dip not deep enough (-2 > -1.5 is false)
                indicators: IndicatorSnapshot {
                    percentage: Some(-1.5),
                    ..qualifying()
                },
                price: 97.0,
                dc_low_enabled: true,
                expected: EntryGates { dip: false, ..all },
            },
            TestCase {
                // TC2: absent day ATR fails the dip gate
                indicators: IndicatorSnapshot {
                    day_atr: None,
                    ..qualifying()
                },
                price: 97.0,
                dc_low_enabled: true,
                expected: EntryGates { dip: false, ..all },
            },
            TestCase {
                // TC3: absent week RSI is false in the OR gate, day RSI rescues it
                indicators: IndicatorSnapshot {
                    week_rsi: None,
                    day_rsi: Some(61.0),
                    ..qualifying()
                },
                price: 97.0,
                dc_low_enabled: true,
                expected: all,
            },
            TestCase {
                // TC4: both RSIs at the threshold fail (strict comparison)
                indicators: IndicatorSnapshot {
                    week_rsi: Some(60.0),
                    day_rsi: Some(60.0),
                    ..qualifying()
                },
                price: 97.0,
                dc_low_enabled: true,
                expected: EntryGates {
                    momentum: false,
                    ..all
                },
            },
            TestCase {
                // TC5: minute RSI not rising
                indicators: IndicatorSnapshot {
                    prev_minute_rsi: Some(65.0),
                    ..qualifying()
                },
                price: 97.0,
                dc_low_enabled: true,
                expected: EntryGates {
                    confirmation: false,
                    ..all
                },
            },
            TestCase {
                // TC6: price below the Donchian low
                indicators: qualifying(),
                price: 94.0,
                dc_low_enabled: true,
                expected: EntryGates {
                    confirmation: false,
                    ..all
                },
            },
            TestCase {
                // TC7: Donchian low disabled passes
                indicators: IndicatorSnapshot {
                    dc_low: None,
                    ..qualifying()
                },
                price: 94.0,
                dc_low_enabled: false,
                expected: all,
            },
            TestCase {
                // TC8: Donchian low enabled but not yet available fails
                indicators: IndicatorSnapshot {
                    dc_low: None,
                    ..qualifying()
                },
                price: 97.0,
                dc_low_enabled: true,
                expected: EntryGates {
                    confirmation: false,
                    ..all
                },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = EntryGates::evaluate(
                &conditions(),
                &test.indicators,
                test.price,
                test.dc_low_enabled,
            );
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_evaluate_latches_for_the_day() {
        let mut state = SignalState::NoSignal;
        let gates = EntryGates::evaluate(&conditions(), &qualifying(), 97.0, true);

        assert_eq!(
            evaluate(&mut state, None, gates, 97.0, time(10), day(10)),
            Evaluation::Triggered
        );
        assert_eq!(
            state,
            SignalState::BuyActive {
                price: 97.0,
                at: time(10),
                trading_day: day(10)
            }
        );

        // Later qualifying ticks the same day do not re-trigger or move the price
        assert_eq!(
            evaluate(&mut state, None, gates, 96.0, time(10), day(10)),
            Evaluation::Latched
        );
        assert!(matches!(state, SignalState::BuyActive { price, .. } if price == 97.0));

        // Next trading day resets and re-evaluates
        assert_eq!(
            evaluate(&mut state, None, EntryGates::default(), 98.0, time(13), day(13)),
            Evaluation::NoEntry
        );
        assert_eq!(state, SignalState::NoSignal);
    }

    #[test]
    fn test_evaluate_restores_cached_buy() {
        let record = SignalRecord::buy(
            InstrumentKey::from("NSE_EQ|INE155A01022"),
            Value::Null,
            412.5,
            time(10),
        );

        let mut state = SignalState::NoSignal;
        let actual = evaluate(
            &mut state,
            Some(&record),
            EntryGates::default(),
            400.0,
            time(10),
            day(10),
        );

        assert_eq!(actual, Evaluation::Restored);
        assert_eq!(
            state,
            SignalState::BuyActive {
                price: 412.5,
                at: time(10),
                trading_day: day(10)
            }
        );
    }

    #[test]
    fn test_evaluate_ignores_cached_sell() {
        let record = SignalRecord {
            signal: SignalKind::Sell,
            ..SignalRecord::buy(InstrumentKey::from("NSE_EQ|X"), Value::Null, 1.0, time(10))
        };

        let mut state = SignalState::NoSignal;
        let actual = evaluate(
            &mut state,
            Some(&record),
            EntryGates::default(),
            1.0,
            time(10),
            day(10),
        );

        assert_eq!(actual, Evaluation::NoEntry);
        assert_eq!(state, SignalState::NoSignal);
    }

    #[test]
    fn test_signal_cache_is_day_scoped() {
        let key = InstrumentKey::from("NSE_EQ|INE155A01022");
        let record = SignalRecord::buy(key.clone(), Value::Null, 100.0, time(10));

        let mut cache = SignalCache::default();
        cache.insert(day(10), record.clone());
        assert_eq!(cache.get(&key, day(10)), Some(&record));
        assert_eq!(cache.get(&key, day(13)), None);

        // Inserting for a new day evicts the previous day's records
        let other = InstrumentKey::from("NSE_EQ|INE002A01018");
        cache.insert(day(13), SignalRecord::buy(other.clone(), Value::Null, 50.0, time(13)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&key, day(13)), None);
        assert!(cache.get(&other, day(13)).is_some());
    }

    #[test]
    fn test_signal_record_serde() {
        let record = SignalRecord::buy(
            InstrumentKey::from("NSE_EQ|INE155A01022"),
            serde_json::json!({ "price": 97.0 }),
            97.0,
            time(10),
        );

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["signal"], "BUY");
        assert_eq!(json["instrument_key"], "NSE_EQ|INE155A01022");

        let actual = serde_json::from_value::<SignalRecord>(json).unwrap();
        assert_eq!(actual, record);
    }
}
