//! Owned map from instrument key to per-instrument state with a readiness gate.
//!
//! Instruments are `Pending` until seeded. Ticks arriving in that window are buffered (bounded)
//! and replayed in arrival order once the instrument is marked ready.

use crate::{
    instrument::{Instrument, InstrumentKey},
    state::{InstrumentSnapshot, InstrumentState, Tick},
};
use derive_more::Display;
use fnv::FnvHashMap;
use parking_lot::{Mutex, RwLock};
use std::{collections::VecDeque, sync::Arc};
use tracing::warn;

#[derive(Clone, PartialEq, Debug)]
pub enum InstrumentSlot {
    Pending {
        instrument: Instrument,
        buffered: VecDeque<Tick>,
    },
    Ready(Box<InstrumentState>),
    Failed {
        instrument: Instrument,
        reason: String,
    },
}

impl InstrumentSlot {
    pub fn pending(instrument: Instrument) -> Self {
        Self::Pending {
            instrument,
            buffered: VecDeque::new(),
        }
    }

    pub fn instrument(&self) -> &Instrument {
        match self {
            InstrumentSlot::Pending { instrument, .. } => instrument,
            InstrumentSlot::Ready(state) => &state.instrument,
            InstrumentSlot::Failed { instrument, .. } => instrument,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, InstrumentSlot::Ready(_))
    }
}

/// Why a tick was not applied.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display)]
pub enum DropReason {
    #[display("unknown instrument")]
    UnknownInstrument,
    #[display("instrument failed to seed")]
    SeedFailed,
    #[display("malformed price")]
    MalformedPrice,
}

/// Map of watched instruments. Each slot has its own lock so one instrument's processing never
/// blocks another's.
#[derive(Debug)]
pub struct StockRegistry {
    slots: RwLock<FnvHashMap<InstrumentKey, Arc<Mutex<InstrumentSlot>>>>,
    max_buffered_ticks: usize,
}

impl StockRegistry {
    pub fn new(max_buffered_ticks: usize) -> Self {
        Self {
            slots: RwLock::new(FnvHashMap::default()),
            max_buffered_ticks,
        }
    }

    /// Register `instrument` as pending. Returns false if the key is already registered.
    pub fn watch(&self, instrument: Instrument) -> bool {
        let mut slots = self.slots.write();
        if slots.contains_key(&instrument.instrument_key) {
            return false;
        }
        slots.insert(
            instrument.instrument_key.clone(),
            Arc::new(Mutex::new(InstrumentSlot::pending(instrument))),
        );
        true
    }

    /// Slot handle for `key`.
    pub fn slot(&self, key: &InstrumentKey) -> Option<Arc<Mutex<InstrumentSlot>>> {
        self.slots.read().get(key).cloned()
    }

    fn slot_or_insert(&self, instrument: &Instrument) -> Arc<Mutex<InstrumentSlot>> {
        if let Some(slot) = self.slot(&instrument.instrument_key) {
            return slot;
        }
        self.slots
            .write()
            .entry(instrument.instrument_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(InstrumentSlot::pending(instrument.clone()))))
            .clone()
    }

    /// Install `state` as ready and feed every buffered tick through `replay` in arrival order,
    /// while holding the slot lock. Returns the number of replayed ticks.
    pub fn mark_ready<F>(&self, state: InstrumentState, mut replay: F) -> usize
    where
        F: FnMut(&mut InstrumentState, Tick),
    {
        let slot = self.slot_or_insert(&state.instrument);
        let mut slot = slot.lock();

        let buffered = match std::mem::replace(&mut *slot, InstrumentSlot::Ready(Box::new(state))) {
            InstrumentSlot::Pending { buffered, .. } => buffered,
            _ => VecDeque::new(),
        };

        let InstrumentSlot::Ready(state) = &mut *slot else {
            return 0;
        };

        let replayed = buffered.len();
        for tick in buffered {
            replay(state.as_mut(), tick);
        }
        replayed
    }

    /// Mark the instrument as failed, discarding any buffered ticks. Returns the number of
    /// discarded ticks.
    pub fn mark_failed(&self, instrument: &Instrument, reason: impl Into<String>) -> usize {
        let slot = self.slot_or_insert(instrument);
        let mut slot = slot.lock();

        let discarded = match &*slot {
            InstrumentSlot::Pending { buffered, .. } => buffered.len(),
            _ => 0,
        };

        *slot = InstrumentSlot::Failed {
            instrument: instrument.clone(),
            reason: reason.into(),
        };
        discarded
    }

    /// Append `tick` to a pending slot's buffer, evicting and returning the oldest buffered tick
    /// if the buffer is full.
    pub fn buffer_tick(&self, buffered: &mut VecDeque<Tick>, tick: Tick) -> Option<Tick> {
        let evicted = if self.max_buffered_ticks == 0 {
            Some(tick)
        } else {
            let evicted = (buffered.len() >= self.max_buffered_ticks)
                .then(|| buffered.pop_front())
                .flatten();
            buffered.push_back(tick);
            evicted
        };

        if let Some(evicted) = &evicted {
            warn!(
                instrument = %evicted.instrument_key,
                max_buffered_ticks = self.max_buffered_ticks,
                "pre-seed tick buffer full, dropping oldest tick"
            );
        }
        evicted
    }

    /// Exclusive access to one ready instrument's state.
    pub fn with_state<F, R>(&self, key: &InstrumentKey, f: F) -> Option<R>
    where
        F: FnOnce(&mut InstrumentState) -> R,
    {
        let slot = self.slot(key)?;
        let mut slot = slot.lock();
        match &mut *slot {
            InstrumentSlot::Ready(state) => Some(f(state.as_mut())),
            _ => None,
        }
    }

    /// Snapshots of every ready instrument.
    pub fn snapshots(&self) -> Vec<InstrumentSnapshot> {
        let slots = self.slots.read().values().cloned().collect::<Vec<_>>();
        slots
            .iter()
            .filter_map(|slot| match &*slot.lock() {
                InstrumentSlot::Ready(state) => Some(state.snapshot()),
                _ => None,
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<InstrumentKey> {
        self.slots.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }

    pub fn ready_count(&self) -> usize {
        let slots = self.slots.read().values().cloned().collect::<Vec<_>>();
        slots.iter().filter(|slot| slot.lock().is_ready()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::StrategyConfig, state::SeedHistory};
    use chrono::{DateTime, FixedOffset, TimeDelta, TimeZone, Utc};

    fn instrument(key: &str) -> Instrument {
        Instrument::new(InstrumentKey::from(key), String::new(), String::new())
    }

    fn tick(key: &str, seconds: i64, price: f64) -> Tick {
        let base: DateTime<Utc> = Utc.with_ymd_and_hms(2025, 1, 10, 3, 45, 0).unwrap();
        Tick::new(key, price, 100.0, base + TimeDelta::seconds(seconds))
    }

    fn buffer(registry: &StockRegistry, slot: &Mutex<InstrumentSlot>, tick: Tick) -> Option<Tick> {
        match &mut *slot.lock() {
            InstrumentSlot::Pending { buffered, .. } => registry.buffer_tick(buffered, tick),
            other => panic!("slot not pending: {other:?}"),
        }
    }

    fn ready_state(key: &str) -> InstrumentState {
        InstrumentState::seed(
            instrument(key),
            SeedHistory::default(),
            &StrategyConfig::default(),
            FixedOffset::east_opt(330 * 60).unwrap(),
        )
    }

    #[test]
    fn test_watch_is_idempotent() {
        let registry = StockRegistry::new(8);
        assert!(registry.watch(instrument("A")));
        assert!(!registry.watch(instrument("A")));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.ready_count(), 0);
    }

    #[test]
    fn test_buffered_ticks_replay_in_order() {
        let registry = StockRegistry::new(8);
        registry.watch(instrument("A"));

        let slot = registry.slot(&InstrumentKey::from("A")).unwrap();
        for (seconds, price) in [(1, 101.0), (2, 102.0), (3, 103.0)] {
            assert_eq!(buffer(&registry, &slot, tick("A", seconds, price)), None);
        }

        let mut replayed = Vec::new();
        let count = registry.mark_ready(ready_state("A"), |_, tick| replayed.push(tick.price));

        assert_eq!(count, 3);
        assert_eq!(replayed, vec![101.0, 102.0, 103.0]);
        assert!(slot.lock().is_ready());
        assert_eq!(registry.snapshots().len(), 1);
    }

    #[test]
    fn test_buffer_overflow_evicts_oldest() {
        let registry = StockRegistry::new(2);
        registry.watch(instrument("A"));
        let slot = registry.slot(&InstrumentKey::from("A")).unwrap();

        buffer(&registry, &slot, tick("A", 1, 101.0));
        buffer(&registry, &slot, tick("A", 2, 102.0));
        let evicted = buffer(&registry, &slot, tick("A", 3, 103.0));
        assert_eq!(evicted, Some(tick("A", 1, 101.0)));

        let mut replayed = Vec::new();
        registry.mark_ready(ready_state("A"), |_, tick| replayed.push(tick.price));
        assert_eq!(replayed, vec![102.0, 103.0]);
    }

    #[test]
    fn test_failed_instrument_drops_ticks() {
        let registry = StockRegistry::new(8);
        registry.watch(instrument("A"));
        let slot = registry.slot(&InstrumentKey::from("A")).unwrap();
        buffer(&registry, &slot, tick("A", 1, 101.0));

        let discarded = registry.mark_failed(&instrument("A"), "HTTP 429");
        assert_eq!(discarded, 1);

        assert!(matches!(&*slot.lock(), InstrumentSlot::Failed { reason, .. } if reason == "HTTP 429"));
        assert!(registry.with_state(&InstrumentKey::from("A"), |_| ()).is_none());
    }

    #[test]
    fn test_with_state_gives_exclusive_access() {
        let registry = StockRegistry::new(8);
        registry.mark_ready(ready_state("A"), |_, _| {});

        let key = InstrumentKey::from("A");
        let price = registry.with_state(&key, |state| {
            state.last_tick = Some(tick("A", 1, 42.0));
            state.snapshot().price
        });

        assert_eq!(price, Some(Some(42.0)));
        assert!(registry.with_state(&InstrumentKey::from("B"), |_| ()).is_none());
    }
}
