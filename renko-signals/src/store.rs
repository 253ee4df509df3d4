use crate::{error::EngineError, instrument::InstrumentKey, signal::SignalRecord};
use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Durable home of emitted signals.
#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Insert or replace the record for `record.instrument_key` on its trading day.
    async fn upsert_signal(&self, record: &SignalRecord) -> Result<(), EngineError>;

    /// Latest record per instrument created on local calendar `day`.
    async fn load_signals_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<FnvHashMap<InstrumentKey, SignalRecord>, EngineError>;
}

/// In-process [`SignalStore`].
///
/// Can be primed to fail a number of upserts.
#[derive(Debug)]
pub struct MemorySignalStore {
    offset: FixedOffset,
    records: Mutex<Vec<SignalRecord>>,
    failures_remaining: AtomicUsize,
}

impl MemorySignalStore {
    /// Store bucketing records into days of the timezone `offset`.
    pub fn new(offset: FixedOffset) -> Self {
        Self {
            offset,
            records: Mutex::new(Vec::new()),
            failures_remaining: AtomicUsize::new(0),
        }
    }

    /// Fail the next `count` upserts with [`EngineError::Persistence`].
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<SignalRecord> {
        self.records.lock().clone()
    }

    fn day_of(&self, record: &SignalRecord) -> NaiveDate {
        record.created_at.with_timezone(&self.offset).date_naive()
    }
}

#[async_trait]
impl SignalStore for MemorySignalStore {
    async fn upsert_signal(&self, record: &SignalRecord) -> Result<(), EngineError> {
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok();
        if should_fail {
            return Err(EngineError::Persistence(format!(
                "injected failure for {}",
                record.instrument_key
            )));
        }

        let day = self.day_of(record);
        let mut records = self.records.lock();
        records.retain(|existing| {
            existing.instrument_key != record.instrument_key || self.day_of(existing) != day
        });
        records.push(record.clone());
        Ok(())
    }

    async fn load_signals_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<FnvHashMap<InstrumentKey, SignalRecord>, EngineError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| self.day_of(record) == day)
            .map(|record| (record.instrument_key.clone(), record.clone()))
            .collect())
    }
}
