//! Engine owning the configuration, the [`StockRegistry`] and the signal cache, plus the
//! asynchronous [`SignalWriter`] that persists emitted signals.

use crate::{
    bar::Interval,
    config::StrategyConfig,
    error::EngineError,
    instrument::{Instrument, InstrumentKey},
    registry::{DropReason, InstrumentSlot, StockRegistry},
    signal::{self, EntryGates, Evaluation, SignalCache, SignalRecord},
    source::HistoricalSource,
    state::{InstrumentSnapshot, InstrumentState, SeedHistory, Tick},
    store::SignalStore,
};
use chrono::{DateTime, FixedOffset, NaiveDate, Utc};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// What happened to a tick offered to [`Engine::process_tick`].
#[derive(Clone, PartialEq, Debug)]
pub enum TickOutcome {
    /// Applied to a ready instrument.
    Updated(InstrumentSnapshot),
    /// Held until the instrument finishes seeding.
    Buffered,
    Dropped(DropReason),
}

/// Outcome of [`Engine::seed_all`].
#[derive(Clone, PartialEq, Debug, Default)]
pub struct SeedReport {
    pub seeded: Vec<InstrumentKey>,
    pub failed: Vec<(InstrumentKey, String)>,
}

#[derive(Debug)]
pub struct Engine {
    config: Arc<StrategyConfig>,
    offset: FixedOffset,
    registry: StockRegistry,
    signals: Mutex<SignalCache>,
    signal_tx: mpsc::UnboundedSender<SignalRecord>,
}

impl Engine {
    /// Validate `config` and construct the engine together with the [`SignalWriter`] that drains
    /// its emitted signals.
    pub fn new(config: StrategyConfig) -> Result<(Self, SignalWriter), EngineError> {
        config.validate()?;
        let offset = config.market.offset()?;

        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let writer = SignalWriter {
            rx: signal_rx,
            max_retries: config.persistence.max_retries,
            retry_delay: Duration::from_millis(config.persistence.retry_delay_ms),
        };

        let engine = Self {
            registry: StockRegistry::new(config.registry.max_buffered_ticks),
            config: Arc::new(config),
            offset,
            signals: Mutex::new(SignalCache::default()),
            signal_tx,
        };

        Ok((engine, writer))
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn registry(&self) -> &StockRegistry {
        &self.registry
    }

    /// Local calendar date of `time` in the exchange timezone.
    pub fn trading_day(&self, time: DateTime<Utc>) -> NaiveDate {
        time.with_timezone(&self.offset).date_naive()
    }

    /// Load `today`'s signals from `store` into the cache. Returns the number restored.
    ///
    /// A load failure is logged and leaves the cache empty.
    pub async fn restore_signals<S>(&self, store: &S, today: NaiveDate) -> usize
    where
        S: SignalStore + ?Sized,
    {
        match store.load_signals_for_day(today).await {
            Ok(records) => {
                let restored = records.len();
                self.signals.lock().restore(today, records);
                info!(%today, restored, "restored signal cache");
                restored
            }
            Err(error) => {
                error!(%today, %error, "failed to restore signal cache, starting empty");
                0
            }
        }
    }

    /// Register `instrument` as pending so early ticks are buffered.
    pub fn watch(&self, instrument: Instrument) -> bool {
        self.registry.watch(instrument)
    }

    /// Build the instrument's state from `history`, mark it ready and replay buffered ticks.
    /// Returns the number of replayed ticks.
    pub fn seed_instrument(&self, instrument: Instrument, history: SeedHistory) -> usize {
        let key = instrument.instrument_key.clone();
        let state = InstrumentState::seed(instrument, history, &self.config, self.offset);

        info!(
            instrument = %key,
            bricks = state.bricks.len(),
            brick_size = state.bricks.brick_size(),
            minute_candles = state.minute.len(),
            day_candles = state.day.len(),
            week_candles = state.week.len(),
            "seeded instrument"
        );

        let replayed = self.registry.mark_ready(state, |state, tick| {
            self.apply(state, tick);
        });

        if replayed > 0 {
            debug!(instrument = %key, replayed, "replayed buffered ticks");
        }
        replayed
    }

    /// Fetch every history series `instrument` needs from `source`.
    pub async fn fetch_history<S>(
        &self,
        source: &S,
        key: &InstrumentKey,
    ) -> Result<SeedHistory, EngineError>
    where
        S: HistoricalSource + ?Sized,
    {
        let week = source
            .fetch_bars(key, Interval::Week, self.config.history_lookback(Interval::Week))
            .await?;
        let day = source
            .fetch_bars(key, Interval::Day, self.config.history_lookback(Interval::Day))
            .await?;
        let minute = source
            .fetch_bars(key, Interval::Minute, self.config.history_lookback(Interval::Minute))
            .await?;
        let intraday = source.fetch_intraday(key).await?;

        Ok(SeedHistory {
            week,
            day,
            minute,
            intraday,
        })
    }

    /// Seed every instrument from `source`, sleeping `seed.throttle_delay_ms` after every
    /// `seed.throttle_every` instruments.
    ///
    /// A fetch failure marks that instrument failed and seeding continues with the next.
    pub async fn seed_all<S>(&self, source: &S, instruments: Vec<Instrument>) -> SeedReport
    where
        S: HistoricalSource + ?Sized,
    {
        for instrument in &instruments {
            self.registry.watch(instrument.clone());
        }

        let total = instruments.len();
        let throttle = self.config.seed;
        let mut report = SeedReport::default();

        for (index, instrument) in instruments.into_iter().enumerate() {
            let key = instrument.instrument_key.clone();

            match self.fetch_history(source, &key).await {
                Ok(history) => {
                    self.seed_instrument(instrument, history);
                    report.seeded.push(key);
                }
                Err(error) => {
                    error!(instrument = %key, %error, "failed to seed instrument, skipping");
                    let discarded = self.registry.mark_failed(&instrument, error.to_string());
                    if discarded > 0 {
                        warn!(instrument = %key, discarded, "discarded buffered ticks");
                    }
                    report.failed.push((key, error.to_string()));
                }
            }

            let seeded = index + 1;
            if throttle.throttle_every > 0 && seeded % throttle.throttle_every == 0 && seeded < total
            {
                debug!(seeded, total, delay_ms = throttle.throttle_delay_ms, "throttling history fetches");
                tokio::time::sleep(Duration::from_millis(throttle.throttle_delay_ms)).await;
            }
        }

        info!(
            seeded = report.seeded.len(),
            failed = report.failed.len(),
            "seeding complete"
        );
        report
    }

    /// Apply a live tick.
    pub fn process_tick(&self, tick: Tick) -> TickOutcome {
        let Some(slot) = self.registry.slot(&tick.instrument_key) else {
            debug!(instrument = %tick.instrument_key, "dropping tick for unknown instrument");
            return TickOutcome::Dropped(DropReason::UnknownInstrument);
        };
        let mut slot = slot.lock();

        match &mut *slot {
            InstrumentSlot::Ready(state) => self.apply(state, tick),
            InstrumentSlot::Pending { buffered, .. } => {
                self.registry.buffer_tick(buffered, tick);
                TickOutcome::Buffered
            }
            InstrumentSlot::Failed { .. } => TickOutcome::Dropped(DropReason::SeedFailed),
        }
    }

    fn apply(&self, state: &mut InstrumentState, tick: Tick) -> TickOutcome {
        if !tick.has_valid_price() {
            warn!(instrument = %tick.instrument_key, price = tick.price, "ignoring malformed price");
            return TickOutcome::Dropped(DropReason::MalformedPrice);
        }

        let conditions = &self.config.entry_conditions;
        let bricks_added = state.apply_tick(&tick, self.offset);
        state.refresh_indicators(&self.config, tick.price);
        state.indicators.apply_tick(
            tick.price,
            tick.previous_close,
            conditions.day_atr_entry_multiplier,
        );

        let trading_day = tick.trading_day(self.offset);
        let gates = EntryGates::evaluate(
            conditions,
            &state.indicators,
            tick.price,
            self.config.strategy_inputs.dc_low_lbp > 0,
        );

        let evaluation = {
            let signals = self.signals.lock();
            let cached = signals.get(&tick.instrument_key, trading_day);
            signal::evaluate(
                &mut state.signal,
                cached,
                gates,
                tick.price,
                tick.time,
                trading_day,
            )
        };

        let snapshot = state.snapshot();

        match evaluation {
            Evaluation::Triggered => {
                info!(
                    instrument = %tick.instrument_key,
                    price = tick.price,
                    day_atr = ?snapshot.indicators.day_atr,
                    percentage = ?snapshot.indicators.percentage,
                    minute_rsi = ?snapshot.indicators.minute_rsi,
                    "BUY signal"
                );
                let record = SignalRecord::buy(
                    tick.instrument_key.clone(),
                    serde_json::to_value(&snapshot).unwrap_or_default(),
                    tick.price,
                    tick.time,
                );
                self.signals.lock().insert(trading_day, record.clone());
                if self.signal_tx.send(record).is_err() {
                    error!(instrument = %tick.instrument_key, "signal writer stopped, BUY not persisted");
                }
            }
            Evaluation::Restored => {
                debug!(instrument = %tick.instrument_key, "restored BUY from signal cache");
            }
            Evaluation::Latched | Evaluation::NoEntry => {}
        }

        debug!(
            instrument = %tick.instrument_key,
            price = tick.price,
            bricks_added,
            ?evaluation,
            "processed tick"
        );

        TickOutcome::Updated(snapshot)
    }

    /// Snapshot of one ready instrument.
    pub fn snapshot(&self, key: &InstrumentKey) -> Option<InstrumentSnapshot> {
        self.registry.with_state(key, |state| state.snapshot())
    }

    /// Snapshots of every ready instrument.
    pub fn snapshots(&self) -> Vec<InstrumentSnapshot> {
        self.registry.snapshots()
    }
}

/// Counts reported by [`SignalWriter::run`] when its channel closes.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct WriterSummary {
    pub persisted: usize,
    pub failed: usize,
}

/// Drains signals queued by the [`Engine`] and upserts them into a [`SignalStore`], retrying
/// failed writes with a fixed delay.
#[derive(Debug)]
pub struct SignalWriter {
    rx: mpsc::UnboundedReceiver<SignalRecord>,
    max_retries: u32,
    retry_delay: Duration,
}

impl SignalWriter {
    /// Run until every [`Engine`] handle has been dropped.
    pub async fn run<S>(mut self, store: Arc<S>) -> WriterSummary
    where
        S: SignalStore + ?Sized,
    {
        let mut summary = WriterSummary::default();

        while let Some(record) = self.rx.recv().await {
            match self.persist(store.as_ref(), &record).await {
                Ok(()) => {
                    debug!(instrument = %record.instrument_key, signal = %record.signal, "persisted signal");
                    summary.persisted += 1;
                }
                Err(error) => {
                    error!(
                        instrument = %record.instrument_key,
                        %error,
                        "failed to persist signal, in-memory state retained"
                    );
                    summary.failed += 1;
                }
            }
        }

        info!(persisted = summary.persisted, failed = summary.failed, "signal writer stopped");
        summary
    }

    async fn persist<S>(&self, store: &S, record: &SignalRecord) -> Result<(), EngineError>
    where
        S: SignalStore + ?Sized,
    {
        let mut attempt = 0;
        loop {
            match store.upsert_signal(record).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        instrument = %record.instrument_key,
                        attempt,
                        max_retries = self.max_retries,
                        %error,
                        "signal upsert failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
