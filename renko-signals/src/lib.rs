//! # Renko Signals
//! Streaming technical-indicator engine for a universe of instruments:
//! * **Aggregation**: fixed-size Renko bricks and rolling minute, day and week candles, seeded in
//!   bulk from history and updated incrementally from live ticks.
//! * **Indicators**: RSI over bricks or quantised candles, ATR as a percent of price and the
//!   Donchian low, each `None` until enough history exists.
//! * **Signals**: a latched per-instrument BUY rule evaluated on every tick, cached per trading
//!   day and persisted asynchronously through a [`SignalStore`](store::SignalStore).
//!
//! ## Overview
//! An [`Engine`](engine::Engine) owns the [`StrategyConfig`](config::StrategyConfig), the
//! [`StockRegistry`](registry::StockRegistry) and the signal cache. Instruments are seeded from
//! a [`HistoricalSource`](source::HistoricalSource), ticks that arrive before seeding completes
//! are buffered and replayed, and a [`TickDispatcher`](dispatch::TickDispatcher) shards live
//! ticks across tokio tasks so each instrument is processed in order.
//!
//! ## Example
//! ```rust,no_run
//! use renko_signals::{
//!     config::StrategyConfig,
//!     dispatch::TickDispatcher,
//!     engine::Engine,
//!     state::Tick,
//!     store::MemorySignalStore,
//! };
//! use std::sync::Arc;
//! use tokio::sync::broadcast;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = StrategyConfig::load("config/settings.json").unwrap();
//!     let (engine, writer) = Engine::new(config).unwrap();
//!
//!     let store = Arc::new(MemorySignalStore::new(engine.offset()));
//!     tokio::spawn(writer.run(store));
//!
//!     let (snapshot_tx, _snapshot_rx) = broadcast::channel(1024);
//!     let dispatcher = TickDispatcher::spawn(Arc::new(engine), 4, snapshot_tx);
//!
//!     let tick: Tick = serde_json::from_str(
//!         r#"{"instrument_key":"NSE_EQ|INE155A01022","ltp":412.35,"cp":418.1,"ltt":1736481912000}"#,
//!     )
//!     .unwrap();
//!     dispatcher.dispatch(tick).unwrap();
//! }
//! ```

/// OHLC [`Bar`](bar::Bar), candle [`Interval`](bar::Interval) and the historical candle row
/// wire format.
pub mod bar;

/// Rolling OHLC candles per timeframe.
pub mod candle;

/// JSON configuration document and its defaults.
pub mod config;

/// Shards live ticks by instrument across tokio tasks.
pub mod dispatch;

/// Seeds instruments, applies ticks and queues emitted signals.
pub mod engine;

/// All [`Error`](std::error::Error)s generated in `renko-signals`.
pub mod error;

/// RSI, ATR percent and Donchian low.
pub mod indicator;

pub mod instrument;

/// Readiness-gated map of per-instrument state.
pub mod registry;

/// Fixed-size Renko brick aggregation.
pub mod renko;

/// Latched BUY rule and the day-scoped signal cache.
pub mod signal;

/// Historical candle provider used for seeding.
pub mod source;

/// Per-instrument state, live ticks and snapshots.
pub mod state;

/// Signal persistence.
pub mod store;

pub use engine::{Engine, SignalWriter, TickOutcome};
pub use error::EngineError;
pub use instrument::{Instrument, InstrumentKey};
pub use state::{InstrumentSnapshot, Tick};
