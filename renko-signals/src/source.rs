use crate::{
    bar::{Bar, Interval},
    error::EngineError,
    instrument::InstrumentKey,
};
use async_trait::async_trait;

/// Provider of historical candles used to seed instrument state.
#[async_trait]
pub trait HistoricalSource: Send + Sync {
    /// Up to `lookback` most recent completed bars of `interval`, ordered oldest to newest.
    async fn fetch_bars(
        &self,
        key: &InstrumentKey,
        interval: Interval,
        lookback: usize,
    ) -> Result<Vec<Bar>, EngineError>;

    /// Today's intraday minute bars, ordered oldest to newest.
    async fn fetch_intraday(&self, key: &InstrumentKey) -> Result<Vec<Bar>, EngineError>;
}
