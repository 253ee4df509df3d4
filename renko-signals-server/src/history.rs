use async_trait::async_trait;
use renko_signals::{
    EngineError, InstrumentKey,
    bar::{Bar, CandleRow, Interval},
    source::HistoricalSource,
};
use std::path::{Path, PathBuf};
use tracing::debug;

/// [`HistoricalSource`] backed by a directory of JSON candle files.
///
/// Layout: `<root>/<instrument key with '|' replaced by '_'>/{minute,day,week,intraday}.json`,
/// each file an array of [`CandleRow`]s in any order.
#[derive(Clone, Debug)]
pub struct FileHistory {
    root: PathBuf,
}

impl FileHistory {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn instrument_dir(&self, key: &InstrumentKey) -> PathBuf {
        self.root.join(key.as_str().replace('|', "_"))
    }

    async fn read_bars(&self, key: &InstrumentKey, path: &Path) -> Result<Vec<Bar>, EngineError> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|error| EngineError::upstream(key, format!("{}: {error}", path.display())))?;

        let rows = serde_json::from_str::<Vec<CandleRow>>(&contents)
            .map_err(|error| EngineError::upstream(key, format!("{}: {error}", path.display())))?;

        let mut bars = rows.into_iter().map(Bar::from).collect::<Vec<_>>();
        bars.sort_by_key(|bar| bar.time);

        debug!(instrument = %key, path = %path.display(), bars = bars.len(), "read history file");
        Ok(bars)
    }
}

#[async_trait]
impl HistoricalSource for FileHistory {
    async fn fetch_bars(
        &self,
        key: &InstrumentKey,
        interval: Interval,
        lookback: usize,
    ) -> Result<Vec<Bar>, EngineError> {
        let path = self
            .instrument_dir(key)
            .join(format!("{}.json", interval.as_str()));
        let mut bars = self.read_bars(key, &path).await?;

        // Newest `lookback` bars, oldest-first
        if bars.len() > lookback {
            bars.drain(..bars.len() - lookback);
        }
        Ok(bars)
    }

    /// A missing intraday file means the session has not opened yet.
    async fn fetch_intraday(&self, key: &InstrumentKey) -> Result<Vec<Bar>, EngineError> {
        let path = self.instrument_dir(key).join("intraday.json");
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        self.read_bars(key, &path).await
    }
}
