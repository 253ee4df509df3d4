use async_trait::async_trait;
use chrono::{FixedOffset, NaiveDate};
use fnv::FnvHashMap;
use renko_signals::{
    EngineError, InstrumentKey, signal::SignalRecord, store::SignalStore,
};
use std::{io::ErrorKind, path::PathBuf};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use tracing::warn;

/// [`SignalStore`] appending one JSON [`SignalRecord`] per line.
///
/// Upserts are appends. Loading keeps the last record per instrument for the requested day.
#[derive(Debug)]
pub struct JsonLinesSignalStore {
    path: PathBuf,
    offset: FixedOffset,
    write_lock: Mutex<()>,
}

impl JsonLinesSignalStore {
    pub fn new(path: impl Into<PathBuf>, offset: FixedOffset) -> Self {
        Self {
            path: path.into(),
            offset,
            write_lock: Mutex::new(()),
        }
    }
}

fn persistence(error: impl std::fmt::Display) -> EngineError {
    EngineError::Persistence(error.to_string())
}

#[async_trait]
impl SignalStore for JsonLinesSignalStore {
    async fn upsert_signal(&self, record: &SignalRecord) -> Result<(), EngineError> {
        let mut line = serde_json::to_string(record).map_err(persistence)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(persistence)?;

        file.write_all(line.as_bytes()).await.map_err(persistence)?;
        file.flush().await.map_err(persistence)
    }

    async fn load_signals_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<FnvHashMap<InstrumentKey, SignalRecord>, EngineError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Ok(FnvHashMap::default());
            }
            Err(error) => return Err(persistence(error)),
        };

        let mut records = FnvHashMap::default();
        for (index, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<SignalRecord>(line) {
                Ok(record) if record.created_at.with_timezone(&self.offset).date_naive() == day => {
                    records.insert(record.instrument_key.clone(), record);
                }
                Ok(_) => {}
                Err(error) => {
                    warn!(path = %self.path.display(), line = index + 1, %error, "skipping malformed signal record");
                }
            }
        }

        Ok(records)
    }
}
