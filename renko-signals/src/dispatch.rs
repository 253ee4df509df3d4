use crate::{
    engine::{Engine, TickOutcome},
    error::EngineError,
    instrument::InstrumentKey,
    state::{InstrumentSnapshot, Tick},
};
use fnv::FnvHasher;
use std::{
    hash::{Hash, Hasher},
    sync::Arc,
};
use tokio::{
    sync::{broadcast, mpsc},
    task::JoinHandle,
};
use tracing::{debug, error, info};

/// Tick counts processed by one shard.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Default)]
pub struct ShardSummary {
    pub shard: usize,
    pub updated: usize,
    pub buffered: usize,
    pub dropped: usize,
}

/// Routes ticks onto a fixed set of tokio tasks by instrument key.
///
/// The same instrument always lands on the same shard, so its ticks are applied in arrival
/// order while different instruments are processed concurrently.
#[derive(Debug)]
pub struct TickDispatcher {
    shards: Vec<mpsc::UnboundedSender<Tick>>,
    handles: Vec<JoinHandle<ShardSummary>>,
}

impl TickDispatcher {
    /// Spawn `shards` workers (at least one) applying ticks to `engine`. Snapshots of updated
    /// instruments are published on `snapshot_tx`.
    pub fn spawn(
        engine: Arc<Engine>,
        shards: usize,
        snapshot_tx: broadcast::Sender<InstrumentSnapshot>,
    ) -> Self {
        let shard_count = shards.max(1);
        let mut senders = Vec::with_capacity(shard_count);
        let mut handles = Vec::with_capacity(shard_count);

        for shard in 0..shard_count {
            let (tx, rx) = mpsc::unbounded_channel();
            senders.push(tx);
            handles.push(tokio::spawn(run_shard(
                shard,
                Arc::clone(&engine),
                rx,
                snapshot_tx.clone(),
            )));
        }

        info!(shards = shard_count, "tick dispatcher started");

        Self {
            shards: senders,
            handles,
        }
    }

    /// Shard index owning `key`.
    pub fn shard_for(key: &InstrumentKey, shard_count: usize) -> usize {
        let mut hasher = FnvHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % shard_count.max(1) as u64) as usize
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Queue `tick` on its instrument's shard.
    pub fn dispatch(&self, tick: Tick) -> Result<(), EngineError> {
        let shard = Self::shard_for(&tick.instrument_key, self.shards.len());
        self.shards[shard]
            .send(tick)
            .map_err(|_| EngineError::ShardClosed { shard })
    }

    /// Stop accepting ticks, drain every shard and collect their summaries.
    pub async fn shutdown(self) -> Vec<ShardSummary> {
        drop(self.shards);

        futures::future::join_all(self.handles)
            .await
            .into_iter()
            .filter_map(|result| match result {
                Ok(summary) => Some(summary),
                Err(error) => {
                    error!(%error, "tick dispatcher shard panicked");
                    None
                }
            })
            .collect()
    }
}

async fn run_shard(
    shard: usize,
    engine: Arc<Engine>,
    mut rx: mpsc::UnboundedReceiver<Tick>,
    snapshot_tx: broadcast::Sender<InstrumentSnapshot>,
) -> ShardSummary {
    let mut summary = ShardSummary {
        shard,
        ..ShardSummary::default()
    };

    while let Some(tick) = rx.recv().await {
        match engine.process_tick(tick) {
            TickOutcome::Updated(snapshot) => {
                summary.updated += 1;
                // No subscribers is fine
                let _ = snapshot_tx.send(snapshot);
            }
            TickOutcome::Buffered => summary.buffered += 1,
            TickOutcome::Dropped(_) => summary.dropped += 1,
        }
    }

    debug!(?summary, "tick dispatcher shard stopped");
    summary
}
