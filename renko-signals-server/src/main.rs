mod broadcast;
mod feed;
mod history;
mod store;

use crate::{history::FileHistory, store::JsonLinesSignalStore};
use chrono::Utc;
use renko_signals::{
    Engine, EngineError, Instrument, config::StrategyConfig, dispatch::TickDispatcher,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    str::FromStr,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{broadcast as channel, watch};
use tracing::{error, info, warn};

/// Server settings read from `RENKO_*` environment variables.
#[derive(Clone, PartialEq, Debug)]
struct Settings {
    config_path: PathBuf,
    history_dir: PathBuf,
    instruments_path: PathBuf,
    signals_path: PathBuf,
    feed_url: String,
    ws_addr: SocketAddr,
    ws_buffer_size: usize,
    shards: usize,
    reconnect_delay: Duration,
}

impl Settings {
    fn from_env() -> Result<Self, EngineError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, EngineError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());

        let default_shards = std::thread::available_parallelism()
            .map(usize::from)
            .unwrap_or(4);

        Ok(Self {
            config_path: var("RENKO_CONFIG", "config/settings.json").into(),
            history_dir: var("RENKO_HISTORY_DIR", "data/history").into(),
            instruments_path: var("RENKO_INSTRUMENTS", "config/instruments.json").into(),
            signals_path: var("RENKO_SIGNALS_PATH", "data/signals.jsonl").into(),
            feed_url: var("RENKO_FEED_URL", "ws://127.0.0.1:8765/ticks"),
            ws_addr: parse_var(&lookup, "RENKO_WS_ADDR", SocketAddr::from(([0, 0, 0, 0], 9002)))?,
            ws_buffer_size: parse_var(&lookup, "RENKO_WS_BUFFER_SIZE", 10_000)?,
            shards: parse_var(&lookup, "RENKO_SHARDS", default_shards)?,
            reconnect_delay: Duration::from_secs(parse_var(
                &lookup,
                "RENKO_FEED_RECONNECT_SECS",
                5,
            )?),
        })
    }
}

/// Parse variable `name` if set, else `default`.
fn parse_var<F, T>(lookup: &F, name: &str, default: T) -> Result<T, EngineError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(name) {
        Some(value) => value
            .parse()
            .map_err(|error| EngineError::Config(format!("{name}={value}: {error}"))),
        None => Ok(default),
    }
}

/// Read the watched universe: a JSON array of [`Instrument`]s.
async fn load_instruments(path: &Path) -> Result<Vec<Instrument>, EngineError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|error| EngineError::Config(format!("{}: {error}", path.display())))?;

    serde_json::from_str(&contents)
        .map_err(|error| EngineError::Config(format!("{}: {error}", path.display())))
}

#[tokio::main]
async fn main() {
    init_logging();

    if let Err(error) = run().await {
        error!(%error, "renko-signals-server failed");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), EngineError> {
    let settings = Settings::from_env()?;
    info!(?settings, "starting renko-signals-server");

    let config = StrategyConfig::load(&settings.config_path)?;
    let instruments = load_instruments(&settings.instruments_path).await?;
    let (engine, writer) = Engine::new(config)?;

    let store = Arc::new(JsonLinesSignalStore::new(
        &settings.signals_path,
        engine.offset(),
    ));
    let writer = tokio::spawn(writer.run(Arc::clone(&store)));

    engine
        .restore_signals(store.as_ref(), engine.trading_day(Utc::now()))
        .await;

    // Pending instruments buffer ticks that arrive while seeding is in progress
    for instrument in &instruments {
        engine.watch(instrument.clone());
    }
    let engine = Arc::new(engine);

    let (snapshot_tx, _) = channel::channel(settings.ws_buffer_size);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener = broadcast::bind(settings.ws_addr).await?;
    let server = tokio::spawn(broadcast::serve(
        listener,
        Arc::clone(&engine),
        snapshot_tx.clone(),
        shutdown_rx,
    ));

    let dispatcher = TickDispatcher::spawn(Arc::clone(&engine), settings.shards, snapshot_tx);

    let seeding = {
        let engine = Arc::clone(&engine);
        let history = FileHistory::new(&settings.history_dir);
        tokio::spawn(async move { engine.seed_all(&history, instruments).await })
    };

    let result = tokio::select! {
        result = feed::run(&settings.feed_url, &dispatcher, settings.reconnect_delay) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            Ok(())
        }
    };

    // Stops the accept loop and closes every connected snapshot client
    let _ = shutdown_tx.send(true);
    seeding.abort();
    let _ = seeding.await;
    if let Err(error) = server.await {
        error!(%error, "snapshot server panicked");
    }

    for summary in dispatcher.shutdown().await {
        info!(?summary, "tick dispatcher shard summary");
    }

    // Writer drains once the last engine handle is dropped
    drop(engine);
    match writer.await {
        Ok(summary) if summary.failed > 0 => {
            warn!(persisted = summary.persisted, failed = summary.failed, "signals not persisted");
        }
        Ok(_) => {}
        Err(error) => error!(%error, "signal writer panicked"),
    }

    result
}

/// Initialise logging. `RENKO_LOG_JSON=1` switches to newline-delimited JSON output.
fn init_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    let json = std::env::var("RENKO_LOG_JSON")
        .is_ok_and(|value| value == "1" || value.eq_ignore_ascii_case("true"));

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}
