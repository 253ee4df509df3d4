use chrono::Utc;
use futures::{SinkExt, StreamExt};
use renko_signals::{Engine, EngineError, InstrumentSnapshot};
use serde::Serialize;
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, watch},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Frame sent to WebSocket clients.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage<'a> {
    Welcome {
        message: &'static str,
        instruments: usize,
        timestamp: chrono::DateTime<Utc>,
    },
    Snapshot(&'a InstrumentSnapshot),
}

/// Bind `addr` for the snapshot broadcast server.
pub async fn bind(addr: SocketAddr) -> Result<TcpListener, EngineError> {
    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, "snapshot server bound");
    Ok(listener)
}

/// Accept clients until `shutdown` flips, streaming every [`InstrumentSnapshot`] published on
/// `tx`. Connected clients are closed on shutdown as well.
pub async fn serve(
    listener: TcpListener,
    engine: Arc<Engine>,
    tx: broadcast::Sender<InstrumentSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer_addr) = tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(error) => {
                    error!(%error, "snapshot server accept failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        };

        info!(%peer_addr, "new snapshot client");
        tokio::spawn(handle_client(
            stream,
            peer_addr,
            Arc::clone(&engine),
            tx.clone(),
            shutdown.clone(),
        ));
    }

    info!("snapshot server stopped");
}

fn to_text(message: &ServerMessage<'_>) -> Option<Message> {
    serde_json::to_string(message)
        .ok()
        .map(|json| Message::Text(json.into()))
}

/// Serve one client: a welcome frame, the current snapshot of every ready instrument, then live
/// snapshots until either side closes or `shutdown` flips.
///
/// The engine and sender handles are released once the initial snapshots are taken.
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    engine: Arc<Engine>,
    tx: broadcast::Sender<InstrumentSnapshot>,
    mut shutdown: watch::Receiver<bool>,
) {
    let ws_stream = tokio::select! {
        handshake = accept_async(stream) => match handshake {
            Ok(ws) => ws,
            Err(error) => {
                error!(%peer_addr, %error, "WebSocket handshake failed");
                return;
            }
        },
        _ = shutdown.changed() => return,
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Subscribe before taking the initial snapshots so no update is missed
    let mut rx = tx.subscribe();
    let snapshots = engine.snapshots();
    drop(tx);
    drop(engine);

    let welcome = ServerMessage::Welcome {
        message: "connected to renko-signals snapshot feed",
        instruments: snapshots.len(),
        timestamp: Utc::now(),
    };
    let initial = std::iter::once(welcome)
        .chain(snapshots.iter().map(ServerMessage::Snapshot))
        .filter_map(|message| to_text(&message))
        .collect::<Vec<_>>();

    for message in initial {
        if ws_sender.send(message).await.is_err() {
            warn!(%peer_addr, "client dropped during initial snapshot");
            return;
        }
    }

    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(snapshot) => {
                    let Some(message) = to_text(&ServerMessage::Snapshot(&snapshot)) else {
                        continue;
                    };
                    if ws_sender.send(message).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(%peer_addr, skipped, "client lagged, skipped snapshots");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!(%peer_addr, "snapshot channel closed");
                    break;
                }
            }
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Close(_)) => break,
                Ok(Message::Text(text)) => debug!(%peer_addr, %text, "ignoring client message"),
                Err(error) => {
                    error!(%peer_addr, %error, "WebSocket error");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
        _ = shutdown.changed() => {
            send_task.abort();
            recv_task.abort();
        }
    }

    info!(%peer_addr, "snapshot client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use renko_signals::{
        Instrument, InstrumentKey, Tick, config::StrategyConfig, state::SeedHistory,
        store::MemorySignalStore,
    };
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite};

    fn tata_power() -> Instrument {
        Instrument::new(
            InstrumentKey::from("NSE_EQ|INE155A01022"),
            "TATA POWER CO LTD".to_string(),
            "TATAPOWER".to_string(),
        )
    }

    async fn next_json<S>(client: &mut S) -> serde_json::Value
    where
        S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        loop {
            if let Some(Ok(Message::Text(text))) = client.next().await {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_client_receives_initial_and_live_snapshots() {
        let (engine, _writer) = Engine::new(StrategyConfig::default()).unwrap();
        let key = InstrumentKey::from("NSE_EQ|INE155A01022");
        engine.seed_instrument(tata_power(), SeedHistory::default());
        let engine = Arc::new(engine);

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _) = broadcast::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(serve(listener, Arc::clone(&engine), tx.clone(), shutdown_rx));

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();

        let welcome = next_json(&mut client).await;
        assert_eq!(welcome["type"], "welcome");
        assert_eq!(welcome["instruments"], 1);

        let initial = next_json(&mut client).await;
        assert_eq!(initial["type"], "snapshot");
        assert_eq!(initial["instrument_key"], "NSE_EQ|INE155A01022");
        assert!(initial["price"].is_null());

        let tick = Tick::new(key, 412.35, 418.1, Utc::now());
        let renko_signals::TickOutcome::Updated(snapshot) = engine.process_tick(tick) else {
            panic!("expected an update");
        };
        tx.send(snapshot).unwrap();

        let live = next_json(&mut client).await;
        assert_eq!(live["type"], "snapshot");
        assert_eq!(live["price"], 412.35);
        assert_eq!(live["percentage"], -1.38);
    }

    #[tokio::test]
    async fn test_shutdown_releases_engine_with_client_connected() {
        let (engine, writer) = Engine::new(StrategyConfig::default()).unwrap();
        engine.seed_instrument(tata_power(), SeedHistory::default());
        let store = Arc::new(MemorySignalStore::new(engine.offset()));
        let writer = tokio::spawn(writer.run(store));
        let engine = Arc::new(engine);

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, _) = broadcast::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let server = tokio::spawn(serve(listener, Arc::clone(&engine), tx.clone(), shutdown_rx));

        let (mut client, _) = connect_async(format!("ws://{addr}")).await.unwrap();
        assert_eq!(next_json(&mut client).await["type"], "welcome");

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(3), server)
            .await
            .expect("server did not stop")
            .unwrap();

        // Client connection is closed by the server
        let closed = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(Ok(message)) = client.next().await {
                if message.is_close() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok());

        drop(tx);
        drop(engine);
        let summary = tokio::time::timeout(Duration::from_secs(3), writer)
            .await
            .expect("writer did not drain")
            .unwrap();
        assert_eq!(summary.persisted, 0);
    }
}
