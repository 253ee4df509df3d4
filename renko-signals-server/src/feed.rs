//! WebSocket tick feed client with auto-reconnect.

use futures::StreamExt;
use renko_signals::{EngineError, Tick, dispatch::TickDispatcher};
use serde::Deserialize;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Messages accepted from the tick feed: a single tick or a batch.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum FeedMessage {
    Tick(Tick),
    Batch(Vec<Tick>),
}

impl FeedMessage {
    pub fn into_ticks(self) -> Vec<Tick> {
        match self {
            FeedMessage::Tick(tick) => vec![tick],
            FeedMessage::Batch(ticks) => ticks,
        }
    }
}

/// Parse a text frame. Control messages such as `{"type": "welcome"}` and unparseable frames
/// yield no ticks.
pub fn parse_message(text: &str) -> Vec<Tick> {
    match serde_json::from_str::<FeedMessage>(text) {
        Ok(message) => message.into_ticks(),
        Err(error) => {
            let raw = text.chars().take(100).collect::<String>();
            debug!(%error, %raw, "ignoring non-tick feed message");
            Vec::new()
        }
    }
}

/// Consume `url` forever, dispatching every tick, reconnecting after `reconnect_delay` whenever
/// the connection fails or closes.
///
/// Only returns if the dispatcher stops accepting ticks.
pub async fn run(
    url: &str,
    dispatcher: &TickDispatcher,
    reconnect_delay: Duration,
) -> Result<(), EngineError> {
    info!(%url, "starting tick feed");

    loop {
        match connect_async(url).await {
            Ok((ws_stream, _)) => {
                info!(%url, "connected to tick feed");
                let (_, mut read) = ws_stream.split();
                let mut received = 0usize;

                while let Some(message) = read.next().await {
                    match message {
                        Ok(Message::Text(text)) => {
                            for tick in parse_message(&text) {
                                received += 1;
                                dispatcher.dispatch(tick)?;
                            }
                        }
                        Ok(Message::Close(_)) => {
                            warn!(%url, "tick feed closed connection");
                            break;
                        }
                        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                        Err(error) => {
                            error!(%url, %error, "tick feed error");
                            break;
                        }
                        _ => {}
                    }
                }

                info!(%url, received, "tick feed disconnected");
            }
            Err(error) => {
                error!(%url, %error, "failed to connect to tick feed");
            }
        }

        debug!(delay_secs = reconnect_delay.as_secs_f64(), "waiting before reconnecting to tick feed");
        tokio::time::sleep(reconnect_delay).await;
    }
}
