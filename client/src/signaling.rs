//! Client side of the signaling channel
//!
//! Opens the WebSocket to the signaling service and splits it into a writer
//! task fed by [`SignalSender`] and a reader task that yields
//! [`SignalingEvent`]s. When the socket ends for any reason the reader emits a
//! single [`SignalingEvent::Lost`].

use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use shared::{ClientSignal, Role, ServerSignal};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

#[derive(Debug, Error)]
pub enum SignalingError {
    #[error("invalid signaling url '{0}'")]
    InvalidUrl(String),
    #[error("failed to connect to signaling service: {0}")]
    Connect(#[from] tungstenite::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Signal(ServerSignal),
    Lost,
}

/// Queues signals for the writer task
#[derive(Debug, Clone)]
pub struct SignalSender(mpsc::UnboundedSender<ClientSignal>);

impl SignalSender {
    pub fn new(sender: mpsc::UnboundedSender<ClientSignal>) -> Self {
        Self(sender)
    }

    /// Returns false once the connection is gone.
    pub fn send(&self, signal: ClientSignal) -> bool {
        self.0.send(signal).is_ok()
    }
}

pub struct SignalingConnection {
    pub outgoing: SignalSender,
    pub incoming: mpsc::UnboundedReceiver<SignalingEvent>,
}

/// Builds the upgrade URL with the `role` query parameter.
pub fn signaling_url(server: &str, role: Role) -> Result<Url, SignalingError> {
    let mut url = Url::parse(server).map_err(|_| SignalingError::InvalidUrl(server.to_string()))?;
    if !matches!(url.scheme(), "ws" | "wss") {
        return Err(SignalingError::InvalidUrl(server.to_string()));
    }

    url.query_pairs_mut().append_pair("role", role.as_str());
    Ok(url)
}

pub async fn connect(server: &str, role: Role) -> Result<SignalingConnection, SignalingError> {
    let url = signaling_url(server, role)?;
    let (ws_stream, _) = connect_async(url.as_str()).await?;
    info!("Connected to signaling service at {}", url);

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ClientSignal>();
    let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(signal) = outgoing_rx.recv().await {
            let text = match signal.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!("Failed to encode signal: {}", e);
                    continue;
                }
            };
            if ws_write.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_write.close().await;
    });

    tokio::spawn(async move {
        while let Some(frame) = ws_read.next().await {
            match frame {
                Ok(Message::Text(text)) => match ServerSignal::from_json(&text) {
                    Ok(signal) => {
                        if incoming_tx.send(SignalingEvent::Signal(signal)).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("Dropping malformed signal: {}", e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Signaling connection errored: {}", e);
                    break;
                }
            }
        }

        info!("Signaling connection lost");
        let _ = incoming_tx.send(SignalingEvent::Lost);
    });

    Ok(SignalingConnection {
        outgoing: SignalSender::new(outgoing_tx),
        incoming: incoming_rx,
    })
}
