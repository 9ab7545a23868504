//! Signaling service network layer: WebSocket accept loop and message routing

use crate::config::{AllowedOrigins, ServerConfig};
use crate::registry::{Outbound, Recipient, SessionRegistry};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use shared::{ClientSignal, PeerId, Role};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Messages sent from connection tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    Connected {
        peer_id: PeerId,
        role: Role,
        sender: mpsc::UnboundedSender<Message>,
    },
    SignalReceived {
        peer_id: PeerId,
        signal: ClientSignal,
    },
    Disconnected {
        peer_id: PeerId,
    },
    Shutdown,
}

/// Signaling service: owns the registry and every connection's outbound queue
pub struct SignalingServer {
    listener: TcpListener,
    allowed_origins: AllowedOrigins,
    registry: SessionRegistry,
    connections: HashMap<PeerId, mpsc::UnboundedSender<Message>>,

    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
}

impl SignalingServer {
    /// Binds the listening socket; fails immediately if the port is taken.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: config.bind_addr,
                source,
            })?;
        info!("Signaling server listening on {}", listener.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();

        Ok(SignalingServer {
            listener,
            allowed_origins: config.allowed_origins,
            registry: SessionRegistry::new(config.max_peers),
            connections: HashMap::new(),
            server_tx,
            server_rx,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Sender into the main loop, used to request shutdown.
    pub fn control(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Runs until a shutdown message arrives.
    pub async fn run(self) -> Result<(), ServerError> {
        let SignalingServer {
            listener,
            allowed_origins,
            mut registry,
            mut connections,
            server_tx,
            mut server_rx,
        } = self;

        tokio::spawn(accept_loop(listener, allowed_origins, server_tx));

        while let Some(message) = server_rx.recv().await {
            match message {
                ServerMessage::Connected {
                    peer_id,
                    role,
                    sender,
                } => match registry.connect(peer_id.clone(), role) {
                    Ok(outbound) => {
                        connections.insert(peer_id, sender);
                        deliver(&connections, outbound);
                    }
                    Err(e) => {
                        warn!("Rejecting peer {}: {}", peer_id, e);
                        let _ = sender.send(Message::Close(None));
                    }
                },
                ServerMessage::SignalReceived { peer_id, signal } => {
                    let outbound = registry.relay(&peer_id, signal);
                    deliver(&connections, outbound);
                }
                ServerMessage::Disconnected { peer_id } => {
                    if connections.remove(&peer_id).is_some() {
                        let outbound = registry.disconnect(&peer_id);
                        deliver(&connections, outbound);
                    }
                }
                ServerMessage::Shutdown => {
                    info!("Signaling server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

/// Accepts TCP connections and hands each one to its own task
async fn accept_loop(
    listener: TcpListener,
    allowed_origins: AllowedOrigins,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let origins = allowed_origins.clone();
                let server_tx = server_tx.clone();
                tokio::spawn(async move {
                    handle_connection(stream, addr, origins, server_tx).await;
                });
            }
            Err(e) => {
                error!("Error accepting connection: {}", e);
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        }

        if server_tx.is_closed() {
            break;
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    allowed_origins: AllowedOrigins,
    server_tx: mpsc::UnboundedSender<ServerMessage>,
) {
    let mut role = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let origin = request
            .headers()
            .get("origin")
            .and_then(|value| value.to_str().ok());
        if !allowed_origins.permits(origin) {
            return Err(reject(StatusCode::FORBIDDEN, "origin not allowed"));
        }

        match parse_role(request.uri().query()) {
            Ok(parsed) => {
                role = Some(parsed);
                Ok(response)
            }
            Err(reason) => Err(reject(StatusCode::BAD_REQUEST, &reason)),
        }
    };

    let ws_stream = match accept_hdr_async(stream, callback).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            debug!("Handshake with {} failed: {}", addr, e);
            return;
        }
    };
    let Some(role) = role else {
        return;
    };

    let peer_id = PeerId::new(Uuid::new_v4().to_string());
    debug!("Connection from {} registered as {}", addr, peer_id);

    let (mut ws_write, mut ws_read) = ws_stream.split();
    let (sender, mut outgoing) = mpsc::unbounded_channel::<Message>();

    if server_tx
        .send(ServerMessage::Connected {
            peer_id: peer_id.clone(),
            role,
            sender,
        })
        .is_err()
    {
        return;
    }

    tokio::spawn(async move {
        while let Some(message) = outgoing.recv().await {
            let closing = matches!(message, Message::Close(_));
            if ws_write.send(message).await.is_err() || closing {
                break;
            }
        }
    });

    while let Some(frame) = ws_read.next().await {
        match frame {
            Ok(Message::Text(text)) => match ClientSignal::from_json(&text) {
                Ok(signal) => {
                    let message = ServerMessage::SignalReceived {
                        peer_id: peer_id.clone(),
                        signal,
                    };
                    if server_tx.send(message).is_err() {
                        break;
                    }
                }
                Err(e) => warn!("Dropping malformed signal from {}: {}", peer_id, e),
            },
            Ok(Message::Binary(_)) => warn!("Dropping binary frame from {}", peer_id),
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("Connection {} errored: {}", peer_id, e);
                break;
            }
        }
    }

    let _ = server_tx.send(ServerMessage::Disconnected { peer_id });
}

/// Reads the `role` query parameter of the upgrade request
fn parse_role(query: Option<&str>) -> Result<Role, String> {
    let query = query.unwrap_or_default();
    let role = url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == "role")
        .map(|(_, value)| value.into_owned());

    match role {
        Some(role) => role.parse::<Role>().map_err(|e| e.to_string()),
        None => Err("missing role query parameter".to_string()),
    }
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Routes registry notifications to connection queues
fn deliver(connections: &HashMap<PeerId, mpsc::UnboundedSender<Message>>, outbound: Vec<Outbound>) {
    for Outbound { to, signal } in outbound {
        let text = match signal.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to encode signal: {}", e);
                continue;
            }
        };

        let targets: Vec<(&PeerId, &mpsc::UnboundedSender<Message>)> = match &to {
            Recipient::Peer(peer_id) => connections.get_key_value(peer_id).into_iter().collect(),
            Recipient::All => connections.iter().collect(),
            Recipient::AllExcept(excluded) => connections
                .iter()
                .filter(|(peer_id, _)| *peer_id != excluded)
                .collect(),
        };

        for (peer_id, sender) in targets {
            if sender.send(Message::Text(text.clone())).is_err() {
                debug!("Connection {} already closed", peer_id);
            }
        }
    }
}
