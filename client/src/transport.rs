//! Peer-link transports
//!
//! [`LinkTransport`] is the seam between the connection manager's negotiation
//! state machine and whatever actually moves bytes between two clients. The
//! manager hands the transport session descriptions and candidates received
//! over signaling; the transport reports progress back as [`TransportEvent`]s
//! on a channel drained by the session loop, including the local description
//! once it has been generated.
//!
//! [`WebRtcTransport`] is the bundled implementation. Every link is one
//! peer connection carrying a single data channel named `game`, ordered and
//! without retransmits. ICE consent checks keep the link alive and report a
//! silent remote as [`TransportEvent::Failed`].

use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::Mutex;
use shared::PeerId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

pub const DATA_CHANNEL_LABEL: &str = "game";

/// Identifies one negotiation attempt; a re-negotiated link gets a new id so
/// late events from the old attempt can be told apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Offer or answer generated for the link
    LocalDescription {
        peer: PeerId,
        link: LinkId,
        sdp: String,
    },
    LocalCandidate {
        peer: PeerId,
        link: LinkId,
        candidate: String,
    },
    Open {
        peer: PeerId,
        link: LinkId,
    },
    Data {
        peer: PeerId,
        link: LinkId,
        payload: Vec<u8>,
    },
    Closed {
        peer: PeerId,
        link: LinkId,
    },
    Failed {
        peer: PeerId,
        link: LinkId,
        reason: String,
    },
}

impl TransportEvent {
    pub fn peer(&self) -> &PeerId {
        match self {
            TransportEvent::LocalDescription { peer, .. }
            | TransportEvent::LocalCandidate { peer, .. }
            | TransportEvent::Open { peer, .. }
            | TransportEvent::Data { peer, .. }
            | TransportEvent::Closed { peer, .. }
            | TransportEvent::Failed { peer, .. } => peer,
        }
    }

    pub fn link(&self) -> LinkId {
        match self {
            TransportEvent::LocalDescription { link, .. }
            | TransportEvent::LocalCandidate { link, .. }
            | TransportEvent::Open { link, .. }
            | TransportEvent::Data { link, .. }
            | TransportEvent::Closed { link, .. }
            | TransportEvent::Failed { link, .. } => *link,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("malformed session description: {0}")]
    BadDescription(String),
    #[error("malformed candidate '{0}'")]
    BadCandidate(String),
    #[error("no link for peer {0}")]
    UnknownPeer(PeerId),
    #[error("link to {0} is not open")]
    NotOpen(PeerId),
}

/// Moves bytes between the local client and its peers
pub trait LinkTransport {
    /// Starts an outgoing link. The offer arrives later as
    /// [`TransportEvent::LocalDescription`].
    fn create_offer(&mut self, peer: &PeerId, link: LinkId) -> Result<(), TransportError>;

    /// Accepts a remote offer. The answer arrives later as
    /// [`TransportEvent::LocalDescription`].
    fn accept_offer(&mut self, peer: &PeerId, link: LinkId, offer: &str)
        -> Result<(), TransportError>;

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), TransportError>;

    fn add_remote_candidate(&mut self, peer: &PeerId, candidate: &str)
        -> Result<(), TransportError>;

    fn send(&mut self, peer: &PeerId, payload: &[u8]) -> Result<(), TransportError>;

    /// Releases the link; unknown peers are ignored.
    fn close(&mut self, peer: &PeerId);
}

/// ICE and liveness settings for [`WebRtcTransport`]
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// STUN/TURN urls; empty means host candidates only
    pub ice_servers: Vec<String>,
    /// Gather loopback candidates, for links within one machine
    pub include_loopback: bool,
    /// Silence after which the connection counts as disconnected
    pub disconnected_timeout: Duration,
    /// Silence after which the connection is failed
    pub failed_timeout: Duration,
    pub keepalive_interval: Duration,
    /// A link that has not opened within this window is failed
    pub connect_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            include_loopback: false,
            disconnected_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(15),
        }
    }
}

enum Command {
    Offer,
    Answer(RTCSessionDescription),
    RemoteAnswer(RTCSessionDescription),
    Candidate(RTCIceCandidateInit),
    Send(Bytes),
}

/// Emits the events of one link until the link finishes
#[derive(Clone)]
struct LinkEvents {
    peer: PeerId,
    link: LinkId,
    events: mpsc::UnboundedSender<TransportEvent>,
    finished: Arc<AtomicBool>,
}

impl LinkEvents {
    fn emit(&self, event: TransportEvent) {
        if !self.finished.load(Ordering::SeqCst) {
            let _ = self.events.send(event);
        }
    }

    /// Sends at most one terminal event per link.
    fn finish(&self, event: Option<TransportEvent>) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(event) = event {
            let _ = self.events.send(event);
        }
    }

    fn description(&self, sdp: String) {
        self.emit(TransportEvent::LocalDescription {
            peer: self.peer.clone(),
            link: self.link,
            sdp,
        });
    }

    fn candidate(&self, candidate: String) {
        self.emit(TransportEvent::LocalCandidate {
            peer: self.peer.clone(),
            link: self.link,
            candidate,
        });
    }

    fn open(&self) {
        self.emit(TransportEvent::Open {
            peer: self.peer.clone(),
            link: self.link,
        });
    }

    fn data(&self, payload: Vec<u8>) {
        self.emit(TransportEvent::Data {
            peer: self.peer.clone(),
            link: self.link,
            payload,
        });
    }

    fn closed(&self) {
        self.finish(Some(TransportEvent::Closed {
            peer: self.peer.clone(),
            link: self.link,
        }));
    }

    fn failed(&self, reason: impl Into<String>) {
        self.finish(Some(TransportEvent::Failed {
            peer: self.peer.clone(),
            link: self.link,
            reason: reason.into(),
        }));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkLoss {
    Failed,
    Closed,
}

/// Connection states that end the link
fn link_loss(state: RTCPeerConnectionState) -> Option<LinkLoss> {
    match state {
        RTCPeerConnectionState::Failed => Some(LinkLoss::Failed),
        RTCPeerConnectionState::Closed => Some(LinkLoss::Closed),
        _ => None,
    }
}

type ChannelSlot = Arc<Mutex<Option<Arc<RTCDataChannel>>>>;

struct LinkHandle {
    link: LinkId,
    commands: mpsc::UnboundedSender<Command>,
    open: Arc<AtomicBool>,
    events: LinkEvents,
}

/// WebRTC implementation of [`LinkTransport`]
///
/// Each link runs as its own task owning the peer connection, so commands
/// for one peer are applied in the order they were issued.
pub struct WebRtcTransport {
    api: Arc<API>,
    config: TransportConfig,
    links: HashMap<PeerId, LinkHandle>,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl WebRtcTransport {
    pub fn new(config: TransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let mut setting_engine = SettingEngine::default();
        setting_engine.set_ice_timeouts(
            Some(config.disconnected_timeout),
            Some(config.failed_timeout),
            Some(config.keepalive_interval),
        );
        setting_engine.set_include_loopback_candidate(config.include_loopback);

        let api = APIBuilder::new()
            .with_setting_engine(setting_engine)
            .build();
        let (events, events_rx) = mpsc::unbounded_channel();

        let transport = WebRtcTransport {
            api: Arc::new(api),
            config,
            links: HashMap::new(),
            events,
        };
        (transport, events_rx)
    }

    fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.config.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.config.ice_servers.clone(),
                ..Default::default()
            }]
        };

        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }

    /// Replaces any link to `peer` with a fresh connection task
    fn start_link(&mut self, peer: &PeerId, link: LinkId, first: Command) {
        self.close(peer);

        let (commands, commands_rx) = mpsc::unbounded_channel();
        let events = LinkEvents {
            peer: peer.clone(),
            link,
            events: self.events.clone(),
            finished: Arc::new(AtomicBool::new(false)),
        };
        let open = Arc::new(AtomicBool::new(false));
        let _ = commands.send(first);

        tokio::spawn(run_link(
            Arc::clone(&self.api),
            self.rtc_configuration(),
            self.config.connect_timeout,
            events.clone(),
            Arc::clone(&open),
            commands_rx,
        ));

        self.links.insert(
            peer.clone(),
            LinkHandle {
                link,
                commands,
                open,
                events,
            },
        );
    }

    fn handle(&self, peer: &PeerId) -> Result<&LinkHandle, TransportError> {
        self.links
            .get(peer)
            .ok_or_else(|| TransportError::UnknownPeer(peer.clone()))
    }

    fn command(&self, peer: &PeerId, command: Command) -> Result<(), TransportError> {
        self.handle(peer)?
            .commands
            .send(command)
            .map_err(|_| TransportError::NotOpen(peer.clone()))
    }
}

impl LinkTransport for WebRtcTransport {
    fn create_offer(&mut self, peer: &PeerId, link: LinkId) -> Result<(), TransportError> {
        self.start_link(peer, link, Command::Offer);
        debug!("Negotiating link {:?} to {}", link, peer);
        Ok(())
    }

    fn accept_offer(
        &mut self,
        peer: &PeerId,
        link: LinkId,
        offer: &str,
    ) -> Result<(), TransportError> {
        let offer = RTCSessionDescription::offer(offer.to_string())
            .map_err(|e| TransportError::BadDescription(e.to_string()))?;

        self.start_link(peer, link, Command::Answer(offer));
        debug!("Answering link {:?} from {}", link, peer);
        Ok(())
    }

    fn accept_answer(&mut self, peer: &PeerId, answer: &str) -> Result<(), TransportError> {
        self.handle(peer)?;
        let answer = RTCSessionDescription::answer(answer.to_string())
            .map_err(|e| TransportError::BadDescription(e.to_string()))?;
        self.command(peer, Command::RemoteAnswer(answer))
    }

    fn add_remote_candidate(
        &mut self,
        peer: &PeerId,
        candidate: &str,
    ) -> Result<(), TransportError> {
        self.handle(peer)?;
        let init: RTCIceCandidateInit = serde_json::from_str(candidate)
            .map_err(|_| TransportError::BadCandidate(candidate.to_string()))?;
        self.command(peer, Command::Candidate(init))
    }

    fn send(&mut self, peer: &PeerId, payload: &[u8]) -> Result<(), TransportError> {
        if !self.handle(peer)?.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen(peer.clone()));
        }
        self.command(peer, Command::Send(Bytes::copy_from_slice(payload)))
    }

    fn close(&mut self, peer: &PeerId) {
        if let Some(handle) = self.links.remove(peer) {
            debug!("Releasing link {:?} to {}", handle.link, peer);
            // Dropping the sender ends the task
            handle.events.finish(None);
        }
    }
}

/// Owns one peer connection and applies commands to it in order
async fn run_link(
    api: Arc<API>,
    configuration: RTCConfiguration,
    connect_timeout: Duration,
    events: LinkEvents,
    open: Arc<AtomicBool>,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let pc = match api.new_peer_connection(configuration).await {
        Ok(pc) => Arc::new(pc),
        Err(e) => {
            events.failed(format!("peer connection: {}", e));
            return;
        }
    };
    let channel: ChannelSlot = Arc::new(Mutex::new(None));
    install_connection_handlers(&pc, &events, &open, &channel);

    let deadline = tokio::time::sleep(connect_timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            command = commands.recv() => {
                let Some(command) = command else { break };
                if let Err(reason) = apply_command(&pc, &events, &open, &channel, command).await {
                    events.failed(reason);
                    break;
                }
            }
            _ = &mut deadline, if !open.load(Ordering::SeqCst) => {
                events.failed("timed out connecting");
                break;
            }
        }
    }

    events.finish(None);
    let dc = channel.lock().take();
    if let Some(dc) = dc {
        let _ = dc.close().await;
    }
    if let Err(e) = pc.close().await {
        debug!("Error closing peer connection to {}: {}", events.peer, e);
    }
}

async fn apply_command(
    pc: &Arc<RTCPeerConnection>,
    events: &LinkEvents,
    open: &Arc<AtomicBool>,
    channel: &ChannelSlot,
    command: Command,
) -> Result<(), String> {
    match command {
        Command::Offer => {
            let init = RTCDataChannelInit {
                ordered: Some(true),
                max_retransmits: Some(0),
                ..Default::default()
            };
            let dc = pc
                .create_data_channel(DATA_CHANNEL_LABEL, Some(init))
                .await
                .map_err(|e| format!("data channel: {}", e))?;
            install_channel_handlers(&dc, events, open);
            *channel.lock() = Some(dc);

            let offer = pc
                .create_offer(None)
                .await
                .map_err(|e| format!("create offer: {}", e))?;
            // Candidates gather only once the description is set
            events.description(offer.sdp.clone());
            pc.set_local_description(offer)
                .await
                .map_err(|e| format!("set local description: {}", e))?;
        }
        Command::Answer(offer) => {
            pc.set_remote_description(offer)
                .await
                .map_err(|e| format!("set remote description: {}", e))?;
            let answer = pc
                .create_answer(None)
                .await
                .map_err(|e| format!("create answer: {}", e))?;
            events.description(answer.sdp.clone());
            pc.set_local_description(answer)
                .await
                .map_err(|e| format!("set local description: {}", e))?;
        }
        Command::RemoteAnswer(answer) => {
            pc.set_remote_description(answer)
                .await
                .map_err(|e| format!("set remote description: {}", e))?;
        }
        Command::Candidate(init) => {
            if let Err(e) = pc.add_ice_candidate(init).await {
                warn!("Ignoring candidate from {}: {}", events.peer, e);
            }
        }
        Command::Send(payload) => {
            let dc = channel.lock().clone();
            match dc {
                Some(dc) => {
                    if let Err(e) = dc.send(&payload).await {
                        debug!("Send to {} dropped: {}", events.peer, e);
                    }
                }
                None => debug!("Send to {} before data channel", events.peer),
            }
        }
    }
    Ok(())
}

fn install_connection_handlers(
    pc: &Arc<RTCPeerConnection>,
    events: &LinkEvents,
    open: &Arc<AtomicBool>,
    channel: &ChannelSlot,
) {
    let candidate_events = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
        let events = candidate_events.clone();
        Box::pin(async move {
            let Some(candidate) = candidate else { return };
            let encoded = candidate
                .to_json()
                .map_err(|e| e.to_string())
                .and_then(|init| serde_json::to_string(&init).map_err(|e| e.to_string()));
            match encoded {
                Ok(candidate) => events.candidate(candidate),
                Err(e) => warn!("Failed to encode local candidate: {}", e),
            }
        })
    }));

    let state_events = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
        let events = state_events.clone();
        Box::pin(async move {
            debug!("Connection to {} is {}", events.peer, state);
            match link_loss(state) {
                Some(LinkLoss::Failed) => events.failed("connection failed"),
                Some(LinkLoss::Closed) => events.closed(),
                None if state == RTCPeerConnectionState::Disconnected => {
                    info!("Connection to {} interrupted", events.peer);
                }
                None => {}
            }
        })
    }));

    let channel_events = events.clone();
    let channel_open = Arc::clone(open);
    let channel_slot = Arc::clone(channel);
    pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
        let events = channel_events.clone();
        let open = Arc::clone(&channel_open);
        let slot = Arc::clone(&channel_slot);
        Box::pin(async move {
            if dc.label() != DATA_CHANNEL_LABEL {
                debug!("Ignoring data channel '{}' from {}", dc.label(), events.peer);
                return;
            }
            install_channel_handlers(&dc, &events, &open);
            *slot.lock() = Some(dc);
        })
    }));
}

fn install_channel_handlers(dc: &Arc<RTCDataChannel>, events: &LinkEvents, open: &Arc<AtomicBool>) {
    let open_events = events.clone();
    let open_flag = Arc::clone(open);
    dc.on_open(Box::new(move || {
        open_flag.store(true, Ordering::SeqCst);
        open_events.open();
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |message: DataChannelMessage| {
        message_events.data(message.data.to_vec());
        Box::pin(async {})
    }));

    let close_events = events.clone();
    dc.on_close(Box::new(move || {
        close_events.closed();
        Box::pin(async {})
    }));
}
