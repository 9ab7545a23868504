//! The client session
//!
//! A [`Session`] is created when the client starts and owns everything the
//! client knows about the shared game: its own peer id, who the host is, the
//! peer cache, every peer link and, while hosting, the simulation. All
//! signaling messages, transport events and simulation steps go through it
//! on one task, so authority checks always see the current state.
//!
//! Authority follows the signaling service. A client becomes host only on
//! `host.assigned` and stops the moment `host.changed` names someone else.

use crate::event_bus::{Event, EventBus};
use crate::game::GameState;
use crate::input::{ConfigTracker, InputTracker};
use crate::peer_manager::{CloseReason, LinkOutput, PeerConnectionManager};
use crate::replication::{InputBuffer, RemovedEntities, TickDiffer, ViewerState};
use crate::signaling::{self, SignalSender, SignalingError, SignalingEvent};
use crate::transport::{LinkTransport, TransportConfig, TransportEvent, WebRtcTransport};
use log::{debug, info, warn};
use shared::{
    ClientSignal, EntityId, GameTick, Joystick, LinkMessage, PeerId, Role, ServerSignal,
    MAX_TICK_RATE, MIN_TICK_RATE,
};
use std::collections::BTreeMap;
use std::rc::Rc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use url::Url;

/// Sent ticks between snapshot checkpoints to the signaling service
pub const CHECKPOINT_INTERVAL: u32 = 30;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("invalid ICE server '{0}'")]
    InvalidIceServer(String),
    #[error("invalid color '{0}', expected #rrggbb")]
    InvalidColor(String),
    #[error(transparent)]
    Signaling(#[from] SignalingError),
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub server_url: String,
    pub role: Role,
    pub tick_rate: u32,
    pub transport: TransportConfig,
    /// Display name announced to the host by players
    pub name: Option<String>,
    pub color: Option<String>,
}

impl SessionConfig {
    /// Validates the server URL and ICE servers; the tick rate is clamped to
    /// the supported range.
    pub fn new<S: AsRef<str>>(
        server_url: &str,
        role: Role,
        tick_rate: u32,
        ice_servers: &[S],
    ) -> Result<Self, SessionError> {
        signaling::signaling_url(server_url, role)?;

        let ice_servers = ice_servers
            .iter()
            .map(|server| {
                let server = server.as_ref();
                match Url::parse(server) {
                    Ok(url) if matches!(url.scheme(), "stun" | "stuns" | "turn" | "turns") => {
                        Ok(server.to_string())
                    }
                    _ => Err(SessionError::InvalidIceServer(server.to_string())),
                }
            })
            .collect::<Result<Vec<String>, _>>()?;

        let clamped = tick_rate.clamp(MIN_TICK_RATE, MAX_TICK_RATE);
        if clamped != tick_rate {
            warn!("Tick rate {} out of range, using {}", tick_rate, clamped);
        }

        Ok(Self {
            server_url: server_url.to_string(),
            role,
            tick_rate: clamped,
            transport: TransportConfig {
                ice_servers,
                ..TransportConfig::default()
            },
            name: None,
            color: None,
        })
    }

    pub fn with_profile(
        mut self,
        name: Option<String>,
        color: Option<String>,
    ) -> Result<Self, SessionError> {
        if let Some(color) = &color {
            if !is_hex_color(color) {
                return Err(SessionError::InvalidColor(color.clone()));
            }
        }
        self.name = name;
        self.color = color;
        Ok(self)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate as f64)
    }
}

fn is_hex_color(color: &str) -> bool {
    color.len() == 7
        && color.starts_with('#')
        && color[1..].chars().all(|c| c.is_ascii_hexdigit())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authority {
    Waiting,
    Viewer { host: PeerId },
    Host,
}

struct HostRuntime {
    game: GameState,
    differ: TickDiffer,
    inputs: InputBuffer,
    removed: RemovedEntities,
    ticks_sent: u32,
}

impl HostRuntime {
    fn new(game: GameState, removed: RemovedEntities) -> Self {
        Self {
            game,
            differ: TickDiffer::new(),
            inputs: InputBuffer::new(),
            removed,
            ticks_sent: 0,
        }
    }
}

/// Event sources the session loop drains
pub struct SessionInputs {
    pub signaling: mpsc::UnboundedReceiver<SignalingEvent>,
    pub transport: mpsc::UnboundedReceiver<TransportEvent>,
}

pub struct Session<T: LinkTransport> {
    local_id: Option<PeerId>,
    role: Role,
    authority: Authority,
    peers: BTreeMap<PeerId, Role>,
    manager: PeerConnectionManager<T>,
    bus: Rc<EventBus<Event>>,
    viewer: ViewerState,
    host: Option<HostRuntime>,
    input: InputTracker,
    profile: ConfigTracker,
    signals: SignalSender,
}

impl Session<WebRtcTransport> {
    /// Creates the peer transport and opens the signaling connection.
    pub async fn connect(config: &SessionConfig) -> Result<(Self, SessionInputs), SessionError> {
        let (transport, transport_events) = WebRtcTransport::new(config.transport.clone());
        let connection = signaling::connect(&config.server_url, config.role).await?;

        let mut session = Session::new(config.role, transport, connection.outgoing);
        session.set_player_config(config.name.clone(), config.color.clone());
        Ok((
            session,
            SessionInputs {
                signaling: connection.incoming,
                transport: transport_events,
            },
        ))
    }
}

impl<T: LinkTransport> Session<T> {
    pub fn new(role: Role, transport: T, signals: SignalSender) -> Self {
        Self {
            local_id: None,
            role,
            authority: Authority::Waiting,
            peers: BTreeMap::new(),
            manager: PeerConnectionManager::new(transport),
            bus: Rc::new(EventBus::new()),
            viewer: ViewerState::new(),
            host: None,
            input: InputTracker::new(PeerId::new("")),
            profile: ConfigTracker::new(PeerId::new("")),
            signals,
        }
    }

    pub fn local_id(&self) -> Option<&PeerId> {
        self.local_id.as_ref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn is_host(&self) -> bool {
        self.authority == Authority::Host
    }

    pub fn current_host(&self) -> Option<&PeerId> {
        match &self.authority {
            Authority::Viewer { host } => Some(host),
            _ => None,
        }
    }

    pub fn peers(&self) -> &BTreeMap<PeerId, Role> {
        &self.peers
    }

    pub fn bus(&self) -> Rc<EventBus<Event>> {
        Rc::clone(&self.bus)
    }

    pub fn viewer(&self) -> &ViewerState {
        &self.viewer
    }

    /// The simulation, present only while hosting.
    pub fn game(&self) -> Option<&GameState> {
        self.host.as_ref().map(|host| &host.game)
    }

    pub fn manager(&self) -> &PeerConnectionManager<T> {
        &self.manager
    }

    fn emit(&self, event: Event, from: Option<&PeerId>) {
        self.bus.dispatch(event.name(), &event, from);
    }

    fn send_signal(&self, signal: ClientSignal) {
        if !self.signals.send(signal) {
            debug!("Signaling connection closed, dropping signal");
        }
    }

    pub fn handle_signal(&mut self, signal: ServerSignal) {
        match signal {
            ServerSignal::Welcome {
                peer_id,
                role,
                peers,
                host_peer_id,
            } => {
                info!("Joined session as {} ({})", peer_id, role);
                self.input.set_peer_id(peer_id.clone());
                self.profile.set_peer_id(peer_id.clone());
                self.peers = peers
                    .into_iter()
                    .filter(|peer| peer.peer_id != peer_id)
                    .map(|peer| (peer.peer_id, peer.role))
                    .collect();

                match host_peer_id {
                    Some(host) if host != peer_id => {
                        self.authority = Authority::Viewer { host };
                    }
                    _ => {
                        self.authority = Authority::Waiting;
                        self.emit(Event::Waiting, None);
                    }
                }
                self.local_id = Some(peer_id);
            }
            ServerSignal::PeerJoined { peer_id, role } => {
                if Some(&peer_id) == self.local_id.as_ref() {
                    return;
                }
                self.peers.insert(peer_id.clone(), role);
                self.emit(
                    Event::PeerJoined {
                        peer_id: peer_id.clone(),
                        role,
                    },
                    None,
                );

                if let Some(host) = &mut self.host {
                    if role == Role::Player && host.game.add_player(&peer_id) {
                        host.removed.forget(&EntityId::from(&peer_id));
                    }
                    // A re-announced peer gets a fresh link
                    self.manager.close(&peer_id);
                    self.manager.open(&peer_id);
                }
            }
            ServerSignal::PeerLeft { peer_id } => {
                self.peers.remove(&peer_id);
                self.manager.close(&peer_id);

                if let Some(host) = &mut self.host {
                    let id = EntityId::from(&peer_id);
                    if host.game.remove_player(&id) {
                        host.removed.record(id.clone());
                        self.manager.broadcast(&LinkMessage::EntityRemoved { id });
                    }
                }
                self.emit(Event::PeerLeft(peer_id), None);
            }
            ServerSignal::HostAssigned {
                peer_id,
                last_known_snapshot,
            } => {
                if Some(&peer_id) != self.local_id.as_ref() {
                    warn!("Ignoring host assignment for {}", peer_id);
                    return;
                }
                self.become_host(last_known_snapshot);
            }
            ServerSignal::HostChanged { peer_id: Some(host) } => {
                if Some(&host) == self.local_id.as_ref() {
                    debug!("host.changed names this client, waiting for host.assigned");
                    return;
                }

                self.stop_host();
                for peer in self.manager.active_peers() {
                    if peer != host {
                        self.manager.close(&peer);
                    }
                }

                info!("Host is now {}", host);
                self.authority = Authority::Viewer { host: host.clone() };
                self.input.invalidate();
                self.profile.invalidate();
                self.emit(Event::HostChanged(Some(host)), None);
            }
            ServerSignal::HostChanged { peer_id: None } => {
                self.stop_host();
                self.manager.close_all();

                info!("No host available, waiting");
                self.authority = Authority::Waiting;
                self.emit(Event::HostChanged(None), None);
                self.emit(Event::Waiting, None);
            }
            ServerSignal::Offer { from, sdp, .. } => match &self.authority {
                Authority::Viewer { host } if *host == from => {
                    self.manager.handle_offer(&from, &sdp);
                }
                _ => warn!("Ignoring offer from {} which is not the current host", from),
            },
            ServerSignal::Answer { from, sdp, .. } => {
                if self.is_host() {
                    self.manager.handle_answer(&from, &sdp);
                } else {
                    debug!("Ignoring answer from {} while not hosting", from);
                }
            }
            ServerSignal::Candidate {
                from, candidate, ..
            } => {
                if self.is_host() || self.current_host() == Some(&from) {
                    self.manager.handle_candidate(&from, &candidate);
                } else {
                    debug!("Ignoring candidate from {}", from);
                }
            }
            ServerSignal::Error { message } => {
                warn!("Signaling service reported: {}", message);
            }
        }

        self.pump_outputs();
    }

    pub fn handle_signaling_lost(&mut self) {
        warn!("Lost signaling connection, tearing down links");
        self.stop_host();
        self.manager.close_all();
        self.peers.clear();
        self.authority = Authority::Waiting;
        self.pump_outputs();
        self.emit(Event::Waiting, None);
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        self.manager.handle_transport_event(event);
        self.pump_outputs();
    }

    /// Runs one simulation step while hosting, otherwise forwards changed
    /// local input to the host.
    pub fn step(&mut self, dt: f32) {
        if let Some(host) = &mut self.host {
            for input in host.inputs.drain() {
                host.game.apply_input(&input);
            }
            host.game.step(dt);

            if let Some(tick) = host.differ.diff(host.game.snapshot()) {
                self.manager.broadcast(&LinkMessage::StateTick(tick.clone()));
                host.ticks_sent += 1;

                if host.ticks_sent % CHECKPOINT_INTERVAL == 0 {
                    match serde_json::to_value(&tick) {
                        Ok(snapshot) => {
                            self.signals
                                .send(ClientSignal::SnapshotCheckpoint { snapshot });
                        }
                        Err(e) => warn!("Failed to encode checkpoint: {}", e),
                    }
                }
            }
        } else if self.role == Role::Player {
            if let Authority::Viewer { host } = &self.authority {
                if self.manager.is_open(host) {
                    if let Some(config) = self.profile.poll() {
                        let result = self
                            .manager
                            .send(host, &LinkMessage::PlayerConfig(config));
                        if !result.is_delivered() {
                            debug!("Player config to {} dropped: {:?}", host, result);
                            self.profile.invalidate();
                        }
                    }
                    if let Some(update) = self.input.poll() {
                        let result = self
                            .manager
                            .send(host, &LinkMessage::InputUpdate(update));
                        if !result.is_delivered() {
                            debug!("Input to {} dropped: {:?}", host, result);
                            self.input.invalidate();
                        }
                    }
                }
            }
        }

        self.pump_outputs();
    }

    pub fn set_input(&mut self, buttons: [bool; 2], joystick: Joystick) {
        self.input.set_buttons(buttons);
        self.input.set_joystick(joystick.force, joystick.angle);
    }

    /// Sets the name and colour announced to the host; players only.
    pub fn set_player_config(&mut self, name: Option<String>, color: Option<String>) {
        if self.role != Role::Player {
            return;
        }
        self.profile.set(name, color);
    }

    pub fn shutdown(&mut self) {
        info!("Shutting down session with {} replicated entities", self.viewer.len());
        self.stop_host();
        self.manager.close_all();
        self.authority = Authority::Waiting;
        self.pump_outputs();
    }

    /// Drives the session until signaling is lost or Ctrl+C is pressed.
    pub async fn run(mut self, inputs: SessionInputs, tick_interval: Duration) {
        let SessionInputs {
            mut signaling,
            mut transport,
        } = inputs;

        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let dt = tick_interval.as_secs_f32();

        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                event = signaling.recv() => match event {
                    Some(SignalingEvent::Signal(signal)) => self.handle_signal(signal),
                    Some(SignalingEvent::Lost) | None => {
                        self.handle_signaling_lost();
                        break;
                    }
                },
                Some(event) = transport.recv() => self.handle_transport_event(event),
                _ = ticker.tick() => self.step(dt),
                _ = &mut ctrl_c => {
                    info!("Received Ctrl+C, shutting down");
                    break;
                }
            }
        }

        self.shutdown();
    }

    fn become_host(&mut self, checkpoint: Option<serde_json::Value>) {
        if self.is_host() {
            return;
        }

        let seed = match (self.viewer.observed_tick(), checkpoint) {
            (Some(tick), _) => tick,
            (None, Some(value)) => serde_json::from_value::<GameTick>(value).unwrap_or_else(|e| {
                warn!("Ignoring unreadable checkpoint: {}", e);
                GameTick::default()
            }),
            (None, None) => GameTick::default(),
        };

        let players: Vec<PeerId> = self
            .peers
            .iter()
            .filter(|(_, role)| **role == Role::Player)
            .map(|(peer, _)| peer.clone())
            .collect();

        let mut game = GameState::seed_from(&seed);
        let mut removed = RemovedEntities::new();
        game.ships.retain(|id, _| {
            let present = players.iter().any(|peer| peer.as_str() == id.as_str());
            if !present {
                removed.record(id.clone());
            }
            present
        });
        for peer in &players {
            game.add_player(peer);
        }

        self.viewer.clear();
        self.manager.close_all();
        info!("Now hosting {} ships", game.ships.len());
        self.authority = Authority::Host;
        self.host = Some(HostRuntime::new(game, removed));
        self.emit(Event::HostStarted, None);

        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.manager.open(&peer);
        }
    }

    fn stop_host(&mut self) {
        if self.host.take().is_some() {
            info!("Stopped hosting");
            self.emit(Event::HostStopped, None);
        }
    }

    fn pump_outputs(&mut self) {
        while let Some(output) = self.manager.poll_output() {
            match output {
                LinkOutput::Signal(signal) => self.send_signal(signal),
                LinkOutput::Opened(peer) => self.on_link_opened(peer),
                LinkOutput::Closed { peer, reason } => self.on_link_closed(peer, reason),
                LinkOutput::Message { peer, message } => self.handle_link_message(peer, message),
            }
        }
    }

    fn on_link_opened(&mut self, peer: PeerId) {
        if let Some(host) = &mut self.host {
            let tick = host.game.snapshot();
            let removed = host.removed.missing_from(&tick);
            match host.differ.diff(tick.clone()) {
                Some(changed) => {
                    self.manager.broadcast(&LinkMessage::StateTick(changed));
                }
                None => {
                    self.manager.send(&peer, &LinkMessage::StateTick(tick));
                }
            }
            // Removals broadcast while the link negotiated never reached it
            for id in removed {
                self.manager.send(&peer, &LinkMessage::EntityRemoved { id });
            }
        } else if self.current_host() == Some(&peer) {
            self.input.invalidate();
            self.profile.invalidate();
        }
        self.emit(Event::LinkOpened(peer.clone()), Some(&peer));
    }

    fn on_link_closed(&mut self, peer: PeerId, reason: CloseReason) {
        self.emit(Event::LinkClosed(peer.clone()), Some(&peer));

        if let CloseReason::Failed(reason) = reason {
            let involves_host = self.is_host() || self.current_host() == Some(&peer);
            if involves_host && self.peers.contains_key(&peer) {
                info!("Link to {} failed ({}), requesting re-negotiation", peer, reason);
                self.send_signal(ClientSignal::LinkFailed { peer_id: peer });
            }
        }
    }

    fn handle_link_message(&mut self, from: PeerId, message: LinkMessage) {
        match message {
            LinkMessage::InputUpdate(mut update) => {
                let Some(host) = &mut self.host else {
                    debug!("Ignoring input from {} while not hosting", from);
                    return;
                };
                host.inputs.push(&from, update.clone());
                update.peer_id = from.clone();
                self.emit(Event::Link(LinkMessage::InputUpdate(update)), Some(&from));
            }
            LinkMessage::PlayerConfig(mut config) => {
                let Some(host) = &mut self.host else {
                    debug!("Ignoring player.config from {} while not hosting", from);
                    return;
                };
                config.peer_id = from.clone();
                host.game.apply_config(&config);
                self.emit(Event::Link(LinkMessage::PlayerConfig(config)), Some(&from));
            }
            LinkMessage::StateTick(tick) => {
                if self.current_host() != Some(&from) {
                    debug!("Ignoring tick from {} which is not the host", from);
                    return;
                }
                self.viewer.apply_tick(&tick);
                self.emit(Event::Link(LinkMessage::StateTick(tick)), Some(&from));
            }
            LinkMessage::EntityRemoved { id } => {
                if self.current_host() != Some(&from) {
                    debug!("Ignoring entity.removed from {}", from);
                    return;
                }
                self.viewer.remove_entity(&id);
                self.emit(Event::Link(LinkMessage::EntityRemoved { id }), Some(&from));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use serde_json::json;
    use shared::{EntityState, InputUpdate, PeerInfo, PlayerConfig};
    use std::cell::RefCell;

    struct Harness {
        session: Session<MockTransport>,
        signals: mpsc::UnboundedReceiver<ClientSignal>,
        events: Rc<RefCell<Vec<String>>>,
    }

    impl Harness {
        fn new(role: Role) -> Self {
            let (tx, signals) = mpsc::unbounded_channel();
            let session = Session::new(role, MockTransport::default(), SignalSender::new(tx));

            let events = Rc::new(RefCell::new(Vec::new()));
            let bus = session.bus();
            for name in [
                Event::HOST_STARTED,
                Event::HOST_STOPPED,
                Event::WAITING,
                Event::LINK_OPENED,
                Event::LINK_CLOSED,
                LinkMessage::STATE_TICK,
                LinkMessage::INPUT_UPDATE,
                LinkMessage::PLAYER_CONFIG,
            ] {
                let events = Rc::clone(&events);
                bus.on(name, move |event: &Event, _| {
                    events.borrow_mut().push(event.name().to_string());
                    Ok(())
                });
            }

            Harness {
                session,
                signals,
                events,
            }
        }

        /// Handles `signal`, then delivers any descriptions the transport generated
        fn signal(&mut self, signal: ServerSignal) {
            self.session.handle_signal(signal);
            self.settle();
        }

        fn settle(&mut self) {
            loop {
                let pending = std::mem::take(&mut self.session.manager.transport_mut().pending);
                if pending.is_empty() {
                    break;
                }
                for event in pending {
                    self.session.handle_transport_event(event);
                }
            }
        }

        fn signals(&mut self) -> Vec<ClientSignal> {
            std::iter::from_fn(|| self.signals.try_recv().ok()).collect()
        }

        fn events(&self) -> Vec<String> {
            self.events.borrow().clone()
        }

        fn welcome(&mut self, peers: &[(&str, Role)], host: Option<&str>) {
            self.signal(ServerSignal::Welcome {
                peer_id: me(),
                role: self.session.role(),
                peers: peers
                    .iter()
                    .map(|(id, role)| PeerInfo {
                        peer_id: PeerId::from(*id),
                        role: *role,
                        is_host: Some(*id) == host,
                    })
                    .collect(),
                host_peer_id: host.map(PeerId::from),
            });
        }

        fn assign_host(&mut self, snapshot: Option<serde_json::Value>) {
            self.signal(ServerSignal::HostAssigned {
                peer_id: me(),
                last_known_snapshot: snapshot,
            });
        }

        /// Completes the host-initiated link to `peer`
        fn complete_link(&mut self, peer: &str) {
            let peer = PeerId::from(peer);
            self.signal(ServerSignal::Answer {
                from: peer.clone(),
                to: me(),
                sdp: "answer".to_string(),
            });
            self.open_event(&peer);
        }

        /// Accepts an offer from the host and opens the link
        fn accept_link(&mut self, host: &str) {
            let host = PeerId::from(host);
            self.signal(ServerSignal::Offer {
                from: host.clone(),
                to: me(),
                sdp: "offer".to_string(),
            });
            self.open_event(&host);
        }

        fn open_event(&mut self, peer: &PeerId) {
            let link = self.session.manager().transport().link_for(peer).unwrap();
            self.session.handle_transport_event(TransportEvent::Open {
                peer: peer.clone(),
                link,
            });
        }

        fn data(&mut self, from: &str, message: LinkMessage) {
            let peer = PeerId::from(from);
            let link = self.session.manager().transport().link_for(&peer).unwrap();
            self.session.handle_transport_event(TransportEvent::Data {
                peer,
                link,
                payload: message.encode().unwrap(),
            });
        }

        fn sent_to(&self, peer: &str) -> Vec<LinkMessage> {
            self.session
                .manager()
                .transport()
                .sent
                .iter()
                .filter(|(p, _)| p.as_str() == peer)
                .map(|(_, bytes)| LinkMessage::decode(bytes).unwrap())
                .collect()
        }
    }

    fn me() -> PeerId {
        PeerId::from("me")
    }

    fn ticks(messages: &[LinkMessage]) -> usize {
        messages
            .iter()
            .filter(|m| matches!(m, LinkMessage::StateTick(_)))
            .count()
    }

    fn hosting(peers: &[(&str, Role)]) -> Harness {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(peers, None);
        harness.assign_host(None);
        harness
    }

    #[test]
    fn test_welcome_with_host_makes_viewer() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("h", Role::Viewer)], Some("h"));

        assert_eq!(
            harness.session.authority(),
            &Authority::Viewer {
                host: PeerId::from("h")
            }
        );
        assert_eq!(harness.session.local_id(), Some(&me()));
        assert_eq!(harness.session.peers().len(), 1);
        assert!(harness.events().is_empty());
    }

    #[test]
    fn test_welcome_without_host_waits() {
        let mut harness = Harness::new(Role::Player);
        harness.welcome(&[], None);

        assert_eq!(harness.session.authority(), &Authority::Waiting);
        assert_eq!(harness.events(), vec!["session.waiting"]);
    }

    #[test]
    fn test_offers_only_accepted_from_host() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("h", Role::Viewer), ("x", Role::Viewer)], Some("h"));

        harness.signal(ServerSignal::Offer {
            from: PeerId::from("x"),
            to: me(),
            sdp: "offer".to_string(),
        });
        assert!(harness.signals().is_empty());

        harness.signal(ServerSignal::Offer {
            from: PeerId::from("h"),
            to: me(),
            sdp: "offer".to_string(),
        });
        assert!(matches!(
            harness.signals().as_slice(),
            [ClientSignal::Answer { to, .. }] if to.as_str() == "h"
        ));
    }

    #[test]
    fn test_host_assignment_opens_links_and_spawns_players() {
        let mut harness = hosting(&[("v1", Role::Viewer), ("p1", Role::Player)]);

        assert!(harness.session.is_host());
        assert_eq!(harness.events(), vec!["host.started"]);

        let offers: Vec<PeerId> = harness
            .signals()
            .into_iter()
            .filter_map(|signal| match signal {
                ClientSignal::Offer { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(offers, vec![PeerId::from("p1"), PeerId::from("v1")]);

        let game = harness.session.game().unwrap();
        assert_eq!(game.ships.len(), 1);
        assert!(game.ships.contains_key(&EntityId::from("p1")));
    }

    #[test]
    fn test_assignment_for_other_peer_ignored() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[], None);
        harness.signal(ServerSignal::HostAssigned {
            peer_id: PeerId::from("someone"),
            last_known_snapshot: None,
        });
        assert!(!harness.session.is_host());
    }

    #[test]
    fn test_identical_ticks_sent_once() {
        let mut harness = hosting(&[("v1", Role::Viewer)]);
        harness.complete_link("v1");

        harness.session.step(1.0 / 30.0);
        harness.session.step(1.0 / 30.0);
        harness.session.step(1.0 / 30.0);

        assert_eq!(ticks(&harness.sent_to("v1")), 1);
    }

    #[test]
    fn test_new_link_receives_current_tick() {
        let mut harness = hosting(&[("v1", Role::Viewer)]);
        harness.complete_link("v1");
        harness.session.step(1.0 / 30.0);

        harness.signal(ServerSignal::PeerJoined {
            peer_id: PeerId::from("v2"),
            role: Role::Viewer,
        });
        harness.complete_link("v2");

        assert_eq!(ticks(&harness.sent_to("v2")), 1);
        harness.session.step(1.0 / 30.0);
        assert_eq!(ticks(&harness.sent_to("v2")), 1);
    }

    #[test]
    fn test_input_applied_to_link_owner() {
        let mut harness = hosting(&[("p1", Role::Player), ("p2", Role::Player)]);
        harness.complete_link("p1");

        harness.data(
            "p1",
            LinkMessage::InputUpdate(InputUpdate {
                peer_id: PeerId::from("p2"),
                buttons: None,
                joystick: Some(Joystick {
                    force: 1.0,
                    angle: 0.0,
                }),
            }),
        );
        harness.session.step(1.0 / 30.0);

        let game = harness.session.game().unwrap();
        assert!(game.ships[&EntityId::from("p1")].velocity[0] > 0.0);
        assert_eq!(game.ships[&EntityId::from("p2")].velocity, [0.0, 0.0]);
        assert!(harness.events().contains(&"input.update".to_string()));
    }

    #[test]
    fn test_player_departure_broadcasts_removal() {
        let mut harness = hosting(&[("v1", Role::Viewer), ("p1", Role::Player)]);
        harness.complete_link("v1");

        harness.signal(ServerSignal::PeerLeft {
            peer_id: PeerId::from("p1"),
        });

        assert!(harness
            .sent_to("v1")
            .contains(&LinkMessage::EntityRemoved { id: "p1".into() }));
        assert!(harness.session.game().unwrap().ships.is_empty());
    }

    #[test]
    fn test_link_opened_after_departure_learns_removal() {
        let mut harness = hosting(&[("v1", Role::Viewer), ("p1", Role::Player)]);
        harness.session.step(1.0 / 30.0);

        harness.signal(ServerSignal::PeerLeft {
            peer_id: PeerId::from("p1"),
        });
        harness.complete_link("v1");
        harness.session.step(1.0 / 30.0);
        harness.session.step(1.0 / 30.0);

        let sent = harness.sent_to("v1");
        assert!(sent.contains(&LinkMessage::EntityRemoved { id: "p1".into() }));
        for message in &sent {
            if let LinkMessage::StateTick(tick) = message {
                assert!(tick.entities.iter().all(|e| e.id.as_str() != "p1"));
            }
        }
    }

    #[test]
    fn test_rejoined_player_not_reported_removed() {
        let mut harness = hosting(&[("v1", Role::Viewer), ("p1", Role::Player)]);
        harness.signal(ServerSignal::PeerLeft {
            peer_id: PeerId::from("p1"),
        });
        harness.signal(ServerSignal::PeerJoined {
            peer_id: PeerId::from("p1"),
            role: Role::Player,
        });

        harness.complete_link("v1");

        let sent = harness.sent_to("v1");
        assert!(!sent.contains(&LinkMessage::EntityRemoved { id: "p1".into() }));
        match sent.first() {
            Some(LinkMessage::StateTick(tick)) => {
                assert!(tick.entities.iter().any(|e| e.id.as_str() == "p1"));
            }
            other => panic!("Expected a tick first, got {:?}", other),
        }
    }

    #[test]
    fn test_player_config_names_own_ship() {
        let mut harness = hosting(&[("p1", Role::Player), ("p2", Role::Player)]);
        harness.complete_link("p1");

        harness.data(
            "p1",
            LinkMessage::PlayerConfig(PlayerConfig {
                peer_id: PeerId::from("p2"),
                name: Some("Ada".to_string()),
                color: Some("#00ff00".to_string()),
            }),
        );
        harness.session.step(1.0 / 30.0);

        let game = harness.session.game().unwrap();
        assert_eq!(game.ships[&EntityId::from("p1")].name.as_deref(), Some("Ada"));
        assert_eq!(game.ships[&EntityId::from("p2")].name, None);
        assert!(harness.events().contains(&"player.config".to_string()));

        let named = harness.sent_to("p1").into_iter().any(|message| match message {
            LinkMessage::StateTick(tick) => tick.entities.iter().any(|e| {
                e.id.as_str() == "p1" && e.color.as_deref() == Some("#00ff00")
            }),
            _ => false,
        });
        assert!(named);
    }

    #[test]
    fn test_host_changed_stops_hosting() {
        let mut harness = hosting(&[("v1", Role::Viewer), ("v2", Role::Viewer)]);
        harness.complete_link("v1");
        harness.complete_link("v2");

        harness.signal(ServerSignal::HostChanged {
            peer_id: Some(PeerId::from("v1")),
        });

        assert!(harness.session.game().is_none());
        assert_eq!(
            harness.session.authority(),
            &Authority::Viewer {
                host: PeerId::from("v1")
            }
        );
        assert!(harness.session.manager().is_open(&PeerId::from("v1")));
        assert!(!harness.session.manager().is_open(&PeerId::from("v2")));
        assert!(harness.events().contains(&"host.stopped".to_string()));
    }

    #[test]
    fn test_host_less_session_waits() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("h", Role::Viewer)], Some("h"));
        harness.accept_link("h");

        harness.signal(ServerSignal::HostChanged { peer_id: None });

        assert_eq!(harness.session.authority(), &Authority::Waiting);
        assert!(harness.session.manager().open_peers().is_empty());
        assert!(harness.events().contains(&"session.waiting".to_string()));
    }

    #[test]
    fn test_viewer_applies_host_ticks_and_removals() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("h", Role::Viewer)], Some("h"));
        harness.accept_link("h");

        harness.data(
            "h",
            LinkMessage::StateTick(GameTick {
                entities: vec![
                    EntityState::new("p1", [1.0, 1.0], 0.0),
                    EntityState::new("p2", [2.0, 2.0], 0.0),
                ],
            }),
        );
        assert_eq!(harness.session.viewer().len(), 2);

        harness.data("h", LinkMessage::EntityRemoved { id: "p1".into() });
        assert!(harness.session.viewer().entity(&"p1".into()).is_none());
        assert_eq!(harness.session.viewer().len(), 1);
    }

    #[test]
    fn test_viewer_rejects_input() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("h", Role::Viewer)], Some("h"));
        harness.accept_link("h");

        harness.data(
            "h",
            LinkMessage::InputUpdate(InputUpdate {
                peer_id: PeerId::from("h"),
                buttons: Some([true, true]),
                joystick: None,
            }),
        );
        assert!(!harness.events().contains(&"input.update".to_string()));
    }

    #[test]
    fn test_migration_seeds_from_checkpoint() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("p1", Role::Player)], None);

        let checkpoint = GameTick {
            entities: vec![
                EntityState::new("p1", [10.0, 20.0], 0.0),
                EntityState::new("gone", [0.0, 0.0], 0.0),
            ],
        };
        harness.assign_host(Some(serde_json::to_value(&checkpoint).unwrap()));

        let game = harness.session.game().unwrap();
        assert_eq!(game.ships.len(), 1);
        assert_eq!(game.ships[&EntityId::from("p1")].position, [10.0, 20.0]);
    }

    #[test]
    fn test_migration_prefers_observed_tick() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[("h", Role::Viewer), ("p1", Role::Player)], Some("h"));
        harness.accept_link("h");
        harness.data(
            "h",
            LinkMessage::StateTick(GameTick {
                entities: vec![EntityState::new("p1", [42.0, 7.0], 1.0)],
            }),
        );

        harness.signal(ServerSignal::PeerLeft {
            peer_id: PeerId::from("h"),
        });
        let stale = json!({ "entities": [{
            "id": "p1", "position": [0.0, 0.0], "rotation": 0.0,
            "velocity": null, "health": null
        }]});
        harness.assign_host(Some(stale));

        let game = harness.session.game().unwrap();
        assert_eq!(game.ships[&EntityId::from("p1")].position, [42.0, 7.0]);
        assert!(harness.session.viewer().is_empty());
    }

    #[test]
    fn test_unreadable_checkpoint_starts_empty() {
        let mut harness = Harness::new(Role::Viewer);
        harness.welcome(&[], None);
        harness.assign_host(Some(json!("garbage")));

        assert!(harness.session.is_host());
        assert!(harness.session.game().unwrap().ships.is_empty());
    }

    #[test]
    fn test_checkpoint_sent_periodically() {
        let mut harness = hosting(&[("p1", Role::Player)]);
        harness.signals();
        harness
            .session
            .host
            .as_mut()
            .unwrap()
            .game
            .ships
            .get_mut(&EntityId::from("p1"))
            .unwrap()
            .velocity = [5.0, 0.0];

        for _ in 0..CHECKPOINT_INTERVAL {
            harness.session.step(1.0 / 30.0);
        }

        let checkpoints = harness
            .signals()
            .into_iter()
            .filter(|s| matches!(s, ClientSignal::SnapshotCheckpoint { .. }))
            .count();
        assert_eq!(checkpoints, 1);
    }

    #[test]
    fn test_link_failure_requests_renegotiation() {
        let mut harness = hosting(&[("v1", Role::Viewer)]);
        harness.signals();
        let link = harness
            .session
            .manager()
            .transport()
            .link_for(&PeerId::from("v1"))
            .unwrap();

        harness.session.handle_transport_event(TransportEvent::Failed {
            peer: PeerId::from("v1"),
            link,
            reason: "no candidate answered".to_string(),
        });

        assert_eq!(
            harness.signals(),
            vec![ClientSignal::LinkFailed {
                peer_id: PeerId::from("v1")
            }]
        );

        harness.signal(ServerSignal::PeerJoined {
            peer_id: PeerId::from("v1"),
            role: Role::Viewer,
        });
        assert!(matches!(
            harness.signals().as_slice(),
            [ClientSignal::Offer { .. }]
        ));
    }

    #[test]
    fn test_signaling_lost_tears_down() {
        let mut harness = hosting(&[("v1", Role::Viewer)]);
        harness.complete_link("v1");

        harness.session.handle_signaling_lost();

        assert_eq!(harness.session.authority(), &Authority::Waiting);
        assert!(harness.session.game().is_none());
        assert!(harness.session.manager().open_peers().is_empty());
        assert!(harness.session.peers().is_empty());
        let events = harness.events();
        assert!(events.contains(&"link.closed".to_string()));
        assert_eq!(events.last().map(String::as_str), Some("session.waiting"));
    }

    #[test]
    fn test_player_sends_changed_input_to_host() {
        let mut harness = Harness::new(Role::Player);
        harness.welcome(&[("h", Role::Viewer)], Some("h"));
        harness.accept_link("h");

        harness.session.set_input(
            [false, false],
            Joystick {
                force: 0.5,
                angle: 1.0,
            },
        );
        harness.session.step(1.0 / 30.0);
        harness.session.step(1.0 / 30.0);

        let sent = harness.sent_to("h");
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            LinkMessage::InputUpdate(update) => {
                assert_eq!(update.peer_id, me());
                assert_eq!(update.joystick.map(|j| j.force), Some(0.5));
            }
            other => panic!("Unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_player_sends_config_once_link_opens() {
        let mut harness = Harness::new(Role::Player);
        harness
            .session
            .set_player_config(Some("Ada".to_string()), Some("#00ff00".to_string()));
        harness.welcome(&[("h", Role::Viewer)], Some("h"));
        harness.session.step(1.0 / 30.0);
        assert!(harness.sent_to("h").is_empty());

        harness.accept_link("h");
        harness.session.step(1.0 / 30.0);
        harness.session.step(1.0 / 30.0);

        let configs: Vec<PlayerConfig> = harness
            .sent_to("h")
            .into_iter()
            .filter_map(|message| match message {
                LinkMessage::PlayerConfig(config) => Some(config),
                _ => None,
            })
            .collect();
        assert_eq!(
            configs,
            vec![PlayerConfig {
                peer_id: me(),
                name: Some("Ada".to_string()),
                color: Some("#00ff00".to_string()),
            }]
        );
    }

    #[test]
    fn test_session_config_validation() {
        let config = SessionConfig::new(
            "ws://127.0.0.1:8080",
            Role::Viewer,
            500,
            &["stun:stun.example.test:3478"],
        )
        .unwrap();
        assert_eq!(config.tick_rate, MAX_TICK_RATE);
        assert_eq!(
            config.transport.ice_servers,
            vec!["stun:stun.example.test:3478".to_string()]
        );
        assert_eq!(
            config.tick_interval(),
            Duration::from_secs_f64(1.0 / MAX_TICK_RATE as f64)
        );

        let none: [&str; 0] = [];
        assert!(matches!(
            SessionConfig::new("ws://127.0.0.1:8080", Role::Viewer, 30, &["10.0.0.1:3478"]),
            Err(SessionError::InvalidIceServer(_))
        ));
        assert!(matches!(
            SessionConfig::new("http://x", Role::Viewer, 30, &none),
            Err(SessionError::Signaling(_))
        ));
        assert_eq!(
            SessionConfig::new("ws://x", Role::Viewer, 0, &none)
                .unwrap()
                .tick_rate,
            MIN_TICK_RATE
        );
    }

    #[test]
    fn test_profile_color_must_be_hex() {
        let none: [&str; 0] = [];
        let config = SessionConfig::new("ws://x", Role::Player, 30, &none).unwrap();

        let named = config
            .clone()
            .with_profile(Some("Ada".to_string()), Some("#A0b1C2".to_string()))
            .unwrap();
        assert_eq!(named.name.as_deref(), Some("Ada"));

        assert!(matches!(
            config.with_profile(None, Some("red".to_string())),
            Err(SessionError::InvalidColor(_))
        ));
    }
}
