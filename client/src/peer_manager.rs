//! Peer Connection Manager
//!
//! Drives the offer/answer/candidate exchange for each remote peer and exposes
//! open links as a best-effort message pipe. The manager performs no I/O of
//! its own: negotiation goes through a [`LinkTransport`], and everything the
//! session has to forward (signals to send, links opening and closing,
//! decoded messages) is queued as [`LinkOutput`] and drained with
//! [`PeerConnectionManager::poll_output`].
//!
//! The host always initiates. A link moves through
//! `Negotiating -> Answered -> Open -> Closed`; a negotiation error closes it
//! immediately and reports the closure so the session can request
//! re-negotiation.

use crate::transport::{LinkId, LinkTransport, TransportEvent};
use log::{debug, info, warn};
use shared::{ClientSignal, LinkMessage, PeerId};
use std::collections::{HashMap, VecDeque};

/// Remote candidates held per peer until its link has a remote description
pub const MAX_BUFFERED_CANDIDATES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Negotiation {
    OfferSent,
    OfferReceived,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Negotiating(Negotiation),
    Answered,
    Open,
    Closed,
}

impl LinkState {
    fn has_remote_description(self) -> bool {
        matches!(
            self,
            LinkState::Negotiating(Negotiation::OfferReceived) | LinkState::Answered | LinkState::Open
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    Local,
    Remote,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    NoLink,
    NotOpen,
    Encode(String),
    Transport(String),
}

/// Outcome of a send; sends never fail loudly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    Dropped(DropReason),
}

impl DeliveryResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryResult::Delivered)
    }
}

/// Work produced by the manager for the session to act on
#[derive(Debug, Clone, PartialEq)]
pub enum LinkOutput {
    Signal(ClientSignal),
    Opened(PeerId),
    Closed { peer: PeerId, reason: CloseReason },
    Message { peer: PeerId, message: LinkMessage },
}

#[derive(Debug)]
struct PeerLink {
    link: LinkId,
    state: LinkState,
    // Transport may open before the offerer has processed the answer
    transport_open: bool,
}

pub struct PeerConnectionManager<T: LinkTransport> {
    transport: T,
    links: HashMap<PeerId, PeerLink>,
    pending_candidates: HashMap<PeerId, VecDeque<String>>,
    next_link_id: u64,
    outputs: VecDeque<LinkOutput>,
}

impl<T: LinkTransport> PeerConnectionManager<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            links: HashMap::new(),
            pending_candidates: HashMap::new(),
            next_link_id: 1,
            outputs: VecDeque::new(),
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn state(&self, peer: &PeerId) -> Option<LinkState> {
        self.links.get(peer).map(|link| link.state)
    }

    pub fn is_open(&self, peer: &PeerId) -> bool {
        self.state(peer) == Some(LinkState::Open)
    }

    pub fn open_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, link)| link.state == LinkState::Open)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Peers with a link that is not closed, in peer order.
    pub fn active_peers(&self) -> Vec<PeerId> {
        let mut peers: Vec<PeerId> = self
            .links
            .iter()
            .filter(|(_, link)| link.state != LinkState::Closed)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    pub fn buffered_candidates(&self, peer: &PeerId) -> usize {
        self.pending_candidates.get(peer).map_or(0, VecDeque::len)
    }

    pub fn poll_output(&mut self) -> Option<LinkOutput> {
        self.outputs.pop_front()
    }

    fn allocate_link(&mut self) -> LinkId {
        let link = LinkId(self.next_link_id);
        self.next_link_id += 1;
        link
    }

    /// Starts negotiation towards `peer`; does nothing if a link is already
    /// negotiating, answered or open.
    pub fn open(&mut self, peer: &PeerId) {
        if matches!(self.state(peer), Some(state) if state != LinkState::Closed) {
            debug!("Link to {} already in progress", peer);
            return;
        }

        self.pending_candidates.remove(peer);
        let link = self.allocate_link();

        match self.transport.create_offer(peer, link) {
            Ok(()) => {
                self.links.insert(
                    peer.clone(),
                    PeerLink {
                        link,
                        state: LinkState::Negotiating(Negotiation::OfferSent),
                        transport_open: false,
                    },
                );
                debug!("Negotiating link to {}", peer);
            }
            Err(e) => {
                warn!("Failed to create offer for {}: {}", peer, e);
                self.transport.close(peer);
                self.outputs.push_back(LinkOutput::Closed {
                    peer: peer.clone(),
                    reason: CloseReason::Failed(e.to_string()),
                });
            }
        }
    }

    /// Answers an offer; a fresh offer replaces any existing link to `from`.
    pub fn handle_offer(&mut self, from: &PeerId, sdp: &str) {
        if let Some(existing) = self.links.get(from) {
            if existing.state != LinkState::Closed {
                debug!("Replacing link to {} with a fresh offer", from);
                self.transport.close(from);
            }
        }

        let link = self.allocate_link();
        self.links.insert(
            from.clone(),
            PeerLink {
                link,
                state: LinkState::Negotiating(Negotiation::OfferReceived),
                transport_open: false,
            },
        );

        match self.transport.accept_offer(from, link, sdp) {
            Ok(()) => self.flush_candidates(from),
            Err(e) => self.fail(from, format!("offer rejected: {}", e)),
        }
    }

    pub fn handle_answer(&mut self, from: &PeerId, sdp: &str) {
        let transport_open = match self.links.get(from) {
            Some(PeerLink {
                state: LinkState::Negotiating(Negotiation::OfferSent),
                transport_open,
                ..
            }) => *transport_open,
            other => {
                debug!(
                    "Dropping answer from {} in state {:?}",
                    from,
                    other.map(|link| link.state)
                );
                return;
            }
        };

        if let Err(e) = self.transport.accept_answer(from, sdp) {
            self.fail(from, format!("answer rejected: {}", e));
            return;
        }

        self.set_state(from, LinkState::Answered);
        self.flush_candidates(from);
        if transport_open {
            self.mark_open(from);
        }
    }

    pub fn handle_candidate(&mut self, from: &PeerId, candidate: &str) {
        let ready = self
            .state(from)
            .is_some_and(LinkState::has_remote_description);

        if ready {
            self.apply_candidate(from, candidate);
            return;
        }

        let buffer = self.pending_candidates.entry(from.clone()).or_default();
        if buffer.len() >= MAX_BUFFERED_CANDIDATES {
            buffer.pop_front();
            debug!("Candidate buffer for {} full, dropped oldest", from);
        }
        buffer.push_back(candidate.to_string());
    }

    fn apply_candidate(&mut self, from: &PeerId, candidate: &str) {
        if let Err(e) = self.transport.add_remote_candidate(from, candidate) {
            warn!("Ignoring candidate from {}: {}", from, e);
        }
    }

    fn flush_candidates(&mut self, peer: &PeerId) {
        if let Some(buffer) = self.pending_candidates.remove(peer) {
            for candidate in buffer {
                self.apply_candidate(peer, &candidate);
            }
        }
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        let current = self
            .links
            .get(event.peer())
            .filter(|link| link.link == event.link() && link.state != LinkState::Closed);
        if current.is_none() {
            debug!(
                "Ignoring event for superseded link {:?} to {}",
                event.link(),
                event.peer()
            );
            return;
        }

        match event {
            TransportEvent::LocalDescription { peer, sdp, .. } => self.local_description(&peer, sdp),
            TransportEvent::LocalCandidate {
                peer, candidate, ..
            } => {
                self.outputs
                    .push_back(LinkOutput::Signal(ClientSignal::Candidate {
                        to: peer,
                        candidate,
                    }));
            }
            TransportEvent::Open { peer, .. } => match self.state(&peer) {
                Some(LinkState::Answered) => self.mark_open(&peer),
                Some(LinkState::Negotiating(_)) => {
                    if let Some(link) = self.links.get_mut(&peer) {
                        link.transport_open = true;
                    }
                }
                _ => {}
            },
            TransportEvent::Data { peer, payload, .. } => {
                if !self.is_open(&peer) {
                    debug!("Dropping data from {} before link opened", peer);
                    return;
                }
                match LinkMessage::decode(&payload) {
                    Ok(message) => self.outputs.push_back(LinkOutput::Message { peer, message }),
                    Err(e) => warn!("Dropping malformed link message from {}: {}", peer, e),
                }
            }
            TransportEvent::Closed { peer, .. } => {
                self.set_state(&peer, LinkState::Closed);
                self.pending_candidates.remove(&peer);
                info!("Link to {} closed by remote", peer);
                self.outputs.push_back(LinkOutput::Closed {
                    peer,
                    reason: CloseReason::Remote,
                });
            }
            TransportEvent::Failed { peer, reason, .. } => self.fail(&peer, reason),
        }
    }

    /// Forwards a generated offer or answer to the remote peer.
    fn local_description(&mut self, peer: &PeerId, sdp: String) {
        let Some(link) = self.links.get(peer) else {
            return;
        };

        match link.state {
            LinkState::Negotiating(Negotiation::OfferSent) => {
                self.outputs.push_back(LinkOutput::Signal(ClientSignal::Offer {
                    to: peer.clone(),
                    sdp,
                }));
                debug!("Sent offer to {}", peer);
            }
            LinkState::Negotiating(Negotiation::OfferReceived) => {
                let transport_open = link.transport_open;
                self.set_state(peer, LinkState::Answered);
                self.outputs.push_back(LinkOutput::Signal(ClientSignal::Answer {
                    to: peer.clone(),
                    sdp,
                }));
                debug!("Sent answer to {}", peer);
                if transport_open {
                    self.mark_open(peer);
                }
            }
            state => debug!("Dropping local description for {} in state {:?}", peer, state),
        }
    }

    pub fn send(&mut self, peer: &PeerId, message: &LinkMessage) -> DeliveryResult {
        match self.state(peer) {
            None | Some(LinkState::Closed) => return DeliveryResult::Dropped(DropReason::NoLink),
            Some(LinkState::Open) => {}
            Some(_) => return DeliveryResult::Dropped(DropReason::NotOpen),
        }

        match message.encode() {
            Ok(payload) => self.send_encoded(peer, &payload),
            Err(e) => DeliveryResult::Dropped(DropReason::Encode(e.to_string())),
        }
    }

    /// Sends to every open link, returning per-peer results in peer order.
    pub fn broadcast(&mut self, message: &LinkMessage) -> Vec<(PeerId, DeliveryResult)> {
        let peers = self.open_peers();
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                let reason = DropReason::Encode(e.to_string());
                return peers
                    .into_iter()
                    .map(|peer| (peer, DeliveryResult::Dropped(reason.clone())))
                    .collect();
            }
        };

        peers
            .into_iter()
            .map(|peer| {
                let result = self.send_encoded(&peer, &payload);
                (peer, result)
            })
            .collect()
    }

    fn send_encoded(&mut self, peer: &PeerId, payload: &[u8]) -> DeliveryResult {
        match self.transport.send(peer, payload) {
            Ok(()) => DeliveryResult::Delivered,
            Err(e) => {
                debug!("Send to {} dropped: {}", peer, e);
                DeliveryResult::Dropped(DropReason::Transport(e.to_string()))
            }
        }
    }

    /// Tears down the link to `peer`. Calling it again has no effect.
    pub fn close(&mut self, peer: &PeerId) {
        self.pending_candidates.remove(peer);

        let active = matches!(self.state(peer), Some(state) if state != LinkState::Closed);
        if !active {
            return;
        }

        self.transport.close(peer);
        self.set_state(peer, LinkState::Closed);
        info!("Closed link to {}", peer);
        self.outputs.push_back(LinkOutput::Closed {
            peer: peer.clone(),
            reason: CloseReason::Local,
        });
    }

    pub fn close_all(&mut self) {
        let mut peers: Vec<PeerId> = self.links.keys().cloned().collect();
        peers.sort();
        for peer in peers {
            self.close(&peer);
        }
        self.pending_candidates.clear();
    }

    fn fail(&mut self, peer: &PeerId, reason: String) {
        warn!("Link to {} failed: {}", peer, reason);
        self.transport.close(peer);
        self.set_state(peer, LinkState::Closed);
        self.pending_candidates.remove(peer);
        self.outputs.push_back(LinkOutput::Closed {
            peer: peer.clone(),
            reason: CloseReason::Failed(reason),
        });
    }

    fn mark_open(&mut self, peer: &PeerId) {
        self.set_state(peer, LinkState::Open);
        info!("Link to {} open", peer);
        self.outputs.push_back(LinkOutput::Opened(peer.clone()));
    }

    fn set_state(&mut self, peer: &PeerId, state: LinkState) {
        if let Some(link) = self.links.get_mut(peer) {
            link.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::MockTransport;
    use shared::{EntityState, GameTick};

    fn manager() -> PeerConnectionManager<MockTransport> {
        PeerConnectionManager::new(MockTransport::default())
    }

    fn drain(manager: &mut PeerConnectionManager<MockTransport>) -> Vec<LinkOutput> {
        std::iter::from_fn(|| manager.poll_output()).collect()
    }

    fn link_of(manager: &PeerConnectionManager<MockTransport>, peer: &PeerId) -> LinkId {
        manager.links[peer].link
    }

    /// Delivers the description the transport generated for the current link
    fn describe(manager: &mut PeerConnectionManager<MockTransport>, peer: &PeerId, sdp: &str) {
        let link = link_of(manager, peer);
        manager.handle_transport_event(TransportEvent::LocalDescription {
            peer: peer.clone(),
            link,
            sdp: sdp.to_string(),
        });
    }

    /// Brings a link to `peer` all the way to open from the answering side
    fn open_as_answerer(manager: &mut PeerConnectionManager<MockTransport>, peer: &PeerId) {
        manager.handle_offer(peer, "offer");
        describe(manager, peer, "answer");
        let link = link_of(manager, peer);
        manager.handle_transport_event(TransportEvent::Open {
            peer: peer.clone(),
            link,
        });
        drain(manager);
    }

    fn tick() -> LinkMessage {
        LinkMessage::StateTick(GameTick {
            entities: vec![EntityState::new("p1", [1.0, 2.0], 0.0)],
        })
    }

    #[test]
    fn test_open_sends_offer_once() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");

        manager.open(&peer);
        manager.open(&peer);

        assert_eq!(manager.transport().offers.len(), 1);
        assert_eq!(
            manager.state(&peer),
            Some(LinkState::Negotiating(Negotiation::OfferSent))
        );
        assert!(drain(&mut manager).is_empty());

        describe(&mut manager, &peer, "offer-1");
        assert_eq!(
            drain(&mut manager),
            vec![LinkOutput::Signal(ClientSignal::Offer {
                to: peer,
                sdp: "offer-1".to_string()
            })]
        );
    }

    #[test]
    fn test_offerer_lifecycle() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);
        let link = link_of(&manager, &peer);
        drain(&mut manager);

        manager.handle_answer(&peer, "answer");
        assert_eq!(manager.state(&peer), Some(LinkState::Answered));

        manager.handle_transport_event(TransportEvent::Open {
            peer: peer.clone(),
            link,
        });
        assert!(manager.is_open(&peer));
        assert_eq!(drain(&mut manager), vec![LinkOutput::Opened(peer)]);
    }

    #[test]
    fn test_transport_open_before_answer() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);
        let link = link_of(&manager, &peer);
        drain(&mut manager);

        manager.handle_transport_event(TransportEvent::Open {
            peer: peer.clone(),
            link,
        });
        assert!(!manager.is_open(&peer));

        manager.handle_answer(&peer, "answer");
        assert!(manager.is_open(&peer));
        assert_eq!(drain(&mut manager), vec![LinkOutput::Opened(peer)]);
    }

    #[test]
    fn test_answerer_lifecycle() {
        let mut manager = manager();
        let host = PeerId::from("host");

        manager.handle_offer(&host, "offer");
        assert_eq!(
            manager.state(&host),
            Some(LinkState::Negotiating(Negotiation::OfferReceived))
        );
        assert!(drain(&mut manager).is_empty());

        describe(&mut manager, &host, "answer-1");
        assert_eq!(manager.state(&host), Some(LinkState::Answered));
        assert_eq!(
            drain(&mut manager),
            vec![LinkOutput::Signal(ClientSignal::Answer {
                to: host.clone(),
                sdp: "answer-1".to_string()
            })]
        );

        let link = link_of(&manager, &host);
        manager.handle_transport_event(TransportEvent::Open { peer: host.clone(), link });
        assert!(manager.is_open(&host));
    }

    #[test]
    fn test_answer_in_wrong_state_dropped() {
        let mut manager = manager();
        let peer = PeerId::from("a");

        manager.handle_answer(&peer, "answer");
        assert_eq!(manager.state(&peer), None);

        manager.handle_offer(&peer, "offer");
        manager.handle_answer(&peer, "answer");
        assert_eq!(
            manager.state(&peer),
            Some(LinkState::Negotiating(Negotiation::OfferReceived))
        );

        describe(&mut manager, &peer, "answer-1");
        manager.handle_answer(&peer, "answer");
        assert_eq!(manager.state(&peer), Some(LinkState::Answered));
        assert!(manager.transport().answers.is_empty());
    }

    #[test]
    fn test_answerer_opens_once_its_answer_is_sent() {
        let mut manager = manager();
        let host = PeerId::from("host");
        manager.handle_offer(&host, "offer");
        let link = link_of(&manager, &host);

        manager.handle_transport_event(TransportEvent::Open {
            peer: host.clone(),
            link,
        });
        assert!(!manager.is_open(&host));

        describe(&mut manager, &host, "answer-1");
        assert!(manager.is_open(&host));
        assert_eq!(
            drain(&mut manager),
            vec![
                LinkOutput::Signal(ClientSignal::Answer {
                    to: host.clone(),
                    sdp: "answer-1".to_string()
                }),
                LinkOutput::Opened(host)
            ]
        );
    }

    #[test]
    fn test_candidates_buffered_until_remote_description() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);

        manager.handle_candidate(&peer, "10.0.0.1:4000");
        manager.handle_candidate(&peer, "10.0.0.2:4000");
        assert!(manager.transport().candidates.is_empty());
        assert_eq!(manager.buffered_candidates(&peer), 2);

        manager.handle_answer(&peer, "answer");
        assert_eq!(manager.buffered_candidates(&peer), 0);
        assert_eq!(
            manager.transport().candidates,
            vec![
                (peer.clone(), "10.0.0.1:4000".to_string()),
                (peer.clone(), "10.0.0.2:4000".to_string()),
            ]
        );

        manager.handle_candidate(&peer, "10.0.0.3:4000");
        assert_eq!(manager.transport().candidates.len(), 3);
    }

    #[test]
    fn test_candidates_before_offer_flushed_on_offer() {
        let mut manager = manager();
        let host = PeerId::from("host");

        manager.handle_candidate(&host, "10.0.0.1:4000");
        manager.handle_offer(&host, "offer");

        assert_eq!(manager.transport().candidates.len(), 1);
    }

    #[test]
    fn test_candidate_buffer_bounded() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);

        for i in 0..(MAX_BUFFERED_CANDIDATES + 5) {
            manager.handle_candidate(&peer, &format!("c{}", i));
        }
        assert_eq!(manager.buffered_candidates(&peer), MAX_BUFFERED_CANDIDATES);

        manager.handle_answer(&peer, "answer");
        let first = &manager.transport().candidates[0].1;
        assert_eq!(first, "c5");
    }

    #[test]
    fn test_local_candidates_become_signals() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);
        let link = link_of(&manager, &peer);
        drain(&mut manager);

        manager.handle_transport_event(TransportEvent::LocalCandidate {
            peer: peer.clone(),
            link,
            candidate: "127.0.0.1:5000".to_string(),
        });

        assert_eq!(
            drain(&mut manager),
            vec![LinkOutput::Signal(ClientSignal::Candidate {
                to: peer,
                candidate: "127.0.0.1:5000".to_string()
            })]
        );
    }

    #[test]
    fn test_stale_link_events_ignored() {
        let mut manager = manager();
        let host = PeerId::from("host");

        manager.handle_offer(&host, "offer");
        let old = link_of(&manager, &host);
        manager.handle_offer(&host, "offer");
        drain(&mut manager);

        manager.handle_transport_event(TransportEvent::Open {
            peer: host.clone(),
            link: old,
        });
        assert!(!manager.is_open(&host));
        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn test_fresh_offer_replaces_open_link() {
        let mut manager = manager();
        let host = PeerId::from("host");
        open_as_answerer(&mut manager, &host);

        manager.handle_offer(&host, "offer");

        assert_eq!(
            manager.state(&host),
            Some(LinkState::Negotiating(Negotiation::OfferReceived))
        );
        assert_eq!(manager.transport().closed, vec![host]);
    }

    #[test]
    fn test_bad_offer_closes_link() {
        let mut manager = manager();
        let host = PeerId::from("host");

        manager.handle_offer(&host, "bad");

        assert_eq!(manager.state(&host), Some(LinkState::Closed));
        match drain(&mut manager).as_slice() {
            [LinkOutput::Closed {
                reason: CloseReason::Failed(_),
                ..
            }] => {}
            other => panic!("Unexpected outputs {:?}", other),
        }
    }

    #[test]
    fn test_transport_failure_closes_link() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);
        let link = link_of(&manager, &peer);
        drain(&mut manager);

        manager.handle_transport_event(TransportEvent::Failed {
            peer: peer.clone(),
            link,
            reason: "no candidate answered".to_string(),
        });

        assert_eq!(manager.state(&peer), Some(LinkState::Closed));
        assert_eq!(
            drain(&mut manager),
            vec![LinkOutput::Closed {
                peer: peer.clone(),
                reason: CloseReason::Failed("no candidate answered".to_string())
            }]
        );

        manager.open(&peer);
        assert_eq!(
            manager.state(&peer),
            Some(LinkState::Negotiating(Negotiation::OfferSent))
        );
    }

    #[test]
    fn test_send_results() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");

        assert_eq!(
            manager.send(&peer, &tick()),
            DeliveryResult::Dropped(DropReason::NoLink)
        );

        manager.open(&peer);
        assert_eq!(
            manager.send(&peer, &tick()),
            DeliveryResult::Dropped(DropReason::NotOpen)
        );

        let other = PeerId::from("other");
        open_as_answerer(&mut manager, &other);
        assert!(manager.send(&other, &tick()).is_delivered());

        manager.transport_mut().fail_sends = true;
        assert!(matches!(
            manager.send(&other, &tick()),
            DeliveryResult::Dropped(DropReason::Transport(_))
        ));
    }

    #[test]
    fn test_broadcast_reaches_open_links_only() {
        let mut manager = manager();
        let a = PeerId::from("a");
        let b = PeerId::from("b");
        open_as_answerer(&mut manager, &a);
        open_as_answerer(&mut manager, &b);
        manager.open(&PeerId::from("c"));

        let results = manager.broadcast(&tick());

        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, result)| result.is_delivered()));
        assert_eq!(manager.transport().sent.len(), 2);
    }

    #[test]
    fn test_data_decoded_into_messages() {
        let mut manager = manager();
        let host = PeerId::from("host");
        open_as_answerer(&mut manager, &host);
        let link = link_of(&manager, &host);

        manager.handle_transport_event(TransportEvent::Data {
            peer: host.clone(),
            link,
            payload: tick().encode().unwrap(),
        });
        manager.handle_transport_event(TransportEvent::Data {
            peer: host.clone(),
            link,
            payload: vec![0xff, 0xff, 0xff],
        });

        assert_eq!(
            drain(&mut manager),
            vec![LinkOutput::Message {
                peer: host,
                message: tick()
            }]
        );
    }

    #[test]
    fn test_close_is_idempotent() {
        let mut manager = manager();
        let peer = PeerId::from("viewer");
        manager.open(&peer);
        manager.handle_candidate(&peer, "c1");
        drain(&mut manager);

        manager.close(&peer);
        manager.close(&peer);

        assert_eq!(manager.state(&peer), Some(LinkState::Closed));
        assert_eq!(manager.buffered_candidates(&peer), 0);
        assert_eq!(manager.transport().closed.len(), 1);
        assert_eq!(drain(&mut manager).len(), 1);
    }

    #[test]
    fn test_events_after_close_ignored() {
        let mut manager = manager();
        let host = PeerId::from("host");
        open_as_answerer(&mut manager, &host);
        let link = link_of(&manager, &host);
        manager.close(&host);
        drain(&mut manager);

        manager.handle_transport_event(TransportEvent::Data {
            peer: host,
            link,
            payload: tick().encode().unwrap(),
        });

        assert!(drain(&mut manager).is_empty());
    }

    #[test]
    fn test_close_all() {
        let mut manager = manager();
        open_as_answerer(&mut manager, &PeerId::from("a"));
        manager.open(&PeerId::from("b"));
        drain(&mut manager);

        manager.close_all();

        assert!(manager.open_peers().is_empty());
        assert_eq!(manager.transport().closed.len(), 2);
    }
}
