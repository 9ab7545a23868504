//! Session membership and host authority for the signaling service
//!
//! The registry tracks every connected peer, the order in which they joined,
//! and which peer currently holds host authority. It knows nothing about game
//! content: negotiation payloads and snapshot checkpoints pass through opaque.
//!
//! All operations are synchronous and return the notifications they produce
//! as [`Outbound`] values. The network layer owns delivery, which keeps the
//! election logic testable without sockets and serialized by construction:
//! only the server main loop ever calls into the registry.

use log::{debug, info, warn};
use shared::{ClientSignal, PeerId, PeerInfo, Role, ServerSignal};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("peer {0} is already registered")]
    Duplicate(PeerId),
    #[error("session is full ({0} peers)")]
    Full(usize),
}

/// Who a notification is addressed to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    Peer(PeerId),
    All,
    AllExcept(PeerId),
}

/// A notification produced by a registry operation
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub to: Recipient,
    pub signal: ServerSignal,
}

impl Outbound {
    fn to_peer(peer_id: &PeerId, signal: ServerSignal) -> Self {
        Self {
            to: Recipient::Peer(peer_id.clone()),
            signal,
        }
    }

    fn to_all(signal: ServerSignal) -> Self {
        Self {
            to: Recipient::All,
            signal,
        }
    }

    fn to_all_except(peer_id: &PeerId, signal: ServerSignal) -> Self {
        Self {
            to: Recipient::AllExcept(peer_id.clone()),
            signal,
        }
    }
}

/// A connected peer as the registry sees it
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub id: PeerId,
    pub role: Role,
    /// Position in connect order; lower joined earlier
    pub join_seq: u64,
}

/// Membership and host assignment for one signaling service process
///
/// Memory-only: a process restart drops every peer and checkpoint.
pub struct SessionRegistry {
    peers: HashMap<PeerId, PeerEntry>,
    host: Option<PeerId>,
    next_join_seq: u64,
    last_snapshot: Option<serde_json::Value>,
    max_peers: usize,
}

impl SessionRegistry {
    pub fn new(max_peers: usize) -> Self {
        Self {
            peers: HashMap::new(),
            host: None,
            next_join_seq: 0,
            last_snapshot: None,
            max_peers,
        }
    }

    /// Registers a peer, announces it, and elects a host if the session has none
    ///
    /// The newcomer receives a `session.welcome` describing the current
    /// membership; everyone else receives `peer.joined`. When the current
    /// host exists it learns about the newcomer through that broadcast and
    /// initiates the peer link.
    pub fn connect(&mut self, peer_id: PeerId, role: Role) -> Result<Vec<Outbound>, RegistryError> {
        if self.peers.contains_key(&peer_id) {
            return Err(RegistryError::Duplicate(peer_id));
        }
        if self.peers.len() >= self.max_peers {
            return Err(RegistryError::Full(self.max_peers));
        }

        let entry = PeerEntry {
            id: peer_id.clone(),
            role,
            join_seq: self.next_join_seq,
        };
        self.next_join_seq += 1;
        self.peers.insert(peer_id.clone(), entry);
        info!("Peer {} connected as {}", peer_id, role);

        let mut outbound = vec![
            Outbound::to_peer(
                &peer_id,
                ServerSignal::Welcome {
                    peer_id: peer_id.clone(),
                    role,
                    peers: self.peer_infos_except(&peer_id),
                    host_peer_id: self.host.clone(),
                },
            ),
            Outbound::to_all_except(
                &peer_id,
                ServerSignal::PeerJoined {
                    peer_id: peer_id.clone(),
                    role,
                },
            ),
        ];

        if self.host.is_none() && role.is_host_eligible() {
            outbound.extend(self.elect_host());
        }

        Ok(outbound)
    }

    /// Removes a peer and re-elects if it held host authority
    ///
    /// Unknown ids are ignored. When the host leaves and no eligible peer
    /// remains, everyone is told the session is host-less.
    pub fn disconnect(&mut self, peer_id: &PeerId) -> Vec<Outbound> {
        let Some(entry) = self.peers.remove(peer_id) else {
            return Vec::new();
        };
        info!("Peer {} ({}) disconnected", peer_id, entry.role);

        let mut outbound = vec![Outbound::to_all(ServerSignal::PeerLeft {
            peer_id: peer_id.clone(),
        })];

        if self.host.as_ref() == Some(peer_id) {
            self.host = None;
            let election = self.elect_host();
            if election.is_empty() {
                info!("No eligible peer left, session is waiting for a host");
                outbound.push(Outbound::to_all(ServerSignal::HostChanged { peer_id: None }));
            } else {
                outbound.extend(election);
            }
        }

        outbound
    }

    /// Assigns host authority to the oldest eligible peer
    ///
    /// No-op while a valid host exists. Ordering is by join sequence, never
    /// by id, so results are reproducible for a given connect order.
    pub fn elect_host(&mut self) -> Vec<Outbound> {
        if let Some(host) = &self.host {
            if self.peers.contains_key(host) {
                return Vec::new();
            }
            warn!("Host {} is no longer registered, re-electing", host);
            self.host = None;
        }

        let Some(elected) = self
            .peers
            .values()
            .filter(|peer| peer.role.is_host_eligible())
            .min_by_key(|peer| peer.join_seq)
            .map(|peer| peer.id.clone())
        else {
            return Vec::new();
        };

        info!("Peer {} elected host", elected);
        self.host = Some(elected.clone());

        vec![
            Outbound::to_peer(
                &elected,
                ServerSignal::HostAssigned {
                    peer_id: elected.clone(),
                    last_known_snapshot: self.last_snapshot.clone(),
                },
            ),
            Outbound::to_all_except(
                &elected,
                ServerSignal::HostChanged {
                    peer_id: Some(elected.clone()),
                },
            ),
        ]
    }

    /// Handles a signal from a connected peer
    ///
    /// Negotiation messages are routed by their `to` field with `from` set
    /// to the sender's registered id.
    pub fn relay(&mut self, from: &PeerId, signal: ClientSignal) -> Vec<Outbound> {
        if !self.peers.contains_key(from) {
            warn!("Dropping signal from unregistered peer {}", from);
            return Vec::new();
        }

        match signal {
            ClientSignal::Offer { to, sdp } => self.route(from, &to, |from, to| ServerSignal::Offer {
                from,
                to,
                sdp,
            }),
            ClientSignal::Answer { to, sdp } => {
                self.route(from, &to, |from, to| ServerSignal::Answer { from, to, sdp })
            }
            ClientSignal::Candidate { to, candidate } => {
                self.route(from, &to, |from, to| ServerSignal::Candidate {
                    from,
                    to,
                    candidate,
                })
            }
            ClientSignal::SnapshotCheckpoint { snapshot } => {
                if self.is_host(from) {
                    self.last_snapshot = Some(snapshot);
                } else {
                    debug!("Ignoring checkpoint from non-host {}", from);
                }
                Vec::new()
            }
            ClientSignal::LinkFailed { peer_id } => self.reannounce(from, &peer_id),
        }
    }

    fn route(
        &self,
        from: &PeerId,
        to: &PeerId,
        build: impl FnOnce(PeerId, PeerId) -> ServerSignal,
    ) -> Vec<Outbound> {
        if !self.peers.contains_key(to) {
            debug!("Relay target {} from {} is not connected", to, from);
            return vec![Outbound::to_peer(
                from,
                ServerSignal::Error {
                    message: format!("peer {} is not connected", to),
                },
            )];
        }

        vec![Outbound::to_peer(to, build(from.clone(), to.clone()))]
    }

    /// Re-sends `peer.joined` for the non-host side of a failed link so the
    /// host re-initiates negotiation.
    fn reannounce(&self, reporter: &PeerId, other: &PeerId) -> Vec<Outbound> {
        let Some(host) = &self.host else {
            return Vec::new();
        };

        let target = if host == reporter {
            other
        } else if host == other {
            reporter
        } else {
            debug!("Ignoring link failure {} <-> {} not involving the host", reporter, other);
            return Vec::new();
        };

        let Some(entry) = self.peers.get(target) else {
            return Vec::new();
        };

        info!("Re-announcing {} to host {} after link failure", target, host);
        vec![Outbound::to_peer(
            host,
            ServerSignal::PeerJoined {
                peer_id: entry.id.clone(),
                role: entry.role,
            },
        )]
    }

    pub fn host(&self) -> Option<&PeerId> {
        self.host.as_ref()
    }

    pub fn is_host(&self, peer_id: &PeerId) -> bool {
        self.host.as_ref() == Some(peer_id)
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn last_snapshot(&self) -> Option<&serde_json::Value> {
        self.last_snapshot.as_ref()
    }

    /// Peer records in connect order
    pub fn peers_in_order(&self) -> Vec<PeerInfo> {
        let mut entries: Vec<&PeerEntry> = self.peers.values().collect();
        entries.sort_by_key(|entry| entry.join_seq);
        entries
            .into_iter()
            .map(|entry| PeerInfo {
                peer_id: entry.id.clone(),
                role: entry.role,
                is_host: self.is_host(&entry.id),
            })
            .collect()
    }

    fn peer_infos_except(&self, peer_id: &PeerId) -> Vec<PeerInfo> {
        self.peers_in_order()
            .into_iter()
            .filter(|info| &info.peer_id != peer_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}
