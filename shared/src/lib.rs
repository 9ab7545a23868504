use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const WORLD_SIZE: f32 = 1000.0;
pub const SHIP_VELOCITY_MULTIPLIER: f32 = 20.0;
pub const SHIP_VELOCITY_EASE: f32 = 0.1;
pub const SHIP_VELOCITY_DECAY: f32 = 0.995;
pub const SHIP_MAX_HEALTH: f32 = 100.0;

/// Step rate the ship constants were tuned for; physics scales `dt` against it.
pub const REFERENCE_STEP_RATE: f32 = 30.0;
pub const DEFAULT_TICK_RATE: u32 = 30;
pub const MIN_TICK_RATE: u32 = 1;
pub const MAX_TICK_RATE: u32 = 60;

/// Opaque identifier the signaling service assigns to each connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Stable identifier of a replicated entity. Ships use their owner's peer id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<&PeerId> for EntityId {
    fn from(peer: &PeerId) -> Self {
        Self(peer.as_str().to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Player,
    Viewer,
}

impl Role {
    /// Only viewers may hold host authority; players are controllers.
    pub fn is_host_eligible(self) -> bool {
        matches!(self, Role::Viewer)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Player => "player",
            Role::Viewer => "viewer",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownRole(pub String);

impl fmt::Display for UnknownRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid role '{}', expected 'player' or 'viewer'", self.0)
    }
}

impl std::error::Error for UnknownRole {}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "player" => Ok(Role::Player),
            "viewer" => Ok(Role::Viewer),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Membership record as announced to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub role: Role,
    pub is_host: bool,
}

/// Messages the signaling service sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ServerSignal {
    #[serde(rename = "session.welcome")]
    Welcome {
        peer_id: PeerId,
        role: Role,
        peers: Vec<PeerInfo>,
        host_peer_id: Option<PeerId>,
    },
    #[serde(rename = "peer.joined")]
    PeerJoined { peer_id: PeerId, role: Role },
    #[serde(rename = "peer.left")]
    PeerLeft { peer_id: PeerId },
    /// Sent only to the elected peer.
    #[serde(rename = "host.assigned")]
    HostAssigned {
        peer_id: PeerId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_known_snapshot: Option<serde_json::Value>,
    },
    /// Sent to everyone except the elected peer; `None` means the session is host-less.
    #[serde(rename = "host.changed")]
    HostChanged { peer_id: Option<PeerId> },
    #[serde(rename = "negotiation.offer")]
    Offer { from: PeerId, to: PeerId, sdp: String },
    #[serde(rename = "negotiation.answer")]
    Answer { from: PeerId, to: PeerId, sdp: String },
    #[serde(rename = "negotiation.candidate")]
    Candidate {
        from: PeerId,
        to: PeerId,
        candidate: String,
    },
    #[serde(rename = "error")]
    Error { message: String },
}

/// Messages a client sends to the signaling service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ClientSignal {
    #[serde(rename = "negotiation.offer")]
    Offer { to: PeerId, sdp: String },
    #[serde(rename = "negotiation.answer")]
    Answer { to: PeerId, sdp: String },
    #[serde(rename = "negotiation.candidate")]
    Candidate { to: PeerId, candidate: String },
    /// Opaque to the server; stored for the next host election.
    #[serde(rename = "snapshot.checkpoint")]
    SnapshotCheckpoint { snapshot: serde_json::Value },
    #[serde(rename = "link.failed")]
    LinkFailed { peer_id: PeerId },
}

impl ServerSignal {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

impl ClientSignal {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Joystick {
    /// 0.0 (centered) to 1.0 (full deflection)
    pub force: f32,
    /// radians
    pub angle: f32,
}

/// Input change from a controlling client, host-ward.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputUpdate {
    pub peer_id: PeerId,
    pub buttons: Option<[bool; 2]>,
    pub joystick: Option<Joystick>,
}

/// Display settings chosen by a player, host-ward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerConfig {
    pub peer_id: PeerId,
    pub name: Option<String>,
    /// `#rrggbb`
    pub color: Option<String>,
}

/// Replicated fields of one entity. Optional fields that are `None` leave the
/// receiver's local value untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityState {
    pub id: EntityId,
    pub position: [f32; 2],
    pub rotation: f32,
    pub velocity: Option<[f32; 2]>,
    pub health: Option<f32>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub color: Option<String>,
}

impl EntityState {
    pub fn new(id: impl Into<String>, position: [f32; 2], rotation: f32) -> Self {
        Self {
            id: EntityId::new(id),
            position,
            rotation,
            velocity: None,
            health: None,
            name: None,
            color: None,
        }
    }
}

/// One authoritative snapshot. Compared structurally to suppress duplicates.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GameTick {
    pub entities: Vec<EntityState>,
}

/// Application messages carried over a peer link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LinkMessage {
    InputUpdate(InputUpdate),
    PlayerConfig(PlayerConfig),
    StateTick(GameTick),
    EntityRemoved { id: EntityId },
}

impl LinkMessage {
    pub const INPUT_UPDATE: &'static str = "input.update";
    pub const PLAYER_CONFIG: &'static str = "player.config";
    pub const STATE_TICK: &'static str = "state.tick";
    pub const ENTITY_REMOVED: &'static str = "entity.removed";

    pub fn name(&self) -> &'static str {
        match self {
            LinkMessage::InputUpdate(_) => Self::INPUT_UPDATE,
            LinkMessage::PlayerConfig(_) => Self::PLAYER_CONFIG,
            LinkMessage::StateTick(_) => Self::STATE_TICK,
            LinkMessage::EntityRemoved { .. } => Self::ENTITY_REMOVED,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}
