//! Host-authoritative replication
//!
//! The host steps the simulation and broadcasts full-state ticks, skipping
//! ticks that are structurally identical to the last one sent. Viewers merge
//! each tick into their local entity map by id. Entities disappear only
//! through an explicit `entity.removed`, never because a tick omitted them.
//!
//! A link that opens late has missed every earlier `entity.removed`, so the
//! host keeps the ids it despawned in [`RemovedEntities`] and replays them to
//! the new link after a fresh tick.
//!
//! Inputs travel the other way: a controlling client sends `input.update`
//! to the host, which queues it and applies it at the start of its next step.

use log::debug;
use shared::{EntityId, EntityState, GameTick, InputUpdate, PeerId};
use std::collections::{BTreeMap, BTreeSet};

/// Suppresses duplicate ticks on the host
#[derive(Debug, Default)]
pub struct TickDiffer {
    last_sent: Option<GameTick>,
}

impl TickDiffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the tick to send, or `None` if it equals the last one sent.
    pub fn diff(&mut self, snapshot: GameTick) -> Option<GameTick> {
        if self.last_sent.as_ref() == Some(&snapshot) {
            return None;
        }
        self.last_sent = Some(snapshot.clone());
        Some(snapshot)
    }
}

/// Entities the host despawned while hosting
#[derive(Debug, Default)]
pub struct RemovedEntities {
    ids: BTreeSet<EntityId>,
}

impl RemovedEntities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, id: EntityId) {
        self.ids.insert(id);
    }

    /// Forgets `id` once it is live again.
    pub fn forget(&mut self, id: &EntityId) {
        self.ids.remove(id);
    }

    /// Removals a freshly opened link must replay after receiving `current`.
    pub fn missing_from(&self, current: &GameTick) -> Vec<EntityId> {
        self.ids
            .iter()
            .filter(|id| !current.entities.iter().any(|entity| entity.id == **id))
            .cloned()
            .collect()
    }
}

/// Replicated entity map on a non-host client
#[derive(Debug, Default)]
pub struct ViewerState {
    entities: BTreeMap<EntityId, EntityState>,
    observed: bool,
}

impl ViewerState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_tick(&mut self, tick: &GameTick) {
        for incoming in &tick.entities {
            self.entities
                .entry(incoming.id.clone())
                .and_modify(|local| {
                    local.position = incoming.position;
                    local.rotation = incoming.rotation;
                    if incoming.velocity.is_some() {
                        local.velocity = incoming.velocity;
                    }
                    if incoming.health.is_some() {
                        local.health = incoming.health;
                    }
                    if incoming.name.is_some() {
                        local.name = incoming.name.clone();
                    }
                    if incoming.color.is_some() {
                        local.color = incoming.color.clone();
                    }
                })
                .or_insert_with(|| incoming.clone());
        }
        self.observed = true;
    }

    pub fn remove_entity(&mut self, id: &EntityId) -> bool {
        let removed = self.entities.remove(id).is_some();
        if !removed {
            debug!("entity.removed for unknown entity {}", id);
        }
        removed
    }

    pub fn entity(&self, id: &EntityId) -> Option<&EntityState> {
        self.entities.get(id)
    }

    pub fn entities(&self) -> impl Iterator<Item = &EntityState> {
        self.entities.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// The locally observed world, for seeding a simulation on migration.
    /// `None` until the first tick has been applied.
    pub fn observed_tick(&self) -> Option<GameTick> {
        self.observed.then(|| GameTick {
            entities: self.entities.values().cloned().collect(),
        })
    }

    pub fn clear(&mut self) {
        self.entities.clear();
        self.observed = false;
    }
}

/// Inputs received by the host, applied at the start of the next step
#[derive(Debug, Default)]
pub struct InputBuffer {
    pending: Vec<InputUpdate>,
}

impl InputBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an update attributed to the link it arrived on.
    pub fn push(&mut self, from: &PeerId, mut update: InputUpdate) {
        if update.peer_id != *from {
            debug!(
                "Input claimed {} but arrived from {}, attributing to link",
                update.peer_id, from
            );
            update.peer_id = from.clone();
        }
        self.pending.push(update);
    }

    pub fn drain(&mut self) -> Vec<InputUpdate> {
        std::mem::take(&mut self.pending)
    }
}
