//! Host-side ship simulation
//!
//! Only the current host steps this state. Each ship belongs to one player
//! peer and is keyed by that peer's id, so snapshots list entities in a
//! stable order.

use log::debug;
use shared::{
    EntityId, EntityState, GameTick, InputUpdate, Joystick, PeerId, PlayerConfig, REFERENCE_STEP_RATE,
    SHIP_MAX_HEALTH, SHIP_VELOCITY_DECAY, SHIP_VELOCITY_EASE, SHIP_VELOCITY_MULTIPLIER, WORLD_SIZE,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct Ship {
    pub position: [f32; 2],
    pub rotation: f32,
    pub velocity: [f32; 2],
    pub health: f32,
    pub joystick: Joystick,
    pub buttons: [bool; 2],
    pub name: Option<String>,
    pub color: Option<String>,
}

impl Ship {
    pub fn spawn() -> Self {
        Self {
            position: [WORLD_SIZE / 2.0, WORLD_SIZE / 2.0],
            rotation: 0.0,
            velocity: [0.0, 0.0],
            health: SHIP_MAX_HEALTH,
            joystick: Joystick {
                force: 0.0,
                angle: 0.0,
            },
            buttons: [false, false],
            name: None,
            color: None,
        }
    }

    fn from_entity(entity: &EntityState) -> Self {
        Self {
            position: entity.position,
            rotation: entity.rotation,
            velocity: entity.velocity.unwrap_or([0.0, 0.0]),
            health: entity.health.unwrap_or(SHIP_MAX_HEALTH),
            name: entity.name.clone(),
            color: entity.color.clone(),
            ..Self::spawn()
        }
    }

    /// Advances one step; `scale` is 1.0 at the reference step rate.
    fn update(&mut self, scale: f32) {
        if self.joystick.force > 0.0 {
            let acceleration = self.joystick.force * SHIP_VELOCITY_MULTIPLIER;
            let target = [
                self.joystick.angle.cos() * acceleration,
                self.joystick.angle.sin() * acceleration,
            ];
            let ease = 1.0 - (1.0 - SHIP_VELOCITY_EASE).powf(scale);
            self.velocity[0] += (target[0] - self.velocity[0]) * ease;
            self.velocity[1] += (target[1] - self.velocity[1]) * ease;
        }

        let decay = SHIP_VELOCITY_DECAY.powf(scale);
        self.velocity[0] *= decay;
        self.velocity[1] *= decay;

        for axis in 0..2 {
            self.position[axis] += self.velocity[axis] * scale;
            if self.position[axis] < 0.0 {
                self.position[axis] = WORLD_SIZE;
            } else if self.position[axis] > WORLD_SIZE {
                self.position[axis] = 0.0;
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GameState {
    pub tick: u32,
    pub ships: BTreeMap<EntityId, Ship>,
}

impl GameState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a simulation from a replicated tick after host migration.
    pub fn seed_from(tick: &GameTick) -> Self {
        let ships = tick
            .entities
            .iter()
            .map(|entity| (entity.id.clone(), Ship::from_entity(entity)))
            .collect();
        Self { tick: 0, ships }
    }

    /// Spawns a ship for `peer`; returns false if it already has one.
    pub fn add_player(&mut self, peer: &PeerId) -> bool {
        let id = EntityId::from(peer);
        if self.ships.contains_key(&id) {
            return false;
        }
        debug!("Spawning ship for {}", peer);
        self.ships.insert(id, Ship::spawn());
        true
    }

    pub fn remove_player(&mut self, id: &EntityId) -> bool {
        self.ships.remove(id).is_some()
    }

    pub fn apply_input(&mut self, input: &InputUpdate) {
        let Some(ship) = self.ships.get_mut(&EntityId::from(&input.peer_id)) else {
            debug!("Input for {} without a ship", input.peer_id);
            return;
        };

        if let Some(joystick) = input.joystick {
            ship.joystick = joystick;
            ship.rotation = joystick.angle;
        }
        if let Some(buttons) = input.buttons {
            ship.buttons = buttons;
        }
    }

    /// Stores the display name and colour a player chose for its ship.
    pub fn apply_config(&mut self, config: &PlayerConfig) {
        let Some(ship) = self.ships.get_mut(&EntityId::from(&config.peer_id)) else {
            debug!("Config for {} without a ship", config.peer_id);
            return;
        };

        if config.name.is_some() {
            ship.name = config.name.clone();
        }
        if config.color.is_some() {
            ship.color = config.color.clone();
        }
    }

    pub fn update_physics(&mut self, dt: f32) {
        let scale = dt * REFERENCE_STEP_RATE;
        for ship in self.ships.values_mut() {
            ship.update(scale);
        }
    }

    pub fn step(&mut self, dt: f32) {
        self.update_physics(dt);
        self.tick += 1;
    }

    pub fn snapshot(&self) -> GameTick {
        GameTick {
            entities: self
                .ships
                .iter()
                .map(|(id, ship)| EntityState {
                    id: id.clone(),
                    position: ship.position,
                    rotation: ship.rotation,
                    velocity: Some(ship.velocity),
                    health: Some(ship.health),
                    name: ship.name.clone(),
                    color: ship.color.clone(),
                })
                .collect(),
        }
    }
}
