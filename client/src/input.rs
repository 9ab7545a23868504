//! Local input tracking with change detection

use shared::{InputUpdate, Joystick, PeerId, PlayerConfig};

#[derive(Debug, Clone, Copy, PartialEq)]
struct InputSnapshot {
    buttons: [bool; 2],
    joystick: Joystick,
}

/// Collects the controlling client's input and produces `input.update`
/// messages carrying only the fields that changed since the last one
pub struct InputTracker {
    peer_id: PeerId,
    current: InputSnapshot,
    last_sent: Option<InputSnapshot>,
}

impl InputTracker {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            current: InputSnapshot {
                buttons: [false, false],
                joystick: Joystick {
                    force: 0.0,
                    angle: 0.0,
                },
            },
            last_sent: None,
        }
    }

    pub fn set_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = peer_id;
    }

    /// Force is clamped to `0.0..=1.0`.
    pub fn set_joystick(&mut self, force: f32, angle: f32) {
        self.current.joystick = Joystick {
            force: force.clamp(0.0, 1.0),
            angle,
        };
    }

    pub fn set_buttons(&mut self, buttons: [bool; 2]) {
        self.current.buttons = buttons;
    }

    /// Forgets what was sent so the next poll carries the full state, e.g.
    /// after the host changed.
    pub fn invalidate(&mut self) {
        self.last_sent = None;
    }

    pub fn poll(&mut self) -> Option<InputUpdate> {
        let current = self.current;
        let update = match self.last_sent {
            Some(last) if last == current => return None,
            Some(last) => InputUpdate {
                peer_id: self.peer_id.clone(),
                buttons: (last.buttons != current.buttons).then_some(current.buttons),
                joystick: (last.joystick != current.joystick).then_some(current.joystick),
            },
            None => InputUpdate {
                peer_id: self.peer_id.clone(),
                buttons: Some(current.buttons),
                joystick: Some(current.joystick),
            },
        };

        self.last_sent = Some(current);
        Some(update)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Profile {
    name: Option<String>,
    color: Option<String>,
}

/// Tracks the player's chosen name and colour, producing a `player.config`
/// whenever they differ from what the host last received
pub struct ConfigTracker {
    peer_id: PeerId,
    current: Profile,
    last_sent: Option<Profile>,
}

impl ConfigTracker {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            current: Profile::default(),
            last_sent: None,
        }
    }

    pub fn set_peer_id(&mut self, peer_id: PeerId) {
        self.peer_id = peer_id;
    }

    pub fn set(&mut self, name: Option<String>, color: Option<String>) {
        self.current = Profile { name, color };
    }

    pub fn invalidate(&mut self) {
        self.last_sent = None;
    }

    pub fn poll(&mut self) -> Option<PlayerConfig> {
        if self.current == Profile::default() || self.last_sent.as_ref() == Some(&self.current) {
            return None;
        }

        self.last_sent = Some(self.current.clone());
        Some(PlayerConfig {
            peer_id: self.peer_id.clone(),
            name: self.current.name.clone(),
            color: self.current.color.clone(),
        })
    }
}
