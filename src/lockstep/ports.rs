//! Seams to the simulation collaborator

use super::{Command, GameState, ParticipantId};

/// Executes a delivered command in the local simulation
pub trait CommandExecutor {
    fn execute(&mut self, command: &Command);
}

/// Faction lookup used by the host to size and validate the match
pub trait FactionRegistry: Send {
    fn faction_count(&self) -> usize;

    fn has_faction(&self, id: ParticipantId) -> bool {
        (id as usize) < self.faction_count()
    }
}

/// Receives freeze/unfreeze decisions on a remote peer
pub trait GameStateSink {
    fn set_game_state(&mut self, state: GameState, time_scale: f32);
}

/// Factions numbered `0..count`
#[derive(Debug, Clone, Copy)]
pub struct FixedFactions {
    count: usize,
}

impl FixedFactions {
    pub fn new(count: usize) -> Self {
        Self { count }
    }
}

impl FactionRegistry for FixedFactions {
    fn faction_count(&self) -> usize {
        self.count
    }
}
