//! Lockstep synchronization core
//!
//! Everything in here is transport-agnostic: the host-side
//! [`LockstepCoordinator`] consumes [`Inbound`] events and produces
//! [`Outbound`] messages, and the remote-side [`RemotePeer`] does the same
//! with `HostMsg`/`PeerMsg`. The websocket layer in `crate::ws` and the
//! match task in [`r#match`] are the only places that touch tokio.

pub mod buffer;
pub mod coordinator;
pub mod r#match;
pub mod participant;
pub mod peer;
pub mod ports;
pub mod sync_test;

pub use coordinator::{
    Inbound, LockstepCoordinator, MatchEvent, MatchPhase, Outbound, TransportEvent,
};
pub use participant::{Liveness, ParticipantRecord};
pub use peer::{LocalTurnTracker, RemotePeer};
pub use ports::{CommandExecutor, FactionRegistry, FixedFactions, GameStateSink};
pub use r#match::{LockstepMatch, MatchHandle, MatchInput, MatchRegistry, PeerConnection};
pub use sync_test::{ClockDirective, SyncReport, SyncTest};

use serde::{Deserialize, Serialize};

/// Participant identifier. Maps 1:1 to a simulation faction id.
pub type ParticipantId = u32;

/// Simulation time scale while the match is frozen.
///
/// Kept above zero so timers driven by the scaled clock still make progress.
pub const FROZEN_TIME_SCALE: f32 = 0.000_001;

/// Global game-state flag shared with the simulation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameState {
    #[default]
    Running,
    Frozen,
}

impl GameState {
    pub fn from_frozen(frozen: bool) -> Self {
        if frozen {
            Self::Frozen
        } else {
            Self::Running
        }
    }

    pub fn is_frozen(self) -> bool {
        self == Self::Frozen
    }

    /// Time scale the simulation should run at in this state
    pub fn time_scale(self) -> f32 {
        match self {
            Self::Running => 1.0,
            Self::Frozen => FROZEN_TIME_SCALE,
        }
    }

    /// Recover the unscaled lockstep delta from a delta measured on the
    /// scaled simulation clock.
    pub fn lockstep_delta(self, scaled_delta: f32) -> f32 {
        scaled_delta / self.time_scale()
    }
}

/// A command scheduled into a lockstep cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// Gameplay input. The payload is opaque to the lockstep layer.
    Input {
        issuer: ParticipantId,
        payload: serde_json::Value,
    },

    /// Destroy every entity of a faction whose owner left the match
    RemoveFaction { faction_id: ParticipantId },
}

/// Why a participant was removed from consensus tracking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovalReason {
    /// Kick countdown ran out while the participant was lagging
    Timeout,
    /// Transport connection closed
    Disconnect,
    /// Host kicked the participant
    Kick,
    /// Simulation reported the faction defeated
    Defeat,
}

impl std::fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Timeout => "timeout",
            Self::Disconnect => "disconnect",
            Self::Kick => "kick",
            Self::Defeat => "defeat",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frozen_delta_is_rescaled_to_real_time() {
        let scaled = 0.016 * FROZEN_TIME_SCALE;
        let real = GameState::Frozen.lockstep_delta(scaled);
        assert!((real - 0.016).abs() < 1e-6);
        assert_eq!(GameState::Running.lockstep_delta(0.016), 0.016);
    }

    #[test]
    fn clock_starts_running() {
        assert_eq!(GameState::default(), GameState::Running);
        assert_eq!(GameState::default().time_scale(), 1.0);
    }

    #[test]
    fn command_wire_format_is_tagged() {
        let json = serde_json::to_value(Command::RemoveFaction { faction_id: 3 }).unwrap();
        assert_eq!(json["kind"], "remove_faction");
        assert_eq!(json["faction_id"], 3);
    }
}
