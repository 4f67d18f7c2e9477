//! Remote side of the delivery acknowledgment protocol
//!
//! A [`RemotePeer`] executes every command of a batch as it arrives, then
//! compares the number it received against the host's `AckCount` and reports
//! the outcome back with a `TurnReport`.

use tracing::{debug, warn};

use crate::ws::protocol::{HostMsg, PeerMsg};

use super::ports::{CommandExecutor, GameStateSink};
use super::{Command, GameState, ParticipantId};

/// Per-peer mirror of the host's turn counter
#[derive(Debug, Clone, Default)]
pub struct LocalTurnTracker {
    current_turn: u64,
    received_command_count: usize,
}

impl LocalTurnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_turn(&self) -> u64 {
        self.current_turn
    }

    pub fn received_command_count(&self) -> usize {
        self.received_command_count
    }

    pub fn on_command_received(&mut self) {
        self.received_command_count += 1;
    }

    /// Compare against the host's count for the cycle.
    ///
    /// Returns whether they matched. The received count resets either way.
    pub fn on_ack_count(&mut self, commands_count: usize) -> bool {
        let matched = commands_count == self.received_command_count;
        if matched {
            self.current_turn += 1;
        }
        self.received_command_count = 0;
        matched
    }
}

pub struct RemotePeer<E, S> {
    participant_id: ParticipantId,
    tracker: LocalTurnTracker,
    executor: E,
    game_state_sink: S,
    game_state: GameState,
    scene_ready_sent: bool,
}

impl<E, S> RemotePeer<E, S>
where
    E: CommandExecutor,
    S: GameStateSink,
{
    pub fn new(participant_id: ParticipantId, executor: E, game_state_sink: S) -> Self {
        Self {
            participant_id,
            tracker: LocalTurnTracker::new(),
            executor,
            game_state_sink,
            game_state: GameState::Running,
            scene_ready_sent: false,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn tracker(&self) -> &LocalTurnTracker {
        &self.tracker
    }

    pub fn game_state(&self) -> GameState {
        self.game_state
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn game_state_sink(&self) -> &S {
        &self.game_state_sink
    }

    /// Signal the host that the map is loaded. Sent once.
    pub fn scene_ready(&mut self) -> Option<PeerMsg> {
        if std::mem::replace(&mut self.scene_ready_sent, true) {
            return None;
        }
        Some(PeerMsg::SceneReady {
            participant_id: self.participant_id,
        })
    }

    pub fn submit(&self, command: Command) -> PeerMsg {
        PeerMsg::SubmitCommand { command }
    }

    /// Apply one host message, returning the reply to send, if any
    pub fn handle(&mut self, msg: &HostMsg) -> Option<PeerMsg> {
        match msg {
            HostMsg::CommandBatch { commands, .. } => {
                for command in commands {
                    self.tracker.on_command_received();
                    self.executor.execute(command);
                }
                None
            }
            HostMsg::AckCount {
                turn,
                commands_count,
            } => {
                let success = self.tracker.on_ack_count(*commands_count);
                if success {
                    debug!(
                        participant_id = self.participant_id,
                        turn,
                        local_turn = self.tracker.current_turn(),
                        "Turn acknowledged"
                    );
                } else {
                    warn!(
                        participant_id = self.participant_id,
                        turn, commands_count, "Command count mismatch"
                    );
                }
                Some(PeerMsg::TurnReport {
                    participant_id: self.participant_id,
                    success,
                })
            }
            HostMsg::Freeze { frozen } => {
                self.game_state = GameState::from_frozen(*frozen);
                self.game_state_sink
                    .set_game_state(self.game_state, self.game_state.time_scale());
                None
            }
            _ => None,
        }
    }
}
