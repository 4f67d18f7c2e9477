//! Per-participant liveness and progress bookkeeping (host only)

use super::ParticipantId;

/// Liveness state derived from a record's flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    /// Kick countdown running
    TimingOut,
    /// Terminal
    Disconnected,
}

/// Host-side record for one participant that reported its scene ready
#[derive(Debug, Clone)]
pub struct ParticipantRecord {
    participant_id: ParticipantId,
    last_acknowledged_turn: u64,
    disconnected: bool,
    timing_out: bool,
    kick_countdown: f32,
    /// Whether the transport can still reach this participant
    reachable: bool,
    /// Set once a faction-removal command has been scheduled (or is not needed)
    faction_removed: bool,
    failed_turns: u32,
}

impl ParticipantRecord {
    pub fn new(participant_id: ParticipantId) -> Self {
        Self {
            participant_id,
            last_acknowledged_turn: 0,
            disconnected: false,
            timing_out: false,
            kick_countdown: 0.0,
            reachable: true,
            faction_removed: false,
            failed_turns: 0,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    pub fn last_acknowledged_turn(&self) -> u64 {
        self.last_acknowledged_turn
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn is_timing_out(&self) -> bool {
        self.timing_out
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn failed_turns(&self) -> u32 {
        self.failed_turns
    }

    /// Remaining kick countdown, only while timing out
    pub fn kick_countdown(&self) -> Option<f32> {
        self.timing_out.then_some(self.kick_countdown)
    }

    pub fn liveness(&self) -> Liveness {
        if self.disconnected {
            Liveness::Disconnected
        } else if self.timing_out {
            Liveness::TimingOut
        } else {
            Liveness::Active
        }
    }

    /// Count one more executed turn.
    ///
    /// Returns false (and changes nothing) if the record already acknowledged
    /// every turn the host has completed.
    pub fn acknowledge_turn(&mut self, server_turn: u64) -> bool {
        if self.last_acknowledged_turn >= server_turn {
            return false;
        }
        self.last_acknowledged_turn += 1;
        true
    }

    pub fn record_failed_turn(&mut self) {
        self.failed_turns = self.failed_turns.saturating_add(1);
    }

    /// Start the kick countdown. Disconnected records never time out.
    pub fn start_timeout(&mut self, duration: f32) -> bool {
        if self.disconnected {
            return false;
        }
        self.timing_out = true;
        self.kick_countdown = duration;
        true
    }

    pub fn cancel_timeout(&mut self) {
        self.timing_out = false;
    }

    /// Advance the kick countdown by `delta`.
    ///
    /// Returns true exactly once: on the tick the countdown runs out, at which
    /// point the record is already marked disconnected.
    pub fn tick_timeout(&mut self, delta: f32) -> bool {
        if self.disconnected || !self.timing_out {
            return false;
        }

        self.kick_countdown -= delta;
        if self.kick_countdown <= 0.0 {
            self.mark_disconnected();
            return true;
        }
        false
    }

    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
        self.timing_out = false;
        self.kick_countdown = 0.0;
    }

    pub fn mark_unreachable(&mut self) {
        self.reachable = false;
    }

    /// Claim the right to schedule this faction's removal command.
    ///
    /// Returns true the first time only.
    pub fn claim_faction_removal(&mut self) -> bool {
        !std::mem::replace(&mut self.faction_removed, true)
    }
}
