//! Authoritative lockstep coordinator (host only)
//!
//! One [`LockstepCoordinator`] is the match context: it owns the turn
//! counter, the pending command buffer, every participant record and the
//! drift detector. It never performs I/O. Transport events go in through
//! [`LockstepCoordinator::handle`] and the per-frame [`LockstepCoordinator::tick`],
//! and every call returns the [`Outbound`] messages the transport must carry.

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::LockstepConfig;
use crate::ws::protocol::{HostMsg, PeerMsg};

use super::buffer::CommandBuffer;
use super::participant::ParticipantRecord;
use super::ports::FactionRegistry;
use super::sync_test::{ClockDirective, SyncTest};
use super::{Command, GameState, ParticipantId, RemovalReason};

/// Match phase as seen from outside the coordinator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchPhase {
    /// Waiting for every participant to load the map
    Loading,
    /// Lockstep cycles running
    Running,
    /// Consensus broken, cycles paused
    Frozen,
}

/// Notifications for the simulation/UI side of the host
#[derive(Debug, Clone, PartialEq)]
pub enum MatchEvent {
    AllParticipantsReady,
    ParticipantRemoved {
        participant_id: ParticipantId,
        reason: RemovalReason,
    },
}

/// Work for the transport produced by the coordinator
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Deliver to every connected participant, in order
    Broadcast(HostMsg),
    /// Close one participant's connection
    Disconnect {
        participant_id: ParticipantId,
        reason: RemovalReason,
    },
    /// Local notification, not sent over the wire
    Event(MatchEvent),
}

/// What the transport observed on a participant's connection
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Message(PeerMsg),
    /// Outbound delivery failed; the connection may still be half-open
    Unreachable,
    /// The connection is gone
    Closed,
}

/// Transport event tagged with the connection's participant
#[derive(Debug, Clone, PartialEq)]
pub struct Inbound {
    pub participant_id: ParticipantId,
    pub event: TransportEvent,
}

pub struct LockstepCoordinator {
    config: LockstepConfig,
    cycle_accumulator: f32,
    server_turn: u64,
    buffer: CommandBuffer,
    ready_participants: usize,
    expected_participants: usize,
    all_participants_ready: bool,
    loading_elapsed: f32,
    clock: GameState,
    participants: Vec<ParticipantRecord>,
    sync_test: SyncTest,
    factions: Box<dyn FactionRegistry>,
}

impl LockstepCoordinator {
    pub fn new<F>(config: LockstepConfig, factions: F) -> Self
    where
        F: FactionRegistry + 'static,
    {
        let config = config.sanitized();

        let mut expected_participants = factions.faction_count();
        if expected_participants == 0 {
            warn!("Match configured with zero factions, expecting one participant");
            expected_participants = 1;
        }

        Self {
            cycle_accumulator: 0.0,
            server_turn: 0,
            buffer: CommandBuffer::new(),
            ready_participants: 0,
            expected_participants,
            all_participants_ready: false,
            loading_elapsed: 0.0,
            clock: GameState::Running,
            participants: Vec::new(),
            sync_test: SyncTest::new(config.sync_trigger_turn, config.sync_reload_interval),
            factions: Box::new(factions),
            config,
        }
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn current_server_turn(&self) -> u64 {
        self.server_turn
    }

    pub fn phase(&self) -> MatchPhase {
        if !self.all_participants_ready {
            MatchPhase::Loading
        } else if self.clock.is_frozen() {
            MatchPhase::Frozen
        } else {
            MatchPhase::Running
        }
    }

    pub fn is_clock_frozen(&self) -> bool {
        self.clock.is_frozen()
    }

    pub fn game_state(&self) -> GameState {
        self.clock
    }

    pub fn all_participants_ready(&self) -> bool {
        self.all_participants_ready
    }

    pub fn expected_participants(&self) -> usize {
        self.expected_participants
    }

    pub fn participants(&self) -> &[ParticipantRecord] {
        &self.participants
    }

    pub fn participant(&self, id: ParticipantId) -> Option<&ParticipantRecord> {
        self.participants.iter().find(|p| p.participant_id() == id)
    }

    /// Participants still taking part in consensus
    pub fn active_participants(&self) -> usize {
        self.participants
            .iter()
            .filter(|p| !p.is_disconnected())
            .count()
    }

    pub fn sync_test(&self) -> &SyncTest {
        &self.sync_test
    }

    pub fn pending_commands(&self) -> &[Command] {
        self.buffer.pending()
    }

    /// Loading ran past the configured timeout without every participant ready
    pub fn loading_timed_out(&self) -> bool {
        !self.all_participants_ready && self.loading_elapsed >= self.config.loading_timeout
    }

    /// Nobody is left to play: every participant that joined has left, or
    /// loading never completed in time
    pub fn is_abandoned(&self) -> bool {
        if self.all_participants_ready {
            return self.active_participants() == 0;
        }
        self.loading_timed_out()
            || (!self.participants.is_empty() && self.active_participants() == 0)
    }

    fn record_mut(&mut self, id: ParticipantId) -> Option<&mut ParticipantRecord> {
        self.participants
            .iter_mut()
            .find(|p| p.participant_id() == id)
    }

    // ------------------------------------------------------------------
    // Inputs
    // ------------------------------------------------------------------

    /// Buffer a command for the next cycle boundary
    pub fn submit_local_command(&mut self, command: Command) {
        self.buffer.push(command);
    }

    /// Dispatch one transport event
    pub fn handle(&mut self, inbound: Inbound) -> Vec<Outbound> {
        let mut out = Vec::new();
        let from = inbound.participant_id;

        match inbound.event {
            TransportEvent::Message(msg) => self.handle_peer_msg(from, msg, &mut out),
            TransportEvent::Unreachable => self.on_unreachable(from),
            TransportEvent::Closed => self.on_connection_closed(from, &mut out),
        }

        out
    }

    fn handle_peer_msg(&mut self, from: ParticipantId, msg: PeerMsg, out: &mut Vec<Outbound>) {
        match msg {
            PeerMsg::SceneReady { participant_id } => {
                if participant_id != from {
                    warn!(from, participant_id, "Scene-ready for another participant, ignoring");
                    return;
                }
                self.on_scene_ready(participant_id, out);
            }
            PeerMsg::SubmitCommand { command } => {
                if !self.all_participants_ready {
                    debug!(participant_id = from, "Command before match start, dropping");
                    return;
                }
                self.buffer.push(command);
            }
            PeerMsg::TurnReport {
                participant_id,
                success,
            } => {
                if participant_id != from {
                    warn!(from, participant_id, "Turn report for another participant, ignoring");
                    return;
                }
                self.on_turn_report(participant_id, success, out);
            }
            PeerMsg::Ping { .. } => {
                // Answered by the transport
            }
        }
    }

    /// Advance the match by `delta` seconds of unscaled time
    pub fn tick(&mut self, delta: f32) -> Vec<Outbound> {
        let mut out = Vec::new();

        if !self.all_participants_ready {
            self.loading_elapsed += delta;
            return out;
        }

        if self.sync_test.all_synced() {
            self.advance_cycle(delta, &mut out);
        } else {
            self.advance_timeouts(delta, &mut out);
        }

        if self.sync_test.advance(delta) {
            self.run_sync_test(&mut out);
        }

        out
    }

    /// Host-initiated kick
    pub fn kick(&mut self, id: ParticipantId) -> Vec<Outbound> {
        let mut out = Vec::new();

        let Some(record) = self.record_mut(id) else {
            warn!(participant_id = id, "Kick for unknown participant");
            return out;
        };
        if record.is_disconnected() {
            return out;
        }
        record.mark_disconnected();

        info!(participant_id = id, "Participant kicked");
        out.push(Outbound::Disconnect {
            participant_id: id,
            reason: RemovalReason::Kick,
        });
        self.announce_removal(id, RemovalReason::Kick, &mut out);
        self.reevaluate_if_unsynced(&mut out);
        out
    }

    /// The simulation reported a faction defeated
    pub fn on_faction_defeated(&mut self, id: ParticipantId) -> Vec<Outbound> {
        let mut out = Vec::new();

        let Some(record) = self.record_mut(id) else {
            debug!(participant_id = id, "Defeated faction has no participant record");
            return out;
        };
        if record.is_disconnected() {
            return out;
        }
        record.mark_disconnected();
        // The simulation already removed the faction itself
        record.claim_faction_removal();

        info!(participant_id = id, "Participant defeated");
        self.announce_removal(id, RemovalReason::Defeat, &mut out);
        if self.is_clock_frozen() {
            self.run_sync_test(&mut out);
        }
        out
    }

    // ------------------------------------------------------------------
    // Loading
    // ------------------------------------------------------------------

    fn on_scene_ready(&mut self, id: ParticipantId, out: &mut Vec<Outbound>) {
        if self.all_participants_ready {
            warn!(participant_id = id, "Scene-ready after match start, ignoring");
            return;
        }
        if !self.factions.has_faction(id) {
            warn!(participant_id = id, "Scene-ready for unknown faction, ignoring");
            return;
        }
        if self.participant(id).is_some() {
            debug!(participant_id = id, "Duplicate scene-ready");
            return;
        }

        self.participants.push(ParticipantRecord::new(id));
        self.ready_participants += 1;

        info!(
            participant_id = id,
            ready = self.ready_participants,
            expected = self.expected_participants,
            "Participant scene ready"
        );

        if self.ready_participants == self.expected_participants {
            self.all_participants_ready = true;
            self.sync_test.on_all_participants_ready();

            info!(turn = self.server_turn, "All participants ready, lockstep running");
            out.push(Outbound::Broadcast(HostMsg::MatchStarted {
                turn: self.server_turn,
            }));
            out.push(Outbound::Event(MatchEvent::AllParticipantsReady));
        }
    }

    // ------------------------------------------------------------------
    // Lockstep cycle
    // ------------------------------------------------------------------

    fn advance_cycle(&mut self, delta: f32, out: &mut Vec<Outbound>) {
        self.cycle_accumulator += delta;

        // At most one boundary per tick; overshoot carries into the next cycle
        if self.cycle_accumulator >= self.config.cycle_length {
            self.cycle_accumulator -= self.config.cycle_length;
            self.complete_cycle(out);
        }
    }

    fn complete_cycle(&mut self, out: &mut Vec<Outbound>) {
        self.server_turn += 1;
        let turn = self.server_turn;

        let commands = self.buffer.take_batch();
        let commands_count = commands.len();

        debug!(turn, commands_count, "Lockstep cycle complete");

        out.push(Outbound::Broadcast(HostMsg::CommandBatch { turn, commands }));
        out.push(Outbound::Broadcast(HostMsg::AckCount {
            turn,
            commands_count,
        }));

        if self.sync_test.try_enable(turn) {
            info!(turn, "Sync test enabled");
        }
    }

    // ------------------------------------------------------------------
    // Acknowledgments
    // ------------------------------------------------------------------

    fn on_turn_report(&mut self, id: ParticipantId, success: bool, out: &mut Vec<Outbound>) {
        let server_turn = self.server_turn;

        let Some(record) = self.record_mut(id) else {
            warn!(participant_id = id, "Turn report from unknown participant");
            return;
        };
        if record.is_disconnected() {
            debug!(participant_id = id, "Turn report from removed participant");
            return;
        }

        if success {
            if !record.acknowledge_turn(server_turn) {
                warn!(
                    participant_id = id,
                    server_turn, "Turn report beyond server turn, dropping"
                );
                return;
            }

            // A lagging participant catching up may end a freeze early
            if !self.sync_test.all_synced() {
                self.run_sync_test(out);
            }
        } else {
            record.record_failed_turn();
            warn!(
                participant_id = id,
                server_turn,
                failed_turns = record.failed_turns(),
                "Participant reported a command count mismatch"
            );

            if self.sync_test.is_enabled() {
                self.run_sync_test(out);
            }
        }
    }

    // ------------------------------------------------------------------
    // Drift detection and liveness
    // ------------------------------------------------------------------

    fn run_sync_test(&mut self, out: &mut Vec<Outbound>) {
        let Some(report) = self
            .sync_test
            .evaluate(self.participants.iter(), self.clock.is_frozen())
        else {
            return;
        };

        let kick_timeout = self.config.kick_timeout;
        for id in report.start_timeouts {
            if let Some(record) = self.record_mut(id) {
                if record.start_timeout(kick_timeout) {
                    warn!(
                        participant_id = id,
                        acknowledged = record.last_acknowledged_turn(),
                        kick_timeout,
                        "Participant lagging, kick countdown started"
                    );
                }
            }
        }

        for id in report.cancel_timeouts {
            if let Some(record) = self.record_mut(id) {
                record.cancel_timeout();
                info!(participant_id = id, "Participant caught up");
            }
        }

        if let Some(directive) = report.clock {
            self.apply_clock(directive, out);
        }
    }

    fn apply_clock(&mut self, directive: ClockDirective, out: &mut Vec<Outbound>) {
        let frozen = directive.frozen();
        self.clock = GameState::from_frozen(frozen);

        info!(
            frozen,
            turn = self.server_turn,
            synced_turns = self.sync_test.synced_turn_count(),
            "Clock state changed"
        );
        out.push(Outbound::Broadcast(HostMsg::Freeze { frozen }));
    }

    fn reevaluate_if_unsynced(&mut self, out: &mut Vec<Outbound>) {
        if !self.sync_test.all_synced() {
            self.run_sync_test(out);
        }
    }

    fn advance_timeouts(&mut self, delta: f32, out: &mut Vec<Outbound>) {
        let expired: Vec<ParticipantId> = self
            .participants
            .iter_mut()
            .filter_map(|record| {
                record
                    .tick_timeout(delta)
                    .then_some(record.participant_id())
            })
            .collect();

        if expired.is_empty() {
            return;
        }

        for id in expired {
            self.expire(id, out);
        }
        self.reevaluate_if_unsynced(out);
    }

    /// Kick countdown ran out; the record is already disconnected
    fn expire(&mut self, id: ParticipantId, out: &mut Vec<Outbound>) {
        let Some(record) = self.record_mut(id) else {
            return;
        };

        if record.is_reachable() {
            // Removal command follows once the transport reports the close
            out.push(Outbound::Disconnect {
                participant_id: id,
                reason: RemovalReason::Timeout,
            });
        } else if record.claim_faction_removal() {
            self.buffer.push(Command::RemoveFaction { faction_id: id });
        }

        info!(participant_id = id, "Participant timed out");
        self.announce_removal(id, RemovalReason::Timeout, out);
    }

    fn on_unreachable(&mut self, id: ParticipantId) {
        if let Some(record) = self.record_mut(id) {
            if record.is_reachable() {
                record.mark_unreachable();
                warn!(participant_id = id, "Participant unreachable");
            }
        }
    }

    fn on_connection_closed(&mut self, id: ParticipantId, out: &mut Vec<Outbound>) {
        let Some(record) = self.record_mut(id) else {
            debug!(participant_id = id, "Connection closed before scene ready");
            return;
        };

        record.mark_unreachable();
        let newly_removed = !record.is_disconnected();
        record.mark_disconnected();

        if record.claim_faction_removal() {
            self.buffer.push(Command::RemoveFaction { faction_id: id });
        }

        if newly_removed {
            info!(participant_id = id, "Participant disconnected");
            self.announce_removal(id, RemovalReason::Disconnect, out);
            self.reevaluate_if_unsynced(out);
        }
    }

    fn announce_removal(&self, id: ParticipantId, reason: RemovalReason, out: &mut Vec<Outbound>) {
        out.push(Outbound::Broadcast(HostMsg::ParticipantRemoved {
            participant_id: id,
            reason,
        }));
        out.push(Outbound::Event(MatchEvent::ParticipantRemoved {
            participant_id: id,
            reason,
        }));
    }
}
