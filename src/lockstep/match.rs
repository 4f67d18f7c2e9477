//! Match task: runs one coordinator on a fixed tick and wires it to channels

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::LockstepConfig;
use crate::ws::protocol::HostMsg;

use super::coordinator::{Inbound, LockstepCoordinator, MatchEvent, Outbound, TransportEvent};
use super::ports::FactionRegistry;
use super::{Command, ParticipantId};

/// Host messages queued for one connection beyond what fits
const DIRECT_CHANNEL_CAPACITY: usize = 32;

/// Direct senders of the connections currently playing each faction
type Connections = Arc<DashMap<ParticipantId, mpsc::Sender<HostMsg>>>;

/// Everything the match task accepts
#[derive(Debug, Clone)]
pub enum MatchInput {
    /// Event on a participant's connection
    Transport(Inbound),
    /// Host-local command for the next cycle
    SubmitCommand(Command),
    Kick(ParticipantId),
    FactionDefeated(ParticipantId),
}

/// The match task is no longer accepting input
#[derive(Debug, thiserror::Error)]
#[error("match task has stopped")]
pub struct MatchClosed;

/// Counters published by the match task after every tick
#[derive(Debug, Default)]
pub struct MatchStatus {
    server_turn: AtomicU64,
    active_participants: AtomicUsize,
    expected_participants: AtomicUsize,
    started: AtomicBool,
    frozen: AtomicBool,
}

/// Handle to a running match
#[derive(Clone)]
pub struct MatchHandle {
    pub id: Uuid,
    pub input_tx: mpsc::Sender<MatchInput>,
    pub outbound_tx: broadcast::Sender<HostMsg>,
    pub events_tx: broadcast::Sender<MatchEvent>,
    status: Arc<MatchStatus>,
    connections: Connections,
}

impl MatchHandle {
    pub fn server_turn(&self) -> u64 {
        self.status.server_turn.load(Ordering::Relaxed)
    }

    pub fn active_participants(&self) -> usize {
        self.status.active_participants.load(Ordering::Relaxed)
    }

    pub fn expected_participants(&self) -> usize {
        self.status.expected_participants.load(Ordering::Relaxed)
    }

    pub fn has_started(&self) -> bool {
        self.status.started.load(Ordering::Relaxed)
    }

    pub fn is_frozen(&self) -> bool {
        self.status.frozen.load(Ordering::Relaxed)
    }

    /// Receive everything the host broadcasts from now on
    pub fn subscribe(&self) -> broadcast::Receiver<HostMsg> {
        self.outbound_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MatchEvent> {
        self.events_tx.subscribe()
    }

    /// Claim the faction `participant_id` for a new connection.
    ///
    /// Returns `None` while another connection holds it. The claim lasts as
    /// long as the returned [`PeerConnection`]; its receiver yields messages
    /// addressed to this connection alone.
    pub fn connect(
        &self,
        participant_id: ParticipantId,
    ) -> Option<(PeerConnection, mpsc::Receiver<HostMsg>)> {
        match self.connections.entry(participant_id) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                let (tx, rx) = mpsc::channel(DIRECT_CHANNEL_CAPACITY);
                slot.insert(tx.clone());
                let connection = PeerConnection {
                    participant_id,
                    tx,
                    connections: Arc::clone(&self.connections),
                };
                Some((connection, rx))
            }
        }
    }

    pub fn is_connected(&self, participant_id: ParticipantId) -> bool {
        self.connections.contains_key(&participant_id)
    }

    pub async fn send(&self, input: MatchInput) -> Result<(), MatchClosed> {
        self.input_tx.send(input).await.map_err(|_| MatchClosed)
    }

    pub async fn transport(
        &self,
        participant_id: ParticipantId,
        event: TransportEvent,
    ) -> Result<(), MatchClosed> {
        self.send(MatchInput::Transport(Inbound {
            participant_id,
            event,
        }))
        .await
    }

    pub async fn submit_command(&self, command: Command) -> Result<(), MatchClosed> {
        self.send(MatchInput::SubmitCommand(command)).await
    }
}

/// One connection's hold on its faction. Dropping it frees the faction.
pub struct PeerConnection {
    participant_id: ParticipantId,
    tx: mpsc::Sender<HostMsg>,
    connections: Connections,
}

impl PeerConnection {
    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Queue a message for this connection only
    pub async fn send(&self, msg: HostMsg) -> Result<(), MatchClosed> {
        self.tx.send(msg).await.map_err(|_| MatchClosed)
    }
}

impl Drop for PeerConnection {
    fn drop(&mut self) {
        let tx = &self.tx;
        self.connections
            .remove_if(&self.participant_id, |_, held| held.same_channel(tx));
    }
}

/// Registry of all active matches
pub struct MatchRegistry {
    matches: DashMap<Uuid, MatchHandle>,
}

impl MatchRegistry {
    pub fn new() -> Self {
        Self {
            matches: DashMap::new(),
        }
    }

    pub fn get(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.get(id).map(|m| m.value().clone())
    }

    pub fn insert(&self, handle: MatchHandle) {
        self.matches.insert(handle.id, handle);
    }

    pub fn remove(&self, id: &Uuid) -> Option<MatchHandle> {
        self.matches.remove(id).map(|(_, h)| h)
    }

    pub fn active_matches(&self) -> usize {
        self.matches.len()
    }

    pub fn total_participants(&self) -> usize {
        self.matches
            .iter()
            .map(|m| m.value().active_participants())
            .sum()
    }

    /// Create a match, register it and spawn its task.
    /// The match removes itself from the registry when it ends.
    pub fn create_match<F>(
        self: &Arc<Self>,
        config: LockstepConfig,
        factions: F,
        tick_rate: u32,
    ) -> MatchHandle
    where
        F: FactionRegistry + 'static,
    {
        let match_id = Uuid::new_v4();
        let coordinator = LockstepCoordinator::new(config, factions);
        let (lockstep_match, handle) = LockstepMatch::new(match_id, coordinator, tick_rate);

        self.insert(handle.clone());
        info!(
            match_id = %match_id,
            expected = handle.expected_participants(),
            "Created new match"
        );

        let registry = Arc::clone(self);
        tokio::spawn(async move {
            lockstep_match.run().await;
            registry.remove(&match_id);
            info!(match_id = %match_id, "Match removed from registry");
        });

        handle
    }
}

impl Default for MatchRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The authoritative match task
pub struct LockstepMatch {
    id: Uuid,
    coordinator: LockstepCoordinator,
    input_rx: mpsc::Receiver<MatchInput>,
    outbound_tx: broadcast::Sender<HostMsg>,
    events_tx: broadcast::Sender<MatchEvent>,
    status: Arc<MatchStatus>,
    connections: Connections,
    tick_rate: u32,
}

impl LockstepMatch {
    pub fn new(
        id: Uuid,
        coordinator: LockstepCoordinator,
        tick_rate: u32,
    ) -> (Self, MatchHandle) {
        let (input_tx, input_rx) = mpsc::channel(256);
        let (outbound_tx, _) = broadcast::channel(256);
        let (events_tx, _) = broadcast::channel(64);
        let status = Arc::new(MatchStatus::default());
        let connections: Connections = Arc::new(DashMap::new());

        let handle = MatchHandle {
            id,
            input_tx,
            outbound_tx: outbound_tx.clone(),
            events_tx: events_tx.clone(),
            status: status.clone(),
            connections: Arc::clone(&connections),
        };

        let lockstep_match = Self {
            id,
            coordinator,
            input_rx,
            outbound_tx,
            events_tx,
            status,
            connections,
            tick_rate: tick_rate.max(1),
        };
        lockstep_match.publish_status();

        (lockstep_match, handle)
    }

    /// Run the host tick loop until the match is abandoned or every handle is dropped
    pub async fn run(mut self) {
        info!(match_id = %self.id, tick_rate = self.tick_rate, "Match task started");

        let tick_duration = Duration::from_secs_f64(1.0 / self.tick_rate as f64);
        let mut tick_interval = interval(tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        loop {
            tick_interval.tick().await;

            if !self.process_inputs() {
                info!(match_id = %self.id, "All match handles dropped");
                break;
            }

            let now = Instant::now();
            let delta = now.duration_since(last_tick).as_secs_f32();
            last_tick = now;

            let outbound = self.coordinator.tick(delta);
            self.dispatch(outbound);
            self.publish_status();

            if self.coordinator.loading_timed_out() {
                warn!(
                    match_id = %self.id,
                    ready = self.coordinator.participants().len(),
                    expected = self.coordinator.expected_participants(),
                    "Loading timed out, ending match"
                );
                break;
            }
            if self.coordinator.is_abandoned() {
                info!(
                    match_id = %self.id,
                    turn = self.coordinator.current_server_turn(),
                    "All participants left, ending match"
                );
                break;
            }
        }
    }

    /// Drain queued inputs. Returns false once the input channel is closed.
    fn process_inputs(&mut self) -> bool {
        loop {
            let input = match self.input_rx.try_recv() {
                Ok(input) => input,
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            };

            let outbound = match input {
                MatchInput::Transport(inbound) => self.coordinator.handle(inbound),
                MatchInput::SubmitCommand(command) => {
                    self.coordinator.submit_local_command(command);
                    Vec::new()
                }
                MatchInput::Kick(id) => self.coordinator.kick(id),
                MatchInput::FactionDefeated(id) => self.coordinator.on_faction_defeated(id),
            };
            self.dispatch(outbound);
        }
    }

    fn dispatch(&self, outbound: Vec<Outbound>) {
        for item in outbound {
            match item {
                Outbound::Broadcast(msg) => {
                    // No subscribers just means nobody is connected right now
                    let _ = self.outbound_tx.send(msg);
                }
                Outbound::Disconnect {
                    participant_id,
                    reason,
                } => {
                    debug!(match_id = %self.id, participant_id, %reason, "Disconnecting participant");
                    self.send_direct(participant_id, HostMsg::Disconnect { participant_id, reason });
                }
                Outbound::Event(event) => {
                    let _ = self.events_tx.send(event);
                }
            }
        }
    }

    /// Deliver to one connection. A missing or closed connection is already
    /// on its way to a `Closed` event.
    fn send_direct(&self, participant_id: ParticipantId, msg: HostMsg) {
        let Some(tx) = self.connections.get(&participant_id).map(|c| c.value().clone()) else {
            debug!(match_id = %self.id, participant_id, "No live connection for direct message");
            return;
        };
        if let Err(e) = tx.try_send(msg) {
            warn!(match_id = %self.id, participant_id, error = %e, "Direct message dropped");
        }
    }

    fn publish_status(&self) {
        let c = &self.coordinator;
        self.status
            .server_turn
            .store(c.current_server_turn(), Ordering::Relaxed);
        self.status
            .active_participants
            .store(c.active_participants(), Ordering::Relaxed);
        self.status
            .expected_participants
            .store(c.expected_participants(), Ordering::Relaxed);
        self.status
            .started
            .store(c.all_participants_ready(), Ordering::Relaxed);
        self.status
            .frozen
            .store(c.is_clock_frozen(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockstep::FixedFactions;

    fn handle(factions: usize) -> MatchHandle {
        let coordinator =
            LockstepCoordinator::new(LockstepConfig::default(), FixedFactions::new(factions));
        let (_task, handle) = LockstepMatch::new(Uuid::new_v4(), coordinator, 60);
        handle
    }

    #[test]
    fn one_connection_per_participant() {
        let handle = handle(2);
        let (first, _rx) = handle.connect(0).unwrap();
        assert!(handle.is_connected(0));
        assert!(handle.connect(0).is_none());
        assert!(handle.connect(1).is_some());

        drop(first);
        assert!(!handle.is_connected(0));
        assert!(handle.connect(0).is_some());
    }

    #[test]
    fn stale_connection_does_not_release_a_newer_claim() {
        let handle = handle(1);
        let (first, _first_rx) = handle.connect(0).unwrap();
        let stale = PeerConnection {
            participant_id: 0,
            tx: mpsc::channel(1).0,
            connections: Arc::clone(&handle.connections),
        };
        drop(stale);
        assert!(handle.is_connected(0));
        drop(first);
        assert!(!handle.is_connected(0));
    }
}
