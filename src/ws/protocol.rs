//! WebSocket protocol message definitions
//! These are the wire types exchanged between the host and remote peers

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::lockstep::{Command, ParticipantId, RemovalReason};

/// Messages sent from a remote peer to the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerMsg {
    /// The peer finished loading the map and is ready to play
    SceneReady { participant_id: ParticipantId },

    /// Command to schedule into the next lockstep cycle
    SubmitCommand { command: Command },

    /// Outcome of comparing the received commands with the host's count
    TurnReport {
        participant_id: ParticipantId,
        success: bool,
    },

    /// Ping for latency measurement
    Ping {
        /// Client timestamp
        t: u64,
    },
}

/// Messages sent from the host to remote peers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostMsg {
    /// Sent once after the connection is accepted
    Welcome {
        match_id: Uuid,
        participant_id: ParticipantId,
        server_time: u64,
    },

    /// Connection refused before joining the match
    Rejected { reason: RejectReason },

    /// Every expected participant is ready; lockstep cycles begin
    MatchStarted { turn: u64 },

    /// All commands buffered during one lockstep cycle, in order
    CommandBatch { turn: u64, commands: Vec<Command> },

    /// Number of commands the preceding batch carried
    AckCount { turn: u64, commands_count: usize },

    /// Freeze or unfreeze the shared simulation clock
    Freeze { frozen: bool },

    /// A participant no longer takes part in consensus
    ParticipantRemoved {
        participant_id: ParticipantId,
        reason: RemovalReason,
    },

    /// Directive to close one participant's connection
    Disconnect {
        participant_id: ParticipantId,
        reason: RemovalReason,
    },

    /// Pong response
    Pong {
        /// Echo back client timestamp
        t: u64,
    },
}

/// Why a connection was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Peer runs a different game version than the host
    GameVersion,
    /// No faction with this id exists in the match
    UnknownFaction,
    /// Another live connection already plays this faction
    AlreadyConnected,
    /// The match ended before this connection was accepted
    MatchClosed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_messages_use_snake_case_tags() {
        let msg: PeerMsg =
            serde_json::from_str(r#"{"type":"turn_report","participant_id":2,"success":false}"#)
                .unwrap();
        assert_eq!(
            msg,
            PeerMsg::TurnReport {
                participant_id: 2,
                success: false
            }
        );
    }

    #[test]
    fn removal_reason_serializes_lowercase() {
        let json = serde_json::to_string(&HostMsg::ParticipantRemoved {
            participant_id: 1,
            reason: RemovalReason::Timeout,
        })
        .unwrap();
        assert!(json.contains(r#""type":"participant_removed""#));
        assert!(json.contains(r#""reason":"timeout""#));
    }
}
