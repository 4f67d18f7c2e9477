//! WebSocket upgrade handler

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use futures::stream::SplitStream;
use futures::{Sink, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::lockstep::{MatchHandle, ParticipantId, PeerConnection, TransportEvent};
use crate::util::rate_limit::PeerRateLimiter;
use crate::util::time::unix_millis;
use crate::ws::protocol::{HostMsg, PeerMsg, RejectReason};

/// Query parameters for WebSocket connection
#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub match_id: Uuid,
    /// Faction this connection plays
    pub participant_id: ParticipantId,
    /// Peers must run the host's game version
    pub game_version: String,
}

/// Errors writing to a peer's socket
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("websocket send failed: {0}")]
    Send(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// Why the writer half of a session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriterExit {
    /// The match task or the session dropped its channels
    ChannelsClosed,
    /// The host directed this connection to close
    Disconnected,
    /// A frame could not be written
    SendFailed,
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    let Some(handle) = state.match_registry.get(&query.match_id) else {
        warn!(match_id = %query.match_id, "WebSocket upgrade for unknown match");
        return (StatusCode::NOT_FOUND, "Match not found").into_response();
    };

    info!(
        match_id = %query.match_id,
        participant_id = query.participant_id,
        "WebSocket upgrade"
    );
    let game_version = state.config.game_version.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, query, game_version, handle))
}

/// Refuse the connection with `reason` and close it
async fn reject<S>(sink: &mut S, participant_id: ParticipantId, reason: RejectReason)
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    warn!(participant_id, ?reason, "Rejecting connection");
    let _ = send_msg(sink, &HostMsg::Rejected { reason }).await;
    let _ = sink.close().await;
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(socket: WebSocket, query: WsQuery, game_version: String, handle: MatchHandle) {
    let participant_id = query.participant_id;
    let (mut ws_sink, ws_stream) = socket.split();

    if query.game_version != game_version {
        debug!(
            participant_id,
            peer_version = %query.game_version,
            host_version = %game_version,
            "Game version mismatch"
        );
        reject(&mut ws_sink, participant_id, RejectReason::GameVersion).await;
        return;
    }

    if participant_id as usize >= handle.expected_participants() {
        reject(&mut ws_sink, participant_id, RejectReason::UnknownFaction).await;
        return;
    }

    if handle.input_tx.is_closed() {
        reject(&mut ws_sink, participant_id, RejectReason::MatchClosed).await;
        return;
    }

    // One live connection per faction; the claim is released when
    // `connection` drops at the end of this function
    let Some((connection, direct_rx)) = handle.connect(participant_id) else {
        reject(&mut ws_sink, participant_id, RejectReason::AlreadyConnected).await;
        return;
    };

    // Subscribe before the welcome so no broadcast is missed
    let outbound_rx = handle.subscribe();

    let welcome = HostMsg::Welcome {
        match_id: handle.id,
        participant_id,
        server_time: unix_millis(),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        error!(participant_id, error = %e, "Failed to send welcome");
        return;
    }

    let writer = tokio::spawn(write_loop(participant_id, ws_sink, direct_rx, outbound_rx));
    run_session(&connection, ws_stream, writer, &handle).await;

    if handle
        .transport(participant_id, TransportEvent::Closed)
        .await
        .is_err()
    {
        debug!(participant_id, "Match already stopped");
    }

    info!(participant_id, "WebSocket connection closed");
}

/// Forward host messages to the socket until a send fails, the host
/// disconnects this participant, or both channels close.
///
/// Direct messages are this connection's own; broadcasts go to every
/// connection of the match.
pub async fn write_loop<S>(
    participant_id: ParticipantId,
    mut sink: S,
    mut direct_rx: mpsc::Receiver<HostMsg>,
    mut outbound_rx: broadcast::Receiver<HostMsg>,
) -> WriterExit
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    loop {
        let msg = tokio::select! {
            direct = direct_rx.recv() => match direct {
                Some(msg) => msg,
                None => return WriterExit::ChannelsClosed,
            },
            broadcast = outbound_rx.recv() => match broadcast {
                Ok(msg) => msg,
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    // Missing lockstep messages breaks the turn count; let
                    // the drift detector deal with this peer
                    warn!(participant_id, lagged = n, "Peer lagged behind host broadcasts");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return WriterExit::ChannelsClosed,
            },
        };

        let closing = matches!(
            msg,
            HostMsg::Disconnect { participant_id: target, .. } if target == participant_id
        );

        if let Err(e) = send_msg(&mut sink, &msg).await {
            debug!(participant_id, error = %e, "WebSocket send failed");
            return WriterExit::SendFailed;
        }

        if closing {
            info!(participant_id, "Closing connection on host request");
            let _ = sink.close().await;
            return WriterExit::Disconnected;
        }
    }
}

/// Read peer messages and forward them to the match task until the socket
/// or the writer ends
async fn run_session(
    connection: &PeerConnection,
    mut ws_stream: SplitStream<WebSocket>,
    mut writer: JoinHandle<WriterExit>,
    handle: &MatchHandle,
) {
    let participant_id = connection.participant_id();
    let rate_limiter = PeerRateLimiter::new();

    loop {
        let result = tokio::select! {
            next = ws_stream.next() => match next {
                Some(result) => result,
                None => break,
            },
            exit = &mut writer => {
                if matches!(exit, Ok(WriterExit::SendFailed)) {
                    let _ = handle
                        .transport(participant_id, TransportEvent::Unreachable)
                        .await;
                }
                return;
            }
        };

        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<PeerMsg>(&text) {
                Ok(PeerMsg::Ping { t }) => {
                    let _ = connection.send(HostMsg::Pong { t }).await;
                }
                Ok(msg) => {
                    if matches!(msg, PeerMsg::SubmitCommand { .. }) && !rate_limiter.check_command()
                    {
                        warn!(participant_id, "Rate limited command submission");
                        continue;
                    }
                    if handle
                        .transport(participant_id, TransportEvent::Message(msg))
                        .await
                        .is_err()
                    {
                        debug!(participant_id, "Match input channel closed");
                        break;
                    }
                }
                Err(e) => {
                    warn!(participant_id, error = %e, "Failed to parse peer message");
                }
            },
            Ok(Message::Binary(_)) => {
                warn!(participant_id, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!(participant_id, "Peer initiated close");
                break;
            }
            Err(e) => {
                error!(participant_id, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer.abort();
}

/// Send a message over WebSocket
async fn send_msg<S>(sink: &mut S, msg: &HostMsg) -> Result<(), TransportError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let json = serde_json::to_string(msg)?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| TransportError::Send(Box::new(e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lockstep::RemovalReason;
    use futures::channel::mpsc as fmpsc;

    fn decode(frame: Message) -> HostMsg {
        match frame {
            Message::Text(text) => serde_json::from_str(&text).unwrap(),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn disconnect_for_this_participant_closes_the_writer() {
        let (sink, mut frames) = fmpsc::unbounded::<Message>();
        let (direct_tx, direct_rx) = mpsc::channel(4);
        let (outbound_tx, outbound_rx) = broadcast::channel(4);

        outbound_tx.send(HostMsg::Freeze { frozen: true }).unwrap();
        direct_tx
            .send(HostMsg::Disconnect {
                participant_id: 3,
                reason: RemovalReason::Timeout,
            })
            .await
            .unwrap();

        let exit = write_loop(3, sink, direct_rx, outbound_rx).await;
        assert_eq!(exit, WriterExit::Disconnected);

        let mut sent = Vec::new();
        while let Some(frame) = frames.next().await {
            sent.push(decode(frame));
        }
        assert!(sent.contains(&HostMsg::Disconnect {
            participant_id: 3,
            reason: RemovalReason::Timeout,
        }));
        assert_eq!(
            sent.last(),
            Some(&HostMsg::Disconnect {
                participant_id: 3,
                reason: RemovalReason::Timeout,
            })
        );
    }

    #[tokio::test]
    async fn failed_send_ends_the_writer() {
        let (sink, frames) = fmpsc::unbounded::<Message>();
        drop(frames);
        let (_direct_tx, direct_rx) = mpsc::channel(4);
        let (outbound_tx, outbound_rx) = broadcast::channel(4);
        outbound_tx
            .send(HostMsg::MatchStarted { turn: 0 })
            .unwrap();

        let exit = write_loop(0, sink, direct_rx, outbound_rx).await;
        assert_eq!(exit, WriterExit::SendFailed);
    }

    #[tokio::test]
    async fn closed_channels_end_the_writer() {
        let (sink, _frames) = fmpsc::unbounded::<Message>();
        let (direct_tx, direct_rx) = mpsc::channel(4);
        let (outbound_tx, outbound_rx) = broadcast::channel::<HostMsg>(4);
        drop(direct_tx);
        drop(outbound_tx);

        let exit = write_loop(0, sink, direct_rx, outbound_rx).await;
        assert_eq!(exit, WriterExit::ChannelsClosed);
    }
}
