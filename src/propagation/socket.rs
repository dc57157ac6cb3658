//! WebSocket transport for push propagation.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{ClientMessage, PropagationError, RoomRegistry, ServerMessage, SessionId};
use crate::{
    error::AppError, models::PollId, poll::poll_view, state::AppState, store::PollStore,
};

/// Per-connection lifecycle. A connection is registered (and thus `Open`)
/// before the upgrade completes, and `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Disconnected,
}

/// Server side of one viewer connection. Dropping it releases every room membership.
pub struct Connection {
    session_id: SessionId,
    phase: Phase,
    rooms: Arc<RoomRegistry>,
    store: Arc<dyn PollStore>,
}

impl Connection {
    pub fn open(
        rooms: Arc<RoomRegistry>,
        store: Arc<dyn PollStore>,
    ) -> Result<(Self, mpsc::Receiver<ServerMessage>), PropagationError> {
        let (session_id, outbound) = rooms.connect()?;

        let connection = Self {
            session_id,
            phase: Phase::Open,
            rooms,
            store,
        };

        Ok((connection, outbound))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Parses and applies one text frame, returning the reply to send back, if any.
    pub async fn handle_text(&mut self, text: &str) -> Option<ServerMessage> {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(message) => self.handle(message).await,
            Err(e) => Some(ServerMessage::Error {
                poll_id: None,
                error: "InvalidInput".to_string(),
                message: format!("Malformed message: {e}"),
            }),
        }
    }

    pub async fn handle(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        if self.phase != Phase::Open {
            return None;
        }

        match message {
            ClientMessage::JoinPoll { poll_id } => Some(self.join(poll_id).await),
            ClientMessage::LeavePoll { poll_id } => {
                self.rooms.leave(self.session_id, poll_id);
                None
            }
        }
    }

    // Membership is registered before the snapshot is read, so no admission can
    // fall between the two. Deltas already covered by the snapshot are skipped
    // by the client using `lastVoteId`.
    async fn join(&mut self, poll_id: PollId) -> ServerMessage {
        let joined = match self.rooms.join(self.session_id, poll_id) {
            Ok(joined) => joined,
            Err(e) => return error_message(poll_id, &AppError::from(e)),
        };

        match poll_view(self.store.as_ref(), poll_id).await {
            Ok(view) => ServerMessage::Snapshot(view),
            Err(e) => {
                if joined {
                    self.rooms.leave(self.session_id, poll_id);
                }
                error_message(poll_id, &e)
            }
        }
    }

    pub fn close(&mut self) {
        if self.phase != Phase::Disconnected {
            self.rooms.disconnect(self.session_id);
            self.phase = Phase::Disconnected;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn error_message(poll_id: PollId, err: &AppError) -> ServerMessage {
    ServerMessage::Error {
        poll_id: Some(poll_id),
        error: err.kind().to_string(),
        message: err.to_string(),
    }
}

pub async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let rooms = state
        .propagation
        .rooms()
        .cloned()
        .ok_or(PropagationError::PushDisabled)?;

    let (connection, outbound) = Connection::open(rooms, state.store.clone())?;

    Ok(ws.on_upgrade(move |socket| run_connection(socket, connection, outbound)))
}

async fn run_connection(
    socket: WebSocket,
    mut connection: Connection,
    mut outbound: mpsc::Receiver<ServerMessage>,
) {
    let session_id = connection.session_id();
    info!(%session_id, "Viewer connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        let reply = tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => connection.handle_text(text.as_str()).await,
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => None,
                Some(Err(e)) => {
                    debug!(%session_id, "Socket error: {e}");
                    break;
                }
            },
            event = outbound.recv() => match event {
                Some(event) => Some(event),
                // Registry closed during shutdown.
                None => break,
            },
        };

        let Some(reply) = reply else {
            continue;
        };

        let payload = match serde_json::to_string(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(%session_id, "Failed to encode message: {e}");
                continue;
            }
        };

        if sink.send(Message::Text(payload.into())).await.is_err() {
            break;
        }
    }

    connection.close();
    let _ = sink.close().await;
    info!(%session_id, "Viewer disconnected");
}
