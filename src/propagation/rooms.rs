//! Room membership for push propagation.
//!
//! Two indexes kept under one lock: poll id -> sessions in that room, and
//! session id -> its outbound queue plus the rooms it joined. Disconnecting a
//! session removes it from every room, and empty rooms are dropped, so
//! membership never outlives the connection.
//!
//! A session whose queue overflows misses deltas. It is flagged as lagging in
//! that room, and the next message it can take is a `resync` notice instead of
//! a delta, which tells the client to ask for a fresh snapshot.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{PropagationError, ServerMessage, VoteCast};
use crate::models::PollId;

pub type SessionId = Uuid;

/// Outcome of one broadcast.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    /// Deltas dropped because a session's queue was full.
    pub dropped: usize,
}

struct SessionEntry {
    sender: mpsc::Sender<ServerMessage>,
    rooms: HashSet<PollId>,
    /// Rooms where this session missed a delta and has not been told yet.
    lagging: HashSet<PollId>,
}

#[derive(Default)]
struct Registry {
    sessions: HashMap<SessionId, SessionEntry>,
    rooms: HashMap<PollId, HashSet<SessionId>>,
}

impl Registry {
    fn remove_session(&mut self, session_id: SessionId) -> Option<SessionEntry> {
        let entry = self.sessions.remove(&session_id)?;

        for poll_id in &entry.rooms {
            self.remove_member(*poll_id, session_id);
        }

        Some(entry)
    }

    fn remove_member(&mut self, poll_id: PollId, session_id: SessionId) {
        if let Some(members) = self.rooms.get_mut(&poll_id) {
            members.remove(&session_id);
            if members.is_empty() {
                self.rooms.remove(&poll_id);
            }
        }
    }
}

pub struct RoomRegistry {
    inner: Mutex<Registry>,
    queue_capacity: usize,
    closed: AtomicBool,
}

impl RoomRegistry {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Registry::default()),
            queue_capacity: queue_capacity.max(1),
            closed: AtomicBool::new(false),
        }
    }

    // Critical sections never panic, so a poisoned lock still holds consistent indexes.
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Registers a new session and hands back its outbound queue.
    pub fn connect(&self) -> Result<(SessionId, mpsc::Receiver<ServerMessage>), PropagationError> {
        if self.is_closed() {
            return Err(PropagationError::Closed);
        }

        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let session_id = Uuid::new_v4();

        self.lock().sessions.insert(
            session_id,
            SessionEntry {
                sender,
                rooms: HashSet::new(),
                lagging: HashSet::new(),
            },
        );
        debug!(%session_id, "Session connected");

        Ok((session_id, receiver))
    }

    /// Adds the session to the poll's room. Returns `false` if it was already a member.
    ///
    /// Joining again is how a client resyncs: the snapshot that follows covers
    /// anything it missed, so a pending lag flag is cleared.
    pub fn join(&self, session_id: SessionId, poll_id: PollId) -> Result<bool, PropagationError> {
        if self.is_closed() {
            return Err(PropagationError::Closed);
        }

        let mut registry = self.lock();

        let entry = registry
            .sessions
            .get_mut(&session_id)
            .ok_or(PropagationError::UnknownSession(session_id))?;
        entry.lagging.remove(&poll_id);
        if !entry.rooms.insert(poll_id) {
            return Ok(false);
        }

        registry.rooms.entry(poll_id).or_default().insert(session_id);
        debug!(%session_id, poll_id, "Joined poll room");

        Ok(true)
    }

    /// Removes the session from the poll's room. Returns `false` if it was not a member.
    pub fn leave(&self, session_id: SessionId, poll_id: PollId) -> bool {
        let mut registry = self.lock();

        let left = registry
            .sessions
            .get_mut(&session_id)
            .is_some_and(|entry| {
                entry.lagging.remove(&poll_id);
                entry.rooms.remove(&poll_id)
            });
        if left {
            registry.remove_member(poll_id, session_id);
            debug!(%session_id, poll_id, "Left poll room");
        }

        left
    }

    /// Drops the session and all its memberships. Returns how many rooms it was in.
    pub fn disconnect(&self, session_id: SessionId) -> usize {
        let removed = self.lock().remove_session(session_id);

        match removed {
            Some(entry) => {
                debug!(%session_id, rooms = entry.rooms.len(), "Session disconnected");
                entry.rooms.len()
            }
            None => 0,
        }
    }

    /// Sends the delta to every session in the poll's room without waiting on any of them.
    pub fn publish(&self, event: &VoteCast) -> Result<Delivery, PropagationError> {
        if self.is_closed() {
            return Err(PropagationError::Closed);
        }

        let poll_id = event.poll_id;
        let mut registry = self.lock();
        let Registry { sessions, rooms } = &mut *registry;
        let mut delivery = Delivery::default();
        let mut gone = Vec::new();

        let Some(members) = rooms.get(&poll_id) else {
            return Ok(delivery);
        };

        for session_id in members {
            let Some(entry) = sessions.get_mut(session_id) else {
                continue;
            };

            let lagging = entry.lagging.contains(&poll_id);
            let message = if lagging {
                ServerMessage::Resync { poll_id }
            } else {
                ServerMessage::NewVote(event.clone())
            };

            match entry.sender.try_send(message) {
                Ok(()) => {
                    if lagging {
                        entry.lagging.remove(&poll_id);
                        debug!(%session_id, poll_id, "Asked lagging session to resync");
                    }
                    delivery.delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    warn!(%session_id, poll_id, "Session queue full, dropping delta");
                    entry.lagging.insert(poll_id);
                    delivery.dropped += 1;
                }
                Err(TrySendError::Closed(_)) => gone.push(*session_id),
            }
        }

        for session_id in gone {
            registry.remove_session(session_id);
        }

        Ok(delivery)
    }

    /// Stops accepting sessions and drops every queue, which ends all socket loops.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let mut registry = self.lock();
        registry.sessions.clear();
        registry.rooms.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn room_size(&self, poll_id: PollId) -> usize {
        self.lock().rooms.get(&poll_id).map_or(0, HashSet::len)
    }

    pub fn room_count(&self) -> usize {
        self.lock().rooms.len()
    }

    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}
