//! Live tally propagation.
//!
//! Two interchangeable strategies, picked at deployment time:
//!
//! - **Push**: sessions hold a WebSocket, join rooms keyed by poll id, and get a
//!   `newVote` delta for every admission. Deltas are lossy hints; a session that
//!   reconnects or falls behind resynchronizes from a `snapshot`.
//! - **Pull**: sessions re-read `GET /polls/{id}` on a fixed interval. The
//!   server keeps no per-client state.
//!
//! Publishing never fails an admission. Callers log the error and move on.

use std::{fmt, str::FromStr, sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{OptionId, PollId, PollView, Vote, VoteId};

pub mod rooms;
pub mod socket;

pub use rooms::{Delivery, RoomRegistry, SessionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    Push,
    Pull,
}

impl FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "push" => Ok(Strategy::Push),
            "pull" => Ok(Strategy::Pull),
            other => Err(format!("unknown propagation strategy {other:?}, expected push or pull")),
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Strategy::Push => f.write_str("push"),
            Strategy::Pull => f.write_str("pull"),
        }
    }
}

#[derive(Error, Debug)]
pub enum PropagationError {
    #[error("Propagation channel is closed")]
    Closed,

    #[error("Unknown session {0}")]
    UnknownSession(SessionId),

    #[error("Push propagation is disabled")]
    PushDisabled,
}

/// Delta broadcast to a poll's room after an admission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteCast {
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub vote_id: VoteId,
}

impl From<&Vote> for VoteCast {
    fn from(vote: &Vote) -> Self {
        Self {
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            vote_id: vote.id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    JoinPoll { poll_id: PollId },
    LeavePoll { poll_id: PollId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    NewVote(VoteCast),
    Snapshot(PollView),
    /// Deltas for the poll were dropped. The client should join again for a snapshot.
    Resync { poll_id: PollId },
    Error {
        poll_id: Option<PollId>,
        error: String,
        message: String,
    },
}

#[derive(Clone)]
pub enum Propagation {
    Push(Arc<RoomRegistry>),
    Pull { interval: Duration },
}

impl Propagation {
    pub fn push(queue_capacity: usize) -> Self {
        Propagation::Push(Arc::new(RoomRegistry::new(queue_capacity)))
    }

    pub fn pull(interval: Duration) -> Self {
        Propagation::Pull { interval }
    }

    pub fn strategy(&self) -> Strategy {
        match self {
            Propagation::Push(_) => Strategy::Push,
            Propagation::Pull { .. } => Strategy::Pull,
        }
    }

    pub fn rooms(&self) -> Option<&Arc<RoomRegistry>> {
        match self {
            Propagation::Push(rooms) => Some(rooms),
            Propagation::Pull { .. } => None,
        }
    }

    /// Interval pull clients should poll at. Push clients use it for their periodic resync.
    pub fn interval(&self, fallback: Duration) -> Duration {
        match self {
            Propagation::Push(_) => fallback,
            Propagation::Pull { interval } => *interval,
        }
    }

    /// Notifies viewers of the poll. Pull has nobody to notify.
    pub fn publish(&self, event: &VoteCast) -> Result<Delivery, PropagationError> {
        match self {
            Propagation::Push(rooms) => rooms.publish(event),
            Propagation::Pull { .. } => Ok(Delivery::default()),
        }
    }

    pub fn close(&self) {
        if let Propagation::Push(rooms) = self {
            rooms.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn strategy_parses_case_insensitively() {
        assert_eq!("PUSH".parse::<Strategy>().unwrap(), Strategy::Push);
        assert_eq!("pull".parse::<Strategy>().unwrap(), Strategy::Pull);
        assert!("sse".parse::<Strategy>().is_err());
    }

    #[test]
    fn client_messages_use_camel_case_tags() {
        let join: ClientMessage =
            serde_json::from_value(json!({ "type": "joinPoll", "pollId": 4 })).unwrap();
        assert_eq!(join, ClientMessage::JoinPoll { poll_id: 4 });

        let leave: ClientMessage =
            serde_json::from_value(json!({ "type": "leavePoll", "pollId": 4 })).unwrap();
        assert_eq!(leave, ClientMessage::LeavePoll { poll_id: 4 });
    }

    #[test]
    fn new_vote_is_flat() {
        let message = ServerMessage::NewVote(VoteCast {
            poll_id: 1,
            option_id: 2,
            vote_id: 3,
        });
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({ "type": "newVote", "pollId": 1, "optionId": 2, "voteId": 3 })
        );
    }

    #[test]
    fn resync_notice_names_the_poll() {
        assert_eq!(
            serde_json::to_value(ServerMessage::Resync { poll_id: 7 }).unwrap(),
            json!({ "type": "resync", "pollId": 7 })
        );
    }

    #[test]
    fn pull_publish_is_a_no_op() {
        let propagation = Propagation::pull(Duration::from_secs(2));
        let delivery = propagation
            .publish(&VoteCast {
                poll_id: 1,
                option_id: 1,
                vote_id: 1,
            })
            .unwrap();
        assert_eq!(delivery, Delivery::default());
        assert!(propagation.rooms().is_none());
        assert_eq!(
            propagation.interval(Duration::from_secs(9)),
            Duration::from_secs(2)
        );
    }
}
