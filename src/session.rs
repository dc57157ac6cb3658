//! Client-side view of one poll.
//!
//! A `PollSession` keeps the latest known state and folds in whatever the
//! active propagation strategy delivers: snapshots from `GET /polls/{id}` or
//! a socket join, and `newVote` deltas between them. Code that renders the
//! session does not care which strategy fed it.
//!
//! Push clients also resync on their own: [`PollSession::resync_message`]
//! asks for a fresh snapshot whenever the session is behind or the resync
//! interval has passed, so a missed delta never sticks.

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use crate::{
    models::{OptionId, PollId, PollView, VoteId},
    poll::leading_options,
    propagation::{ClientMessage, ServerMessage, VoteCast},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No snapshot yet.
    Connecting,
    /// Snapshot applied; deltas are folded in.
    Live,
    /// Connection dropped, deltas were lost or one could not be applied.
    /// Deltas are ignored until the next snapshot.
    Stale,
    Closed,
}

#[derive(Debug, Clone)]
pub struct PollSession {
    poll_id: PollId,
    status: SessionStatus,
    view: Option<PollView>,
    /// Highest vote id covered by the last snapshot.
    baseline: Option<VoteId>,
    /// Deltas applied on top of the last snapshot.
    applied: HashSet<VoteId>,
    synced_at: Option<Instant>,
}

impl PollSession {
    pub fn new(poll_id: PollId) -> Self {
        Self {
            poll_id,
            status: SessionStatus::Connecting,
            view: None,
            baseline: None,
            applied: HashSet::new(),
            synced_at: None,
        }
    }

    pub fn poll_id(&self) -> PollId {
        self.poll_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn view(&self) -> Option<&PollView> {
        self.view.as_ref()
    }

    /// True until a fresh snapshot has been applied since the last disconnect.
    pub fn needs_resync(&self) -> bool {
        matches!(self.status, SessionStatus::Connecting | SessionStatus::Stale)
    }

    pub fn join_message(&self) -> ClientMessage {
        ClientMessage::JoinPoll {
            poll_id: self.poll_id,
        }
    }

    /// Whether a fresh snapshot should be requested at `now`.
    pub fn resync_due(&self, now: Instant, interval: Duration) -> bool {
        match self.status {
            SessionStatus::Connecting | SessionStatus::Stale => true,
            SessionStatus::Closed => false,
            SessionStatus::Live => self
                .synced_at
                .map_or(true, |at| now.saturating_duration_since(at) >= interval),
        }
    }

    /// The `joinPoll` to send when a resync is due. Joining a room again is
    /// idempotent on the server and answers with a snapshot.
    pub fn resync_message(&self, now: Instant, interval: Duration) -> Option<ClientMessage> {
        self.resync_due(now, interval).then(|| self.join_message())
    }

    /// Closes the session and returns the message releasing its room.
    pub fn close(&mut self) -> ClientMessage {
        self.status = SessionStatus::Closed;
        ClientMessage::LeavePoll {
            poll_id: self.poll_id,
        }
    }

    pub fn disconnected(&mut self) {
        if self.status == SessionStatus::Live {
            self.status = SessionStatus::Stale;
        }
    }

    /// Applies a socket message. Returns whether the rendered state changed.
    pub fn apply(&mut self, message: ServerMessage) -> bool {
        match message {
            ServerMessage::Snapshot(view) => self.apply_snapshot(view),
            ServerMessage::NewVote(event) => self.apply_delta(&event),
            ServerMessage::Resync { poll_id } => {
                if poll_id == self.poll_id && self.status == SessionStatus::Live {
                    self.status = SessionStatus::Stale;
                }
                false
            }
            ServerMessage::Error { .. } => false,
        }
    }

    /// Replaces the state wholesale. Returns whether anything changed by value,
    /// which is all a pull loop has to go on.
    pub fn apply_snapshot(&mut self, view: PollView) -> bool {
        if view.id != self.poll_id || self.status == SessionStatus::Closed {
            return false;
        }

        self.status = SessionStatus::Live;
        self.baseline = view.last_vote_id;
        self.applied.clear();
        self.synced_at = Some(Instant::now());

        if self.view.as_ref() == Some(&view) {
            return false;
        }

        self.view = Some(view);
        true
    }

    /// Folds one `newVote` delta in. Deltas may arrive in any order.
    pub fn apply_delta(&mut self, event: &VoteCast) -> bool {
        if event.poll_id != self.poll_id || self.status != SessionStatus::Live {
            return false;
        }

        if self.baseline.is_some_and(|baseline| event.vote_id <= baseline)
            || self.applied.contains(&event.vote_id)
        {
            return false;
        }

        let Some(view) = self.view.as_mut() else {
            return false;
        };

        let Some(option) = view.options.iter_mut().find(|o| o.id == event.option_id) else {
            self.status = SessionStatus::Stale;
            return false;
        };

        option.vote_count += 1;
        view.total_votes += 1;
        view.last_vote_id = view.last_vote_id.max(Some(event.vote_id));
        self.applied.insert(event.vote_id);

        let leading = leading_options(
            view.options
                .iter()
                .map(|o| (o.id, o.vote_count))
                .collect::<Vec<_>>(),
        );
        for option in &mut view.options {
            option.leading = leading.contains(&option.id);
        }

        true
    }

    pub fn total_votes(&self) -> i64 {
        self.view.as_ref().map_or(0, |view| view.total_votes)
    }

    pub fn leading(&self) -> Vec<OptionId> {
        self.view.as_ref().map_or_else(Vec::new, |view| {
            view.options
                .iter()
                .filter(|o| o.leading)
                .map(|o| o.id)
                .collect()
        })
    }

    /// Share of the vote in percent, 0 before the first vote.
    pub fn percentage(&self, option_id: OptionId) -> f64 {
        let Some(view) = &self.view else {
            return 0.0;
        };
        if view.total_votes == 0 {
            return 0.0;
        }

        view.options
            .iter()
            .find(|o| o.id == option_id)
            .map_or(0.0, |o| o.vote_count as f64 * 100.0 / view.total_votes as f64)
    }
}
