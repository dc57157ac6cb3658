//! Vote admission.
//!
//! Duplicate prevention is best effort. The voter id is an unverified token
//! chosen by the client and the origin address can be shared (NAT) or
//! changed, so neither is a security boundary. The pre-check below only
//! gives a fast answer; the store's unique indexes are what actually keep two
//! racing admissions from both landing, and a unique violation there is
//! reported exactly like a pre-check hit.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::{
    error::{AppError, StoreError},
    models::{NewVote, OptionId, PollId, Vote},
    propagation::{Propagation, VoteCast},
    store::PollStore,
};

/// Whether the origin address counts as a second duplicate signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginPolicy {
    Enforce,
    Ignore,
}

/// Identity signals attached to a vote attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoterIdentity {
    token: Option<String>,
    origin: Option<String>,
}

impl VoterIdentity {
    /// Blank values count as absent.
    pub fn new(token: Option<String>, origin: Option<String>) -> Self {
        Self {
            token: non_blank(token),
            origin: non_blank(origin),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    pub fn origin(&self) -> Option<&str> {
        self.origin.as_deref()
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[derive(Clone)]
pub struct VoteGuard {
    store: Arc<dyn PollStore>,
    propagation: Propagation,
    origin_policy: OriginPolicy,
}

impl VoteGuard {
    pub fn new(
        store: Arc<dyn PollStore>,
        propagation: Propagation,
        origin_policy: OriginPolicy,
    ) -> Self {
        Self {
            store,
            propagation,
            origin_policy,
        }
    }

    /// Admits at most one vote per voter and poll, then notifies the poll's viewers once.
    pub async fn attempt_vote(
        &self,
        poll_id: PollId,
        option_id: OptionId,
        voter: &VoterIdentity,
    ) -> Result<Vote, AppError> {
        let poll = self
            .store
            .find_poll(poll_id)
            .await?
            .ok_or(AppError::NotFound("Poll"))?;

        if poll.option(option_id).is_none() {
            return Err(AppError::InvalidOption { poll_id, option_id });
        }

        let origin_key = match self.origin_policy {
            OriginPolicy::Enforce => voter.origin(),
            OriginPolicy::Ignore => None,
        };

        if voter.token().is_none() && origin_key.is_none() {
            return Err(AppError::InvalidInput(
                "A voterId is required to vote".to_string(),
            ));
        }

        if self
            .store
            .find_existing_vote(poll_id, voter.token(), origin_key)
            .await?
            .is_some()
        {
            debug!(poll_id, "Vote rejected by pre-check");
            return Err(AppError::AlreadyVoted);
        }

        let new_vote = NewVote {
            poll_id,
            option_id,
            voter_id: voter.token().map(str::to_string),
            origin: voter.origin().map(str::to_string),
            origin_key: origin_key.map(str::to_string),
        };

        let vote = match self.store.insert_vote(new_vote).await {
            Ok(vote) => vote,
            Err(StoreError::Duplicate) => {
                debug!(poll_id, "Vote rejected by unique constraint");
                return Err(AppError::AlreadyVoted);
            }
            // The (option, poll) foreign key disagreed with the check above.
            Err(StoreError::MissingReference) => {
                return Err(AppError::InvalidOption { poll_id, option_id });
            }
            Err(e) => return Err(e.into()),
        };

        info!(poll_id, option_id, vote_id = vote.id, "Vote admitted");

        match self.propagation.publish(&VoteCast::from(&vote)) {
            Ok(delivery) => debug!(
                poll_id,
                delivered = delivery.delivered,
                dropped = delivery.dropped,
                "Vote propagated"
            ),
            Err(e) => warn!(poll_id, "Vote admitted but not propagated: {e}"),
        }

        Ok(vote)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        models::Poll,
        poll::get_tally,
        propagation::{RoomRegistry, ServerMessage},
        store::InMemoryStore,
    };

    async fn color_poll(store: &InMemoryStore) -> Poll {
        store
            .create_poll("Best color?", &["Red".into(), "Blue".into()])
            .await
            .unwrap()
    }

    fn voter(token: &str) -> VoterIdentity {
        VoterIdentity::new(Some(token.to_string()), None)
    }

    fn guard(store: Arc<InMemoryStore>, propagation: Propagation) -> VoteGuard {
        VoteGuard::new(store, propagation, OriginPolicy::Enforce)
    }

    #[tokio::test]
    async fn one_vote_per_voter() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;
        let guard = guard(store.clone(), Propagation::pull(Duration::from_secs(2)));
        let (red, blue) = (poll.options[0].id, poll.options[1].id);

        guard.attempt_vote(poll.id, red, &voter("a")).await.unwrap();

        for option in [red, blue] {
            let err = guard.attempt_vote(poll.id, option, &voter("a")).await;
            assert!(matches!(err, Err(AppError::AlreadyVoted)));
        }

        guard.attempt_vote(poll.id, blue, &voter("b")).await.unwrap();

        let tally = get_tally(store.as_ref(), poll.id).await.unwrap();
        assert_eq!(tally.total, 2);
        assert_eq!(tally.per_option[&red], 1);
        assert_eq!(tally.per_option[&blue], 1);
        assert_eq!(tally.leading(), vec![red, blue]);
    }

    #[tokio::test]
    async fn rejects_unknown_poll_and_foreign_option() {
        let store = Arc::new(InMemoryStore::new());
        let first = color_poll(&store).await;
        let second = color_poll(&store).await;
        let guard = guard(store, Propagation::pull(Duration::from_secs(2)));

        let missing = guard.attempt_vote(999, 1, &voter("a")).await;
        assert!(matches!(missing, Err(AppError::NotFound(_))));

        let foreign = guard
            .attempt_vote(first.id, second.options[0].id, &voter("a"))
            .await;
        assert!(matches!(foreign, Err(AppError::InvalidOption { .. })));
    }

    #[tokio::test]
    async fn requires_some_identity() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;
        let guard = VoteGuard::new(
            store,
            Propagation::pull(Duration::from_secs(2)),
            OriginPolicy::Ignore,
        );

        let anonymous = VoterIdentity::new(Some("   ".into()), Some("10.0.0.1".into()));
        let err = guard
            .attempt_vote(poll.id, poll.options[0].id, &anonymous)
            .await;
        assert!(matches!(err, Err(AppError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn origin_policy_controls_shared_addresses() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;
        let red = poll.options[0].id;
        let pull = Propagation::pull(Duration::from_secs(2));

        let strict = VoteGuard::new(store.clone(), pull.clone(), OriginPolicy::Enforce);
        let lenient = VoteGuard::new(store.clone(), pull, OriginPolicy::Ignore);

        let a = VoterIdentity::new(Some("a".into()), Some("10.0.0.1".into()));
        let b = VoterIdentity::new(Some("b".into()), Some("10.0.0.1".into()));
        let c = VoterIdentity::new(Some("c".into()), Some("10.0.0.1".into()));

        strict.attempt_vote(poll.id, red, &a).await.unwrap();
        assert!(matches!(
            strict.attempt_vote(poll.id, red, &b).await,
            Err(AppError::AlreadyVoted)
        ));
        lenient.attempt_vote(poll.id, red, &c).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_attempts_admit_exactly_one() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;
        let guard = guard(store.clone(), Propagation::push(16));

        const K: usize = 12;
        let attempts: Vec<_> = (0..K)
            .map(|i| {
                let guard = guard.clone();
                let option = poll.options[i % 2].id;
                let poll_id = poll.id;
                tokio::spawn(async move {
                    guard.attempt_vote(poll_id, option, &voter("racer")).await
                })
            })
            .collect();

        let (mut admitted, mut rejected) = (0, 0);
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(AppError::AlreadyVoted) => rejected += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(admitted, 1);
        assert_eq!(rejected, K - 1);
        assert_eq!(get_tally(store.as_ref(), poll.id).await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn admission_notifies_room_once() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;
        let rooms = Arc::new(RoomRegistry::new(8));
        let guard = guard(store, Propagation::Push(rooms.clone()));

        let (session, mut rx) = rooms.connect().unwrap();
        rooms.join(session, poll.id).unwrap();

        let vote = guard
            .attempt_vote(poll.id, poll.options[1].id, &voter("a"))
            .await
            .unwrap();
        let _ = guard
            .attempt_vote(poll.id, poll.options[0].id, &voter("a"))
            .await;

        assert_eq!(
            rx.recv().await.unwrap(),
            ServerMessage::NewVote(VoteCast::from(&vote))
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_channel_does_not_fail_admission() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;
        let propagation = Propagation::push(8);
        propagation.close();
        let guard = guard(store.clone(), propagation);

        guard
            .attempt_vote(poll.id, poll.options[0].id, &voter("a"))
            .await
            .unwrap();
        assert_eq!(get_tally(store.as_ref(), poll.id).await.unwrap().total, 1);
    }
}
