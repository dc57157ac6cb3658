//! Durable store port and the in-memory adapter.
//!
//! The store owns polls, options and the append-only vote log. It is also the
//! only mutual-exclusion point for admissions: `insert_vote` must reject a
//! second vote for the same `(poll, voter_id)` or `(poll, origin_key)` with
//! [`StoreError::Duplicate`], no matter how many inserts race.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    error::StoreError,
    models::{NewVote, OptionCount, Poll, PollId, PollOption, PollSummary, Vote, VoteId},
};

/// How many polls `list_polls` returns.
pub const LIST_LIMIT: i64 = 100;

#[async_trait]
pub trait PollStore: Send + Sync {
    /// Creates a poll and its options atomically. Options keep the given order.
    async fn create_poll(&self, title: &str, options: &[String]) -> Result<Poll, StoreError>;

    async fn find_poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError>;

    /// Newest first, at most [`LIST_LIMIT`] entries.
    async fn list_polls(&self) -> Result<Vec<PollSummary>, StoreError>;

    /// Any vote in the poll cast by `voter_id` or from `origin_key`.
    async fn find_existing_vote(
        &self,
        poll_id: PollId,
        voter_id: Option<&str>,
        origin_key: Option<&str>,
    ) -> Result<Option<Vote>, StoreError>;

    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, StoreError>;

    /// Every option of the poll in display order, with its vote count.
    async fn option_counts(&self, poll_id: PollId) -> Result<Vec<OptionCount>, StoreError>;
}

#[derive(Default)]
struct Tables {
    polls: BTreeMap<PollId, Poll>,
    votes: Vec<Vote>,
    /// Unique keys mapped to the vote that claimed them.
    voter_keys: HashMap<(PollId, String), VoteId>,
    origin_keys: HashMap<(PollId, String), VoteId>,
    next_poll_id: i64,
    next_option_id: i64,
    next_vote_id: i64,
}

/// Process-local store used when no database is configured, and in tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PollStore for InMemoryStore {
    async fn create_poll(&self, title: &str, options: &[String]) -> Result<Poll, StoreError> {
        let mut tables = self.tables.write().await;

        tables.next_poll_id += 1;
        let poll_id = tables.next_poll_id;

        let mut poll_options = Vec::with_capacity(options.len());
        for (position, text) in options.iter().enumerate() {
            tables.next_option_id += 1;
            poll_options.push(PollOption {
                id: tables.next_option_id,
                poll_id,
                text: text.clone(),
                position: position as i32,
            });
        }

        let poll = Poll {
            id: poll_id,
            title: title.to_string(),
            created_at: Utc::now(),
            options: poll_options,
        };
        tables.polls.insert(poll_id, poll.clone());

        Ok(poll)
    }

    async fn find_poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError> {
        Ok(self.tables.read().await.polls.get(&poll_id).cloned())
    }

    async fn list_polls(&self) -> Result<Vec<PollSummary>, StoreError> {
        let tables = self.tables.read().await;

        let summaries = tables
            .polls
            .values()
            .rev()
            .take(LIST_LIMIT as usize)
            .map(|poll| PollSummary {
                id: poll.id,
                title: poll.title.clone(),
                created_at: poll.created_at,
                total_votes: tables.votes.iter().filter(|v| v.poll_id == poll.id).count() as i64,
            })
            .collect();

        Ok(summaries)
    }

    async fn find_existing_vote(
        &self,
        poll_id: PollId,
        voter_id: Option<&str>,
        origin_key: Option<&str>,
    ) -> Result<Option<Vote>, StoreError> {
        let tables = self.tables.read().await;

        let claimed = voter_id
            .and_then(|id| tables.voter_keys.get(&(poll_id, id.to_string())))
            .or_else(|| {
                origin_key.and_then(|key| tables.origin_keys.get(&(poll_id, key.to_string())))
            });

        let found = claimed.and_then(|vote_id| tables.votes.iter().find(|v| v.id == *vote_id));

        Ok(found.cloned())
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, StoreError> {
        let mut tables = self.tables.write().await;

        let option_matches = tables
            .polls
            .get(&vote.poll_id)
            .and_then(|poll| poll.option(vote.option_id))
            .is_some();
        if !option_matches {
            return Err(StoreError::MissingReference);
        }

        let voter_key = vote.voter_id.clone().map(|id| (vote.poll_id, id));
        let origin_key = vote.origin_key.clone().map(|key| (vote.poll_id, key));

        if voter_key.as_ref().is_some_and(|k| tables.voter_keys.contains_key(k))
            || origin_key.as_ref().is_some_and(|k| tables.origin_keys.contains_key(k))
        {
            return Err(StoreError::Duplicate);
        }

        tables.next_vote_id += 1;
        let vote_id = tables.next_vote_id;

        if let Some(key) = voter_key {
            tables.voter_keys.insert(key, vote_id);
        }
        if let Some(key) = origin_key {
            tables.origin_keys.insert(key, vote_id);
        }

        let stored = Vote {
            id: vote_id,
            poll_id: vote.poll_id,
            option_id: vote.option_id,
            voter_id: vote.voter_id,
            origin: vote.origin,
            created_at: Utc::now(),
        };
        tables.votes.push(stored.clone());

        Ok(stored)
    }

    async fn option_counts(&self, poll_id: PollId) -> Result<Vec<OptionCount>, StoreError> {
        let tables = self.tables.read().await;

        let Some(poll) = tables.polls.get(&poll_id) else {
            return Ok(Vec::new());
        };

        let counts = poll
            .options
            .iter()
            .map(|option| {
                let votes = tables.votes.iter().filter(|v| v.option_id == option.id);
                OptionCount {
                    option: option.clone(),
                    votes: votes.clone().count() as i64,
                    last_vote_id: votes.map(|v| v.id).max(),
                }
            })
            .collect();

        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn new_vote(poll: &Poll, option: usize, voter: Option<&str>, origin: Option<&str>) -> NewVote {
        NewVote {
            poll_id: poll.id,
            option_id: poll.options[option].id,
            voter_id: voter.map(str::to_string),
            origin: origin.map(str::to_string),
            origin_key: origin.map(str::to_string),
        }
    }

    async fn color_poll(store: &InMemoryStore) -> Poll {
        store
            .create_poll("Best color?", &["Red".to_string(), "Blue".to_string()])
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_keeps_option_order() {
        let store = InMemoryStore::new();
        let poll = color_poll(&store).await;

        let found = store.find_poll(poll.id).await.unwrap().unwrap();
        let texts: Vec<_> = found.options.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, ["Red", "Blue"]);
        assert_eq!(found.options[1].position, 1);
        assert!(store.find_poll(poll.id + 1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn insert_rejects_same_voter_twice() {
        let store = InMemoryStore::new();
        let poll = color_poll(&store).await;

        store
            .insert_vote(new_vote(&poll, 0, Some("a"), None))
            .await
            .unwrap();
        let err = store
            .insert_vote(new_vote(&poll, 1, Some("a"), None))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));
    }

    #[tokio::test]
    async fn insert_rejects_same_origin_key() {
        let store = InMemoryStore::new();
        let poll = color_poll(&store).await;

        store
            .insert_vote(new_vote(&poll, 0, Some("a"), Some("10.0.0.1")))
            .await
            .unwrap();
        let err = store
            .insert_vote(new_vote(&poll, 0, Some("b"), Some("10.0.0.1")))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate));
    }

    #[tokio::test]
    async fn insert_rejects_foreign_option() {
        let store = InMemoryStore::new();
        let first = color_poll(&store).await;
        let second = color_poll(&store).await;

        let mut vote = new_vote(&first, 0, Some("a"), None);
        vote.option_id = second.options[0].id;
        let err = store.insert_vote(vote).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingReference));
    }

    #[tokio::test]
    async fn find_existing_matches_voter_or_origin() {
        let store = InMemoryStore::new();
        let poll = color_poll(&store).await;
        store
            .insert_vote(new_vote(&poll, 0, Some("a"), Some("10.0.0.1")))
            .await
            .unwrap();

        let by_voter = store.find_existing_vote(poll.id, Some("a"), None).await;
        let by_origin = store
            .find_existing_vote(poll.id, Some("z"), Some("10.0.0.1"))
            .await;
        let neither = store
            .find_existing_vote(poll.id, Some("z"), Some("10.0.0.2"))
            .await;
        let nothing = store.find_existing_vote(poll.id, None, None).await;

        assert!(by_voter.unwrap().is_some());
        assert!(by_origin.unwrap().is_some());
        assert!(neither.unwrap().is_none());
        assert!(nothing.unwrap().is_none());
    }

    #[tokio::test]
    async fn unkeyed_origin_does_not_block_later_checks() {
        let store = InMemoryStore::new();
        let poll = color_poll(&store).await;
        // Admitted while origin checks were off: address recorded, no key claimed.
        let mut lenient = new_vote(&poll, 0, Some("a"), Some("10.0.0.1"));
        lenient.origin_key = None;
        store.insert_vote(lenient).await.unwrap();

        let found = store
            .find_existing_vote(poll.id, Some("b"), Some("10.0.0.1"))
            .await
            .unwrap();
        assert!(found.is_none());

        store
            .insert_vote(new_vote(&poll, 1, Some("b"), Some("10.0.0.1")))
            .await
            .unwrap();
        let found = store
            .find_existing_vote(poll.id, Some("c"), Some("10.0.0.1"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().voter_id.as_deref(), Some("b"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn racing_inserts_admit_one() {
        let store = Arc::new(InMemoryStore::new());
        let poll = color_poll(&store).await;

        let attempts: Vec<_> = (0..16)
            .map(|i| {
                let store = store.clone();
                let vote = new_vote(&poll, i % 2, Some("same-voter"), None);
                tokio::spawn(async move { store.insert_vote(vote).await })
            })
            .collect();

        let mut admitted = 0;
        for attempt in attempts {
            match attempt.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(StoreError::Duplicate) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn counts_follow_display_order() {
        let store = InMemoryStore::new();
        let poll = color_poll(&store).await;
        store
            .insert_vote(new_vote(&poll, 1, Some("a"), None))
            .await
            .unwrap();
        let last = store
            .insert_vote(new_vote(&poll, 1, Some("b"), None))
            .await
            .unwrap();

        let counts = store.option_counts(poll.id).await.unwrap();
        assert_eq!(counts.len(), 2);
        assert_eq!(counts[0].votes, 0);
        assert_eq!(counts[0].last_vote_id, None);
        assert_eq!(counts[1].votes, 2);
        assert_eq!(counts[1].last_vote_id, Some(last.id));

        let listed = store.list_polls().await.unwrap();
        assert_eq!(listed[0].total_votes, 2);
    }
}
