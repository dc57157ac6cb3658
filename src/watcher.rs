//! Pull-strategy client loop.
//!
//! A `PollWatcher` re-reads a poll on a fixed interval and publishes the view
//! whenever it changes by value. The first read happens immediately so a new
//! viewer never renders a stale tally. Dropping the watcher stops the loop.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::{debug, warn};

use crate::{
    models::{PollId, PollView},
    session::PollSession,
};

#[derive(Error, Debug)]
pub enum WatchError {
    #[error("Request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server answered {0}")]
    Status(reqwest::StatusCode),
}

/// Where a watcher reads full poll state from.
#[async_trait]
pub trait PollSource: Send + Sync + 'static {
    async fn fetch(&self, poll_id: PollId) -> Result<PollView, WatchError>;
}

/// Reads `GET {base_url}/polls/{id}`.
pub struct HttpPollSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPollSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl PollSource for HttpPollSource {
    async fn fetch(&self, poll_id: PollId) -> Result<PollView, WatchError> {
        let url = format!("{}/polls/{poll_id}", self.base_url);
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            return Err(WatchError::Status(response.status()));
        }

        Ok(response.json().await?)
    }
}

pub struct PollWatcher {
    receiver: watch::Receiver<Option<PollView>>,
    task: JoinHandle<()>,
}

impl PollWatcher {
    pub fn spawn<S: PollSource>(source: Arc<S>, poll_id: PollId, interval: Duration) -> Self {
        let (sender, receiver) = watch::channel(None);

        let task = tokio::spawn(async move {
            let mut session = PollSession::new(poll_id);
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match source.fetch(poll_id).await {
                    Ok(view) => {
                        if session.apply_snapshot(view.clone()) {
                            debug!(poll_id, total = view.total_votes, "Poll changed");
                            sender.send_replace(Some(view));
                        }
                    }
                    // Keep the last good view and try again next tick.
                    Err(e) => warn!(poll_id, "Poll refresh failed: {e}"),
                }
            }
        });

        Self { receiver, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<PollView>> {
        self.receiver.clone()
    }

    pub fn latest(&self) -> Option<PollView> {
        self.receiver.borrow().clone()
    }

    pub fn stop(self) {
        drop(self);
    }
}

impl Drop for PollWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

    use super::*;
    use crate::models::OptionView;

    /// Serves a poll whose single option gains a vote whenever `votes` is bumped.
    #[derive(Default)]
    struct FakeSource {
        votes: AtomicI64,
        fetches: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl PollSource for FakeSource {
        async fn fetch(&self, poll_id: PollId) -> Result<PollView, WatchError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(WatchError::Status(reqwest::StatusCode::SERVICE_UNAVAILABLE));
            }

            let votes = self.votes.load(Ordering::SeqCst);
            Ok(PollView {
                id: poll_id,
                title: "Q".into(),
                options: vec![OptionView {
                    id: 1,
                    text: "A".into(),
                    vote_count: votes,
                    leading: votes > 0,
                }],
                total_votes: votes,
                last_vote_id: (votes > 0).then_some(votes),
            })
        }
    }

    #[tokio::test]
    async fn first_read_is_immediate_and_changes_propagate() {
        let source = Arc::new(FakeSource::default());
        let watcher = PollWatcher::spawn(source.clone(), 5, Duration::from_millis(10));
        let mut updates = watcher.subscribe();

        time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watcher.latest().unwrap().total_votes, 0);

        source.votes.store(1, Ordering::SeqCst);
        time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watcher.latest().unwrap().total_votes, 1);
    }

    #[tokio::test]
    async fn failures_keep_the_last_view() {
        let source = Arc::new(FakeSource::default());
        source.votes.store(3, Ordering::SeqCst);
        let watcher = PollWatcher::spawn(source.clone(), 5, Duration::from_millis(10));
        let mut updates = watcher.subscribe();
        time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();

        source.fail.store(true, Ordering::SeqCst);
        let before = source.fetches.load(Ordering::SeqCst);
        while source.fetches.load(Ordering::SeqCst) < before + 3 {
            time::sleep(Duration::from_millis(5)).await;
        }

        assert_eq!(watcher.latest().unwrap().total_votes, 3);
    }

    #[tokio::test]
    async fn dropping_the_watcher_stops_polling() {
        let source = Arc::new(FakeSource::default());
        let watcher = PollWatcher::spawn(source.clone(), 5, Duration::from_millis(10));
        let mut updates = watcher.subscribe();
        time::timeout(Duration::from_secs(2), updates.changed())
            .await
            .unwrap()
            .unwrap();

        watcher.stop();
        time::sleep(Duration::from_millis(30)).await;
        let after_stop = source.fetches.load(Ordering::SeqCst);
        time::sleep(Duration::from_millis(50)).await;

        assert_eq!(source.fetches.load(Ordering::SeqCst), after_stop);
    }
}
