use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type PollId = i64;
pub type OptionId = i64;
pub type VoteId = i64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PollOption {
    pub id: OptionId,
    pub poll_id: PollId,
    pub text: String,
    pub position: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Poll {
    pub id: PollId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub options: Vec<PollOption>,
}

impl Poll {
    pub fn option(&self, option_id: OptionId) -> Option<&PollOption> {
        self.options.iter().find(|option| option.id == option_id)
    }
}

/// An admitted vote. The origin address is kept for auditing but never serialized.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub id: VoteId,
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub voter_id: Option<String>,
    #[serde(skip)]
    pub origin: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A vote waiting to be inserted. `origin_key` is only set when origin uniqueness is enforced.
#[derive(Debug, Clone)]
pub struct NewVote {
    pub poll_id: PollId,
    pub option_id: OptionId,
    pub voter_id: Option<String>,
    pub origin: Option<String>,
    pub origin_key: Option<String>,
}

/// One option with its vote count, as read from the vote log.
#[derive(Debug, Clone)]
pub struct OptionCount {
    pub option: PollOption,
    pub votes: i64,
    pub last_vote_id: Option<VoteId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub id: PollId,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub total_votes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionView {
    pub id: OptionId,
    pub text: String,
    pub vote_count: i64,
    pub leading: bool,
}

/// Full poll state with live counts, served by `GET /polls/{id}` and pushed as a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollView {
    pub id: PollId,
    pub title: String,
    pub options: Vec<OptionView>,
    pub total_votes: i64,
    /// Highest vote id counted in this view.
    pub last_vote_id: Option<VoteId>,
}

#[derive(Debug, Deserialize)]
pub struct CreatePollRequest {
    #[serde(alias = "question")]
    pub title: String,
    pub options: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedPoll {
    pub id: PollId,
    pub title: String,
    pub options: Vec<OptionView>,
    pub share_link: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub option_id: OptionId,
    #[serde(default)]
    pub voter_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    pub vote: Vote,
}
