use std::collections::BTreeMap;

use crate::{
    error::AppError,
    models::{OptionCount, OptionId, OptionView, PollId, PollView, VoteId},
    store::PollStore,
};

/// Vote counts derived from the vote log. Never stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tally {
    pub poll_id: PollId,
    pub per_option: BTreeMap<OptionId, i64>,
    pub total: i64,
    pub last_vote_id: Option<VoteId>,
}

impl Tally {
    fn from_counts(poll_id: PollId, counts: &[OptionCount]) -> Self {
        Self {
            poll_id,
            per_option: counts.iter().map(|c| (c.option.id, c.votes)).collect(),
            total: counts.iter().map(|c| c.votes).sum(),
            last_vote_id: counts.iter().filter_map(|c| c.last_vote_id).max(),
        }
    }

    pub fn leading(&self) -> Vec<OptionId> {
        leading_options(self.per_option.iter().map(|(id, count)| (*id, *count)))
    }
}

/// Options holding the maximum count. Ties are all leading; nothing leads before the first vote.
pub fn leading_options<I>(counts: I) -> Vec<OptionId>
where
    I: IntoIterator<Item = (OptionId, i64)> + Clone,
{
    let max = counts.clone().into_iter().map(|(_, count)| count).max();

    match max {
        Some(max) if max > 0 => counts
            .into_iter()
            .filter(|(_, count)| *count == max)
            .map(|(id, _)| id)
            .collect(),
        _ => Vec::new(),
    }
}

pub async fn get_tally(store: &dyn PollStore, poll_id: PollId) -> Result<Tally, AppError> {
    let counts = store.option_counts(poll_id).await?;

    // A poll always has options, so no rows means no poll.
    if counts.is_empty() {
        return Err(AppError::NotFound("Poll"));
    }

    Ok(Tally::from_counts(poll_id, &counts))
}

/// Full poll state with counts and leading flags, read in one pass over the vote log.
pub async fn poll_view(store: &dyn PollStore, poll_id: PollId) -> Result<PollView, AppError> {
    let poll = store
        .find_poll(poll_id)
        .await?
        .ok_or(AppError::NotFound("Poll"))?;

    let counts = store.option_counts(poll_id).await?;
    let tally = Tally::from_counts(poll_id, &counts);
    let leading = tally.leading();

    let options = counts
        .into_iter()
        .map(|count| OptionView {
            leading: leading.contains(&count.option.id),
            id: count.option.id,
            text: count.option.text,
            vote_count: count.votes,
        })
        .collect();

    Ok(PollView {
        id: poll.id,
        title: poll.title,
        options,
        total_votes: tally.total,
        last_vote_id: tally.last_vote_id,
    })
}
