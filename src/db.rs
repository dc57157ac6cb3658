//! Postgres adapter for [`PollStore`]. Queries are runtime-checked so the crate
//! builds without a live database.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{migrate::Migrator, postgres::PgPoolOptions, PgPool};
use tracing::info;

use crate::{
    error::StoreError,
    models::{NewVote, OptionCount, Poll, PollId, PollOption, PollSummary, Vote, VoteId},
    store::{PollStore, LIST_LIMIT},
};

static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

pub async fn create_pool(database_url: &str, max_connections: u32) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;

    MIGRATOR.run(&pool).await?;
    info!("Database migrations applied");

    Ok(pool)
}

pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct PollRow {
    id: PollId,
    title: String,
    created_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct OptionCountRow {
    id: i64,
    poll_id: PollId,
    text: String,
    position: i32,
    vote_count: i64,
    last_vote_id: Option<VoteId>,
}

#[async_trait]
impl PollStore for PgStore {
    async fn create_poll(&self, title: &str, options: &[String]) -> Result<Poll, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, PollRow>(
            "INSERT INTO polls (title) VALUES ($1) RETURNING id, title, created_at",
        )
        .bind(title)
        .fetch_one(&mut *tx)
        .await?;

        let positions: Vec<i32> = (0..options.len() as i32).collect();
        let mut poll_options = sqlx::query_as::<_, PollOption>(
            r#"
            INSERT INTO poll_options (poll_id, text, position)
            SELECT $1, u.text, u.position
            FROM UNNEST($2::text[], $3::int4[]) AS u(text, position)
            RETURNING id, poll_id, text, position
            "#,
        )
        .bind(row.id)
        .bind(options)
        .bind(&positions)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        poll_options.sort_by_key(|option| option.position);

        Ok(Poll {
            id: row.id,
            title: row.title,
            created_at: row.created_at,
            options: poll_options,
        })
    }

    async fn find_poll(&self, poll_id: PollId) -> Result<Option<Poll>, StoreError> {
        let Some(row) = sqlx::query_as::<_, PollRow>(
            "SELECT id, title, created_at FROM polls WHERE id = $1",
        )
        .bind(poll_id)
        .fetch_optional(&self.pool)
        .await?
        else {
            return Ok(None);
        };

        let options = sqlx::query_as::<_, PollOption>(
            "SELECT id, poll_id, text, position FROM poll_options WHERE poll_id = $1 ORDER BY position",
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(Poll {
            id: row.id,
            title: row.title,
            created_at: row.created_at,
            options,
        }))
    }

    async fn list_polls(&self) -> Result<Vec<PollSummary>, StoreError> {
        let summaries = sqlx::query_as::<_, PollSummary>(
            r#"
            SELECT p.id, p.title, p.created_at, COUNT(v.id) AS total_votes
            FROM polls p
            LEFT JOIN votes v ON v.poll_id = p.id
            GROUP BY p.id
            ORDER BY p.created_at DESC, p.id DESC
            LIMIT $1
            "#,
        )
        .bind(LIST_LIMIT)
        .fetch_all(&self.pool)
        .await?;

        Ok(summaries)
    }

    async fn find_existing_vote(
        &self,
        poll_id: PollId,
        voter_id: Option<&str>,
        origin_key: Option<&str>,
    ) -> Result<Option<Vote>, StoreError> {
        // NULL parameters never match, so an absent signal is simply skipped.
        let vote = sqlx::query_as::<_, Vote>(
            r#"
            SELECT id, poll_id, option_id, voter_id, origin, created_at
            FROM votes
            WHERE poll_id = $1 AND (voter_id = $2 OR origin_key = $3)
            LIMIT 1
            "#,
        )
        .bind(poll_id)
        .bind(voter_id)
        .bind(origin_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(vote)
    }

    async fn insert_vote(&self, vote: NewVote) -> Result<Vote, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Ids come from a sequence before commit. Serializing inserts per poll
        // makes them commit in id order, so a snapshot's `lastVoteId` covers
        // every vote of the poll at or below it.
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(vote.poll_id)
            .execute(&mut *tx)
            .await?;

        let stored = sqlx::query_as::<_, Vote>(
            r#"
            INSERT INTO votes (poll_id, option_id, voter_id, origin, origin_key)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, poll_id, option_id, voter_id, origin, created_at
            "#,
        )
        .bind(vote.poll_id)
        .bind(vote.option_id)
        .bind(vote.voter_id)
        .bind(vote.origin)
        .bind(vote.origin_key)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(stored)
    }

    async fn option_counts(&self, poll_id: PollId) -> Result<Vec<OptionCount>, StoreError> {
        let rows = sqlx::query_as::<_, OptionCountRow>(
            r#"
            SELECT o.id, o.poll_id, o.text, o.position,
                   COUNT(v.id) AS vote_count, MAX(v.id) AS last_vote_id
            FROM poll_options o
            LEFT JOIN votes v ON v.option_id = o.id
            WHERE o.poll_id = $1
            GROUP BY o.id
            ORDER BY o.position
            "#,
        )
        .bind(poll_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| OptionCount {
                option: PollOption {
                    id: row.id,
                    poll_id: row.poll_id,
                    text: row.text,
                    position: row.position,
                },
                votes: row.vote_count,
                last_vote_id: row.last_vote_id,
            })
            .collect())
    }
}
