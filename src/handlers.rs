use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        rejection::{JsonRejection, PathRejection},
        ConnectInfo, Path, State,
    },
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use tracing::info;

use crate::{
    admission::VoterIdentity,
    error::AppError,
    models::{
        CreatePollRequest, CreatedPoll, OptionView, PollId, PollSummary, PollView, VoteRequest,
        VoteResponse,
    },
    poll::poll_view,
    propagation::Strategy,
    state::AppState,
};

pub const MAX_OPTIONS: usize = 64;
pub const MAX_TEXT_LEN: usize = 500;

/// Create a poll from a title and at least two non-empty options
pub async fn create_poll(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<CreatePollRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatedPoll>), AppError> {
    let Json(request) = payload.map_err(|e| AppError::InvalidInput(e.body_text()))?;
    let (title, options) = validate_poll(request)?;

    let poll = state.store.create_poll(&title, &options).await?;
    info!(poll_id = poll.id, options = poll.options.len(), "Poll created");

    let created = CreatedPoll {
        id: poll.id,
        share_link: state.config.share_link(poll.id),
        title: poll.title,
        options: poll
            .options
            .into_iter()
            .map(|option| OptionView {
                id: option.id,
                text: option.text,
                vote_count: 0,
                leading: false,
            })
            .collect(),
    };

    Ok((StatusCode::CREATED, Json(created)))
}

fn validate_poll(request: CreatePollRequest) -> Result<(String, Vec<String>), AppError> {
    let title = request.title.trim().to_string();
    if title.is_empty() {
        return Err(AppError::InvalidInput("A poll title is required".into()));
    }

    let options: Vec<String> = request
        .options
        .iter()
        .map(|option| option.trim().to_string())
        .filter(|option| !option.is_empty())
        .collect();

    if options.len() < 2 {
        return Err(AppError::InvalidInput(
            "At least 2 non-empty options are required".into(),
        ));
    }
    if options.len() > MAX_OPTIONS {
        return Err(AppError::InvalidInput(format!(
            "At most {MAX_OPTIONS} options are allowed"
        )));
    }
    if title.len() > MAX_TEXT_LEN || options.iter().any(|o| o.len() > MAX_TEXT_LEN) {
        return Err(AppError::InvalidInput(format!(
            "Title and options are limited to {MAX_TEXT_LEN} bytes"
        )));
    }

    Ok((title, options))
}

/// List the newest polls with their vote totals
pub async fn list_polls(
    State(state): State<Arc<AppState>>,
) -> Result<Json<Vec<PollSummary>>, AppError> {
    Ok(Json(state.store.list_polls().await?))
}

/// Get a poll with live counts
pub async fn get_poll(
    State(state): State<Arc<AppState>>,
    poll_id: Result<Path<PollId>, PathRejection>,
) -> Result<Json<PollView>, AppError> {
    let Path(poll_id) = poll_id.map_err(|_| AppError::NotFound("Poll"))?;

    Ok(Json(poll_view(state.store.as_ref(), poll_id).await?))
}

/// Vote for an option
pub async fn vote(
    State(state): State<Arc<AppState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    poll_id: Result<Path<PollId>, PathRejection>,
    payload: Result<Json<VoteRequest>, JsonRejection>,
) -> Result<Json<VoteResponse>, AppError> {
    let Path(poll_id) = poll_id.map_err(|_| AppError::NotFound("Poll"))?;
    let Json(request) = payload.map_err(|e| AppError::InvalidInput(e.body_text()))?;

    let origin = origin_address(&headers, peer, state.config.trust_forwarded_for);
    let voter = VoterIdentity::new(request.voter_id, Some(origin));

    let vote = state
        .guard
        .attempt_vote(poll_id, request.option_id, &voter)
        .await?;

    Ok(Json(VoteResponse { vote }))
}

/// The peer address, or the first `X-Forwarded-For` hop when running behind a trusted proxy.
pub fn origin_address(headers: &HeaderMap, peer: SocketAddr, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        if let Some(forwarded) = forwarded {
            return forwarded.to_string();
        }
    }

    peer.ip().to_string()
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PropagationInfo {
    pub strategy: Strategy,
    pub interval_ms: u64,
}

/// How clients should follow live counts
pub async fn propagation_info(State(state): State<Arc<AppState>>) -> Json<PropagationInfo> {
    let interval = state.propagation.interval(state.config.poll_interval);

    Json(PropagationInfo {
        strategy: state.propagation.strategy(),
        interval_ms: interval.as_millis() as u64,
    })
}
