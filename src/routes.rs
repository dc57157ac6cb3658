use std::{sync::Arc, time::Duration};

use axum::{
    routing::{get, post},
    Router,
};
use http::{header::CONTENT_TYPE, Method};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::{handlers, propagation::socket::ws_handler, state::AppState};

pub fn create_routes(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE])
        .max_age(Duration::from_secs(60 * 60));

    Router::new()
        .route("/polls", get(handlers::list_polls).post(handlers::create_poll))
        .route("/polls/{id}", get(handlers::get_poll))
        .route("/polls/{id}/vote", post(handlers::vote))
        .route("/propagation", get(handlers::propagation_info))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
