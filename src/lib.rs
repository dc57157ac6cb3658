//! Live poll voting.
//!
//! Users create a poll, share its link, and everyone viewing it watches the
//! tally move as votes come in.
//!
//! # Voting
//!
//! Each voter gets one vote per poll. The voter is identified by an opaque
//! `voterId` the client keeps in local storage and, unless `ORIGIN_CHECK` is
//! off, by the request's origin address. Both are weak signals: clearing
//! local storage and switching networks gets a second vote. The unique
//! indexes on `votes` are the enforcement point, so concurrent attempts for
//! one voter still land exactly once.
//!
//! # Live counts
//!
//! Counts are never stored; every read aggregates the vote log. Viewers stay
//! current in one of two ways, chosen with `PROPAGATION`:
//!
//! - `push`: join a room over `/ws` and receive a `newVote` delta per
//!   admission, plus a full `snapshot` on every join.
//! - `pull`: re-read `GET /polls/{id}` every `POLL_INTERVAL_MS`.
//!
//! [`session::PollSession`] and [`watcher::PollWatcher`] are the client
//! halves of those two loops.
//!
//! # Setup
//!
//! Run against Postgres (migrations run on startup).
//! ```sh
//! DATABASE_URL=postgres://localhost/polls cargo run
//! ```
//!
//! Run with the in-memory store.
//! ```sh
//! RUST_LOG=info cargo run
//! ```
use std::{net::SocketAddr, sync::Arc, time::Duration};

use axum_server::Handle;
#[cfg(unix)]
use tokio::signal::unix::{signal, SignalKind};
use tokio::signal::ctrl_c;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

pub mod admission;
pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod poll;
pub mod propagation;
pub mod routes;
pub mod session;
pub mod state;
pub mod store;
pub mod watcher;

use config::Config;
use error::StartupError;
use state::AppState;

pub async fn start_server() -> Result<(), StartupError> {
    dotenvy::dotenv().ok();

    fmt().with_env_filter(EnvFilter::from_default_env()).init();

    info!("Loading config...");
    let config = Config::load()?;

    info!("Initializing state...");
    let state = AppState::new(config).await?;

    info!("Starting server...");
    let app = routes::create_routes(state.clone());

    let address = SocketAddr::from(([0, 0, 0, 0], state.config.port));
    info!("Binding to {address}");

    let handle = Handle::new();
    tokio::spawn(shutdown_signal(handle.clone(), state.clone()));

    axum_server::bind(address)
        .handle(handle)
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await?;

    info!("Server shut down");
    Ok(())
}

async fn shutdown_signal(handle: Handle, state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }

        info!("Received Ctrl+C, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {e}");
                std::future::pending::<()>().await;
            }
        }

        info!("Received terminate signal, shutting down");
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    // Ends every socket loop so open viewers do not hold up the drain.
    state.propagation.close();
    handle.graceful_shutdown(Some(Duration::from_secs(10)));
}
