use std::sync::Arc;

use tracing::{info, warn};

use super::{
    admission::{OriginPolicy, VoteGuard},
    config::Config,
    db::{create_pool, PgStore},
    error::StoreError,
    propagation::{Propagation, Strategy},
    store::{InMemoryStore, PollStore},
};

pub struct AppState {
    pub config: Config,
    pub store: Arc<dyn PollStore>,
    pub propagation: Propagation,
    pub guard: VoteGuard,
}

impl AppState {
    pub async fn new(config: Config) -> Result<Arc<Self>, StoreError> {
        let store: Arc<dyn PollStore> = match &config.database_url {
            Some(url) => {
                info!("Connecting to Postgres...");
                Arc::new(PgStore::new(create_pool(url, config.db_max_connections).await?))
            }
            None => {
                warn!("Using in-memory store");
                Arc::new(InMemoryStore::new())
            }
        };

        Ok(Self::with_store(config, store))
    }

    pub fn with_store(config: Config, store: Arc<dyn PollStore>) -> Arc<Self> {
        let propagation = match config.propagation {
            Strategy::Push => Propagation::push(config.session_queue),
            Strategy::Pull => Propagation::pull(config.poll_interval),
        };
        info!("Live propagation: {}", propagation.strategy());

        let origin_policy = if config.origin_check {
            OriginPolicy::Enforce
        } else {
            OriginPolicy::Ignore
        };

        let guard = VoteGuard::new(store.clone(), propagation.clone(), origin_policy);

        Arc::new(Self {
            config,
            store,
            propagation,
            guard,
        })
    }
}
