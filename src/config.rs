use std::{env, fmt::Display, str::FromStr, time::Duration};

use tracing::{info, warn};

use crate::{error::ConfigError, propagation::Strategy};

pub struct Config {
    pub port: u16,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub propagation: Strategy,
    pub poll_interval: Duration,
    pub session_queue: usize,
    pub origin_check: bool,
    pub trust_forwarded_for: bool,
    pub app_url: String,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the process env.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty());
        if database_url.is_none() {
            warn!("DATABASE_URL not set, votes will only live in memory");
        }

        let poll_interval_ms: u64 = try_load(&lookup, "POLL_INTERVAL_MS", "2000")?;
        if poll_interval_ms == 0 {
            return Err(invalid("POLL_INTERVAL_MS", "0", "must be positive"));
        }

        let session_queue: usize = try_load(&lookup, "SESSION_QUEUE", "64")?;
        if session_queue == 0 {
            return Err(invalid("SESSION_QUEUE", "0", "must be positive"));
        }

        Ok(Self {
            port: try_load(&lookup, "PORT", "3030")?,
            database_url,
            db_max_connections: try_load(&lookup, "DB_MAX_CONNECTIONS", "5")?,
            propagation: try_load(&lookup, "PROPAGATION", "push")?,
            poll_interval: Duration::from_millis(poll_interval_ms),
            session_queue,
            origin_check: try_load(&lookup, "ORIGIN_CHECK", "true")?,
            trust_forwarded_for: try_load(&lookup, "TRUST_FORWARDED_FOR", "false")?,
            app_url: try_load::<String, _>(&lookup, "APP_URL", "http://localhost:3030")?
                .trim_end_matches('/')
                .to_string(),
        })
    }

    pub fn share_link(&self, poll_id: i64) -> String {
        format!("{}/polls/{poll_id}", self.app_url)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3030,
            database_url: None,
            db_max_connections: 5,
            propagation: Strategy::Push,
            poll_interval: Duration::from_millis(2000),
            session_queue: 64,
            origin_check: true,
            trust_forwarded_for: false,
            app_url: "http://localhost:3030".to_string(),
        }
    }
}

fn try_load<T, F>(lookup: &F, key: &'static str, default: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key).unwrap_or_else(|| {
        info!("{key} not set, using default: {default}");
        default.to_string()
    });

    raw.trim().parse().map_err(|e: T::Err| {
        warn!("Invalid {key} value: {e}");
        invalid(key, &raw, &e.to_string())
    })
}

fn invalid(key: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}
