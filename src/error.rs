use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use crate::{
    models::{OptionId, PollId},
    propagation::PropagationError,
};

/// Errors raised by the durable store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A uniqueness constraint rejected the write.
    #[error("Unique constraint violated")]
    Duplicate,

    /// A foreign key pointed at a row that does not exist.
    #[error("Referenced row does not exist")]
    MissingReference,

    #[error("Database error: {0}")]
    Unavailable(sqlx::Error),

    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.is_unique_violation() {
                return StoreError::Duplicate;
            }
            if db_err.is_foreign_key_violation() {
                return StoreError::MissingReference;
            }
        }

        StoreError::Unavailable(err)
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {key} value {value:?}: {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Client-facing errors. Every handler returns `Result<_, AppError>`.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    InvalidInput(String),

    #[error("Option {option_id} does not belong to poll {poll_id}")]
    InvalidOption { poll_id: PollId, option_id: OptionId },

    #[error("You have already voted in this poll")]
    AlreadyVoted,

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(#[source] StoreError),

    #[error("Live propagation unavailable: {0}")]
    ChannelUnavailable(#[from] PropagationError),
}

impl AppError {
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::NotFound(_) => "NotFound",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::InvalidOption { .. } => "InvalidOption",
            AppError::AlreadyVoted => "AlreadyVoted",
            AppError::StorageUnavailable(_) => "StorageUnavailable",
            AppError::ChannelUnavailable(_) => "ChannelUnavailable",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidInput(_) | AppError::InvalidOption { .. } => StatusCode::BAD_REQUEST,
            AppError::AlreadyVoted => StatusCode::FORBIDDEN,
            AppError::StorageUnavailable(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::ChannelUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => AppError::AlreadyVoted,
            other => AppError::StorageUnavailable(other),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Storage details stay in the logs.
        let message = match &self {
            AppError::StorageUnavailable(source) => {
                error!("Storage failure: {source}");
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        let body = ErrorBody {
            error: self.kind(),
            message,
        };

        (status, Json(body)).into_response()
    }
}

/// Fatal errors while bringing the server up.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Server error: {0}")]
    Io(#[from] std::io::Error),
}
