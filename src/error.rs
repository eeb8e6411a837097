//! Error types for loreforge.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::State,
        to: crate::model::State,
    },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("bad cron expression {expr:?}: {source}")]
    Cron {
        expr: String,
        #[source]
        source: cron::error::Error,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
