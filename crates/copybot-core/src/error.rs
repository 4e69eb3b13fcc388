//! Error types shared across the copy-trading engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Exchange API error: {message}")]
    Api { message: String, status: Option<u16> },

    #[error("Position error: {0}")]
    Position(String),

    #[error("Invariant violation: {0}")]
    Anomaly(String),

    #[error("Instance replication refused: {0}")]
    Replication(String),
}

pub type Result<T> = std::result::Result<T, Error>;
