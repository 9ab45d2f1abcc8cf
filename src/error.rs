use thiserror::Error;

use crate::models::DeliveryStatus;
use crate::services::{FetchError, MailError};

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A delivery was requested for a user that cannot receive one yet.
    /// Raised before any delivery row exists.
    #[error("Delivery not configured: {0}")]
    DeliveryConfig(String),

    #[error("Invalid delivery transition for #{id}: {from} -> {to}")]
    InvalidTransition {
        id: i64,
        from: DeliveryStatus,
        to: DeliveryStatus,
    },

    #[error("Delivery #{0} is finalized and can no longer change")]
    Finalized(i64),

    #[error("Delivery #{id} is {status}; only failed deliveries can be retried")]
    NotRetryable { id: i64, status: DeliveryStatus },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Content fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Mail error: {0}")]
    Mail(#[from] MailError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
