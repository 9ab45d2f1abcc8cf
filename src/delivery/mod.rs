mod engine;
#[cfg(test)]
pub(crate) mod testing;

use std::any::Any;
use std::path::PathBuf;

use thiserror::Error;

use crate::error::AppError;
use crate::models::DeliveryStatus;
use crate::services::{FetchError, MailError};

pub use engine::DeliveryEngine;

/// Longest failure message kept on a delivery or subscription row.
pub const MAX_ERROR_LEN: usize = 1000;

/// Why a delivery attempt failed once its row exists.
///
/// None of these escape [`DeliveryEngine::execute`]; they are recorded on the
/// delivery and returned as a `failed` [`DeliveryResult`].
#[derive(Error, Debug)]
pub enum DeliveryError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("File too large: {:.1}MB exceeds {:.0}MB limit", megabytes(.size), megabytes(.limit))]
    Size { size: u64, limit: u64 },

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error("{0}")]
    Config(String),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl From<AppError> for DeliveryError {
    fn from(e: AppError) -> Self {
        Self::Unexpected(e.to_string())
    }
}

impl From<std::io::Error> for DeliveryError {
    fn from(e: std::io::Error) -> Self {
        Self::Unexpected(format!("IO error: {e}"))
    }
}

fn megabytes(bytes: &u64) -> f64 {
    *bytes as f64 / (1024.0 * 1024.0)
}

/// Outcome of one call to [`DeliveryEngine::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryResult {
    pub delivery_id: i64,
    pub status: DeliveryStatus,
    pub file_path: Option<PathBuf>,
    pub file_size_bytes: Option<i64>,
    pub article_count: Option<i64>,
    pub error_stage: Option<DeliveryStatus>,
    pub error_message: Option<String>,
}

impl DeliveryResult {
    fn skipped(delivery_id: i64, message: String) -> Self {
        Self {
            delivery_id,
            status: DeliveryStatus::Skipped,
            file_path: None,
            file_size_bytes: None,
            article_count: None,
            error_stage: None,
            error_message: Some(message),
        }
    }
}

/// Cut `message` to at most `max` characters without splitting one.
pub fn truncate_message(message: &str, max: usize) -> String {
    match message.char_indices().nth(max) {
        Some((idx, _)) => message[..idx].to_string(),
        None => message.to_string(),
    }
}

/// Text carried by a caught panic, for error messages.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "panic without message".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn panic_payloads_become_messages() {
        let literal: Box<dyn Any + Send> = Box::new("boom");
        let formatted: Box<dyn Any + Send> = Box::new(format!("boom {}", 2));
        let other: Box<dyn Any + Send> = Box::new(7_u8);
        assert_eq!(panic_message(&*literal), "boom");
        assert_eq!(panic_message(&*formatted), "boom 2");
        assert_eq!(panic_message(&*other), "panic without message");
    }

    #[test]
    fn unexpected_errors_are_prefixed() {
        let err = DeliveryError::from(AppError::Config("boom".into()));
        assert_eq!(err.to_string(), "Unexpected error: Configuration error: boom");
    }

    #[test]
    fn size_error_message() {
        let err = DeliveryError::Size {
            size: 15 * 1024 * 1024 + 100 * 1024,
            limit: 11 * 1024 * 1024,
        };
        assert_eq!(err.to_string(), "File too large: 15.1MB exceeds 11MB limit");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        assert_eq!(truncate_message("short", 10), "short");
        assert_eq!(truncate_message("ééééé", 3), "ééé");
        assert_eq!(truncate_message(&"x".repeat(1500), MAX_ERROR_LEN).len(), 1000);
    }
}
