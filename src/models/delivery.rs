use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A stored status string that names no known state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status value '{0}'")]
pub struct ParseStatusError(pub String);

/// State of one delivery attempt.
///
/// ```text
/// PENDING -> FETCHING -> GENERATING -> SENDING -> SENT
///               |            |            |
///               +------------+------------+--> FAILED
/// (duplicate guard) ------------------------------> SKIPPED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Fetching,
    Generating,
    Sending,
    Sent,
    Failed,
    Skipped,
}

impl DeliveryStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Generating => "generating",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Failed | Self::Skipped)
    }

    /// The complete transition table. `Skipped` is only ever written at
    /// creation, so no edge leads into it.
    pub fn can_transition_to(self, next: Self) -> bool {
        use DeliveryStatus::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Fetching, Generating)
                | (Generating, Sending)
                | (Sending, Sent)
                | (Fetching, Failed)
                | (Generating, Failed)
                | (Sending, Failed)
        )
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "fetching" => Ok(Self::Fetching),
            "generating" => Ok(Self::Generating),
            "sending" => Ok(Self::Sending),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delivery {
    pub id: i64,
    pub subscription_id: i64,
    pub user_id: i64,
    pub status: DeliveryStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub file_path: Option<String>,
    pub file_size_bytes: Option<i64>,
    pub article_count: Option<i64>,
    /// Stage that was active when the attempt failed.
    pub error_stage: Option<DeliveryStatus>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDelivery {
    pub subscription_id: i64,
    pub user_id: i64,
    pub status: DeliveryStatus,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
