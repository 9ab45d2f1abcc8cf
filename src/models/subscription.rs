use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{ParseStatusError, Schedule};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionKind {
    /// Built-in Calibre recipe, source is the recipe name.
    Recipe,
    /// Arbitrary feed, source is the feed URL.
    Rss,
}

impl SubscriptionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recipe => "recipe",
            Self::Rss => "rss",
        }
    }
}

impl FromStr for SubscriptionKind {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "recipe" => Ok(Self::Recipe),
            "rss" => Ok(Self::Rss),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Outcome of the most recent run, as shown on the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunOutcome {
    Success,
    Failed,
    Skipped,
}

impl RunOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(ParseStatusError(other.to_string())),
        }
    }
}

/// Per-delivery knobs handed to the content fetcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliverySettings {
    #[serde(default = "default_max_articles")]
    pub max_articles: u32,
    #[serde(default = "default_oldest_days")]
    pub oldest_days: u32,
    #[serde(default = "default_include_images")]
    pub include_images: bool,
    /// Title used for the attachment instead of the subscription name.
    #[serde(default)]
    pub title_override: Option<String>,
}

fn default_max_articles() -> u32 {
    25
}

fn default_oldest_days() -> u32 {
    7
}

fn default_include_images() -> bool {
    true
}

impl Default for DeliverySettings {
    fn default() -> Self {
        Self {
            max_articles: default_max_articles(),
            oldest_days: default_oldest_days(),
            include_images: default_include_images(),
            title_override: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscription {
    pub id: i64,
    pub user_id: i64,
    pub kind: SubscriptionKind,
    pub source: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub settings: DeliverySettings,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_status: Option<RunOutcome>,
    pub last_error: Option<String>,
    /// `None` means the subscription is never triggered automatically.
    pub next_run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    /// Name given to the generated book.
    pub fn display_name(&self) -> &str {
        self.settings
            .title_override
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub user_id: i64,
    pub kind: SubscriptionKind,
    pub source: String,
    pub name: String,
    pub enabled: bool,
    pub schedule: Schedule,
    pub settings: DeliverySettings,
    pub next_run_at: Option<DateTime<Utc>>,
}
