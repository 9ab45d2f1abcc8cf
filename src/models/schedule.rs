use serde::{Deserialize, Serialize};

/// When a subscription is triggered automatically.
///
/// Stored as JSON tagged by `type`, e.g. `{"type": "daily", "time": "07:00"}`.
/// A tag this build does not know deserializes to [`Schedule::Unknown`] so the
/// row still loads; the calculator then refuses to schedule it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Schedule {
    /// Every day at `time` (HH:MM) in the user's zone.
    Daily {
        #[serde(default = "default_time")]
        time: String,
    },
    /// At `time` on each listed weekday ("mon".."sun").
    Weekly {
        #[serde(default = "default_time")]
        time: String,
        #[serde(default)]
        days: Vec<String>,
    },
    /// Every `interval_hours` hours counted from the last run.
    Interval {
        #[serde(default = "default_interval_hours")]
        interval_hours: u32,
    },
    /// Only delivered on request.
    Manual,
    #[serde(other)]
    Unknown,
}

fn default_time() -> String {
    "07:00".to_string()
}

fn default_interval_hours() -> u32 {
    12
}

impl Default for Schedule {
    fn default() -> Self {
        Self::Daily {
            time: default_time(),
        }
    }
}

impl Schedule {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Daily { .. } => "daily",
            Self::Weekly { .. } => "weekly",
            Self::Interval { .. } => "interval",
            Self::Manual => "manual",
            Self::Unknown => "unknown",
        }
    }
}
