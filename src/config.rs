use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveTime;

use crate::error::{AppError, Result};
use crate::scheduler::SchedulerSettings;

const APP_DIR: &str = "paperboy";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Where generated EPUBs are written.
    #[serde(default = "default_epub_dir")]
    pub epub_dir: String,

    /// Used when RUST_LOG is not set.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default = "default_calibre_binary")]
    pub calibre_binary: String,

    #[serde(default = "default_calibre_timeout")]
    pub calibre_timeout_secs: u64,

    /// Largest EPUB that will be mailed.
    #[serde(default = "default_max_file_size")]
    pub max_file_size_mb: u64,

    #[serde(default = "default_epub_retention")]
    pub epub_retention_hours: u32,

    #[serde(default = "default_delivery_retention")]
    pub delivery_retention_days: u32,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_deliveries: usize,

    /// Daily retention run, "HH:MM" UTC.
    #[serde(default = "default_retention_time")]
    pub retention_time_utc: String,

    #[serde(default = "default_subject_prefix")]
    pub subject_prefix: String,
}

fn data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

fn default_db_path() -> String {
    data_dir().join("paperboy.db").to_string_lossy().to_string()
}

fn default_epub_dir() -> String {
    data_dir().join("epubs").to_string_lossy().to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_calibre_binary() -> String {
    "ebook-convert".to_string()
}

fn default_calibre_timeout() -> u64 {
    600
}

fn default_max_file_size() -> u64 {
    11
}

fn default_epub_retention() -> u32 {
    24
}

fn default_delivery_retention() -> u32 {
    30
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    3
}

fn default_retention_time() -> String {
    "03:00".to_string()
}

fn default_subject_prefix() -> String {
    "Paperboy".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            epub_dir: default_epub_dir(),
            log_level: default_log_level(),
            calibre_binary: default_calibre_binary(),
            calibre_timeout_secs: default_calibre_timeout(),
            max_file_size_mb: default_max_file_size(),
            epub_retention_hours: default_epub_retention(),
            delivery_retention_days: default_delivery_retention(),
            poll_interval_secs: default_poll_interval(),
            max_concurrent_deliveries: default_max_concurrent(),
            retention_time_utc: default_retention_time(),
            subject_prefix: default_subject_prefix(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save()?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path();
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_secs == 0 {
            return Err(AppError::Config("poll_interval_secs must be at least 1".into()));
        }
        if self.max_concurrent_deliveries == 0 {
            return Err(AppError::Config(
                "max_concurrent_deliveries must be at least 1".into(),
            ));
        }
        if self.max_file_size_mb == 0 {
            return Err(AppError::Config("max_file_size_mb must be at least 1".into()));
        }
        if self.calibre_timeout_secs == 0 {
            return Err(AppError::Config("calibre_timeout_secs must be at least 1".into()));
        }
        if NaiveTime::parse_from_str(&self.retention_time_utc, "%H:%M").is_err() {
            return Err(AppError::Config(format!(
                "retention_time_utc '{}' is not HH:MM",
                self.retention_time_utc
            )));
        }
        if i64::from(self.delivery_retention_days) * 24 < i64::from(self.epub_retention_hours) {
            return Err(AppError::Config(
                "delivery_retention_days must cover epub_retention_hours".into(),
            ));
        }
        Ok(())
    }

    pub fn max_file_size_bytes(&self) -> u64 {
        self.max_file_size_mb * 1024 * 1024
    }

    pub fn calibre_timeout(&self) -> Duration {
        Duration::from_secs(self.calibre_timeout_secs)
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            max_concurrent: self.max_concurrent_deliveries,
            epub_retention: chrono::Duration::hours(i64::from(self.epub_retention_hours)),
            record_retention: chrono::Duration::days(i64::from(self.delivery_retention_days)),
            retention_time: self.retention_time_utc.clone(),
        }
    }
}
