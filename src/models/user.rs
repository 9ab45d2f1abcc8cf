use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// Address of the e-reader's inbox.
    pub kindle_email: Option<String>,
    /// IANA zone name, e.g. "Europe/Berlin".
    pub timezone: String,
    pub smtp_config: Option<SmtpConfig>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Destination address, if one is set and non-blank.
    pub fn destination(&self) -> Option<&str> {
        self.kindle_email
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub kindle_email: Option<String>,
    pub timezone: String,
    pub smtp_config: Option<SmtpConfig>,
}

/// Outbound mail settings of one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmtpConfig {
    pub host: String,
    #[serde(default = "default_smtp_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    #[serde(default = "default_true")]
    pub use_tls: bool,
}

fn default_smtp_port() -> u16 {
    587
}

fn default_true() -> bool {
    true
}

impl SmtpConfig {
    /// Checks the fields the transport cannot do without.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.host.trim().is_empty() {
            return Err("SMTP host is not configured".to_string());
        }
        if self.from_email.trim().is_empty() {
            return Err("SMTP from address is not configured".to_string());
        }
        if self.port == 0 {
            return Err("SMTP port must be non-zero".to_string());
        }
        Ok(())
    }
}
