//! Collaborator fakes shared by the engine and scheduler tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::models::{DeliverySettings, SmtpConfig};
use crate::services::{ContentFetcher, FetchError, MailError, Mailer};

/// Writes `size` bytes to the requested output unless told otherwise.
#[derive(Default)]
pub struct FakeFetcher {
    pub size: usize,
    pub fail: AtomicBool,
    pub reason: Option<String>,
    /// Sources that always fail, regardless of `fail`.
    pub failing_sources: Vec<String>,
    /// Sources whose fetch panics.
    pub panicking_sources: Vec<String>,
    /// Report success for a file that was never written.
    pub wrong_path: bool,
    pub delay: Option<Duration>,
    pub recipe_calls: AtomicUsize,
    pub feed_calls: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeFetcher {
    pub fn writing(size: usize) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    pub fn failing(reason: &str) -> Self {
        Self {
            fail: AtomicBool::new(true),
            reason: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.recipe_calls.load(Ordering::SeqCst) + self.feed_calls.load(Ordering::SeqCst)
    }

    async fn produce(&self, source: &str, output: &Path) -> Result<PathBuf, FetchError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let result = self.produce_now(source, output);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    fn produce_now(&self, source: &str, output: &Path) -> Result<PathBuf, FetchError> {
        if self.panicking_sources.iter().any(|s| s == source) {
            panic!("fetcher blew up on {source}");
        }
        if self.fail.load(Ordering::SeqCst) || self.failing_sources.iter().any(|s| s == source) {
            return Err(FetchError::Failed {
                source_name: format!("Recipe '{source}'"),
                reason: self.reason.clone().unwrap_or_else(|| "fetch failed".to_string()),
            });
        }
        if self.wrong_path {
            return Ok(output.with_file_name("vanished.epub"));
        }
        std::fs::write(output, vec![b'x'; self.size])?;
        Ok(output.to_path_buf())
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch_recipe(
        &self,
        recipe: &str,
        output: &Path,
        _settings: &DeliverySettings,
    ) -> Result<PathBuf, FetchError> {
        self.recipe_calls.fetch_add(1, Ordering::SeqCst);
        self.produce(recipe, output).await
    }

    async fn fetch_feed(
        &self,
        feed_url: &str,
        _title: &str,
        output: &Path,
        _settings: &DeliverySettings,
    ) -> Result<PathBuf, FetchError> {
        self.feed_calls.fetch_add(1, Ordering::SeqCst);
        self.produce(feed_url, output).await
    }
}

#[derive(Default)]
pub struct FakeMailer {
    pub fail: bool,
    pub calls: AtomicUsize,
    pub subjects: Mutex<Vec<String>>,
}

#[async_trait]
impl Mailer for FakeMailer {
    async fn send(
        &self,
        _config: &SmtpConfig,
        _to: &str,
        subject: &str,
        _attachment: &Path,
        _display_name: Option<&str>,
    ) -> Result<(), MailError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.subjects
            .lock()
            .map_err(|e| MailError::Send(e.to_string()))?
            .push(subject.to_string());
        if self.fail {
            return Err(MailError::Send("550 mailbox unavailable".into()));
        }
        Ok(())
    }
}

pub fn smtp_config() -> SmtpConfig {
    SmtpConfig {
        host: "smtp.example.com".into(),
        port: 587,
        username: "sender".into(),
        password: "secret".into(),
        from_email: "sender@example.com".into(),
        use_tls: true,
    }
}
