use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::FutureExt;

use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{
    Delivery, DeliveryStatus, NewDelivery, RunOutcome, SmtpConfig, Subscription, SubscriptionKind,
    User,
};
use crate::services::{ContentFetcher, Mailer};

use super::{panic_message, truncate_message, DeliveryError, DeliveryResult, MAX_ERROR_LEN};

/// Runs a single subscription through fetch, size check and send.
///
/// Every stage change is written to storage before the stage starts, so a
/// crash leaves the last stage that was actually reached on the row.
pub struct DeliveryEngine {
    repository: Repository,
    fetcher: Arc<dyn ContentFetcher>,
    mailer: Arc<dyn Mailer>,
    epub_dir: PathBuf,
    max_file_size: u64,
    subject_prefix: String,
}

impl DeliveryEngine {
    pub fn new(
        repository: Repository,
        fetcher: Arc<dyn ContentFetcher>,
        mailer: Arc<dyn Mailer>,
        epub_dir: PathBuf,
        max_file_size: u64,
        subject_prefix: String,
    ) -> Self {
        Self {
            repository,
            fetcher,
            mailer,
            epub_dir,
            max_file_size,
            subject_prefix,
        }
    }

    /// Deliver `subscription` to `user` once.
    ///
    /// Returns `Err` only when the user cannot receive deliveries at all
    /// ([`AppError::DeliveryConfig`], no row is written) or when storage
    /// refuses to record the outcome. Every pipeline failure comes back as a
    /// `failed` result.
    pub async fn execute(
        &self,
        subscription: &mut Subscription,
        user: &User,
        scheduled_at: Option<DateTime<Utc>>,
        force: bool,
    ) -> Result<DeliveryResult> {
        let destination = user
            .destination()
            .ok_or_else(|| AppError::DeliveryConfig("Kindle email not configured".to_string()))?;
        let smtp = user
            .smtp_config
            .as_ref()
            .ok_or_else(|| AppError::DeliveryConfig("SMTP settings not configured".to_string()))?;

        let now = Utc::now();
        let scheduled_at = scheduled_at.unwrap_or(now);

        if !force {
            if let Some(result) = self.skip_if_sent_today(subscription, user, scheduled_at, now).await? {
                return Ok(result);
            }
        }

        let delivery_id = self
            .repository
            .insert_delivery(NewDelivery {
                subscription_id: subscription.id,
                user_id: user.id,
                status: DeliveryStatus::Pending,
                scheduled_at,
                started_at: None,
                completed_at: None,
                error_message: None,
            })
            .await?;
        let mut delivery = self
            .repository
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("delivery #{delivery_id}")))?;

        tracing::info!(
            "Starting delivery {} for subscription '{}'",
            delivery.id,
            subscription.name
        );

        self.advance(&mut delivery, DeliveryStatus::Fetching).await?;

        // A panicking collaborator still ends the row as failed.
        let stages = AssertUnwindSafe(self.run_stages(&mut delivery, subscription, destination, smtp))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(DeliveryError::Unexpected(format!(
                    "delivery panicked: {}",
                    panic_message(&*panic)
                )))
            });

        match stages {
            Ok(()) => self.succeed(delivery, subscription, destination).await,
            Err(e) => self.fail(delivery, subscription, e).await,
        }
    }

    /// Only `failed` deliveries can be retried. A retry is a new attempt with
    /// its own row; the failed row is left as it was.
    pub async fn retry(&self, delivery_id: i64) -> Result<DeliveryResult> {
        let failed = self
            .repository
            .get_delivery(delivery_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("delivery #{delivery_id}")))?;
        if failed.status != DeliveryStatus::Failed {
            return Err(AppError::NotRetryable {
                id: failed.id,
                status: failed.status,
            });
        }

        let mut subscription = self
            .repository
            .get_subscription(failed.subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subscription #{}", failed.subscription_id)))?;
        let user = self
            .repository
            .get_user(subscription.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user #{}", subscription.user_id)))?;

        tracing::info!("Retrying failed delivery {} for '{}'", failed.id, subscription.name);
        self.execute(&mut subscription, &user, None, false).await
    }

    pub async fn recent_deliveries(&self, subscription_id: i64, limit: usize) -> Result<Vec<Delivery>> {
        self.repository.recent_deliveries(subscription_id, limit).await
    }

    async fn skip_if_sent_today(
        &self,
        subscription: &Subscription,
        user: &User,
        scheduled_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<DeliveryResult>> {
        let Some(existing) = self
            .repository
            .sent_delivery_since(subscription.id, start_of_utc_day(now))
            .await?
        else {
            return Ok(None);
        };

        let message = format!("Already sent today (delivery #{})", existing.id);
        let id = self
            .repository
            .insert_delivery(NewDelivery {
                subscription_id: subscription.id,
                user_id: user.id,
                status: DeliveryStatus::Skipped,
                scheduled_at,
                started_at: Some(now),
                completed_at: Some(now),
                error_message: Some(message.clone()),
            })
            .await?;

        tracing::info!(
            "Skipped delivery for '{}': already sent today (delivery #{})",
            subscription.name,
            existing.id
        );
        Ok(Some(DeliveryResult::skipped(id, message)))
    }

    /// Fetch, check and send. Starts with the row in `fetching`; on error the
    /// row's status is the stage that failed.
    async fn run_stages(
        &self,
        delivery: &mut Delivery,
        subscription: &Subscription,
        destination: &str,
        smtp: &SmtpConfig,
    ) -> std::result::Result<(), DeliveryError> {
        let output = self.epub_dir.join(format!(
            "{}_{}_{}.epub",
            subscription.id,
            delivery.id,
            Utc::now().format("%Y%m%d_%H%M%S")
        ));

        let produced = match subscription.kind {
            SubscriptionKind::Recipe => {
                self.fetcher
                    .fetch_recipe(&subscription.source, &output, &subscription.settings)
                    .await?
            }
            SubscriptionKind::Rss => {
                self.fetcher
                    .fetch_feed(
                        &subscription.source,
                        &subscription.name,
                        &output,
                        &subscription.settings,
                    )
                    .await?
            }
        };
        delivery.file_path = Some(produced.to_string_lossy().to_string());

        self.advance(delivery, DeliveryStatus::Generating).await?;

        let size = tokio::fs::metadata(&produced).await?.len();
        delivery.file_size_bytes = i64::try_from(size).ok();
        if size > self.max_file_size {
            return Err(DeliveryError::Size {
                size,
                limit: self.max_file_size,
            });
        }
        tracing::info!(
            "Delivery {}: EPUB generated ({:.1} KB)",
            delivery.id,
            size as f64 / 1024.0
        );

        self.advance(delivery, DeliveryStatus::Sending).await?;

        smtp.validate().map_err(DeliveryError::Config)?;
        let subject = format!("{}: {}", self.subject_prefix, subscription.name);
        self.mailer
            .send(
                smtp,
                destination,
                &subject,
                &produced,
                Some(subscription.display_name()),
            )
            .await?;

        Ok(())
    }

    /// Move to `next`, persisting before returning.
    async fn advance(&self, delivery: &mut Delivery, next: DeliveryStatus) -> Result<()> {
        if !delivery.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                id: delivery.id,
                from: delivery.status,
                to: next,
            });
        }

        let now = Utc::now();
        delivery.status = next;
        if next == DeliveryStatus::Fetching {
            delivery.started_at = Some(now);
        }
        if next.is_terminal() {
            delivery.completed_at = Some(now);
        }

        self.repository.update_delivery(delivery).await?;
        tracing::debug!("Delivery {} status: {}", delivery.id, next);
        Ok(())
    }

    async fn succeed(
        &self,
        mut delivery: Delivery,
        subscription: &mut Subscription,
        destination: &str,
    ) -> Result<DeliveryResult> {
        self.advance(&mut delivery, DeliveryStatus::Sent).await?;

        subscription.last_run_at = delivery.completed_at;
        subscription.last_status = Some(RunOutcome::Success);
        subscription.last_error = None;
        self.repository.record_run(subscription).await?;

        tracing::info!(
            "Delivery {} completed successfully: '{}' sent to {}",
            delivery.id,
            subscription.name,
            destination
        );

        Ok(DeliveryResult {
            delivery_id: delivery.id,
            status: delivery.status,
            file_path: delivery.file_path.map(PathBuf::from),
            file_size_bytes: delivery.file_size_bytes,
            article_count: delivery.article_count,
            error_stage: None,
            error_message: None,
        })
    }

    async fn fail(
        &self,
        mut delivery: Delivery,
        subscription: &mut Subscription,
        error: DeliveryError,
    ) -> Result<DeliveryResult> {
        let stage = delivery.status;
        let message = truncate_message(&error.to_string(), MAX_ERROR_LEN);

        delivery.error_stage = Some(stage);
        delivery.error_message = Some(message.clone());
        self.advance(&mut delivery, DeliveryStatus::Failed).await?;

        subscription.last_run_at = delivery.completed_at;
        subscription.last_status = Some(RunOutcome::Failed);
        subscription.last_error = Some(message.clone());
        self.repository.record_run(subscription).await?;

        tracing::error!(
            "Delivery {} failed at stage '{}': {}",
            delivery.id,
            stage,
            message
        );

        Ok(DeliveryResult {
            delivery_id: delivery.id,
            status: delivery.status,
            file_path: delivery.file_path.map(PathBuf::from),
            file_size_bytes: delivery.file_size_bytes,
            article_count: delivery.article_count,
            error_stage: Some(stage),
            error_message: Some(message),
        })
    }
}

fn start_of_utc_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive().and_time(chrono::NaiveTime::MIN).and_utc()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use chrono::TimeZone;
    use tokio_test::{assert_err, assert_ok};

    use std::path::Path;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use super::*;
    use crate::delivery::testing::{smtp_config as smtp, FakeFetcher, FakeMailer};
    use crate::models::{DeliverySettings, NewSubscription, NewUser, Schedule};
    use crate::services::{FetchError, MailError};

    struct Harness {
        engine: DeliveryEngine,
        repo: Repository,
        fetcher: Arc<FakeFetcher>,
        mailer: Arc<FakeMailer>,
        _dir: tempfile::TempDir,
    }

    async fn harness(fetcher: FakeFetcher, mailer: FakeMailer, max_file_size: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open_in_memory().await.unwrap();
        let fetcher = Arc::new(fetcher);
        let mailer = Arc::new(mailer);
        let engine = DeliveryEngine::new(
            repo.clone(),
            fetcher.clone(),
            mailer.clone(),
            dir.path().to_path_buf(),
            max_file_size,
            "Paperboy".to_string(),
        );
        Harness {
            engine,
            repo,
            fetcher,
            mailer,
            _dir: dir,
        }
    }

    async fn seed(
        repo: &Repository,
        kindle_email: Option<&str>,
        smtp_config: Option<SmtpConfig>,
        kind: SubscriptionKind,
    ) -> (Subscription, User) {
        let user_id = repo
            .insert_user(NewUser {
                username: "reader".into(),
                email: "reader@example.com".into(),
                kindle_email: kindle_email.map(str::to_string),
                timezone: "UTC".into(),
                smtp_config,
            })
            .await
            .unwrap();
        let source = match kind {
            SubscriptionKind::Recipe => "the_guardian",
            SubscriptionKind::Rss => "https://example.com/feed.xml",
        };
        let sub_id = repo
            .insert_subscription(NewSubscription {
                user_id,
                kind,
                source: source.into(),
                name: "The Guardian".into(),
                enabled: true,
                schedule: Schedule::default(),
                settings: DeliverySettings {
                    max_articles: 25,
                    ..DeliverySettings::default()
                },
                next_run_at: None,
            })
            .await
            .unwrap();
        (
            repo.get_subscription(sub_id).await.unwrap().unwrap(),
            repo.get_user(user_id).await.unwrap().unwrap(),
        )
    }

    async fn ready(h: &Harness) -> (Subscription, User) {
        seed(&h.repo, Some("reader@kindle.com"), Some(smtp()), SubscriptionKind::Recipe).await
    }

    #[tokio::test]
    async fn successful_delivery_is_sent() {
        let h = harness(FakeFetcher::writing(2048), FakeMailer::default(), 1024 * 1024).await;
        let (mut sub, user) = ready(&h).await;

        let result = assert_ok!(h.engine.execute(&mut sub, &user, None, false).await);
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(result.file_size_bytes, Some(2048));
        assert!(result.file_path.as_ref().unwrap().exists());
        assert_eq!(result.error_stage, None);

        let rows = h.repo.recent_deliveries(sub.id, 10).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, DeliveryStatus::Sent);
        assert!(rows[0].started_at.is_some());
        assert!(rows[0].completed_at.is_some());

        let stored = h.repo.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.last_status, Some(RunOutcome::Success));
        assert_eq!(stored.last_error, None);
        assert!(stored.last_run_at.is_some());

        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            h.mailer.subjects.lock().unwrap().as_slice(),
            ["Paperboy: The Guardian".to_string()]
        );
    }

    #[tokio::test]
    async fn rss_subscriptions_use_the_feed_entry_point() {
        let h = harness(FakeFetcher::writing(16), FakeMailer::default(), 1024).await;
        let (mut sub, user) =
            seed(&h.repo, Some("reader@kindle.com"), Some(smtp()), SubscriptionKind::Rss).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Sent);
        assert_eq!(h.fetcher.feed_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.fetcher.recipe_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn oversized_output_fails_at_generating() {
        let h = harness(FakeFetcher::writing(64), FakeMailer::default(), 8).await;
        let (mut sub, user) = ready(&h).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(result.error_stage, Some(DeliveryStatus::Generating));
        assert!(result.error_message.unwrap().starts_with("File too large"));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);

        // The artifact stays referenced so retention can remove it.
        let row = h.repo.get_delivery(result.delivery_id).await.unwrap().unwrap();
        assert!(row.file_path.is_some());
        assert!(row.completed_at.is_some());
    }

    #[tokio::test]
    async fn fetch_failure_fails_at_fetching() {
        let h = harness(FakeFetcher::failing("no feeds found"), FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(result.error_stage, Some(DeliveryStatus::Fetching));
        assert_eq!(
            result.error_message.as_deref(),
            Some("Recipe 'the_guardian' failed: no feeds found")
        );
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);

        let stored = h.repo.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.last_status, Some(RunOutcome::Failed));
        assert_eq!(stored.last_error, result.error_message);

        let row = h.repo.get_delivery(result.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert_eq!(row.error_stage, Some(DeliveryStatus::Fetching));
    }

    #[tokio::test]
    async fn mail_failure_fails_at_sending() {
        let mailer = FakeMailer {
            fail: true,
            ..FakeMailer::default()
        };
        let h = harness(FakeFetcher::writing(16), mailer, 1024).await;
        let (mut sub, user) = ready(&h).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(result.error_stage, Some(DeliveryStatus::Sending));
        assert_eq!(
            result.error_message.as_deref(),
            Some("Failed to send email: 550 mailbox unavailable")
        );
        assert_eq!(sub.last_status, Some(RunOutcome::Failed));
    }

    #[tokio::test]
    async fn broken_smtp_settings_fail_at_sending_without_mailing() {
        let h = harness(FakeFetcher::writing(16), FakeMailer::default(), 1024).await;
        let mut config = smtp();
        config.host = String::new();
        let (mut sub, user) =
            seed(&h.repo, Some("reader@kindle.com"), Some(config), SubscriptionKind::Recipe).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(result.error_stage, Some(DeliveryStatus::Sending));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unexpected_errors_are_prefixed_and_recorded() {
        let fetcher = FakeFetcher {
            size: 16,
            wrong_path: true,
            ..FakeFetcher::default()
        };
        let h = harness(fetcher, FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(result.error_stage, Some(DeliveryStatus::Generating));
        assert!(result.error_message.unwrap().starts_with("Unexpected error: "));
    }

    #[tokio::test]
    async fn long_failure_messages_are_truncated() {
        let reason = "x".repeat(3000);
        let h = harness(FakeFetcher::failing(&reason), FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;

        let result = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.error_message.as_ref().unwrap().chars().count(), MAX_ERROR_LEN);
        let stored = h.repo.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.last_error.unwrap().chars().count(), MAX_ERROR_LEN);
    }

    #[tokio::test]
    async fn missing_destination_is_a_config_error_without_rows() {
        let h = harness(FakeFetcher::writing(16), FakeMailer::default(), 1024).await;
        let (mut sub, user) = seed(&h.repo, Some("   "), Some(smtp()), SubscriptionKind::Recipe).await;

        let err = assert_err!(h.engine.execute(&mut sub, &user, None, false).await);
        assert!(matches!(err, AppError::DeliveryConfig(ref m) if m == "Kindle email not configured"));
        assert!(h.repo.recent_deliveries(sub.id, 10).await.unwrap().is_empty());
        assert_eq!(h.fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn missing_smtp_is_a_config_error_without_rows() {
        let h = harness(FakeFetcher::writing(16), FakeMailer::default(), 1024).await;
        let (mut sub, user) =
            seed(&h.repo, Some("reader@kindle.com"), None, SubscriptionKind::Recipe).await;

        let err = assert_err!(h.engine.execute(&mut sub, &user, None, false).await);
        assert!(matches!(err, AppError::DeliveryConfig(ref m) if m == "SMTP settings not configured"));
        assert!(h.repo.recent_deliveries(sub.id, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_send_today_is_skipped_unless_forced() {
        let h = harness(FakeFetcher::writing(16), FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;

        let first = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(first.status, DeliveryStatus::Sent);
        let after_first = h.repo.get_subscription(sub.id).await.unwrap().unwrap();

        let skipped = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(skipped.status, DeliveryStatus::Skipped);
        assert_eq!(
            skipped.error_message,
            Some(format!("Already sent today (delivery #{})", first.delivery_id))
        );
        assert_eq!(h.fetcher.calls(), 1);
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 1);

        let skipped_row = h.repo.get_delivery(skipped.delivery_id).await.unwrap().unwrap();
        assert_eq!(skipped_row.status, DeliveryStatus::Skipped);
        let after_skip = h.repo.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(after_skip.last_run_at, after_first.last_run_at);

        let forced = h.engine.execute(&mut sub, &user, None, true).await.unwrap();
        assert_eq!(forced.status, DeliveryStatus::Sent);
        assert_eq!(h.fetcher.calls(), 2);
        assert_eq!(h.repo.recent_deliveries(sub.id, 10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn scheduled_time_is_recorded() {
        let h = harness(FakeFetcher::writing(16), FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;
        let scheduled = Utc.with_ymd_and_hms(2024, 1, 15, 7, 0, 0).unwrap();

        let result = h.engine.execute(&mut sub, &user, Some(scheduled), false).await.unwrap();
        let row = h.repo.get_delivery(result.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.scheduled_at, scheduled);
    }

    #[tokio::test]
    async fn retry_creates_a_new_row() {
        let h = harness(FakeFetcher::failing("temporary outage"), FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;

        let failed = h.engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(failed.status, DeliveryStatus::Failed);

        h.fetcher.fail.store(false, Ordering::SeqCst);
        let retried = h.engine.retry(failed.delivery_id).await.unwrap();
        assert_eq!(retried.status, DeliveryStatus::Sent);
        assert_ne!(retried.delivery_id, failed.delivery_id);

        let original = h.repo.get_delivery(failed.delivery_id).await.unwrap().unwrap();
        assert_eq!(original.status, DeliveryStatus::Failed);

        let err = assert_err!(h.engine.retry(retried.delivery_id).await);
        assert!(matches!(err, AppError::NotRetryable { status: DeliveryStatus::Sent, .. }));
        assert!(matches!(h.engine.retry(9999).await, Err(AppError::NotFound(_))));
    }

    #[tokio::test]
    async fn panicking_fetch_is_recorded_as_failure() {
        let fetcher = FakeFetcher {
            panicking_sources: vec!["the_guardian".into()],
            ..FakeFetcher::default()
        };
        let h = harness(fetcher, FakeMailer::default(), 1024).await;
        let (mut sub, user) = ready(&h).await;

        let result = assert_ok!(h.engine.execute(&mut sub, &user, None, false).await);
        assert_eq!(result.status, DeliveryStatus::Failed);
        assert_eq!(result.error_stage, Some(DeliveryStatus::Fetching));
        let message = result.error_message.unwrap();
        assert!(message.starts_with("Unexpected error: "));
        assert!(message.contains("fetcher blew up on the_guardian"));
        assert_eq!(h.mailer.calls.load(Ordering::SeqCst), 0);

        let row = h.repo.get_delivery(result.delivery_id).await.unwrap().unwrap();
        assert_eq!(row.status, DeliveryStatus::Failed);
        assert!(row.completed_at.is_some());
        let stored = h.repo.get_subscription(sub.id).await.unwrap().unwrap();
        assert_eq!(stored.last_status, Some(RunOutcome::Failed));
        assert!(stored.last_run_at.is_some());
    }

    /// Output and attachment names are `<subscription>_<delivery>_<stamp>.epub`.
    fn delivery_id_of(path: &Path) -> i64 {
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        name.split('_').nth(1).unwrap().parse().unwrap()
    }

    /// Reads the stored row while the fetch stage runs.
    struct RowReadingFetcher {
        repo: Repository,
        seen: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl ContentFetcher for RowReadingFetcher {
        async fn fetch_recipe(
            &self,
            _recipe: &str,
            output: &Path,
            _settings: &DeliverySettings,
        ) -> std::result::Result<PathBuf, FetchError> {
            let row = self.repo.get_delivery(delivery_id_of(output)).await.unwrap().unwrap();
            self.seen.lock().unwrap().push(row);
            std::fs::write(output, b"epub")?;
            Ok(output.to_path_buf())
        }

        async fn fetch_feed(
            &self,
            _feed_url: &str,
            _title: &str,
            output: &Path,
            settings: &DeliverySettings,
        ) -> std::result::Result<PathBuf, FetchError> {
            self.fetch_recipe("", output, settings).await
        }
    }

    /// Reads the stored row while the send stage runs.
    struct RowReadingMailer {
        repo: Repository,
        seen: Mutex<Vec<Delivery>>,
    }

    #[async_trait]
    impl Mailer for RowReadingMailer {
        async fn send(
            &self,
            _config: &SmtpConfig,
            _to: &str,
            _subject: &str,
            attachment: &Path,
            _display_name: Option<&str>,
        ) -> std::result::Result<(), MailError> {
            let row = self.repo.get_delivery(delivery_id_of(attachment)).await.unwrap().unwrap();
            self.seen.lock().unwrap().push(row);
            Ok(())
        }
    }

    #[tokio::test]
    async fn each_stage_is_stored_before_it_runs() {
        let dir = tempfile::tempdir().unwrap();
        let repo = Repository::open_in_memory().await.unwrap();
        let fetcher = Arc::new(RowReadingFetcher {
            repo: repo.clone(),
            seen: Mutex::default(),
        });
        let mailer = Arc::new(RowReadingMailer {
            repo: repo.clone(),
            seen: Mutex::default(),
        });
        let engine = DeliveryEngine::new(
            repo.clone(),
            fetcher.clone(),
            mailer.clone(),
            dir.path().to_path_buf(),
            1024,
            "Paperboy".to_string(),
        );
        let (mut sub, user) =
            seed(&repo, Some("reader@kindle.com"), Some(smtp()), SubscriptionKind::Recipe).await;

        let result = engine.execute(&mut sub, &user, None, false).await.unwrap();
        assert_eq!(result.status, DeliveryStatus::Sent);

        let during_fetch = fetcher.seen.lock().unwrap().clone();
        assert_eq!(during_fetch.len(), 1);
        assert_eq!(during_fetch[0].id, result.delivery_id);
        assert_eq!(during_fetch[0].status, DeliveryStatus::Fetching);
        assert!(during_fetch[0].started_at.is_some());
        assert_eq!(during_fetch[0].completed_at, None);

        let during_send = mailer.seen.lock().unwrap().clone();
        assert_eq!(during_send.len(), 1);
        assert_eq!(during_send[0].status, DeliveryStatus::Sending);
        assert!(during_send[0].file_path.is_some());
        assert_eq!(during_send[0].file_size_bytes, Some(4));
        assert_eq!(during_send[0].completed_at, None);
    }

    #[test]
    fn day_starts_at_utc_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 1, 15, 22, 45, 10).unwrap();
        assert_eq!(start_of_utc_day(now), Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap());
    }
}
