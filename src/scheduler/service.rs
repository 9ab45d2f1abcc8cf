use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::db::Repository;
use crate::delivery::{panic_message, DeliveryEngine};
use crate::error::{AppError, Result};
use crate::models::{DeliveryStatus, Schedule};

use super::compute_next_run;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub poll_interval: Duration,
    pub max_concurrent: usize,
    /// Generated EPUBs older than this are removed from disk.
    pub epub_retention: chrono::Duration,
    /// Delivery rows older than this are deleted.
    pub record_retention: chrono::Duration,
    /// Daily retention run, "HH:MM" UTC.
    pub retention_time: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub files_deleted: usize,
    pub records_deleted: usize,
}

/// Polls storage for due subscriptions and hands them to the delivery engine.
///
/// Storage is the only record of what is due; nothing about schedules is kept
/// in memory between polls.
pub struct SchedulerService {
    inner: Arc<Inner>,
    running: Mutex<Option<Running>>,
}

struct Inner {
    repository: Repository,
    engine: Arc<DeliveryEngine>,
    settings: SchedulerSettings,
    gate: Arc<Semaphore>,
}

struct Running {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SchedulerService {
    pub fn new(repository: Repository, engine: Arc<DeliveryEngine>, settings: SchedulerSettings) -> Self {
        let gate = Arc::new(Semaphore::new(settings.max_concurrent.max(1)));
        Self {
            inner: Arc::new(Inner {
                repository,
                engine,
                settings,
                gate,
            }),
            running: Mutex::new(None),
        }
    }

    /// Reschedule stale subscriptions, then start the poll and retention loops.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            tracing::warn!("Scheduler already running");
            return Ok(());
        }

        self.inner.reconcile(Utc::now()).await?;

        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(poll_loop(self.inner.clone(), shutdown.clone())),
            tokio::spawn(retention_loop(self.inner.clone(), shutdown.clone())),
        ];
        *running = Some(Running { shutdown, tasks });

        let settings = &self.inner.settings;
        tracing::info!(
            "Scheduler started: polling every {}s, max {} concurrent deliveries",
            settings.poll_interval.as_secs(),
            settings.max_concurrent
        );
        tracing::info!(
            "Retention cleanup at {} UTC: EPUBs after {}h, records after {} days",
            settings.retention_time,
            settings.epub_retention.num_hours(),
            settings.record_retention.num_days()
        );
        Ok(())
    }

    /// Stop both loops and wait for any cycle already underway to finish.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };

        running.shutdown.cancel();
        for task in running.tasks {
            if let Err(e) = task.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
        tracing::info!("Scheduler stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// One poll cycle. Returns the number of subscriptions dispatched.
    pub async fn run_poll_cycle(&self) -> Result<usize> {
        self.inner.clone().poll_cycle().await
    }

    pub async fn run_retention(&self) -> Result<RetentionReport> {
        self.inner.retention(Utc::now()).await
    }
}

async fn poll_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(inner.settings.poll_interval);
    // A cycle that overruns the interval swallows the ticks it missed.
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = inner.clone().poll_cycle().await {
                    tracing::error!("Poll cycle failed: {}", e);
                }
            }
        }
    }
}

async fn retention_loop(inner: Arc<Inner>, shutdown: CancellationToken) {
    let schedule = Schedule::Daily {
        time: inner.settings.retention_time.clone(),
    };

    loop {
        let now = Utc::now();
        let Some(next) = compute_next_run(&schedule, "UTC", now, None, None) else {
            tracing::warn!(
                "Invalid retention time '{}', retention cleanup disabled",
                inner.settings.retention_time
            );
            shutdown.cancelled().await;
            break;
        };
        let wait = (next - now).to_std().unwrap_or_default();

        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(wait) => {
                if let Err(e) = inner.retention(Utc::now()).await {
                    tracing::error!("Error during retention cleanup: {}", e);
                }
            }
        }
    }
}

impl Inner {
    /// Move every overdue subscription to its next slot after `now`.
    /// Missed runs are skipped, not delivered late.
    async fn reconcile(&self, now: DateTime<Utc>) -> Result<usize> {
        let stale = self.repository.stale_subscriptions(now).await?;
        if stale.is_empty() {
            return Ok(0);
        }

        tracing::info!("Fixing {} stale schedules (skipping missed runs)", stale.len());
        for subscription in &stale {
            let timezone = self
                .repository
                .get_user(subscription.user_id)
                .await?
                .map(|user| user.timezone)
                .unwrap_or_else(|| "UTC".to_string());

            let next = compute_next_run(
                &subscription.schedule,
                &timezone,
                now,
                subscription.last_run_at,
                Some(subscription.created_at),
            );
            self.repository.set_next_run(subscription.id, next).await?;
            tracing::debug!(
                "Subscription {} '{}': rescheduled to {:?}",
                subscription.id,
                subscription.name,
                next
            );
        }
        Ok(stale.len())
    }

    async fn poll_cycle(self: Arc<Self>) -> Result<usize> {
        let due = self.repository.due_subscriptions(Utc::now()).await?;
        if due.is_empty() {
            return Ok(0);
        }
        tracing::info!("Found {} due subscription(s)", due.len());

        let mut deliveries = JoinSet::new();
        for subscription in &due {
            let permit = self
                .gate
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| AppError::Other(e.into()))?;
            let inner = self.clone();
            let subscription_id = subscription.id;
            deliveries.spawn(async move {
                let _permit = permit;
                inner.dispatch(subscription_id).await;
            });
        }

        while let Some(joined) = deliveries.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Scheduled delivery task failed: {}", e);
            }
        }
        Ok(due.len())
    }

    async fn dispatch(&self, subscription_id: i64) {
        if let Err(e) = self.try_dispatch(subscription_id).await {
            tracing::error!(
                "Error in scheduled delivery for subscription {}: {}",
                subscription_id,
                e
            );
        }
    }

    async fn try_dispatch(&self, subscription_id: i64) -> Result<()> {
        let Some(mut subscription) = self.repository.get_subscription(subscription_id).await? else {
            tracing::warn!("Subscription {} not found during delivery", subscription_id);
            return Ok(());
        };

        // Honour edits made since the poll query ran.
        let now = Utc::now();
        let scheduled_at = match subscription.next_run_at {
            Some(at) if subscription.enabled && at <= now => at,
            _ => {
                tracing::debug!("Subscription {} is no longer due", subscription_id);
                return Ok(());
            }
        };

        let Some(user) = self.repository.get_user(subscription.user_id).await? else {
            tracing::warn!("User {} not found during delivery", subscription.user_id);
            return Ok(());
        };

        tracing::info!("Starting scheduled delivery for '{}'", subscription.name);
        let outcome = AssertUnwindSafe(self.engine.execute(&mut subscription, &user, Some(scheduled_at), false))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| {
                Err(AppError::Other(anyhow!(
                    "delivery panicked: {}",
                    panic_message(&*panic)
                )))
            });

        // Reschedule whatever happened, so a broken source waits for its next slot.
        let next = compute_next_run(
            &subscription.schedule,
            &user.timezone,
            Utc::now(),
            subscription.last_run_at,
            Some(subscription.created_at),
        );
        self.repository.set_next_run(subscription.id, next).await?;

        let result = outcome?;
        match result.status {
            DeliveryStatus::Failed => tracing::warn!(
                "Delivery for '{}' failed: {}",
                subscription.name,
                result.error_message.as_deref().unwrap_or_default()
            ),
            _ => tracing::info!(
                "Delivery for '{}' {}, next run: {:?}",
                subscription.name,
                result.status,
                next
            ),
        }
        Ok(())
    }

    /// Remove old artifacts, then old rows. Each step can be re-run safely
    /// after an interruption.
    async fn retention(&self, now: DateTime<Utc>) -> Result<RetentionReport> {
        let epub_cutoff = now - self.settings.epub_retention;
        let record_cutoff = now - self.settings.record_retention;
        let mut report = RetentionReport::default();

        for delivery in self.repository.deliveries_with_artifacts_before(epub_cutoff).await? {
            let Some(path) = delivery.file_path.as_deref() else {
                continue;
            };
            match tokio::fs::remove_file(path).await {
                Ok(()) => {
                    report.files_deleted += 1;
                    tracing::debug!("Deleted EPUB: {}", path);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    // Keep the path so the next run tries again.
                    tracing::warn!("Failed to delete {}: {}", path, e);
                    continue;
                }
            }
            self.repository.clear_artifact_path(delivery.id).await?;
        }

        report.records_deleted = self.repository.delete_deliveries_before(record_cutoff).await?;

        if report.files_deleted > 0 || report.records_deleted > 0 {
            tracing::info!(
                "Retention cleanup: {} EPUB files deleted, {} delivery records deleted",
                report.files_deleted,
                report.records_deleted
            );
        }
        Ok(report)
    }
}
