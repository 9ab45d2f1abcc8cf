use std::path::PathBuf;
use std::sync::Arc;

use crate::config::Config;
use crate::db::Repository;
use crate::delivery::{DeliveryEngine, DeliveryResult};
use crate::error::{AppError, Result};
use crate::models::Delivery;
use crate::scheduler::{RetentionReport, SchedulerService};
use crate::services::{CalibreWrapper, Recipe, SmtpMailer};

/// Everything a running process needs, built once from [`Config`].
pub struct App {
    repository: Repository,
    calibre: Arc<CalibreWrapper>,
    mailer: Arc<SmtpMailer>,
    engine: Arc<DeliveryEngine>,
    pub scheduler: SchedulerService,
}

impl App {
    pub async fn new(config: &Config) -> Result<Self> {
        let epub_dir = PathBuf::from(&config.epub_dir);
        std::fs::create_dir_all(&epub_dir)?;
        if let Some(parent) = PathBuf::from(&config.db_path).parent() {
            std::fs::create_dir_all(parent)?;
        }

        let repository = Repository::new(&config.db_path).await?;
        let calibre = Arc::new(CalibreWrapper::new(
            config.calibre_binary.clone(),
            config.calibre_timeout(),
        ));
        let mailer = Arc::new(SmtpMailer::new(config.max_file_size_bytes()));

        let engine = Arc::new(DeliveryEngine::new(
            repository.clone(),
            calibre.clone(),
            mailer.clone(),
            epub_dir,
            config.max_file_size_bytes(),
            config.subject_prefix.clone(),
        ));
        let scheduler =
            SchedulerService::new(repository.clone(), engine.clone(), config.scheduler_settings());

        Ok(Self {
            repository,
            calibre,
            mailer,
            engine,
            scheduler,
        })
    }

    /// Run the scheduler until Ctrl-C, then drain and stop it.
    pub async fn run_daemon(&self) -> Result<()> {
        self.scheduler.start().await?;
        tokio::signal::ctrl_c().await?;
        tracing::info!("Shutdown requested");
        self.scheduler.stop().await;
        Ok(())
    }

    pub async fn send_now(&self, subscription_id: i64, force: bool) -> Result<DeliveryResult> {
        let mut subscription = self
            .repository
            .get_subscription(subscription_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("subscription #{subscription_id}")))?;
        let user = self
            .repository
            .get_user(subscription.user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user #{}", subscription.user_id)))?;

        self.engine.execute(&mut subscription, &user, None, force).await
    }

    pub async fn retry(&self, delivery_id: i64) -> Result<DeliveryResult> {
        self.engine.retry(delivery_id).await
    }

    pub async fn history(&self, subscription_id: i64, limit: usize) -> Result<Vec<Delivery>> {
        self.engine.recent_deliveries(subscription_id, limit).await
    }

    pub async fn list_recipes(&self, force_refresh: bool) -> Result<Vec<Recipe>> {
        Ok(self.calibre.list_builtin_recipes(force_refresh).await?)
    }

    pub async fn check_calibre(&self) -> Result<String> {
        Ok(self.calibre.verify_installation().await?)
    }

    pub async fn verify_smtp(&self, user_id: i64) -> Result<()> {
        let user = self
            .repository
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("user #{user_id}")))?;
        let smtp = user
            .smtp_config
            .as_ref()
            .ok_or_else(|| AppError::DeliveryConfig("SMTP settings not configured".to_string()))?;
        smtp.validate().map_err(AppError::DeliveryConfig)?;

        Ok(self.mailer.verify(smtp).await?)
    }

    pub async fn cleanup(&self) -> Result<RetentionReport> {
        self.scheduler.run_retention().await
    }
}
