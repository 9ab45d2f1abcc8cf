use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, Type, ValueRef};
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::models::{
    Delivery, DeliverySettings, DeliveryStatus, NewDelivery, NewSubscription, NewUser, RunOutcome,
    Schedule, SmtpConfig, Subscription, SubscriptionKind, User,
};

use super::schema::SCHEMA;

const USER_COLUMNS: &str =
    "id, username, email, kindle_email, timezone, smtp_config, created_at";

const SUBSCRIPTION_COLUMNS: &str = "id, user_id, kind, source, name, enabled, schedule, settings, \
     last_run_at, last_status, last_error, next_run_at, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, subscription_id, user_id, status, scheduled_at, started_at, \
     completed_at, file_path, file_size_bytes, article_count, error_stage, error_message, created_at";

/// SQLite-backed store for users, subscriptions and deliveries.
///
/// This is the only place where statuses and JSON columns cross between their
/// stored text form and their typed form.
#[derive(Clone)]
pub struct Repository {
    conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;
        Self::init(conn).await
    }

    #[cfg(test)]
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        Self::init(conn).await
    }

    async fn init(conn: Connection) -> Result<Self> {
        conn.call(|conn| {
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // User operations

    pub async fn insert_user(&self, user: NewUser) -> Result<i64> {
        let smtp_config = user
            .smtp_config
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let created_at = timestamp(Utc::now());

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO users (username, email, kindle_email, timezone, smtp_config, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        user.username,
                        user.email,
                        user.kindle_email,
                        user.timezone,
                        smtp_config,
                        created_at
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn get_user(&self, id: i64) -> Result<Option<User>> {
        let user = self
            .conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare(&format!("SELECT {USER_COLUMNS} FROM users WHERE id = ?1"))?;
                let user = stmt.query_row(params![id], user_from_row).optional()?;
                Ok(user)
            })
            .await?;
        Ok(user)
    }

    // Subscription operations

    pub async fn insert_subscription(&self, subscription: NewSubscription) -> Result<i64> {
        let schedule = serde_json::to_string(&subscription.schedule)?;
        let settings = serde_json::to_string(&subscription.settings)?;
        let now = timestamp(Utc::now());

        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO subscriptions
                        (user_id, kind, source, name, enabled, schedule, settings, next_run_at, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)",
                    params![
                        subscription.user_id,
                        subscription.kind,
                        subscription.source,
                        subscription.name,
                        subscription.enabled,
                        schedule,
                        settings,
                        subscription.next_run_at.map(timestamp),
                        now,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    pub async fn get_subscription(&self, id: i64) -> Result<Option<Subscription>> {
        let subscription = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = ?1"
                ))?;
                let subscription = stmt
                    .query_row(params![id], subscription_from_row)
                    .optional()?;
                Ok(subscription)
            })
            .await?;
        Ok(subscription)
    }

    /// Enabled subscriptions whose next run is at or before `now`, earliest first.
    pub async fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        self.scheduled_subscriptions("next_run_at <= ?1", now).await
    }

    /// Enabled subscriptions whose next run is strictly before `now`.
    pub async fn stale_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<Subscription>> {
        self.scheduled_subscriptions("next_run_at < ?1", now).await
    }

    async fn scheduled_subscriptions(
        &self,
        condition: &'static str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>> {
        let now = timestamp(now);
        let subscriptions = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions
                     WHERE enabled = 1 AND next_run_at IS NOT NULL AND {condition}
                     ORDER BY next_run_at, id"
                ))?;
                let subscriptions = stmt
                    .query_map(params![now], subscription_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(subscriptions)
            })
            .await?;
        Ok(subscriptions)
    }

    pub async fn set_next_run(&self, id: i64, next_run_at: Option<DateTime<Utc>>) -> Result<()> {
        let updated_at = timestamp(Utc::now());
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscriptions SET next_run_at = ?1, updated_at = ?2 WHERE id = ?3",
                    params![next_run_at.map(timestamp), updated_at, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Persist the last-run fields of a subscription.
    pub async fn record_run(&self, subscription: &Subscription) -> Result<()> {
        let id = subscription.id;
        let last_run_at = subscription.last_run_at.map(timestamp);
        let last_status = subscription.last_status;
        let last_error = subscription.last_error.clone();
        let updated_at = timestamp(Utc::now());

        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE subscriptions
                     SET last_run_at = ?1, last_status = ?2, last_error = ?3, updated_at = ?4
                     WHERE id = ?5",
                    params![last_run_at, last_status, last_error, updated_at, id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Delivery operations

    pub async fn insert_delivery(&self, delivery: NewDelivery) -> Result<i64> {
        let created_at = timestamp(Utc::now());
        let id = self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO deliveries
                        (subscription_id, user_id, status, scheduled_at, started_at, completed_at, error_message, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        delivery.subscription_id,
                        delivery.user_id,
                        delivery.status,
                        timestamp(delivery.scheduled_at),
                        delivery.started_at.map(timestamp),
                        delivery.completed_at.map(timestamp),
                        delivery.error_message,
                        created_at,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?;
        Ok(id)
    }

    /// Write every mutable column of an in-flight delivery.
    ///
    /// Rows already in a terminal status are left untouched and reported as
    /// [`AppError::Finalized`].
    pub async fn update_delivery(&self, delivery: &Delivery) -> Result<()> {
        let id = delivery.id;
        let status = delivery.status;
        let started_at = delivery.started_at.map(timestamp);
        let completed_at = delivery.completed_at.map(timestamp);
        let file_path = delivery.file_path.clone();
        let file_size_bytes = delivery.file_size_bytes;
        let article_count = delivery.article_count;
        let error_stage = delivery.error_stage;
        let error_message = delivery.error_message.clone();

        let changed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE deliveries
                     SET status = ?2, started_at = ?3, completed_at = ?4, file_path = ?5,
                         file_size_bytes = ?6, article_count = ?7, error_stage = ?8, error_message = ?9
                     WHERE id = ?1 AND status NOT IN ('sent', 'failed', 'skipped')",
                    params![
                        id,
                        status,
                        started_at,
                        completed_at,
                        file_path,
                        file_size_bytes,
                        article_count,
                        error_stage,
                        error_message
                    ],
                )?;
                Ok(changed)
            })
            .await?;

        if changed == 0 {
            return Err(AppError::Finalized(id));
        }
        Ok(())
    }

    pub async fn get_delivery(&self, id: i64) -> Result<Option<Delivery>> {
        let delivery = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries WHERE id = ?1"
                ))?;
                let delivery = stmt.query_row(params![id], delivery_from_row).optional()?;
                Ok(delivery)
            })
            .await?;
        Ok(delivery)
    }

    /// Most recent attempts for a subscription, newest first.
    pub async fn recent_deliveries(&self, subscription_id: i64, limit: usize) -> Result<Vec<Delivery>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let deliveries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE subscription_id = ?1
                     ORDER BY created_at DESC, id DESC
                     LIMIT ?2"
                ))?;
                let deliveries = stmt
                    .query_map(params![subscription_id, limit], delivery_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(deliveries)
            })
            .await?;
        Ok(deliveries)
    }

    /// A `sent` delivery for the subscription completed at or after `since`.
    pub async fn sent_delivery_since(
        &self,
        subscription_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Option<Delivery>> {
        let since = timestamp(since);
        let delivery = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE subscription_id = ?1 AND status = ?2 AND completed_at >= ?3
                     ORDER BY completed_at DESC
                     LIMIT 1"
                ))?;
                let delivery = stmt
                    .query_row(
                        params![subscription_id, DeliveryStatus::Sent, since],
                        delivery_from_row,
                    )
                    .optional()?;
                Ok(delivery)
            })
            .await?;
        Ok(delivery)
    }

    /// Finished deliveries that still reference an artifact and completed before `cutoff`.
    pub async fn deliveries_with_artifacts_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Delivery>> {
        let cutoff = timestamp(cutoff);
        let deliveries = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {DELIVERY_COLUMNS} FROM deliveries
                     WHERE file_path IS NOT NULL AND completed_at IS NOT NULL AND completed_at < ?1
                     ORDER BY id"
                ))?;
                let deliveries = stmt
                    .query_map(params![cutoff], delivery_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(deliveries)
            })
            .await?;
        Ok(deliveries)
    }

    /// Retention is the one writer allowed to touch a finalized row.
    pub async fn clear_artifact_path(&self, id: i64) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE deliveries SET file_path = NULL WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn delete_deliveries_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let cutoff = timestamp(cutoff);
        let deleted = self
            .conn
            .call(move |conn| {
                let deleted =
                    conn.execute("DELETE FROM deliveries WHERE created_at < ?1", params![cutoff])?;
                Ok(deleted)
            })
            .await?;
        Ok(deleted)
    }

    #[cfg(test)]
    pub async fn backdate_delivery(
        &self,
        id: i64,
        created_at: DateTime<Utc>,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE deliveries SET created_at = ?1, completed_at = ?2 WHERE id = ?3",
                    params![timestamp(created_at), completed_at.map(timestamp), id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Fixed-width UTC text, so string order in SQL matches time order.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // Try RFC3339 first (e.g., "2026-01-11T12:34:56.000000Z")
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // Try SQLite datetime format (e.g., "2026-01-11 12:34:56")
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn invalid_text(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn get_datetime(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_datetime(&raw).ok_or_else(|| invalid_text(idx, format!("invalid timestamp '{raw}'")))
}

fn get_opt_datetime(row: &Row, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|raw| {
        parse_datetime(&raw).ok_or_else(|| invalid_text(idx, format!("invalid timestamp '{raw}'")))
    })
    .transpose()
}

fn user_from_row(row: &Row) -> rusqlite::Result<User> {
    let id: i64 = row.get(0)?;
    let smtp_config = row
        .get::<_, Option<String>>(5)?
        .and_then(|raw| match serde_json::from_str::<SmtpConfig>(&raw) {
            Ok(config) => Some(config),
            Err(e) => {
                tracing::warn!("User {} has unreadable SMTP settings: {}", id, e);
                None
            }
        });

    Ok(User {
        id,
        username: row.get(1)?,
        email: row.get(2)?,
        kindle_email: row.get(3)?,
        timezone: row.get(4)?,
        smtp_config,
        created_at: get_datetime(row, 6)?,
    })
}

fn subscription_from_row(row: &Row) -> rusqlite::Result<Subscription> {
    let id: i64 = row.get(0)?;

    let schedule_raw: String = row.get(6)?;
    let schedule = serde_json::from_str::<Schedule>(&schedule_raw).unwrap_or_else(|e| {
        tracing::warn!("Subscription {} has malformed schedule '{}': {}", id, schedule_raw, e);
        Schedule::Unknown
    });

    let settings_raw: String = row.get(7)?;
    let settings = serde_json::from_str::<DeliverySettings>(&settings_raw).unwrap_or_else(|e| {
        tracing::warn!("Subscription {} has malformed settings, using defaults: {}", id, e);
        DeliverySettings::default()
    });

    Ok(Subscription {
        id,
        user_id: row.get(1)?,
        kind: row.get(2)?,
        source: row.get(3)?,
        name: row.get(4)?,
        enabled: row.get(5)?,
        schedule,
        settings,
        last_run_at: get_opt_datetime(row, 8)?,
        last_status: row.get(9)?,
        last_error: row.get(10)?,
        next_run_at: get_opt_datetime(row, 11)?,
        created_at: get_datetime(row, 12)?,
        updated_at: get_datetime(row, 13)?,
    })
}

fn delivery_from_row(row: &Row) -> rusqlite::Result<Delivery> {
    Ok(Delivery {
        id: row.get(0)?,
        subscription_id: row.get(1)?,
        user_id: row.get(2)?,
        status: row.get(3)?,
        scheduled_at: get_datetime(row, 4)?,
        started_at: get_opt_datetime(row, 5)?,
        completed_at: get_opt_datetime(row, 6)?,
        file_path: row.get(7)?,
        file_size_bytes: row.get(8)?,
        article_count: row.get(9)?,
        error_stage: row.get(10)?,
        error_message: row.get(11)?,
        created_at: get_datetime(row, 12)?,
    })
}

/// Enums stored as their lowercase names.
macro_rules! text_column {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e| FromSqlError::Other(Box::new(e)))
            }
        }
    };
}

text_column!(DeliveryStatus);
text_column!(SubscriptionKind);
text_column!(RunOutcome);
