//! Database repository for users, devices and consumption samples.
//!
//! All SQLite read/write logic lives here. The poller writes samples
//! through the [`SampleSink`] trait; the energy service reads devices and
//! aggregates consumption for charts.
//!
//! Consumption samples are append-only: nothing in this crate updates or
//! deletes them. Timestamps are stored as RFC 3339 strings.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

use crate::models::{ConsumptionSample, DeviceRecord, User};

#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The write violated a uniqueness rule. Carries a user-facing message.
    #[error("{0}")]
    Declined(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Anything able to persist a consumption sample.
#[async_trait]
pub trait SampleSink: Send + Sync {
    async fn record_sample(&self, sample: &ConsumptionSample) -> Result<(), RepositoryError>;
}

/// Per-user figures used to personalise outgoing mail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserStats {
    pub days_active: i64,
    pub connected_devices: i64,
    pub estimated_savings_pct: i64,
    pub co2_reduced_kg: i64,
    pub monthly_kwh: f64,
}

impl Default for UserStats {
    fn default() -> Self {
        Self {
            days_active: 1,
            connected_devices: 0,
            estimated_savings_pct: 15,
            co2_reduced_kg: 5,
            monthly_kwh: 0.0,
        }
    }
}

/// Repository for reading and writing EnerVirgil data to SQLite.
#[derive(Clone)]
pub struct EnergyRepository {
    pool: SqlitePool,
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

fn user_from_row(row: &SqliteRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        full_name: row.try_get("full_name")?,
        email: row.try_get("email")?,
        receipt_number: row.try_get("receipt_number")?,
        created_at: row.try_get("created_at")?,
    })
}

fn device_from_row(row: &SqliteRow) -> Result<DeviceRecord, sqlx::Error> {
    Ok(DeviceRecord {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        name: row.try_get("name")?,
        ip_address: row.try_get("ip_address")?,
        created_at: row.try_get("created_at")?,
    })
}

fn sample_from_row(row: &SqliteRow) -> Result<ConsumptionSample, sqlx::Error> {
    let timestamp: String = row.try_get("timestamp")?;
    let timestamp = DateTime::parse_from_rfc3339(&timestamp)
        .map_err(|err| sqlx::Error::Decode(Box::new(err)))?
        .with_timezone(&Utc);

    Ok(ConsumptionSample {
        user_id: row.try_get("user_id")?,
        device_id: row.try_get("device_id")?,
        consumption_kwh: row.try_get("consumption_kwh")?,
        timestamp,
    })
}

impl EnergyRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    // ---- Users ----

    /// Insert a user. Returns the new row id.
    pub async fn insert_user(
        &self,
        username: &str,
        full_name: &str,
        email: Option<&str>,
        receipt_number: &str,
    ) -> Result<i64, RepositoryError> {
        let result = sqlx::query(
            "INSERT INTO users (username, full_name, email, receipt_number, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(username)
        .bind(full_name)
        .bind(email)
        .bind(receipt_number)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                RepositoryError::Declined("Username or receipt number already registered.".into())
            } else {
                RepositoryError::Database(err)
            }
        })?;

        Ok(result.last_insert_rowid())
    }

    pub async fn user_by_receipt(&self, receipt_number: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, username, full_name, email, receipt_number, created_at
             FROM users WHERE receipt_number = ?",
        )
        .bind(receipt_number)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    pub async fn user_by_id(&self, user_id: i64) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, username, full_name, email, receipt_number, created_at
             FROM users WHERE id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(user_from_row).transpose()?)
    }

    // ---- Devices ----

    /// Register a plug for a user. A second plug with the same IP is declined.
    pub async fn insert_device(
        &self,
        user_id: i64,
        name: &str,
        ip_address: &str,
    ) -> Result<i64, RepositoryError> {
        let created_at = Utc::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let result = sqlx::query(
            "INSERT INTO devices (user_id, name, ip_address, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(user_id)
        .bind(name)
        .bind(ip_address)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|err| {
            if is_unique_violation(&err) {
                RepositoryError::Declined("This IP address is already registered.".into())
            } else {
                RepositoryError::Database(err)
            }
        })?;

        Ok(result.last_insert_rowid())
    }

    pub async fn devices_for_user(&self, user_id: i64) -> Result<Vec<DeviceRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, name, ip_address, created_at
             FROM devices WHERE user_id = ? ORDER BY id ASC",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(device_from_row).collect::<Result<_, _>>()?)
    }

    /// Every registered device, used by the background sampler.
    pub async fn all_devices(&self) -> Result<Vec<DeviceRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT id, user_id, name, ip_address, created_at FROM devices ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(device_from_row).collect::<Result<_, _>>()?)
    }

    pub async fn device_by_id(&self, device_id: i64) -> Result<Option<DeviceRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, name, ip_address, created_at FROM devices WHERE id = ?",
        )
        .bind(device_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(device_from_row).transpose()?)
    }

    /// Like [`device_by_id`](Self::device_by_id) but only when owned by `user_id`.
    pub async fn device_for_user(
        &self,
        device_id: i64,
        user_id: i64,
    ) -> Result<Option<DeviceRecord>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, user_id, name, ip_address, created_at
             FROM devices WHERE id = ? AND user_id = ?",
        )
        .bind(device_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(device_from_row).transpose()?)
    }

    /// Returns `true` if a row owned by `user_id` was deleted.
    pub async fn delete_device(&self, device_id: i64, user_id: i64) -> Result<bool, RepositoryError> {
        let result = sqlx::query("DELETE FROM devices WHERE id = ? AND user_id = ?")
            .bind(device_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    // ---- Consumption ----

    pub async fn insert_sample(&self, sample: &ConsumptionSample) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO consumption (user_id, device_id, consumption_kwh, timestamp)
             VALUES (?, ?, ?, ?)",
        )
        .bind(sample.user_id)
        .bind(sample.device_id)
        .bind(sample.consumption_kwh)
        .bind(sample.timestamp.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Sum of a user's samples with `from <= timestamp < to`.
    pub async fn sum_consumption_between(
        &self,
        user_id: i64,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<f64, RepositoryError> {
        let row = sqlx::query(
            "SELECT COALESCE(SUM(consumption_kwh), 0.0) AS total
             FROM consumption
             WHERE user_id = ? AND timestamp >= ? AND timestamp < ?",
        )
        .bind(user_id)
        .bind(from.to_rfc3339())
        .bind(to.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("total")?)
    }

    /// Most recent samples for a device, newest first.
    pub async fn recent_samples(
        &self,
        device_id: i64,
        limit: i64,
    ) -> Result<Vec<ConsumptionSample>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT user_id, device_id, consumption_kwh, timestamp
             FROM consumption
             WHERE device_id = ?
             ORDER BY timestamp DESC
             LIMIT ?",
        )
        .bind(device_id)
        .bind(limit.clamp(1, 500))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(sample_from_row).collect::<Result<_, _>>()?)
    }

    /// Figures for the welcome mail: account age, device count, last 30
    /// days of consumption and derived savings / CO2 estimates.
    pub async fn user_stats(&self, user_id: i64) -> Result<UserStats, RepositoryError> {
        let now = Utc::now();

        let days_active = match self.user_by_id(user_id).await? {
            Some(user) => DateTime::parse_from_rfc3339(&user.created_at)
                .map(|created| (now - created.with_timezone(&Utc)).num_days().max(1))
                .unwrap_or(1),
            None => 1,
        };

        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM devices WHERE user_id = ?")
            .bind(user_id)
            .fetch_one(&self.pool)
            .await?;
        let connected_devices: i64 = row.try_get("cnt")?;

        let monthly_kwh = self
            .sum_consumption_between(user_id, now - chrono::Duration::days(30), now)
            .await?;

        let estimated_savings_pct = (25 + connected_devices * 3).clamp(5, 35);
        let co2_reduced_kg =
            ((monthly_kwh * 0.5 * (estimated_savings_pct as f64 / 100.0)) as i64).max(1);

        Ok(UserStats {
            days_active,
            connected_devices,
            estimated_savings_pct,
            co2_reduced_kg,
            monthly_kwh: crate::models::round_to(monthly_kwh, 2),
        })
    }
}

#[async_trait]
impl SampleSink for EnergyRepository {
    async fn record_sample(&self, sample: &ConsumptionSample) -> Result<(), RepositoryError> {
        self.insert_sample(sample).await
    }
}
