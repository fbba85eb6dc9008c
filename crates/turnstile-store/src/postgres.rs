//! Networked relational backend.
//!
//! Pooled connections via sqlx; the schema is applied at connect time so
//! callers can assume the tables exist. The extend-on-conflict statement is
//! the Postgres twin of the sqlite one (`GREATEST` instead of `MAX`), so
//! behavior is identical across backends.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool};
use tracing::info;

use turnstile_types::{Plan, PlanUpdate, Setting, Subscription, User};

use crate::error::StoreError;
use crate::{SECS_PER_DAY, Store, datetime_from_secs};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS users (
    user_id      BIGINT PRIMARY KEY,
    username     TEXT,
    display_name TEXT,
    joined_at    BIGINT NOT NULL DEFAULT (floor(extract(epoch FROM now()))::bigint)
);

CREATE TABLE IF NOT EXISTS channel_subscriptions (
    user_id      BIGINT NOT NULL,
    channel_code TEXT NOT NULL,
    expiry       BIGINT NOT NULL,
    created_at   BIGINT NOT NULL DEFAULT (floor(extract(epoch FROM now()))::bigint),
    UNIQUE (user_id, channel_code)
);

CREATE INDEX IF NOT EXISTS idx_subscriptions_user
    ON channel_subscriptions (user_id);

CREATE TABLE IF NOT EXISTS plans (
    plan_id TEXT PRIMARY KEY,
    days    INTEGER NOT NULL,
    price   INTEGER NOT NULL,
    label   TEXT NOT NULL,
    channel TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
";

pub struct PostgresStore {
    pool: PgPool,
}

#[derive(FromRow)]
struct UserRow {
    user_id: i64,
    username: Option<String>,
    display_name: Option<String>,
    joined_at: i64,
}

#[derive(FromRow)]
struct SubscriptionRow {
    channel_code: String,
    expiry: i64,
}

#[derive(FromRow)]
struct PlanRow {
    plan_id: String,
    days: i32,
    price: i32,
    label: String,
    channel: String,
}

impl PostgresStore {
    /// Connect, bounded by an acquire timeout so a dead database fails fast
    /// instead of hanging requests, and apply the schema. The URL may carry
    /// credentials and is never logged.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;

        sqlx::raw_sql(SCHEMA).execute(&pool).await?;

        info!("postgres store connected ({max_connections} max connections)");
        Ok(Self { pool })
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_user(
        &self,
        id: i64,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO users (user_id, username, display_name) VALUES ($1, $2, $3)
             ON CONFLICT (user_id) DO UPDATE SET
                 username = EXCLUDED.username,
                 display_name = EXCLUDED.display_name",
        )
        .bind(id)
        .bind(username)
        .bind(display_name)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            "SELECT user_id, username, display_name, joined_at FROM users WHERE user_id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(User {
                id: row.user_id,
                username: row.username,
                display_name: row.display_name,
                joined_at: datetime_from_secs(row.joined_at)?,
            })
        })
        .transpose()
    }

    async fn list_all_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        let ids = sqlx::query_scalar::<_, i64>("SELECT user_id FROM users ORDER BY user_id")
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }

    async fn get_expiry(
        &self,
        user_id: i64,
        channel_code: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let secs = sqlx::query_scalar::<_, i64>(
            "SELECT expiry FROM channel_subscriptions
             WHERE user_id = $1 AND channel_code = $2",
        )
        .bind(user_id)
        .bind(channel_code)
        .fetch_optional(&self.pool)
        .await?;
        secs.map(datetime_from_secs).transpose()
    }

    async fn max_expiry(&self, user_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        let secs = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(expiry) FROM channel_subscriptions WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        secs.map(datetime_from_secs).transpose()
    }

    async fn upsert_subscription(
        &self,
        user_id: i64,
        channel_code: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO channel_subscriptions (user_id, channel_code, expiry)
             VALUES ($1, $2, $3)
             ON CONFLICT (user_id, channel_code) DO UPDATE SET expiry = EXCLUDED.expiry",
        )
        .bind(user_id)
        .bind(channel_code)
        .bind(expiry.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn extend_subscription(
        &self,
        user_id: i64,
        channel_code: &str,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<DateTime<Utc>, StoreError> {
        let duration = i64::from(days) * SECS_PER_DAY;
        // Single conditional statement, evaluated server-side, so two
        // concurrent grants on the same pair both apply.
        let expiry = sqlx::query_scalar::<_, i64>(
            "INSERT INTO channel_subscriptions (user_id, channel_code, expiry, created_at)
             VALUES ($1, $2, $3 + $4, $3)
             ON CONFLICT (user_id, channel_code) DO UPDATE SET
                 expiry = GREATEST(channel_subscriptions.expiry, $3) + $4
             RETURNING expiry",
        )
        .bind(user_id)
        .bind(channel_code)
        .bind(now.timestamp())
        .bind(duration)
        .fetch_one(&self.pool)
        .await?;
        datetime_from_secs(expiry)
    }

    async fn delete_subscription(
        &self,
        user_id: i64,
        channel_code: Option<&str>,
    ) -> Result<(), StoreError> {
        match channel_code {
            Some(code) => {
                sqlx::query(
                    "DELETE FROM channel_subscriptions WHERE user_id = $1 AND channel_code = $2",
                )
                .bind(user_id)
                .bind(code)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("DELETE FROM channel_subscriptions WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(())
    }

    async fn list_active_subscriptions(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT channel_code, expiry FROM channel_subscriptions
             WHERE user_id = $1 AND expiry > $2
             ORDER BY channel_code",
        )
        .bind(user_id)
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(Subscription {
                    channel_code: row.channel_code,
                    expiry: datetime_from_secs(row.expiry)?,
                })
            })
            .collect()
    }

    async fn count_users(&self) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?)
    }

    async fn count_active_distinct_users(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(DISTINCT user_id) FROM channel_subscriptions WHERE expiry > $1",
        )
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn count_active_by_channel(
        &self,
        channel_code: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        Ok(sqlx::query_scalar(
            "SELECT COUNT(*) FROM channel_subscriptions
             WHERE channel_code = $1 AND expiry > $2",
        )
        .bind(channel_code)
        .bind(now.timestamp())
        .fetch_one(&self.pool)
        .await?)
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        let row = sqlx::query_as::<_, PlanRow>(
            "SELECT plan_id, days, price, label, channel FROM plans WHERE plan_id = $1",
        )
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(plan_from_row))
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        let rows = sqlx::query_as::<_, PlanRow>(
            "SELECT plan_id, days, price, label, channel FROM plans ORDER BY plan_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(plan_from_row).collect())
    }

    async fn seed_plans(&self, seed: &[Plan]) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM plans")
            .fetch_one(&mut *tx)
            .await?;
        if count > 0 {
            return Ok(false);
        }
        for plan in seed {
            sqlx::query(
                "INSERT INTO plans (plan_id, days, price, label, channel)
                 VALUES ($1, $2, $3, $4, $5)
                 ON CONFLICT (plan_id) DO NOTHING",
            )
            .bind(&plan.plan_id)
            .bind(plan.days as i32)
            .bind(plan.price as i32)
            .bind(&plan.label)
            .bind(&plan.channel)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(true)
    }

    async fn update_plan(&self, plan_id: &str, update: &PlanUpdate) -> Result<bool, StoreError> {
        let exists = sqlx::query_scalar::<_, i32>("SELECT 1 FROM plans WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await?;
        if exists.is_none() {
            return Ok(false);
        }
        if update.is_empty() {
            return Ok(true);
        }

        let mut sets: Vec<String> = Vec::new();
        let mut position = 1;
        if update.days.is_some() {
            sets.push(format!("days = ${position}"));
            position += 1;
        }
        if update.price.is_some() {
            sets.push(format!("price = ${position}"));
            position += 1;
        }
        if update.label.is_some() {
            sets.push(format!("label = ${position}"));
            position += 1;
        }
        let sql = format!(
            "UPDATE plans SET {} WHERE plan_id = ${position}",
            sets.join(", ")
        );

        let mut query = sqlx::query(&sql);
        if let Some(days) = update.days {
            query = query.bind(days as i32);
        }
        if let Some(price) = update.price {
            query = query.bind(price as i32);
        }
        if let Some(ref label) = update.label {
            query = query.bind(label.as_str());
        }
        query.bind(plan_id).execute(&self.pool).await?;
        Ok(true)
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        let value = sqlx::query_scalar("SELECT value FROM settings WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_settings(&self) -> Result<Vec<Setting>, StoreError> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT key, value FROM settings ORDER BY key")
                .fetch_all(&self.pool)
                .await?;
        Ok(rows
            .into_iter()
            .map(|(key, value)| Setting { key, value })
            .collect())
    }

    async fn seed_settings(&self, defaults: &[(String, String)]) -> Result<(), StoreError> {
        for (key, value) in defaults {
            sqlx::query(
                "INSERT INTO settings (key, value) VALUES ($1, $2)
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}

fn plan_from_row(row: PlanRow) -> Plan {
    Plan {
        plan_id: row.plan_id,
        days: row.days as u32,
        price: row.price as u32,
        label: row.label,
        channel: row.channel,
    }
}
