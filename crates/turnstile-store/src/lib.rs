pub mod error;
pub mod postgres;
pub mod sqlite;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use turnstile_types::{Plan, PlanUpdate, Setting, Subscription, User};

pub use error::StoreError;
pub use postgres::PostgresStore;
pub use sqlite::SqliteStore;

/// Backend selection, decided once at startup.
#[derive(Debug, Clone)]
pub enum StoreConfig {
    /// Embedded file-based store.
    Sqlite { path: PathBuf },
    /// Networked relational store.
    Postgres { url: String, max_connections: u32 },
}

/// Open the configured backend and run its migrations.
pub async fn open(config: &StoreConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config {
        StoreConfig::Sqlite { path } => Ok(Arc::new(SqliteStore::open(path)?)),
        StoreConfig::Postgres {
            url,
            max_connections,
        } => Ok(Arc::new(PostgresStore::connect(url, *max_connections).await?)),
    }
}

/// Durable storage contract for users, subscriptions, plans and settings.
///
/// Every operation is atomic with respect to a single logical row; no
/// cross-row transactions are required. Callers must see identical behavior
/// from both backends.
///
/// All instants cross this boundary as `DateTime<Utc>` and are persisted as
/// unix epoch seconds, which keeps the extend-on-conflict arithmetic a single
/// portable SQL expression.
#[async_trait]
pub trait Store: Send + Sync {
    // -- Users --

    /// Insert the user if absent, else overwrite username/display name
    /// (including overwriting with `None`). `joined_at` is set on first
    /// insert and preserved after that.
    async fn upsert_user(
        &self,
        id: i64,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError>;

    async fn list_all_user_ids(&self) -> Result<Vec<i64>, StoreError>;

    // -- Subscriptions --

    /// Stored expiry for the pair, whether or not it has lapsed.
    async fn get_expiry(
        &self,
        user_id: i64,
        channel_code: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Latest expiry across all of the user's channels, lapsed or not.
    async fn max_expiry(&self, user_id: i64) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Insert-or-replace the single row for the pair.
    async fn upsert_subscription(
        &self,
        user_id: i64,
        channel_code: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Additive grant as one conditional statement: the new expiry is
    /// `max(current expiry, now) + days`, computed inside the database so
    /// concurrent grants on the same pair cannot lose updates. Returns the
    /// new expiry.
    async fn extend_subscription(
        &self,
        user_id: i64,
        channel_code: &str,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<DateTime<Utc>, StoreError>;

    /// Delete one row if a channel is given, else all rows for the user.
    /// Not an error if nothing existed.
    async fn delete_subscription(
        &self,
        user_id: i64,
        channel_code: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Rows with `expiry > now`, ordered by channel code.
    async fn list_active_subscriptions(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError>;

    // -- Aggregates --

    async fn count_users(&self) -> Result<i64, StoreError>;

    async fn count_active_distinct_users(&self, now: DateTime<Utc>) -> Result<i64, StoreError>;

    async fn count_active_by_channel(
        &self,
        channel_code: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError>;

    // -- Plans --

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError>;

    /// All plans, ordered by plan id.
    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError>;

    /// Insert the seed plans only if the plans table is empty (whole-table
    /// guard, so administrator edits survive restarts). Returns whether
    /// anything was seeded.
    async fn seed_plans(&self, seed: &[Plan]) -> Result<bool, StoreError>;

    /// Apply only the provided fields. Returns false if the plan id is
    /// unknown; an update with no fields is a no-op success.
    async fn update_plan(&self, plan_id: &str, update: &PlanUpdate) -> Result<bool, StoreError>;

    // -- Settings --

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// All settings, ordered by key.
    async fn list_settings(&self) -> Result<Vec<Setting>, StoreError>;

    /// Insert each default only if its key is absent.
    async fn seed_settings(&self, defaults: &[(String, String)]) -> Result<(), StoreError>;

    // -- Health --

    async fn ping(&self) -> Result<(), StoreError>;

    fn backend_name(&self) -> &'static str;
}

pub(crate) fn datetime_from_secs(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Unexpected(anyhow::anyhow!("timestamp out of range: {secs}")))
}

pub(crate) const SECS_PER_DAY: i64 = 86_400;
