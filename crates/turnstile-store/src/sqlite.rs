//! Embedded file-based backend.
//!
//! Single connection behind a mutex, WAL mode for concurrent readers.
//! All entitlement mutations are single statements, so the mutex is only
//! serializing statement execution, never a read-modify-write window.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, ToSql, params};
use tracing::info;

use turnstile_types::{Plan, PlanUpdate, Setting, Subscription, User};

use crate::error::StoreError;
use crate::{SECS_PER_DAY, Store, datetime_from_secs};

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        migrate(&conn)?;

        info!("sqlite store opened at {}", path.display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests and throwaway environments.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError>,
    {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| StoreError::Unexpected(anyhow::anyhow!("db lock poisoned: {e}")))?;
        f(&mut conn)
    }
}

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            user_id      INTEGER PRIMARY KEY,
            username     TEXT,
            display_name TEXT,
            joined_at    INTEGER NOT NULL DEFAULT (unixepoch())
        );

        CREATE TABLE IF NOT EXISTS channel_subscriptions (
            user_id      INTEGER NOT NULL,
            channel_code TEXT NOT NULL,
            expiry       INTEGER NOT NULL,
            created_at   INTEGER NOT NULL DEFAULT (unixepoch()),
            UNIQUE(user_id, channel_code)
        );

        CREATE INDEX IF NOT EXISTS idx_subscriptions_user
            ON channel_subscriptions(user_id);

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
        ",
    )?;
    Ok(())
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_user(
        &self,
        id: i64,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (user_id, username, display_name) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                     username = excluded.username,
                     display_name = excluded.display_name",
                params![id, username, display_name],
            )?;
            Ok(())
        })
    }

    async fn get_user(&self, id: i64) -> Result<Option<User>, StoreError> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT user_id, username, display_name, joined_at
                     FROM users WHERE user_id = ?1",
                    [id],
                    |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, Option<String>>(2)?,
                            row.get::<_, i64>(3)?,
                        ))
                    },
                )
                .optional()?;

            row.map(|(id, username, display_name, joined_at)| {
                Ok(User {
                    id,
                    username,
                    display_name,
                    joined_at: datetime_from_secs(joined_at)?,
                })
            })
            .transpose()
        })
    }

    async fn list_all_user_ids(&self) -> Result<Vec<i64>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT user_id FROM users ORDER BY user_id")?;
            let ids = stmt
                .query_map([], |row| row.get(0))?
                .collect::<Result<Vec<i64>, _>>()?;
            Ok(ids)
        })
    }

    async fn get_expiry(
        &self,
        user_id: i64,
        channel_code: &str,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_conn(|conn| {
            let secs: Option<i64> = conn
                .query_row(
                    "SELECT expiry FROM channel_subscriptions
                     WHERE user_id = ?1 AND channel_code = ?2",
                    params![user_id, channel_code],
                    |row| row.get(0),
                )
                .optional()?;
            secs.map(datetime_from_secs).transpose()
        })
    }

    async fn max_expiry(&self, user_id: i64) -> Result<Option<DateTime<Utc>>, StoreError> {
        self.with_conn(|conn| {
            let secs: Option<i64> = conn.query_row(
                "SELECT MAX(expiry) FROM channel_subscriptions WHERE user_id = ?1",
                [user_id],
                |row| row.get(0),
            )?;
            secs.map(datetime_from_secs).transpose()
        })
    }

    async fn upsert_subscription(
        &self,
        user_id: i64,
        channel_code: &str,
        expiry: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channel_subscriptions (user_id, channel_code, expiry)
                 VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id, channel_code) DO UPDATE SET expiry = excluded.expiry",
                params![user_id, channel_code, expiry.timestamp()],
            )?;
            Ok(())
        })
    }

    async fn extend_subscription(
        &self,
        user_id: i64,
        channel_code: &str,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<DateTime<Utc>, StoreError> {
        let now_secs = now.timestamp();
        let duration = i64::from(days) * SECS_PER_DAY;
        self.with_conn(|conn| {
            // One conditional statement: a lapsed expiry restarts from now,
            // an active one is extended, and concurrent grants both apply.
            let expiry: i64 = conn.query_row(
                "INSERT INTO channel_subscriptions (user_id, channel_code, expiry, created_at)
                 VALUES (?1, ?2, ?3 + ?4, ?3)
                 ON CONFLICT(user_id, channel_code) DO UPDATE SET
                     expiry = MAX(expiry, ?3) + ?4
                 RETURNING expiry",
                params![user_id, channel_code, now_secs, duration],
                |row| row.get(0),
            )?;
            datetime_from_secs(expiry)
        })
    }

    async fn delete_subscription(
        &self,
        user_id: i64,
        channel_code: Option<&str>,
    ) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            match channel_code {
                Some(code) => conn.execute(
                    "DELETE FROM channel_subscriptions WHERE user_id = ?1 AND channel_code = ?2",
                    params![user_id, code],
                )?,
                None => conn.execute(
                    "DELETE FROM channel_subscriptions WHERE user_id = ?1",
                    [user_id],
                )?,
            };
            Ok(())
        })
    }

    async fn list_active_subscriptions(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<Subscription>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT channel_code, expiry FROM channel_subscriptions
                 WHERE user_id = ?1 AND expiry > ?2
                 ORDER BY channel_code",
            )?;
            let rows = stmt
                .query_map(params![user_id, now.timestamp()], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            rows.into_iter()
                .map(|(channel_code, expiry)| {
                    Ok(Subscription {
                        channel_code,
                        expiry: datetime_from_secs(expiry)?,
                    })
                })
                .collect()
        })
    }

    async fn count_users(&self) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?)
        })
    }

    async fn count_active_distinct_users(&self, now: DateTime<Utc>) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(DISTINCT user_id) FROM channel_subscriptions WHERE expiry > ?1",
                [now.timestamp()],
                |row| row.get(0),
            )?)
        })
    }

    async fn count_active_by_channel(
        &self,
        channel_code: &str,
        now: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        self.with_conn(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM channel_subscriptions
                 WHERE channel_code = ?1 AND expiry > ?2",
                params![channel_code, now.timestamp()],
                |row| row.get(0),
            )?)
        })
    }

    async fn get_plan(&self, plan_id: &str) -> Result<Option<Plan>, StoreError> {
        self.with_conn(|conn| {
            let plan = conn
                .query_row(
                    "SELECT plan_id, days, price, label, channel FROM plans WHERE plan_id = ?1",
                    [plan_id],
                    plan_from_row,
                )
                .optional()?;
            Ok(plan)
        })
    }

    async fn list_plans(&self) -> Result<Vec<Plan>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT plan_id, days, price, label, channel FROM plans ORDER BY plan_id",
            )?;
            let plans = stmt
                .query_map([], plan_from_row)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(plans)
        })
    }

    async fn seed_plans(&self, seed: &[Plan]) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let count: i64 = tx.query_row("SELECT COUNT(*) FROM plans", [], |row| row.get(0))?;
            if count > 0 {
                return Ok(false);
            }
            for plan in seed {
                tx.execute(
                    "INSERT INTO plans (plan_id, days, price, label, channel)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(plan_id) DO NOTHING",
                    params![
                        plan.plan_id,
                        i64::from(plan.days),
                        i64::from(plan.price),
                        plan.label,
                        plan.channel
                    ],
                )?;
            }
            tx.commit()?;
            Ok(true)
        })
    }

    async fn update_plan(&self, plan_id: &str, update: &PlanUpdate) -> Result<bool, StoreError> {
        self.with_conn(|conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT 1 FROM plans WHERE plan_id = ?1", [plan_id], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_none() {
                return Ok(false);
            }
            if update.is_empty() {
                return Ok(true);
            }

            let days = update.days.map(i64::from);
            let price = update.price.map(i64::from);
            let id = plan_id.to_string();

            let mut sets: Vec<&str> = Vec::new();
            let mut args: Vec<&dyn ToSql> = Vec::new();
            if let Some(ref days) = days {
                sets.push("days = ?");
                args.push(days);
            }
            if let Some(ref price) = price {
                sets.push("price = ?");
                args.push(price);
            }
            if let Some(ref label) = update.label {
                sets.push("label = ?");
                args.push(label);
            }
            args.push(&id);

            let sql = format!("UPDATE plans SET {} WHERE plan_id = ?", sets.join(", "));
            conn.execute(&sql, args.as_slice())?;
            Ok(true)
        })
    }

    async fn get_setting(&self, key: &str) -> Result<Option<String>, StoreError> {
        self.with_conn(|conn| {
            let value = conn
                .query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| {
                    row.get(0)
                })
                .optional()?;
            Ok(value)
        })
    }

    async fn set_setting(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }

    async fn list_settings(&self) -> Result<Vec<Setting>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT key, value FROM settings ORDER BY key")?;
            let settings = stmt
                .query_map([], |row| {
                    Ok(Setting {
                        key: row.get(0)?,
                        value: row.get(1)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(settings)
        })
    }

    async fn seed_settings(&self, defaults: &[(String, String)]) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            for (key, value) in defaults {
                conn.execute(
                    "INSERT INTO settings (key, value) VALUES (?1, ?2)
                     ON CONFLICT(key) DO NOTHING",
                    params![key, value],
                )?;
            }
            Ok(())
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |_| Ok(()))?;
            Ok(())
        })
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}

fn plan_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Plan> {
    Ok(Plan {
        plan_id: row.get(0)?,
        days: row.get::<_, i64>(1)? as u32,
        price: row.get::<_, i64>(2)? as u32,
        label: row.get(3)?,
        channel: row.get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn store() -> SqliteStore {
        SqliteStore::open_in_memory().unwrap()
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()
    }

    fn plan(id: &str, days: u32, price: u32, channel: &str) -> Plan {
        Plan {
            plan_id: id.to_string(),
            days,
            price,
            label: format!("{days} Days"),
            channel: channel.to_string(),
        }
    }

    #[tokio::test]
    async fn upsert_user_refreshes_metadata() {
        let store = store();
        store.upsert_user(7, Some("old"), None).await.unwrap();
        store
            .upsert_user(7, Some("new"), Some("New Name"))
            .await
            .unwrap();

        let user = store.get_user(7).await.unwrap().unwrap();
        assert_eq!(user.username.as_deref(), Some("new"));
        assert_eq!(user.display_name.as_deref(), Some("New Name"));
        assert_eq!(store.count_users().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn upsert_user_can_clear_metadata() {
        let store = store();
        store
            .upsert_user(7, Some("name"), Some("Display"))
            .await
            .unwrap();
        store.upsert_user(7, None, None).await.unwrap();

        let user = store.get_user(7).await.unwrap().unwrap();
        assert_eq!(user.username, None);
        assert_eq!(user.display_name, None);
    }

    #[tokio::test]
    async fn missing_user_is_none() {
        let store = store();
        assert!(store.get_user(42).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn extension_is_additive() {
        let store = store();
        let now = now();

        let first = store.extend_subscription(1, "ch1", now, 7).await.unwrap();
        assert_eq!(first, now + Duration::days(7));

        let second = store.extend_subscription(1, "ch1", now, 5).await.unwrap();
        assert_eq!(second, now + Duration::days(12));
    }

    #[tokio::test]
    async fn lapsed_grant_restarts_from_now() {
        let store = store();
        let now = now();
        store
            .upsert_subscription(1, "ch1", now - Duration::days(1))
            .await
            .unwrap();

        let expiry = store.extend_subscription(1, "ch1", now, 10).await.unwrap();
        assert_eq!(expiry, now + Duration::days(10));
    }

    #[tokio::test]
    async fn expiry_tie_is_inactive() {
        let store = store();
        let now = now();
        store.upsert_subscription(1, "ch1", now).await.unwrap();

        assert!(
            store
                .list_active_subscriptions(1, now)
                .await
                .unwrap()
                .is_empty()
        );
        assert_eq!(store.count_active_by_channel("ch1", now).await.unwrap(), 0);
        // The stored row is still there.
        assert_eq!(store.get_expiry(1, "ch1").await.unwrap(), Some(now));
    }

    #[tokio::test]
    async fn delete_scopes_to_one_channel_or_all() {
        let store = store();
        let now = now();
        store.extend_subscription(1, "ch1", now, 7).await.unwrap();
        store.extend_subscription(1, "ch2", now, 7).await.unwrap();

        store.delete_subscription(1, Some("ch1")).await.unwrap();
        let remaining = store.list_active_subscriptions(1, now).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].channel_code, "ch2");

        store.delete_subscription(1, None).await.unwrap();
        assert!(
            store
                .list_active_subscriptions(1, now)
                .await
                .unwrap()
                .is_empty()
        );
        // Deleting again is not an error.
        store.delete_subscription(1, None).await.unwrap();
    }

    #[tokio::test]
    async fn active_subscriptions_are_ordered_by_channel() {
        let store = store();
        let now = now();
        store.extend_subscription(1, "ch3", now, 7).await.unwrap();
        store.extend_subscription(1, "ch1", now, 7).await.unwrap();

        let subs = store.list_active_subscriptions(1, now).await.unwrap();
        let codes: Vec<_> = subs.iter().map(|s| s.channel_code.as_str()).collect();
        assert_eq!(codes, vec!["ch1", "ch3"]);
    }

    #[tokio::test]
    async fn max_expiry_spans_channels() {
        let store = store();
        let now = now();
        store.extend_subscription(1, "ch1", now, 7).await.unwrap();
        store.extend_subscription(1, "ch2", now, 30).await.unwrap();

        assert_eq!(
            store.max_expiry(1).await.unwrap(),
            Some(now + Duration::days(30))
        );
        assert_eq!(store.max_expiry(2).await.unwrap(), None);
    }

    #[tokio::test]
    async fn aggregate_counts_line_up() {
        let store = store();
        let now = now();
        for id in [1, 2, 3] {
            store.upsert_user(id, None, None).await.unwrap();
        }
        store.extend_subscription(1, "ch1", now, 7).await.unwrap();
        store.extend_subscription(1, "ch2", now, 7).await.unwrap();
        store.extend_subscription(2, "ch1", now, 7).await.unwrap();

        assert_eq!(store.count_users().await.unwrap(), 3);
        assert_eq!(store.count_active_distinct_users(now).await.unwrap(), 2);
        assert_eq!(store.count_active_by_channel("ch1", now).await.unwrap(), 2);
        assert_eq!(store.count_active_by_channel("ch2", now).await.unwrap(), 1);
        assert_eq!(store.list_all_user_ids().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn seed_guard_preserves_admin_edits() {
        let store = store();
        let seed = vec![plan("ch1_7_days", 7, 299, "ch1")];

        assert!(store.seed_plans(&seed).await.unwrap());
        let update = PlanUpdate {
            price: Some(199),
            ..Default::default()
        };
        assert!(store.update_plan("ch1_7_days", &update).await.unwrap());

        // Second seeding is a no-op and must not revert the edit.
        assert!(!store.seed_plans(&seed).await.unwrap());
        let plan = store.get_plan("ch1_7_days").await.unwrap().unwrap();
        assert_eq!(plan.price, 199);
    }

    #[tokio::test]
    async fn update_plan_applies_only_provided_fields() {
        let store = store();
        store
            .seed_plans(&[plan("ch1_7_days", 7, 299, "ch1")])
            .await
            .unwrap();

        let update = PlanUpdate {
            price: Some(249),
            ..Default::default()
        };
        assert!(store.update_plan("ch1_7_days", &update).await.unwrap());

        let updated = store.get_plan("ch1_7_days").await.unwrap().unwrap();
        assert_eq!(updated.price, 249);
        assert_eq!(updated.days, 7);
        assert_eq!(updated.label, "7 Days");
    }

    #[tokio::test]
    async fn update_unknown_plan_is_false_and_mutates_nothing() {
        let store = store();
        store
            .seed_plans(&[plan("ch1_7_days", 7, 299, "ch1")])
            .await
            .unwrap();

        let update = PlanUpdate {
            price: Some(1),
            ..Default::default()
        };
        assert!(!store.update_plan("nope", &update).await.unwrap());
        let untouched = store.get_plan("ch1_7_days").await.unwrap().unwrap();
        assert_eq!(untouched.price, 299);
    }

    #[tokio::test]
    async fn empty_update_is_noop_success() {
        let store = store();
        store
            .seed_plans(&[plan("ch1_7_days", 7, 299, "ch1")])
            .await
            .unwrap();
        assert!(
            store
                .update_plan("ch1_7_days", &PlanUpdate::default())
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn settings_roundtrip_and_seed_if_absent() {
        let store = store();
        assert_eq!(store.get_setting("upi_id").await.unwrap(), None);

        store.set_setting("upi_id", "pay@bank").await.unwrap();
        assert_eq!(
            store.get_setting("upi_id").await.unwrap().as_deref(),
            Some("pay@bank")
        );

        // Seeding never overwrites an existing key.
        store
            .seed_settings(&[
                ("upi_id".to_string(), "default@bank".to_string()),
                ("admin_username".to_string(), "admin".to_string()),
            ])
            .await
            .unwrap();
        assert_eq!(
            store.get_setting("upi_id").await.unwrap().as_deref(),
            Some("pay@bank")
        );
        assert_eq!(
            store.get_setting("admin_username").await.unwrap().as_deref(),
            Some("admin")
        );

        let all = store.list_settings().await.unwrap();
        let keys: Vec<_> = all.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["admin_username", "upi_id"]);
    }
}
