//! Plan and settings registry: the administrator-mutable configuration the
//! engine's callers consult.
//!
//! Reads hand out explicit values (or a whole [`ConfigSnapshot`]) instead of
//! mutating process-wide state, so concurrent requests never observe a
//! half-applied administrative edit.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info};

use turnstile_store::Store;
use turnstile_types::{Plan, PlanUpdate, Setting};

use crate::EngineError;

pub struct Registry {
    store: Arc<dyn Store>,
}

impl Registry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Seed startup defaults. Plans are guarded by a whole-table check so a
    /// restart never reverts administrator edits; settings are inserted
    /// per key only where absent.
    pub async fn seed_defaults(
        &self,
        plans: &[Plan],
        settings: &[(String, String)],
    ) -> Result<(), EngineError> {
        for plan in plans {
            validate_plan_fields(Some(plan.days), Some(plan.price))?;
        }

        if self.store.seed_plans(plans).await? {
            info!("seeded {} default plans", plans.len());
        } else {
            debug!("plans already present, seed skipped");
        }
        self.store.seed_settings(settings).await?;
        Ok(())
    }

    pub async fn plan(&self, plan_id: &str) -> Result<Option<Plan>, EngineError> {
        Ok(self.store.get_plan(plan_id).await?)
    }

    /// A plan that must exist, e.g. one the user just selected from a menu.
    pub async fn require_plan(&self, plan_id: &str) -> Result<Plan, EngineError> {
        self.store
            .get_plan(plan_id)
            .await?
            .ok_or(EngineError::NotFound("plan"))
    }

    pub async fn plans(&self) -> Result<Vec<Plan>, EngineError> {
        Ok(self.store.list_plans().await?)
    }

    /// Plans targeting one channel code, partitioned by the explicit
    /// `channel` column. Plan ids stay opaque.
    pub async fn plans_for_channel(&self, channel: &str) -> Result<Vec<Plan>, EngineError> {
        let plans = self.store.list_plans().await?;
        Ok(plans.into_iter().filter(|p| p.channel == channel).collect())
    }

    /// Apply an administrative edit. Provided days/price must be positive;
    /// validation happens before any store mutation. Returns false for an
    /// unknown plan id.
    pub async fn update_plan(
        &self,
        plan_id: &str,
        update: &PlanUpdate,
    ) -> Result<bool, EngineError> {
        validate_plan_fields(update.days, update.price)?;
        let updated = self.store.update_plan(plan_id, update).await?;
        if updated {
            info!("plan {plan_id} updated");
        }
        Ok(updated)
    }

    pub async fn setting(&self, key: &str, default: &str) -> Result<String, EngineError> {
        Ok(self
            .store
            .get_setting(key)
            .await?
            .unwrap_or_else(|| default.to_string()))
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<(), EngineError> {
        self.store.set_setting(key, value).await?;
        info!("setting {key} updated");
        Ok(())
    }

    pub async fn settings(&self) -> Result<Vec<Setting>, EngineError> {
        Ok(self.store.list_settings().await?)
    }

    /// A point-in-time copy of all plans and settings for rendering code.
    pub async fn snapshot(&self) -> Result<ConfigSnapshot, EngineError> {
        let plans = self.store.list_plans().await?;
        let settings = self
            .store
            .list_settings()
            .await?
            .into_iter()
            .map(|s| (s.key, s.value))
            .collect();
        Ok(ConfigSnapshot { plans, settings })
    }
}

fn validate_plan_fields(days: Option<u32>, price: Option<u32>) -> Result<(), EngineError> {
    if days == Some(0) {
        return Err(EngineError::InvalidArgument("days must be positive".into()));
    }
    if price == Some(0) {
        return Err(EngineError::InvalidArgument("price must be positive".into()));
    }
    Ok(())
}

/// Immutable view of the registry at one instant. Passed by value to
/// rendering code; a later administrative edit produces a new snapshot
/// rather than mutating this one.
#[derive(Debug, Clone)]
pub struct ConfigSnapshot {
    pub plans: Vec<Plan>,
    pub settings: BTreeMap<String, String>,
}

impl ConfigSnapshot {
    pub fn plan(&self, plan_id: &str) -> Option<&Plan> {
        self.plans.iter().find(|p| p.plan_id == plan_id)
    }

    pub fn plans_for_channel(&self, channel: &str) -> Vec<&Plan> {
        self.plans.iter().filter(|p| p.channel == channel).collect()
    }

    pub fn setting<'a>(&'a self, key: &str, default: &'a str) -> &'a str {
        self.settings.get(key).map(String::as_str).unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnstile_store::SqliteStore;

    fn registry() -> Registry {
        Registry::new(Arc::new(SqliteStore::open_in_memory().unwrap()))
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

    fn seed() -> Vec<Plan> {
        vec![
            plan("ch1_7_days", 7, 299, "ch1"),
            plan("ch1_30_days", 30, 650, "ch1"),
            plan("ch2_7_days", 7, 149, "ch2"),
            plan("all_30_days", 30, 899, "all"),
        ]
    }

    #[tokio::test]
    async fn reseeding_preserves_admin_edits() {
        let registry = registry();
        registry.seed_defaults(&seed(), &[]).await.unwrap();

        let update = PlanUpdate {
            price: Some(550),
            ..Default::default()
        };
        assert!(registry.update_plan("ch1_30_days", &update).await.unwrap());

        registry.seed_defaults(&seed(), &[]).await.unwrap();
        let plan = registry.require_plan("ch1_30_days").await.unwrap();
        assert_eq!(plan.price, 550);
        assert_eq!(plan.days, 30);
    }

    #[tokio::test]
    async fn invalid_update_is_rejected_before_mutation() {
        let registry = registry();
        registry.seed_defaults(&seed(), &[]).await.unwrap();

        let err = registry
            .update_plan(
                "ch1_7_days",
                &PlanUpdate {
                    price: Some(0),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidArgument(_)));

        let plan = registry.require_plan("ch1_7_days").await.unwrap();
        assert_eq!(plan.price, 299);
    }

    #[tokio::test]
    async fn unknown_plan_update_returns_false() {
        let registry = registry();
        registry.seed_defaults(&seed(), &[]).await.unwrap();

        let update = PlanUpdate {
            price: Some(1),
            ..Default::default()
        };
        assert!(!registry.update_plan("nope", &update).await.unwrap());
    }

    #[tokio::test]
    async fn partition_uses_the_channel_column() {
        let registry = registry();
        registry.seed_defaults(&seed(), &[]).await.unwrap();

        let ch1: Vec<_> = registry
            .plans_for_channel("ch1")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.plan_id)
            .collect();
        assert_eq!(ch1, vec!["ch1_30_days", "ch1_7_days"]);

        let bundles = registry.plans_for_channel("all").await.unwrap();
        assert_eq!(bundles.len(), 1);
    }

    #[tokio::test]
    async fn missing_plan_is_not_found() {
        let registry = registry();
        let err = registry.require_plan("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::NotFound("plan")));
    }

    #[tokio::test]
    async fn snapshot_is_a_stable_value() {
        let registry = registry();
        registry
            .seed_defaults(
                &seed(),
                &[("admin_username".to_string(), "admin".to_string())],
            )
            .await
            .unwrap();

        let snapshot = registry.snapshot().await.unwrap();

        // An edit after the snapshot does not leak into it.
        registry
            .update_plan(
                "ch2_7_days",
                &PlanUpdate {
                    price: Some(999),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(snapshot.plan("ch2_7_days").unwrap().price, 149);
        assert_eq!(snapshot.setting("admin_username", "fallback"), "admin");
        assert_eq!(snapshot.setting("missing", "fallback"), "fallback");
        assert_eq!(snapshot.plans_for_channel("ch1").len(), 2);
    }
}
