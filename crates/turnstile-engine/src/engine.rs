//! Entitlement decisions: grant, extend, revoke, evaluate, aggregate.
//!
//! Per `(user, channel)` pair the lifecycle is NoGrant -> Active -> Expired,
//! where Active -> Expired is never a stored transition: it is evaluated
//! lazily by comparing the persisted expiry against the clock. Any state is
//! re-enterable (a fresh grant restarts a lapsed pair from now).

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use turnstile_store::Store;
use turnstile_types::{ChannelSet, Scope, Stats, Subscription};

use crate::EngineError;
use crate::clock::Clock;

const EXPIRY_FORMAT: &str = "%d %b %Y, %I:%M %p";

/// Shown when a user has no stored expiry at all.
pub const EXPIRY_NOT_SET: &str = "N/A";

/// Fixed human-readable rendering of an expiry instant.
pub fn format_expiry(expiry: DateTime<Utc>) -> String {
    expiry.format(EXPIRY_FORMAT).to_string()
}

/// Outcome of one channel's grant within a scope expansion.
#[derive(Debug, Clone)]
pub struct Grant {
    pub channel_code: String,
    pub expiry: DateTime<Utc>,
}

pub struct Entitlements {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    channels: ChannelSet,
}

impl Entitlements {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, channels: ChannelSet) -> Self {
        Self {
            store,
            clock,
            channels,
        }
    }

    pub fn channels(&self) -> &ChannelSet {
        &self.channels
    }

    /// Metadata refresh on every inbound interaction. Idempotent; the latest
    /// username/display name always wins.
    pub async fn ensure_user(
        &self,
        id: i64,
        username: Option<&str>,
        display_name: Option<&str>,
    ) -> Result<(), EngineError> {
        self.store.upsert_user(id, username, display_name).await?;
        debug!("user {id} metadata refreshed");
        Ok(())
    }

    /// Strictly-greater comparison: an expiry equal to now is already
    /// inactive. Unknown users are simply false.
    pub async fn has_access(&self, user_id: i64, channel_code: &str) -> Result<bool, EngineError> {
        let expiry = self.store.get_expiry(user_id, channel_code).await?;
        Ok(expiry.is_some_and(|e| e > self.clock.now()))
    }

    pub async fn has_any_access(&self, user_id: i64) -> Result<bool, EngineError> {
        let active = self
            .store
            .list_active_subscriptions(user_id, self.clock.now())
            .await?;
        Ok(!active.is_empty())
    }

    /// Grant `days` of access to every channel the scope covers.
    ///
    /// Idempotent-additive: repeated grants accumulate, and a lapsed grant
    /// restarts from now rather than from the stale expiry. The multi-channel
    /// expansion is deliberately not atomic across channels: each channel's
    /// entitlement is independent, so a failure partway leaves the earlier
    /// grants in place.
    pub async fn grant(
        &self,
        user_id: i64,
        days: u32,
        scope: &Scope,
    ) -> Result<Vec<Grant>, EngineError> {
        if days == 0 {
            return Err(EngineError::InvalidArgument(
                "days must be a positive integer".into(),
            ));
        }

        let now = self.clock.now();
        let mut grants = Vec::new();
        for code in scope.expand(&self.channels) {
            let expiry = self
                .store
                .extend_subscription(user_id, code, now, days)
                .await?;
            info!("granted {days}d of {code} to user {user_id}, expires {expiry}");
            grants.push(Grant {
                channel_code: code.to_string(),
                expiry,
            });
        }
        Ok(grants)
    }

    /// Remove one channel's grant, or every grant when no channel is given.
    /// Not an error if nothing existed.
    pub async fn revoke(
        &self,
        user_id: i64,
        channel_code: Option<&str>,
    ) -> Result<(), EngineError> {
        self.store.delete_subscription(user_id, channel_code).await?;
        match channel_code {
            Some(code) => info!("revoked {code} from user {user_id}"),
            None => info!("revoked all channels from user {user_id}"),
        }
        Ok(())
    }

    /// Active subscriptions only, ordered by channel code.
    pub async fn list_subscriptions(&self, user_id: i64) -> Result<Vec<Subscription>, EngineError> {
        Ok(self
            .store
            .list_active_subscriptions(user_id, self.clock.now())
            .await?)
    }

    /// The stored expiry for one channel, or the latest across all channels
    /// when none is given, rendered for display. Lapsed expiries still
    /// render; only a missing row yields the not-set sentinel.
    pub async fn expiry_display(
        &self,
        user_id: i64,
        channel_code: Option<&str>,
    ) -> Result<String, EngineError> {
        let expiry = match channel_code {
            Some(code) => self.store.get_expiry(user_id, code).await?,
            None => self.store.max_expiry(user_id).await?,
        };
        Ok(expiry.map(format_expiry).unwrap_or_else(|| EXPIRY_NOT_SET.to_string()))
    }

    /// Pure aggregation over store counts; the engine holds no state of its
    /// own.
    pub async fn stats(&self) -> Result<Stats, EngineError> {
        let now = self.clock.now();
        let total_users = self.store.count_users().await?;
        let premium_users = self.store.count_active_distinct_users(now).await?;

        let mut channels = BTreeMap::new();
        for code in self.channels.codes() {
            channels.insert(
                code.to_string(),
                self.store.count_active_by_channel(code, now).await?,
            );
        }

        Ok(Stats {
            total_users,
            premium_users,
            free_users: total_users - premium_users,
            channels,
        })
    }
}
