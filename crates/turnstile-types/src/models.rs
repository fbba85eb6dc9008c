use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A known end user. Created on first interaction and refreshed on every one
/// after that; never deleted by normal operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
    pub display_name: Option<String>,
    pub joined_at: DateTime<Utc>,
}

/// A time-bounded entitlement to a single channel. At most one exists per
/// `(user, channel_code)` pair; a row with `expiry <= now` is inactive but
/// may stay persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub channel_code: String,
    pub expiry: DateTime<Utc>,
}

/// A purchasable offer: `days` of access to `channel` for `price`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub days: u32,
    pub price: u32,
    pub label: String,
    /// Channel code this plan targets (`ch1`, ..., or `all` for bundles).
    pub channel: String,
}

/// Partial administrative edit of a plan. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanUpdate {
    pub days: Option<u32>,
    pub price: Option<u32>,
    pub label: Option<String>,
}

impl PlanUpdate {
    pub fn is_empty(&self) -> bool {
        self.days.is_none() && self.price.is_none() && self.label.is_none()
    }
}

/// Free-form key/value configuration row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Setting {
    pub key: String,
    pub value: String,
}

/// Aggregate user/subscription counts at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stats {
    pub total_users: i64,
    /// Users with at least one active subscription.
    pub premium_users: i64,
    pub free_users: i64,
    /// Active subscription count per configured channel code.
    pub channels: BTreeMap<String, i64>,
}
