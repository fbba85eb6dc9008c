//! Startup configuration from the environment, plus the built-in seed data
//! the registry plants on first run. Everything here is immutable once the
//! process is up; runtime edits live in the settings table.

use std::path::PathBuf;

use turnstile_store::StoreConfig;
use turnstile_types::{Channel, ChannelSet, Plan};

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub store: StoreConfig,
    pub channels: ChannelSet,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("TURNSTILE_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = std::env::var("TURNSTILE_PORT")
            .unwrap_or_else(|_| "10000".into())
            .parse()?;

        // A set DATABASE_URL selects Postgres; otherwise fall back to the
        // embedded store for local development.
        let store = match std::env::var("DATABASE_URL") {
            Ok(url) if !url.is_empty() => StoreConfig::Postgres {
                url,
                max_connections: std::env::var("TURNSTILE_DB_POOL")
                    .unwrap_or_else(|_| "5".into())
                    .parse()?,
            },
            _ => StoreConfig::Sqlite {
                path: PathBuf::from(
                    std::env::var("TURNSTILE_DB_PATH").unwrap_or_else(|_| "turnstile.db".into()),
                ),
            },
        };

        let channels = ChannelSet::new(vec![
            Channel {
                code: "ch1".into(),
                name: env_or("CHANNEL_1_NAME", "Channel One"),
            },
            Channel {
                code: "ch2".into(),
                name: env_or("CHANNEL_2_NAME", "Channel Two"),
            },
            Channel {
                code: "ch3".into(),
                name: env_or("CHANNEL_3_NAME", "Channel Three"),
            },
        ]);

        Ok(Self {
            host,
            port,
            store,
            channels,
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Default purchasable plans, inserted only while the plans table is empty.
pub fn default_plans() -> Vec<Plan> {
    fn plan(plan_id: &str, days: u32, price: u32, label: &str, channel: &str) -> Plan {
        Plan {
            plan_id: plan_id.into(),
            days,
            price,
            label: label.into(),
            channel: channel.into(),
        }
    }

    vec![
        plan("ch1_7_days", 7, 299, "7 Days", "ch1"),
        plan("ch1_15_days", 15, 500, "15 Days", "ch1"),
        plan("ch1_30_days", 30, 650, "30 Days", "ch1"),
        plan("ch2_7_days", 7, 149, "7 Days", "ch2"),
        plan("ch2_15_days", 15, 249, "15 Days", "ch2"),
        plan("ch2_30_days", 30, 320, "1 Month", "ch2"),
        plan("ch3_7_days", 7, 149, "7 Days", "ch3"),
        plan("ch3_15_days", 15, 249, "15 Days", "ch3"),
        plan("ch3_30_days", 30, 320, "1 Month", "ch3"),
        // Bundles covering every channel at a discount.
        plan("all_15_days", 15, 699, "15 Days", "all"),
        plan("all_30_days", 30, 899, "30 Days", "all"),
    ]
}

/// Default settings, inserted per key only where absent so administrator
/// edits survive restarts.
pub fn default_settings(channels: &ChannelSet) -> Vec<(String, String)> {
    let mut defaults = vec![
        ("upi_id".to_string(), env_or("UPI_ID", "yourname@bank")),
        ("binance_id".to_string(), env_or("BINANCE_ID", "")),
        ("paypal_email".to_string(), env_or("PAYPAL_EMAIL", "")),
        (
            "admin_username".to_string(),
            env_or("ADMIN_USERNAME", "admin"),
        ),
        ("tutorial_link".to_string(), env_or("TUTORIAL_LINK", "")),
        ("start_image_url".to_string(), env_or("START_IMAGE_URL", "")),
        (
            "premium_image_url".to_string(),
            env_or("PREMIUM_IMAGE_URL", ""),
        ),
    ];
    for (index, channel) in channels.iter().enumerate() {
        defaults.push((format!("channel_{}_name", index + 1), channel.name.clone()));
    }
    defaults
}
