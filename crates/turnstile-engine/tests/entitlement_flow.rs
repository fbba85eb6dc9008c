//! End-to-end flow against the embedded backend: a user shows up, buys a
//! bundle plan (confirmed manually by an admin), and the admin later edits
//! pricing and revokes access.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use turnstile_engine::{Entitlements, FixedClock, Registry};
use turnstile_store::SqliteStore;
use turnstile_types::{Channel, ChannelSet, Plan, PlanUpdate, Scope};

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 30, 0).unwrap()
}

fn channels() -> ChannelSet {
    ChannelSet::new(vec![
        Channel { code: "ch1".into(), name: "Channel One".into() },
        Channel { code: "ch2".into(), name: "Channel Two".into() },
        Channel { code: "ch3".into(), name: "Channel Three".into() },
    ])
}

fn seed_plans() -> Vec<Plan> {
    vec![
        Plan {
            plan_id: "ch1_7_days".into(),
            days: 7,
            price: 299,
            label: "7 Days".into(),
            channel: "ch1".into(),
        },
        Plan {
            plan_id: "all_30_days".into(),
            days: 30,
            price: 899,
            label: "30 Days".into(),
            channel: "all".into(),
        },
    ]
}

fn setup() -> (Entitlements, Registry, Arc<FixedClock>) {
    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let clock = Arc::new(FixedClock::new(start()));
    let engine = Entitlements::new(store.clone(), clock.clone(), channels());
    let registry = Registry::new(store);
    (engine, registry, clock)
}

#[tokio::test]
async fn purchase_and_admin_lifecycle() {
    let (engine, registry, clock) = setup();
    registry
        .seed_defaults(
            &seed_plans(),
            &[("admin_username".to_string(), "admin".to_string())],
        )
        .await
        .unwrap();

    // User shows up; transport ensures the user row on every interaction.
    engine.ensure_user(42, Some("alice"), Some("Alice")).await.unwrap();
    assert!(!engine.has_any_access(42).await.unwrap());

    // User picks the bundle plan; admin confirms payment and grants it.
    let plan = registry.require_plan("all_30_days").await.unwrap();
    let scope = Scope::parse(&plan.channel, engine.channels()).unwrap();
    let grants = engine.grant(42, plan.days, &scope).await.unwrap();
    assert_eq!(grants.len(), 3);

    for code in ["ch1", "ch2", "ch3"] {
        assert!(engine.has_access(42, code).await.unwrap());
    }
    assert_eq!(
        engine.expiry_display(42, Some("ch1")).await.unwrap(),
        "01 Jul 2025, 09:30 AM"
    );

    // A top-up on one channel stacks on the bundle.
    let plan = registry.require_plan("ch1_7_days").await.unwrap();
    let scope = Scope::parse(&plan.channel, engine.channels()).unwrap();
    engine.grant(42, plan.days, &scope).await.unwrap();
    assert_eq!(
        engine.expiry_display(42, Some("ch1")).await.unwrap(),
        "08 Jul 2025, 09:30 AM"
    );

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.total_users, 1);
    assert_eq!(stats.premium_users, 1);
    assert_eq!(stats.free_users, 0);

    // Admin reprices the bundle; the edit is partial.
    assert!(
        registry
            .update_plan(
                "all_30_days",
                &PlanUpdate {
                    price: Some(799),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
    );
    let repriced = registry.require_plan("all_30_days").await.unwrap();
    assert_eq!(repriced.price, 799);
    assert_eq!(repriced.days, 30);

    // Time passes beyond every grant.
    clock.advance(Duration::days(60));
    assert!(!engine.has_any_access(42).await.unwrap());
    // The stale expiry still renders for support queries.
    assert_eq!(
        engine.expiry_display(42, None).await.unwrap(),
        "08 Jul 2025, 09:30 AM"
    );

    // A fresh grant restarts from the advanced clock, then gets revoked.
    engine
        .grant(42, 7, &Scope::Channel("ch2".into()))
        .await
        .unwrap();
    assert!(engine.has_access(42, "ch2").await.unwrap());

    engine.revoke(42, None).await.unwrap();
    assert!(!engine.has_any_access(42).await.unwrap());
    assert_eq!(engine.expiry_display(42, None).await.unwrap(), "N/A");
}
