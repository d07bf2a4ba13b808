//! Tests for `src/store/integrations.rs`.

use whatsmux::store::IntegrationConfig;
use whatsmux::types::{HealthStatus, TransportKind, UserKind, UserRef};

use crate::support::{configure, temp_store, user_cloud_credentials};

#[tokio::test]
async fn switching_transport_keeps_history_with_one_active_record() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");

    configure(&store, &alice, TransportKind::Cloud, false).await;
    assert_eq!(
        store.find_user_by_cloud_number("user-number-id").await.expect("lookup"),
        Some(alice.clone())
    );

    configure(&store, &alice, TransportKind::PersonalBridge, true).await;

    let history = store.integration_history(&alice).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history.iter().filter(|i| i.active).count(), 1);

    let active = store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("active");
    assert_eq!(active.transport, TransportKind::PersonalBridge);
    assert!(active.fallback_enabled);
    assert_eq!(active.health, HealthStatus::Unknown);

    // The inactive cloud record no longer receives webhooks.
    assert_eq!(
        store.find_user_by_cloud_number("user-number-id").await.expect("lookup"),
        None
    );
}

#[tokio::test]
async fn same_transport_is_updated_in_place() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;

    let mut config = IntegrationConfig::for_transport(TransportKind::Cloud);
    config.credentials = Some(user_cloud_credentials());
    config.auto_reply_enabled = true;
    config.auto_reply_text = "away".to_owned();
    let updated = store
        .configure_integration(&alice, &config)
        .await
        .expect("configure");

    assert!(updated.auto_reply_enabled);
    assert_eq!(updated.auto_reply_text, "away");
    assert_eq!(store.integration_history(&alice).await.expect("history").len(), 1);
}

#[tokio::test]
async fn users_of_different_kinds_are_separate() {
    let (_dir, store) = temp_store().await;
    let user = UserRef::user("42");
    let reseller = UserRef::new("42", UserKind::Reseller);
    configure(&store, &user, TransportKind::Cloud, false).await;

    assert!(store.active_integration(&user).await.expect("lookup").is_some());
    assert!(store.active_integration(&reseller).await.expect("lookup").is_none());
}

#[tokio::test]
async fn health_is_mirrored_only_onto_the_matching_transport() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::PersonalBridge, false).await;

    let cloud = store
        .record_health(&alice, TransportKind::Cloud, HealthStatus::Healthy, None)
        .await
        .expect("record");
    assert!(!cloud);

    let bridge = store
        .record_health(
            &alice,
            TransportKind::PersonalBridge,
            HealthStatus::Degraded,
            Some("connection_lost"),
        )
        .await
        .expect("record");
    assert!(bridge);

    let active = store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("active");
    assert_eq!(active.health, HealthStatus::Degraded);
    assert_eq!(active.last_error.as_deref(), Some("connection_lost"));
    assert!(active.last_health_check.is_some());
}

#[tokio::test]
async fn credentials_never_serialize() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    let active = store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("active");
    assert!(active.cloud.is_some());

    let json = serde_json::to_string(&active).expect("serialize");
    assert!(!json.contains("user-token"));
    assert!(json.contains("\"transport\":\"cloud\""));
}
