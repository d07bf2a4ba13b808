//! Tests for `src/router/autoreply.rs`.

use std::sync::Arc;
use std::time::Duration;

use whatsmux::router::spawn_auto_reply;
use whatsmux::store::{IntegrationConfig, NormalizedMessage};
use whatsmux::transport::{InboundEnvelope, InboundItem};
use whatsmux::types::{TransportKind, UserRef};

use crate::support::{eventually, Harness};

const REPLY: &str = "Thanks, I'll get back to you soon.";

async fn enable_auto_reply(h: &Harness, user: &UserRef, kind: TransportKind) {
    let mut config = IntegrationConfig::for_transport(kind);
    config.auto_reply_enabled = true;
    config.auto_reply_text = REPLY.to_owned();
    h.store
        .configure_integration(user, &config)
        .await
        .expect("configure");
}

fn message_from(user: &UserRef, from: &str, id: &str) -> InboundEnvelope {
    InboundEnvelope {
        user: user.clone(),
        items: vec![InboundItem::Message(NormalizedMessage {
            user: user.clone(),
            transport: TransportKind::PersonalBridge,
            provider_message_id: id.to_owned(),
            from: from.to_owned(),
            to: None,
            body: "are you there?".to_owned(),
            sender_name: None,
            timestamp: None,
        })],
    }
}

#[tokio::test]
async fn inbound_message_gets_the_canned_reply() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");
    enable_auto_reply(&h, &alice, TransportKind::PersonalBridge).await;
    let task = spawn_auto_reply(Arc::clone(&h.router), &h.events);

    h.router
        .ingest(message_from(&alice, "15550002000", "MSG-1"))
        .await;

    let bridge = Arc::clone(&h.bridge);
    eventually("auto-reply sent", move || {
        let bridge = Arc::clone(&bridge);
        async move { bridge.sent_count() == 1 }
    })
    .await;
    let sent = h.bridge.sent.lock().expect("sent lock")[0].clone();
    assert_eq!(sent.recipient, "15550002000");
    assert_eq!(sent.content, REPLY);

    task.abort();
}

#[tokio::test]
async fn duplicates_do_not_trigger_a_second_reply() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");
    enable_auto_reply(&h, &alice, TransportKind::PersonalBridge).await;
    let task = spawn_auto_reply(Arc::clone(&h.router), &h.events);

    h.router
        .ingest(message_from(&alice, "15550002000", "MSG-1"))
        .await;
    h.router
        .ingest(message_from(&alice, "15550002000", "MSG-1"))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.bridge.sent_count(), 1);

    task.abort();
}

#[tokio::test]
async fn no_reply_when_switched_off() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");
    let mut config = IntegrationConfig::for_transport(TransportKind::PersonalBridge);
    config.auto_reply_text = REPLY.to_owned();
    h.store
        .configure_integration(&alice, &config)
        .await
        .expect("configure");
    let task = spawn_auto_reply(Arc::clone(&h.router), &h.events);

    h.router
        .ingest(message_from(&alice, "15550002000", "MSG-1"))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.bridge.sent_count(), 0);

    task.abort();
}

#[tokio::test]
async fn no_reply_to_blocked_contacts_or_own_device() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");
    enable_auto_reply(&h, &alice, TransportKind::PersonalBridge).await;
    h.store
        .set_bridge_phone(&alice, Some("15550001000"))
        .await
        .expect("bridge phone");
    h.store
        .set_blocked(&alice, "15550002000", true)
        .await
        .expect("block");
    let task = spawn_auto_reply(Arc::clone(&h.router), &h.events);

    h.router
        .ingest(message_from(&alice, "15550002000", "MSG-1"))
        .await;
    h.router
        .ingest(message_from(&alice, "15550001000", "MSG-2"))
        .await;

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(h.bridge.sent_count(), 0);

    task.abort();
}
