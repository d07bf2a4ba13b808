//! Tests for `src/transport/bridge.rs`: sends over a live session socket and
//! normalisation of device events.

use std::sync::Arc;

use serde_json::json;
use tokio::sync::mpsc;

use whatsmux::bridge::{BridgeConnector, BridgeEvent};
use whatsmux::events::EventPublisher;
use whatsmux::session::{SessionManager, SessionState};
use whatsmux::store::MessageStore;
use whatsmux::transport::bridge::{normalize_event, BridgeTransport};
use whatsmux::transport::{
    DeliveryPath, InboundEnvelope, InboundItem, OutboundMessage, SendContext, Transport,
    TransportError,
};
use whatsmux::types::{DeliveryStatus, MessageKind, TransportKind, UserRef};

use crate::support::{configure, eventually, fast_policy, temp_store, FakeConnector};

fn manager(
    store: &MessageStore,
    connector: &Arc<FakeConnector>,
) -> (Arc<SessionManager>, mpsc::Receiver<InboundEnvelope>) {
    let (tx, rx) = mpsc::channel(16);
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(connector) as Arc<dyn BridgeConnector>,
        store.clone(),
        EventPublisher::default(),
        tx,
        fast_policy(0),
    ));
    (sessions, rx)
}

async fn context(store: &MessageStore, user: &UserRef) -> SendContext {
    SendContext {
        user: user.clone(),
        integration: store
            .active_integration(user)
            .await
            .expect("lookup")
            .expect("configured"),
    }
}

fn message(kind: MessageKind) -> OutboundMessage {
    OutboundMessage {
        recipient: "15550002000".to_owned(),
        content: "hello".to_owned(),
        kind,
    }
}

#[tokio::test]
async fn connected_session_sends_over_its_socket() {
    let (_dir, store) = temp_store().await;
    let connector = FakeConnector::new();
    let (sessions, _rx) = manager(&store, &connector);
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::PersonalBridge, false).await;

    sessions.init(&alice).await.expect("init");
    let probe = Arc::clone(&connector);
    let user = alice.clone();
    eventually("connection opened", move || {
        let connected = probe.is_connected(&user);
        async move { connected }
    })
    .await;
    connector
        .emit(&alice, BridgeEvent::Connected { phone: Some("15550001000".to_owned()) })
        .await;
    let probe = Arc::clone(&sessions);
    let user = alice.clone();
    eventually("session connected", move || {
        let sessions = Arc::clone(&probe);
        let user = user.clone();
        async move { sessions.state(&user).await == SessionState::Connected }
    })
    .await;

    let transport = BridgeTransport::new(Arc::clone(&sessions));
    let ctx = context(&store, &alice).await;
    let receipt = transport
        .send(&ctx, &message(MessageKind::Text))
        .await
        .expect("send");

    assert_eq!(receipt.message_id, "bridge-1");
    assert_eq!(receipt.path, DeliveryPath::Direct);
    let sent = connector.socket(&alice).sent.lock().expect("sent lock").clone();
    assert_eq!(sent, vec![("15550002000".to_owned(), "hello".to_owned())]);

    let template = transport.send(&ctx, &message(MessageKind::Template)).await;
    assert!(matches!(
        template,
        Err(TransportError::TransportRejected {
            transport: TransportKind::PersonalBridge,
            ..
        })
    ));

    sessions.shutdown_all().await;
}

#[tokio::test]
async fn no_session_means_not_connected() {
    let (_dir, store) = temp_store().await;
    let connector = FakeConnector::new();
    let (sessions, _rx) = manager(&store, &connector);
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::PersonalBridge, false).await;

    let err = BridgeTransport::new(sessions)
        .send(&context(&store, &alice).await, &message(MessageKind::Text))
        .await
        .expect_err("no session");

    assert_eq!(err, TransportError::NotConnected);
    assert!(err.is_fallback_eligible());
}

#[test]
fn device_messages_are_normalised() {
    let alice = UserRef::user("alice");
    let event = BridgeEvent::Message {
        from: "15550002000:12@s.whatsapp.net".to_owned(),
        text: "hi".to_owned(),
        message_id: "3EB0".to_owned(),
        timestamp: Some(1_700_000_000),
        push_name: Some("Ann".to_owned()),
        from_me: false,
    };

    match normalize_event(&alice, &event, Some("15550001000")) {
        Some(InboundItem::Message(m)) => {
            assert_eq!(m.from, "15550002000");
            assert_eq!(m.to.as_deref(), Some("15550001000"));
            assert_eq!(m.transport, TransportKind::PersonalBridge);
            assert_eq!(m.sender_name.as_deref(), Some("Ann"));
            assert!(m.timestamp.is_some_and(|t| t.starts_with("2023-11-14")));
        }
        other => panic!("expected a message, got {other:?}"),
    }
}

#[test]
fn receipts_parse_case_insensitively_and_skip_unknown_statuses() {
    let alice = UserRef::user("alice");
    let read = BridgeEvent::Receipt {
        message_id: "3EB0".to_owned(),
        status: "READ".to_owned(),
    };
    assert_eq!(
        normalize_event(&alice, &read, None),
        Some(InboundItem::Status {
            transport: TransportKind::PersonalBridge,
            provider_message_id: "3EB0".to_owned(),
            status: DeliveryStatus::Read,
        })
    );

    let played = BridgeEvent::Receipt {
        message_id: "3EB0".to_owned(),
        status: "played".to_owned(),
    };
    assert_eq!(normalize_event(&alice, &played, None), None);
}

#[test]
fn raw_sidecar_json_is_normalised() {
    let transport_user = UserRef::user("alice");
    let raw = json!({
        "type": "message",
        "from": "15550002000@s.whatsapp.net",
        "text": "hi",
        "message_id": "3EB1"
    });
    let event: BridgeEvent = serde_json::from_value(raw).expect("valid event");
    let item = normalize_event(&transport_user, &event, None);
    assert!(matches!(item, Some(InboundItem::Message(_))));
}
