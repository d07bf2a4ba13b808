//! Tests for `Router::ingest`: de-duplication and receipts.

use whatsmux::events::EventKind;
use whatsmux::router::SendRequest;
use whatsmux::store::{NormalizedMessage, Page};
use whatsmux::transport::{InboundEnvelope, InboundItem};
use whatsmux::types::{DeliveryStatus, Direction, TransportKind, UserRef};

use crate::support::{configure, Harness};

fn inbound(user: &UserRef, id: &str, body: &str) -> InboundItem {
    InboundItem::Message(NormalizedMessage {
        user: user.clone(),
        transport: TransportKind::PersonalBridge,
        provider_message_id: id.to_owned(),
        from: "15550002000".to_owned(),
        to: Some("15550001000".to_owned()),
        body: body.to_owned(),
        sender_name: Some("Ann".to_owned()),
        timestamp: None,
    })
}

fn receipt(id: &str, status: DeliveryStatus) -> InboundItem {
    InboundItem::Status {
        transport: TransportKind::Cloud,
        provider_message_id: id.to_owned(),
        status,
    }
}

#[tokio::test]
async fn redelivered_messages_are_stored_once() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");
    configure(&h.store, &alice, TransportKind::PersonalBridge, false).await;
    let mut events = h.events.subscribe_user(&alice);

    let report = h
        .router
        .ingest(InboundEnvelope {
            user: alice.clone(),
            items: vec![
                inbound(&alice, "MSG-1", "hi"),
                inbound(&alice, "MSG-1", "hi"),
                inbound(&alice, "MSG-2", "still there?"),
            ],
        })
        .await;

    assert_eq!(report.stored, 2);
    assert_eq!(report.duplicates, 1);

    let conversation = h
        .store
        .conversation_for(&alice, "15550002000")
        .await
        .expect("conversation");
    assert_eq!(conversation.unread_count, 2);
    assert_eq!(conversation.last_message_preview.as_deref(), Some("still there?"));

    let messages = h
        .store
        .conversation_messages(&alice, conversation.id, Page::default())
        .await
        .expect("messages");
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.direction == Direction::Inbound));

    let contact = h
        .store
        .contact(&alice, "15550002000")
        .await
        .expect("lookup")
        .expect("contact created");
    assert!(contact.has_inbound);
    assert_eq!(contact.name.as_deref(), Some("Ann"));

    let integration = h
        .store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("configured");
    assert_eq!(integration.received_count, 2);

    for expected in ["MSG-1", "MSG-2"] {
        let event = events.recv().await.expect("event");
        match event.kind {
            EventKind::MessageReceived { message } => {
                assert_eq!(message.provider_message_id.as_deref(), Some(expected));
            }
            other => panic!("expected MessageReceived, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn receipts_only_move_forward() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");
    configure(&h.store, &alice, TransportKind::Cloud, false).await;
    let outcome = h
        .router
        .send_message(&alice, SendRequest::text("15550002000", "hello"))
        .await
        .expect("send");

    let apply = |status| InboundEnvelope {
        user: alice.clone(),
        items: vec![receipt(&outcome.message_id, status)],
    };

    assert_eq!(h.router.ingest(apply(DeliveryStatus::Delivered)).await.statuses, 1);
    assert_eq!(h.router.ingest(apply(DeliveryStatus::Read)).await.statuses, 1);
    assert_eq!(h.router.ingest(apply(DeliveryStatus::Delivered)).await.statuses, 0);

    let stored = h
        .store
        .find_message(TransportKind::Cloud, Direction::Outbound, &outcome.message_id)
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(stored.status, DeliveryStatus::Read);
}

#[tokio::test]
async fn receipts_for_unknown_messages_are_ignored() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");

    let report = h
        .router
        .ingest(InboundEnvelope {
            user: alice,
            items: vec![receipt("wamid.unknown", DeliveryStatus::Delivered)],
        })
        .await;

    assert_eq!(report.statuses, 0);
    assert_eq!(report.stored, 0);
}

#[tokio::test]
async fn ingest_without_an_integration_still_stores() {
    let h = Harness::new().await;
    let alice = UserRef::user("alice");

    let report = h
        .router
        .ingest(InboundEnvelope {
            user: alice.clone(),
            items: vec![inbound(&alice, "MSG-1", "hi")],
        })
        .await;

    assert_eq!(report.stored, 1);
    let found = h
        .store
        .find_message(TransportKind::PersonalBridge, Direction::Inbound, "MSG-1")
        .await
        .expect("lookup");
    assert!(found.is_some_and(|m| m.user == alice));
}
