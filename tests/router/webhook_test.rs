//! Tests for `Router::ingest_webhook`: attribution of cloud webhook traffic.

use serde_json::{json, Value};

use whatsmux::router::SendRequest;
use whatsmux::types::{DeliveryStatus, Direction, TransportKind, UserRef};

use crate::support::{configure, Harness};

fn change(phone_number_id: &str, messages: Value, statuses: Value) -> Value {
    json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": {
                        "display_phone_number": "15550001000",
                        "phone_number_id": phone_number_id
                    },
                    "contacts": [{ "profile": { "name": "Ann" }, "wa_id": "15550002000" }],
                    "messages": messages,
                    "statuses": statuses
                }
            }]
        }]
    })
}

fn text_from(from: &str, id: &str, body: &str) -> Value {
    json!({
        "from": from,
        "id": id,
        "timestamp": "1700000000",
        "type": "text",
        "text": { "body": body }
    })
}

#[tokio::test]
async fn changes_for_a_user_number_reach_that_user() {
    let h = Harness::with_real_cloud().await;
    let alice = UserRef::user("alice");
    configure(&h.store, &alice, TransportKind::Cloud, false).await;

    let sent = h
        .router
        .send_message(&alice, SendRequest::text("15550002000", "hello"))
        .await
        .expect("send");

    let payload = change(
        "user-number-id",
        json!([text_from("15550002000", "wamid.IN1", "hi back")]),
        json!([{ "id": sent.message_id, "status": "delivered" }]),
    );
    let report = h.router.ingest_webhook(&payload).await;

    assert_eq!(report.stored, 1);
    assert_eq!(report.statuses, 1);
    assert_eq!(report.unrouted, 0);

    let inbound = h
        .store
        .find_message(TransportKind::Cloud, Direction::Inbound, "wamid.IN1")
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(inbound.user, alice);
    assert_eq!(inbound.body, "hi back");

    let outbound = h
        .store
        .find_message(TransportKind::Cloud, Direction::Outbound, &sent.message_id)
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(outbound.status, DeliveryStatus::Delivered);
}

#[tokio::test]
async fn changes_for_unknown_numbers_are_unrouted() {
    let h = Harness::with_real_cloud().await;

    let payload = change(
        "nobody",
        json!([text_from("15550002000", "wamid.IN1", "hi")]),
        json!([]),
    );
    let report = h.router.ingest_webhook(&payload).await;

    assert_eq!(report.stored, 0);
    assert_eq!(report.unrouted, 1);
}

#[tokio::test]
async fn fallback_traffic_is_attributed_to_the_sending_user() {
    let h = Harness::with_real_cloud().await;
    let alice = UserRef::user("alice");
    let bob = UserRef::user("bob");
    configure(&h.store, &alice, TransportKind::SharedFallback, false).await;
    configure(&h.store, &bob, TransportKind::SharedFallback, false).await;
    h.store.grant_credits(&alice, 5).await.expect("grant");
    h.store.grant_credits(&bob, 5).await.expect("grant");

    let to_ann = h
        .router
        .send_message(&alice, SendRequest::text("15550002000", "hi Ann"))
        .await
        .expect("send");
    h.router
        .send_message(&bob, SendRequest::text("15550003000", "hi Ben"))
        .await
        .expect("send");

    let payload = change(
        "platform-number-id",
        json!([
            text_from("15550002000", "wamid.ANN", "hello alice"),
            text_from("15550003000", "wamid.BEN", "hello bob"),
            text_from("15550009999", "wamid.STRANGER", "who is this"),
        ]),
        json!([{ "id": to_ann.message_id, "status": "read" }]),
    );
    let report = h.router.ingest_webhook(&payload).await;

    assert_eq!(report.stored, 2);
    assert_eq!(report.statuses, 1);
    assert_eq!(report.unrouted, 1);

    let ann = h
        .store
        .find_message(TransportKind::SharedFallback, Direction::Inbound, "wamid.ANN")
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(ann.user, alice);
    let ben = h
        .store
        .find_message(TransportKind::SharedFallback, Direction::Inbound, "wamid.BEN")
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(ben.user, bob);

    let receipt = h
        .store
        .find_message(TransportKind::SharedFallback, Direction::Outbound, &to_ann.message_id)
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(receipt.status, DeliveryStatus::Read);
}

#[tokio::test]
async fn fallback_replies_go_to_the_latest_sender() {
    let h = Harness::with_real_cloud().await;
    let alice = UserRef::user("alice");
    let bob = UserRef::user("bob");
    configure(&h.store, &alice, TransportKind::SharedFallback, false).await;
    configure(&h.store, &bob, TransportKind::SharedFallback, false).await;
    h.store.grant_credits(&alice, 5).await.expect("grant");
    h.store.grant_credits(&bob, 5).await.expect("grant");

    h.router
        .send_message(&alice, SendRequest::text("15550002000", "first"))
        .await
        .expect("send");
    h.router
        .send_message(&bob, SendRequest::text("15550002000", "second"))
        .await
        .expect("send");

    let payload = change(
        "platform-number-id",
        json!([text_from("15550002000", "wamid.REPLY", "which of you?")]),
        json!([]),
    );
    h.router.ingest_webhook(&payload).await;

    let reply = h
        .store
        .find_message(TransportKind::SharedFallback, Direction::Inbound, "wamid.REPLY")
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(reply.user, bob);
}

#[tokio::test]
async fn malformed_payloads_are_ignored() {
    let h = Harness::with_real_cloud().await;

    let report = h.router.ingest_webhook(&json!({ "entry": "nope" })).await;
    assert_eq!(report, Default::default());

    let report = h
        .router
        .ingest_webhook(&json!({ "entry": [{ "changes": [{ "value": {} }] }] }))
        .await;
    assert_eq!(report, Default::default());
}
