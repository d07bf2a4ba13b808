//! Tests for `src/transport/cloud.rs`: template-first sends and classification.

use std::sync::Arc;

use whatsmux::store::{IntegrationConfig, MessageStore};
use whatsmux::transport::cloud::{CloudApi, CloudApiError, CloudPayload, CloudTransport};
use whatsmux::transport::{
    DeliveryPath, OutboundMessage, SendContext, Transport, TransportError,
};
use whatsmux::types::{MessageKind, TransportKind, UserRef};

use crate::support::{configure, template, temp_store, ScriptedCloudApi};

const RECIPIENT: &str = "15550002000";

async fn context(store: &MessageStore, user: &UserRef) -> SendContext {
    let integration = store
        .active_integration(user)
        .await
        .expect("lookup")
        .expect("configured");
    SendContext {
        user: user.clone(),
        integration,
    }
}

fn text(content: &str) -> OutboundMessage {
    OutboundMessage {
        recipient: RECIPIENT.to_owned(),
        content: content.to_owned(),
        kind: MessageKind::Text,
    }
}

fn transport(api: &Arc<ScriptedCloudApi>, store: &MessageStore) -> CloudTransport {
    CloudTransport::new(Arc::clone(api) as Arc<dyn CloudApi>, store.clone(), template())
}

#[tokio::test]
async fn first_contact_opens_with_the_default_template() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    let api = Arc::new(ScriptedCloudApi::new());

    let receipt = transport(&api, &store)
        .send(&context(&store, &alice).await, &text("hello"))
        .await
        .expect("send");

    assert_eq!(receipt.path, DeliveryPath::Template);
    let calls = api.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].0, "user-number-id");
    match &calls[0].1 {
        CloudPayload::Template { to, name, language } => {
            assert_eq!(to, RECIPIENT);
            assert_eq!(name, "hello_world");
            assert_eq!(language, "en_US");
        }
        other => panic!("expected a template, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_template_is_retried_as_free_form() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    let api = Arc::new(ScriptedCloudApi::new());
    api.reject_next(132_001);

    let receipt = transport(&api, &store)
        .send(&context(&store, &alice).await, &text("hello"))
        .await
        .expect("free-form retry should succeed");

    assert_eq!(receipt.path, DeliveryPath::FreeformAfterTemplate);
    let calls = api.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls[0].1.is_template());
    assert_eq!(
        calls[1].1,
        CloudPayload::Text {
            to: RECIPIENT.to_owned(),
            body: "hello".to_owned(),
        }
    );
}

#[tokio::test]
async fn failed_retry_reports_the_free_form_error() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    let api = Arc::new(ScriptedCloudApi::new());
    api.reject_next(132_001);
    api.reject_next(131_047);

    let err = transport(&api, &store)
        .send(&context(&store, &alice).await, &text("hello"))
        .await
        .expect_err("both attempts rejected");

    match err {
        TransportError::TransportRejected { transport, .. } => {
            assert_eq!(transport, TransportKind::Cloud);
        }
        other => panic!("expected a rejection, got {other:?}"),
    }
    assert_eq!(api.calls().len(), 2);
}

#[tokio::test]
async fn known_contacts_get_free_form_text() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    store
        .mark_inbound_seen(&alice, RECIPIENT, Some("Ann"))
        .await
        .expect("seen");
    let api = Arc::new(ScriptedCloudApi::new());

    let receipt = transport(&api, &store)
        .send(&context(&store, &alice).await, &text("hello again"))
        .await
        .expect("send");

    assert_eq!(receipt.path, DeliveryPath::Direct);
    let calls = api.calls();
    assert_eq!(calls.len(), 1);
    assert!(!calls[0].1.is_template());
}

#[tokio::test]
async fn explicit_template_sends_the_named_template() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    let api = Arc::new(ScriptedCloudApi::new());
    let message = OutboundMessage {
        recipient: RECIPIENT.to_owned(),
        content: "order_update".to_owned(),
        kind: MessageKind::Template,
    };

    let receipt = transport(&api, &store)
        .send(&context(&store, &alice).await, &message)
        .await
        .expect("send");

    assert_eq!(receipt.path, DeliveryPath::Template);
    match &api.calls()[0].1 {
        CloudPayload::Template { name, .. } => assert_eq!(name, "order_update"),
        other => panic!("expected a template, got {other:?}"),
    }
}

#[tokio::test]
async fn missing_credentials_fail_before_any_call() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    store
        .configure_integration(&alice, &IntegrationConfig::for_transport(TransportKind::Cloud))
        .await
        .expect("configure");
    let api = Arc::new(ScriptedCloudApi::new());

    let err = transport(&api, &store)
        .send(&context(&store, &alice).await, &text("hello"))
        .await
        .expect_err("no credentials");

    assert!(matches!(err, TransportError::CredentialMissing { .. }));
    assert!(!err.is_fallback_eligible());
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn api_timeout_is_a_fallback_eligible_rejection() {
    let (_dir, store) = temp_store().await;
    let alice = UserRef::user("alice");
    configure(&store, &alice, TransportKind::Cloud, false).await;
    store
        .mark_inbound_seen(&alice, RECIPIENT, None)
        .await
        .expect("seen");
    let api = Arc::new(ScriptedCloudApi::new());
    api.push(Err(CloudApiError::Timeout));

    let err = transport(&api, &store)
        .send(&context(&store, &alice).await, &text("hello"))
        .await
        .expect_err("timed out");

    assert_eq!(err, TransportError::timed_out(TransportKind::Cloud));
    assert!(err.is_fallback_eligible());
}
