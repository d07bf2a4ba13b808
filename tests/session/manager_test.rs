//! Tests for `SessionManager`: lifecycle, pairing, reconnects and teardown.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc;

use whatsmux::bridge::{BridgeConnector, BridgeEvent, DisconnectReason};
use whatsmux::events::{EventKind, EventPublisher};
use whatsmux::session::{InitOutcome, PairingStatus, SessionError, SessionManager, SessionState};
use whatsmux::store::{IntegrationConfig, MessageStore};
use whatsmux::transport::InboundEnvelope;
use whatsmux::transport::TransportError;
use whatsmux::types::{Direction, HealthStatus, MessageKind, TransportKind, UserRef};

use crate::support::{configure, eventually, fast_policy, temp_store, FakeConnector, Harness};

struct Fixture {
    _dir: tempfile::TempDir,
    store: MessageStore,
    events: EventPublisher,
    connector: Arc<FakeConnector>,
    sessions: Arc<SessionManager>,
    _inbound: mpsc::Receiver<InboundEnvelope>,
}

async fn fixture(max_attempts: u32) -> Fixture {
    let (dir, store) = temp_store().await;
    let events = EventPublisher::default();
    let connector = FakeConnector::new();
    let (tx, rx) = mpsc::channel(16);
    let sessions = Arc::new(SessionManager::new(
        Arc::clone(&connector) as Arc<dyn BridgeConnector>,
        store.clone(),
        events.clone(),
        tx,
        fast_policy(max_attempts),
    ));
    Fixture {
        _dir: dir,
        store,
        events,
        connector,
        sessions,
        _inbound: rx,
    }
}

async fn wait_for_state(sessions: &Arc<SessionManager>, user: &UserRef, want: SessionState) {
    let sessions = Arc::clone(sessions);
    let user = user.clone();
    eventually(&format!("session {want}"), move || {
        let sessions = Arc::clone(&sessions);
        let user = user.clone();
        async move { sessions.state(&user).await == want }
    })
    .await;
}

async fn wait_for_connection(connector: &Arc<FakeConnector>, user: &UserRef, connects: usize) {
    let connector = Arc::clone(connector);
    let user = user.clone();
    eventually("device connection", move || {
        let ready = connector.is_connected(&user)
            && connector.connects.load(Ordering::SeqCst) >= connects;
        async move { ready }
    })
    .await;
}

async fn connect(f: &Fixture, user: &UserRef) {
    configure(&f.store, user, TransportKind::PersonalBridge, false).await;
    f.sessions.init(user).await.expect("init");
    wait_for_connection(&f.connector, user, 1).await;
    f.connector
        .emit(user, BridgeEvent::Connected { phone: Some("15550001000@s.whatsapp.net".to_owned()) })
        .await;
    wait_for_state(&f.sessions, user, SessionState::Connected).await;
}

async fn integration_health(store: &MessageStore, user: &UserRef) -> HealthStatus {
    store
        .active_integration(user)
        .await
        .expect("lookup")
        .expect("configured")
        .health
}

#[tokio::test]
async fn init_requires_an_enabled_bridge_integration() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");

    let missing = f.sessions.init(&alice).await;
    assert!(matches!(missing, Err(SessionError::NotConfigured(_))));

    configure(&f.store, &alice, TransportKind::Cloud, false).await;
    let wrong_kind = f.sessions.init(&alice).await;
    assert!(matches!(wrong_kind, Err(SessionError::NotConfigured(_))));

    let mut config = IntegrationConfig::for_transport(TransportKind::PersonalBridge);
    config.enabled = false;
    f.store
        .configure_integration(&alice, &config)
        .await
        .expect("configure");
    let disabled = f.sessions.init(&alice).await;
    assert!(matches!(disabled, Err(SessionError::Disabled(_))));

    assert_eq!(f.connector.connects.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn init_is_idempotent_while_live() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    configure(&f.store, &alice, TransportKind::PersonalBridge, false).await;

    let first = f.sessions.init(&alice).await.expect("init");
    let second = f.sessions.init(&alice).await.expect("init");

    assert_eq!(first, InitOutcome::Started);
    assert!(matches!(second, InitOutcome::AlreadyRunning(_)));
    wait_for_connection(&f.connector, &alice, 1).await;
    assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);
    assert_eq!(f.sessions.active_sessions().await, 1);

    f.sessions.shutdown_all().await;
}

#[tokio::test]
async fn pairing_code_flow_ends_connected() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    configure(&f.store, &alice, TransportKind::PersonalBridge, false).await;
    let mut events = f.events.subscribe_user(&alice);

    assert_eq!(f.sessions.pairing_code(&alice).await, PairingStatus::NotInitialized);

    f.sessions.init(&alice).await.expect("init");
    wait_for_connection(&f.connector, &alice, 1).await;
    assert_eq!(
        f.sessions.pairing_code(&alice).await,
        PairingStatus::NotReady {
            state: SessionState::Initializing
        }
    );

    f.connector
        .emit(&alice, BridgeEvent::Qr { code: "2@pairing-payload".to_owned() })
        .await;
    wait_for_state(&f.sessions, &alice, SessionState::AwaitingPairing).await;
    assert_eq!(
        f.sessions.pairing_code(&alice).await,
        PairingStatus::Ready {
            code: "2@pairing-payload".to_owned()
        }
    );
    assert_eq!(integration_health(&f.store, &alice).await, HealthStatus::Disconnected);

    f.connector
        .emit(
            &alice,
            BridgeEvent::Connected {
                phone: Some("15550001000@s.whatsapp.net".to_owned()),
            },
        )
        .await;
    wait_for_state(&f.sessions, &alice, SessionState::Connected).await;
    assert_eq!(
        f.sessions.pairing_code(&alice).await,
        PairingStatus::AlreadyConnected {
            phone: Some("15550001000".to_owned())
        }
    );

    let integration = f
        .store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("configured");
    assert_eq!(integration.health, HealthStatus::Healthy);
    assert_eq!(integration.bridge_phone.as_deref(), Some("15550001000"));

    let issued = events.recv().await.expect("pairing event");
    assert!(matches!(
        issued.kind,
        EventKind::PairingCodeIssued { ref code } if code == "2@pairing-payload"
    ));
    let connected = events.recv().await.expect("connected event");
    assert!(matches!(connected.kind, EventKind::Connected { .. }));

    f.sessions.shutdown_all().await;
}

#[tokio::test]
async fn remote_logout_is_terminal_until_the_next_init() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    connect(&f, &alice).await;

    f.connector
        .emit(&alice, BridgeEvent::Disconnected { reason: DisconnectReason::new("logged_out") })
        .await;
    wait_for_state(&f.sessions, &alice, SessionState::LoggedOut).await;

    assert_eq!(f.sessions.pairing_code(&alice).await, PairingStatus::LoggedOut);
    assert_eq!(f.sessions.active_sessions().await, 0);
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 1);
    let integration = f
        .store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("configured");
    assert_eq!(integration.health, HealthStatus::Disconnected);
    assert!(integration.bridge_phone.is_none());

    // No reconnect was attempted on its own.
    assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);

    let again = f.sessions.init(&alice).await.expect("init");
    assert_eq!(again, InitOutcome::Started);
    wait_for_connection(&f.connector, &alice, 2).await;

    f.sessions.shutdown_all().await;
}

#[tokio::test]
async fn dropped_connection_reconnects() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    connect(&f, &alice).await;
    let mut events = f.events.subscribe_user(&alice);

    f.connector
        .emit(
            &alice,
            BridgeEvent::Disconnected {
                reason: DisconnectReason::new("connection_lost"),
            },
        )
        .await;
    wait_for_connection(&f.connector, &alice, 2).await;

    let dropped = events.recv().await.expect("disconnect event");
    match dropped.kind {
        EventKind::Disconnected { reason, logged_out } => {
            assert_eq!(reason, "connection_lost");
            assert!(!logged_out);
        }
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 0);

    f.connector
        .emit(&alice, BridgeEvent::Connected { phone: None })
        .await;
    wait_for_state(&f.sessions, &alice, SessionState::Connected).await;

    f.sessions.shutdown_all().await;
}

#[tokio::test]
async fn reconnects_stop_after_the_configured_attempts() {
    let f = fixture(2).await;
    let alice = UserRef::user("alice");
    configure(&f.store, &alice, TransportKind::PersonalBridge, false).await;
    *f.connector.fail_connects.lock().expect("fail lock") = true;

    f.sessions.init(&alice).await.expect("init");
    wait_for_state(&f.sessions, &alice, SessionState::LoggedOut).await;

    assert_eq!(f.connector.connects.load(Ordering::SeqCst), 3);
    assert_eq!(f.sessions.active_sessions().await, 0);
    assert_eq!(integration_health(&f.store, &alice).await, HealthStatus::Disconnected);
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 0);

    // The device is still paired, so sends see a transient outage.
    let snapshot = f.sessions.snapshot(&alice).await.expect("snapshot");
    assert!(snapshot.exhausted);
    let sent = f
        .sessions
        .send(&alice, "15550002000", "hello", MessageKind::Text)
        .await;
    assert_eq!(sent, Err(TransportError::NotConnected));
}

#[tokio::test]
async fn switching_transport_stops_the_bridge_session() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    connect(&f, &alice).await;
    let socket = f.connector.socket(&alice);

    let integration = f
        .sessions
        .configure(&alice, &IntegrationConfig::for_transport(TransportKind::Cloud))
        .await
        .expect("configure");
    assert_eq!(integration.transport, TransportKind::Cloud);

    assert_eq!(f.sessions.active_sessions().await, 0);
    assert_eq!(f.sessions.state(&alice).await, SessionState::Uninitialized);
    assert_eq!(socket.closes.load(Ordering::SeqCst), 1);
    assert_eq!(socket.logouts.load(Ordering::SeqCst), 0);
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 0);
    let connector = Arc::clone(&f.connector);
    let user = alice.clone();
    eventually("device feed released", move || {
        let open = connector.is_connected(&user);
        async move { !open }
    })
    .await;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(f.connector.connects.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn disabling_the_bridge_stops_the_session() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    connect(&f, &alice).await;

    let mut config = IntegrationConfig::for_transport(TransportKind::PersonalBridge);
    config.enabled = false;
    f.sessions.configure(&alice, &config).await.expect("configure");

    assert_eq!(f.sessions.active_sessions().await, 0);
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn reconfiguring_an_enabled_bridge_keeps_the_session() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    connect(&f, &alice).await;

    let mut config = IntegrationConfig::for_transport(TransportKind::PersonalBridge);
    config.auto_reply_enabled = true;
    f.sessions.configure(&alice, &config).await.expect("configure");

    assert_eq!(f.sessions.state(&alice).await, SessionState::Connected);
    assert_eq!(f.sessions.active_sessions().await, 1);

    f.sessions.shutdown_all().await;
}

#[tokio::test]
async fn resume_reconnects_enabled_bridge_users_after_restart() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    let bob = UserRef::user("bob");
    let carol = UserRef::user("carol");
    connect(&f, &alice).await;
    configure(&f.store, &bob, TransportKind::Cloud, false).await;
    let mut disabled = IntegrationConfig::for_transport(TransportKind::PersonalBridge);
    disabled.enabled = false;
    f.store
        .configure_integration(&carol, &disabled)
        .await
        .expect("configure");
    f.sessions.shutdown_all().await;

    let started = f.sessions.resume_all().await.expect("resume");

    assert_eq!(started, 1);
    wait_for_connection(&f.connector, &alice, 2).await;
    assert_eq!(f.sessions.state(&bob).await, SessionState::Uninitialized);
    assert_eq!(f.sessions.state(&carol).await, SessionState::Uninitialized);
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 0);

    let again = f.sessions.resume_all().await.expect("resume");
    assert_eq!(again, 0);

    f.sessions.shutdown_all().await;
}

#[tokio::test]
async fn disconnect_logs_out_and_forgets_the_device() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    connect(&f, &alice).await;
    let socket = f.connector.socket(&alice);

    f.sessions.disconnect(&alice).await;

    assert_eq!(socket.logouts.load(Ordering::SeqCst), 1);
    assert!(socket.closes.load(Ordering::SeqCst) >= 1);
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 1);
    assert_eq!(f.sessions.state(&alice).await, SessionState::Uninitialized);
    let integration = f
        .store
        .active_integration(&alice)
        .await
        .expect("lookup")
        .expect("configured");
    assert_eq!(integration.health, HealthStatus::Disconnected);
    assert!(integration.bridge_phone.is_none());
}

#[tokio::test]
async fn disconnect_without_a_session_still_forgets_the_device() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    configure(&f.store, &alice, TransportKind::PersonalBridge, false).await;
    let mut events = f.events.subscribe_user(&alice);

    f.sessions.disconnect(&alice).await;

    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 1);
    assert_eq!(integration_health(&f.store, &alice).await, HealthStatus::Disconnected);
    let event = events.recv().await.expect("event");
    assert!(matches!(event.kind, EventKind::Disconnected { logged_out: true, .. }));
}

#[tokio::test]
async fn shutdown_closes_sockets_but_keeps_credentials() {
    let f = fixture(0).await;
    let alice = UserRef::user("alice");
    let bob = UserRef::user("bob");
    connect(&f, &alice).await;
    connect(&f, &bob).await;
    let sockets = [f.connector.socket(&alice), f.connector.socket(&bob)];

    f.sessions.shutdown_all().await;

    for socket in &sockets {
        assert_eq!(socket.closes.load(Ordering::SeqCst), 1);
        assert_eq!(socket.logouts.load(Ordering::SeqCst), 0);
    }
    assert_eq!(f.connector.discards.load(Ordering::SeqCst), 0);
    assert_eq!(f.sessions.active_sessions().await, 0);
}

#[tokio::test]
async fn device_messages_flow_through_the_ingest_loop() {
    let mut h = Harness::new().await;
    let alice = UserRef::user("alice");
    configure(&h.store, &alice, TransportKind::PersonalBridge, false).await;
    let inbound = h.inbound_rx.take().expect("inbound receiver");
    let ingest = tokio::spawn(Arc::clone(&h.router).run_ingest(inbound));

    h.sessions.init(&alice).await.expect("init");
    wait_for_connection(&h.connector, &alice, 1).await;
    h.connector
        .emit(&alice, BridgeEvent::Connected { phone: Some("15550001000".to_owned()) })
        .await;
    for (id, from_me) in [("ECHO", true), ("3EB0", false)] {
        h.connector
            .emit(
                &alice,
                BridgeEvent::Message {
                    from: "15550002000@s.whatsapp.net".to_owned(),
                    text: "hi".to_owned(),
                    message_id: id.to_owned(),
                    timestamp: None,
                    push_name: None,
                    from_me,
                },
            )
            .await;
    }

    let store = h.store.clone();
    eventually("inbound message stored", move || {
        let store = store.clone();
        async move {
            store
                .find_message(TransportKind::PersonalBridge, Direction::Inbound, "3EB0")
                .await
                .ok()
                .flatten()
                .is_some()
        }
    })
    .await;
    let echo = h
        .store
        .find_message(TransportKind::PersonalBridge, Direction::Inbound, "ECHO")
        .await
        .expect("lookup");
    assert!(echo.is_none());

    let stored = h
        .store
        .find_message(TransportKind::PersonalBridge, Direction::Inbound, "3EB0")
        .await
        .expect("lookup")
        .expect("stored");
    assert_eq!(stored.user, alice);
    assert_eq!(stored.recipient, "15550001000");

    h.sessions.shutdown_all().await;
    ingest.abort();
}
