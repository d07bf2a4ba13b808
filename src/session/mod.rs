//! Personal-bridge session manager.
//!
//! Each user's bridge session is one Tokio task (the session actor) that owns
//! the live socket, applies the [`state`] machine to every transport event,
//! mirrors transitions into the user's integration record and publishes the
//! matching lifecycle event. The [`SessionManager`] holds one handle per
//! user: a command channel into the actor and a `watch` snapshot of its
//! state, pairing code, phone and socket.
//!
//! # Concurrency
//!
//! The handle map lock is held across the liveness check and the spawn in
//! [`SessionManager::init`], so two concurrent inits for one user cannot
//! open two sockets. Reconnect sleeps race the command channel, so
//! [`SessionManager::disconnect`] cancels a pending reconnect immediately.

pub mod backoff;
pub mod state;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::bridge::{BridgeConnection, BridgeConnector, BridgeEvent, BridgeSocket};
use crate::events::{EventKind, EventPublisher};
use crate::store::{Integration, IntegrationConfig, MessageStore, StoreError};
use crate::transport::bridge::normalize_event;
use crate::transport::{InboundEnvelope, TransportError};
use crate::types::{normalize_phone, HealthStatus, MessageKind, TransportKind, UserRef};

pub use self::backoff::ReconnectPolicy;
pub use self::state::{transition, SessionState, SessionTrigger};

/// Commands buffered per session actor.
const COMMAND_CHANNEL_CAPACITY: usize = 8;

/// How long `disconnect`/`shutdown_all` wait for an actor to finish teardown.
const TEARDOWN_TIMEOUT_SECS: u64 = 15;

/// Close reason recorded for an explicit disconnect.
const DISCONNECT_REASON: &str = "disconnect_requested";

/// Close reason recorded when reconnect attempts run out.
const EXHAUSTED_REASON: &str = "reconnect_exhausted";

/// Errors from session management.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The user's active integration is not a personal bridge.
    #[error("no personal bridge integration configured for {0}")]
    NotConfigured(String),

    /// The user's personal bridge integration is disabled.
    #[error("personal bridge integration for {0} is disabled")]
    Disabled(String),

    /// Store access failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result of [`SessionManager::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "state", rename_all = "snake_case")]
pub enum InitOutcome {
    /// A new session actor was started.
    Started,
    /// A live session already exists; nothing was started.
    AlreadyRunning(SessionState),
}

/// Result of [`SessionManager::pairing_code`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PairingStatus {
    /// A code is waiting to be scanned.
    Ready {
        /// Opaque pairing payload.
        code: String,
    },
    /// The session is starting and has not issued a code yet.
    NotReady {
        /// Current session state.
        state: SessionState,
    },
    /// The device is already paired and connected.
    AlreadyConnected {
        /// Phone number of the paired device.
        phone: Option<String>,
    },
    /// The session was logged out; call init to pair again.
    LoggedOut,
    /// No session was ever started.
    NotInitialized,
}

/// Point-in-time view of one session.
#[derive(Clone)]
pub struct SessionSnapshot {
    /// Current state.
    pub state: SessionState,
    /// Pairing code, while awaiting pairing.
    pub pairing_code: Option<String>,
    /// Device phone number, once connected.
    pub phone: Option<String>,
    /// Live socket, while a connection is open.
    pub socket: Option<Arc<dyn BridgeSocket>>,
    /// The session stopped because reconnect attempts ran out. The device is
    /// still paired; only the connection is gone.
    pub exhausted: bool,
}

impl std::fmt::Debug for SessionSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionSnapshot")
            .field("state", &self.state)
            .field("pairing_code", &self.pairing_code.as_ref().map(|_| "[present]"))
            .field("phone", &self.phone)
            .field("socket", &self.socket.is_some())
            .field("exhausted", &self.exhausted)
            .finish()
    }
}

impl SessionSnapshot {
    fn new(state: SessionState) -> Self {
        Self {
            state,
            pairing_code: None,
            phone: None,
            socket: None,
            exhausted: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

/// Dependencies shared by the manager and every session actor.
struct SessionContext {
    connector: Arc<dyn BridgeConnector>,
    store: MessageStore,
    events: EventPublisher,
    inbound_tx: mpsc::Sender<InboundEnvelope>,
    policy: ReconnectPolicy,
}

impl SessionContext {
    async fn mirror(&self, user: &UserRef, health: HealthStatus, last_error: Option<&str>) {
        if let Err(e) = self
            .store
            .record_health(user, TransportKind::PersonalBridge, health, last_error)
            .await
        {
            warn!(user = %user, error = %e, "failed to mirror session health");
        }
    }

    async fn forget_device(&self, user: &UserRef) {
        if let Err(e) = self.connector.discard_credentials(user).await {
            warn!(user = %user, error = %e, "failed to discard bridge credentials");
        }
        if let Err(e) = self.store.set_bridge_phone(user, None).await {
            warn!(user = %user, error = %e, "failed to clear bridge phone");
        }
    }
}

struct SessionHandle {
    generation: u64,
    snapshot: watch::Receiver<SessionSnapshot>,
    commands: mpsc::Sender<Command>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        self.snapshot.borrow().state.is_live() && !self.task.is_finished()
    }
}

/// Owns every user's bridge session actor.
pub struct SessionManager {
    ctx: Arc<SessionContext>,
    sessions: Mutex<HashMap<String, SessionHandle>>,
    generation: AtomicU64,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("policy", &self.ctx.policy)
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    /// Create a manager. Inbound messages and receipts from every session are
    /// forwarded on `inbound_tx`.
    pub fn new(
        connector: Arc<dyn BridgeConnector>,
        store: MessageStore,
        events: EventPublisher,
        inbound_tx: mpsc::Sender<InboundEnvelope>,
        policy: ReconnectPolicy,
    ) -> Self {
        Self {
            ctx: Arc::new(SessionContext {
                connector,
                store,
                events,
                inbound_tx,
                policy,
            }),
            sessions: Mutex::new(HashMap::new()),
            generation: AtomicU64::new(1),
        }
    }

    /// Start the user's bridge session unless a live one exists.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotConfigured`] when the user's active
    /// integration is not a personal bridge, [`SessionError::Disabled`] when
    /// it is disabled, or [`SessionError::Store`] on store failure.
    pub async fn init(&self, user: &UserRef) -> Result<InitOutcome, SessionError> {
        match self.ctx.store.active_integration(user).await? {
            Some(i) if i.transport == TransportKind::PersonalBridge && i.enabled => {}
            Some(i) if i.transport == TransportKind::PersonalBridge => {
                return Err(SessionError::Disabled(user.key()));
            }
            _ => return Err(SessionError::NotConfigured(user.key())),
        }

        let key = user.key();
        let mut sessions = self.sessions.lock().await;

        let previous = match sessions.get(&key) {
            Some(handle) if handle.is_live() => {
                let state = handle.snapshot.borrow().state;
                debug!(user = %user, %state, "init ignored, session already running");
                return Ok(InitOutcome::AlreadyRunning(state));
            }
            Some(handle) => handle.snapshot.borrow().state,
            None => SessionState::Uninitialized,
        };
        let initial =
            transition(previous, SessionTrigger::Init).unwrap_or(SessionState::Initializing);

        let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::new(initial));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let actor = SessionActor {
            user: user.clone(),
            ctx: Arc::clone(&self.ctx),
            snapshot: snapshot_tx,
            commands: command_rx,
            attempt: 0,
        };
        let task = tokio::spawn(actor.run());

        sessions.insert(
            key,
            SessionHandle {
                generation: self.generation.fetch_add(1, Ordering::Relaxed),
                snapshot: snapshot_rx,
                commands: command_tx,
                task,
            },
        );
        info!(user = %user, "bridge session started");
        Ok(InitOutcome::Started)
    }

    /// Current pairing status for the user.
    pub async fn pairing_code(&self, user: &UserRef) -> PairingStatus {
        let Some(snapshot) = self.snapshot(user).await else {
            return PairingStatus::NotInitialized;
        };
        match (snapshot.state, snapshot.pairing_code) {
            (SessionState::Connected, _) => PairingStatus::AlreadyConnected {
                phone: snapshot.phone,
            },
            (SessionState::LoggedOut, _) => PairingStatus::LoggedOut,
            (SessionState::AwaitingPairing, Some(code)) => PairingStatus::Ready { code },
            (state, _) => PairingStatus::NotReady { state },
        }
    }

    /// Current state of the user's session.
    pub async fn state(&self, user: &UserRef) -> SessionState {
        self.snapshot(user)
            .await
            .map_or(SessionState::Uninitialized, |s| s.state)
    }

    /// Snapshot of the user's session, if one was ever started.
    pub async fn snapshot(&self, user: &UserRef) -> Option<SessionSnapshot> {
        let sessions = self.sessions.lock().await;
        sessions
            .get(&user.key())
            .map(|h| h.snapshot.borrow().clone())
    }

    /// Number of sessions that are not logged out.
    pub async fn active_sessions(&self) -> usize {
        let sessions = self.sessions.lock().await;
        sessions.values().filter(|h| h.is_live()).count()
    }

    /// Send a message over the user's live socket.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::LoggedOut`] for a logged-out session,
    /// [`TransportError::NotConnected`] unless the session is connected
    /// (including a session that gave up reconnecting), or the classified
    /// socket failure.
    pub async fn send(
        &self,
        user: &UserRef,
        recipient: &str,
        content: &str,
        kind: MessageKind,
    ) -> Result<String, TransportError> {
        let snapshot = self.snapshot(user).await.ok_or(TransportError::NotConnected)?;
        let socket = match (snapshot.state, snapshot.socket) {
            (SessionState::LoggedOut, _) if !snapshot.exhausted => {
                return Err(TransportError::LoggedOut)
            }
            (SessionState::Connected, Some(socket)) => socket,
            _ => return Err(TransportError::NotConnected),
        };
        if kind == MessageKind::Template {
            return Err(TransportError::TransportRejected {
                transport: TransportKind::PersonalBridge,
                reason: "template messages are not supported by the personal bridge".to_owned(),
            });
        }
        socket
            .send_text(recipient, content)
            .await
            .map_err(TransportError::from)
    }

    /// Apply a user's integration config and stop any bridge session it no
    /// longer covers.
    ///
    /// A switch away from the personal bridge, or disabling it, stops the
    /// session but keeps the paired device so a later switch back can resume.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] on store failure.
    pub async fn configure(
        &self,
        user: &UserRef,
        config: &IntegrationConfig,
    ) -> Result<Integration, SessionError> {
        let integration = self.ctx.store.configure_integration(user, config).await?;
        if integration.transport != TransportKind::PersonalBridge || !integration.enabled {
            self.stop(user).await;
        }
        Ok(integration)
    }

    /// Start a session for every user whose active integration is an enabled
    /// personal bridge. Returns how many sessions were started.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Store`] when the users cannot be listed.
    pub async fn resume_all(&self) -> Result<usize, SessionError> {
        let mut started = 0;
        for user in self.ctx.store.active_bridge_users().await? {
            match self.init(&user).await {
                Ok(InitOutcome::Started) => started += 1,
                Ok(InitOutcome::AlreadyRunning(_)) => {}
                Err(e) => warn!(user = %user, error = %e, "failed to resume bridge session"),
            }
        }
        info!(sessions = started, "bridge sessions resumed");
        Ok(started)
    }

    /// Close the user's session without logging out or discarding the
    /// paired device. No-op when nothing is running.
    pub async fn stop(&self, user: &UserRef) {
        let key = user.key();
        let handle = {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&key)
        };
        let Some(handle) = handle else {
            return;
        };
        if !handle.task.is_finished() {
            Self::shut_down(&key, handle).await;
        }
        info!(user = %user, "bridge session stopped");
    }

    /// Tear the user's session down and forget the paired device.
    ///
    /// Works in any state, including when no session is running: stored
    /// credentials are discarded and the integration is marked disconnected.
    pub async fn disconnect(&self, user: &UserRef) {
        let key = user.key();
        let target = {
            let sessions = self.sessions.lock().await;
            sessions
                .get(&key)
                .filter(|h| !h.task.is_finished())
                .map(|h| (h.generation, h.commands.clone()))
        };

        let handled = match target {
            Some((generation, commands)) => {
                let (done_tx, done_rx) = oneshot::channel();
                let stopped = commands.send(Command::Disconnect(done_tx)).await.is_ok()
                    && tokio::time::timeout(Duration::from_secs(TEARDOWN_TIMEOUT_SECS), done_rx)
                        .await
                        .is_ok_and(|r| r.is_ok());
                self.remove(&key, generation, !stopped).await;
                stopped
            }
            None => false,
        };

        if !handled {
            // No actor to run the teardown; apply its effects directly.
            self.ctx.forget_device(user).await;
            self.ctx.mirror(user, HealthStatus::Disconnected, None).await;
            self.ctx.events.publish(
                user,
                EventKind::Disconnected {
                    reason: DISCONNECT_REASON.to_owned(),
                    logged_out: true,
                },
            );
            let mut sessions = self.sessions.lock().await;
            sessions.remove(&key);
        }
        info!(user = %user, "bridge session disconnected");
    }

    /// Close every socket without logging out, for process shutdown.
    pub async fn shutdown_all(&self) {
        let handles: Vec<(String, SessionHandle)> = {
            let mut sessions = self.sessions.lock().await;
            sessions.drain().collect()
        };

        for (key, handle) in handles {
            if handle.task.is_finished() {
                continue;
            }
            Self::shut_down(&key, handle).await;
        }
        info!("all bridge sessions shut down");
    }

    async fn shut_down(key: &str, handle: SessionHandle) {
        let (done_tx, done_rx) = oneshot::channel();
        let stopped = handle.commands.send(Command::Shutdown(done_tx)).await.is_ok()
            && tokio::time::timeout(Duration::from_secs(TEARDOWN_TIMEOUT_SECS), done_rx)
                .await
                .is_ok_and(|r| r.is_ok());
        if !stopped {
            warn!(session = %key, "session did not stop in time, aborting");
            handle.task.abort();
        }
    }

    async fn remove(&self, key: &str, generation: u64, abort: bool) {
        let mut sessions = self.sessions.lock().await;
        if sessions.get(key).is_some_and(|h| h.generation == generation) {
            if let Some(handle) = sessions.remove(key) {
                if abort {
                    handle.task.abort();
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Actor
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Command {
    /// Log out, discard credentials and stop.
    Disconnect(oneshot::Sender<()>),
    /// Close the socket and stop, keeping credentials.
    Shutdown(oneshot::Sender<()>),
}

enum ConnectStep {
    Command(Option<Command>),
    Connected(Result<BridgeConnection, crate::bridge::BridgeError>),
}

enum PumpStep {
    Command(Option<Command>),
    Event(Option<BridgeEvent>),
}

enum PumpExit {
    Stopped,
    Dropped(String),
}

struct SessionActor {
    user: UserRef,
    ctx: Arc<SessionContext>,
    snapshot: watch::Sender<SessionSnapshot>,
    commands: mpsc::Receiver<Command>,
    attempt: u32,
}

impl SessionActor {
    async fn run(mut self) {
        let initial = self.snapshot.borrow().state;
        self.ctx.mirror(&self.user, initial.health(), None).await;

        loop {
            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => ConnectStep::Command(cmd),
                result = self.ctx.connector.connect(&self.user) => ConnectStep::Connected(result),
            };

            let reason = match step {
                ConnectStep::Command(cmd) => {
                    self.handle_command(cmd, None).await;
                    return;
                }
                ConnectStep::Connected(Ok(connection)) => match self.pump(connection).await {
                    PumpExit::Stopped => return,
                    PumpExit::Dropped(reason) => reason,
                },
                ConnectStep::Connected(Err(e)) => {
                    warn!(user = %self.user, error = %e, "bridge connect failed");
                    format!("connect failed: {e}")
                }
            };

            if !self.schedule_reconnect(reason).await {
                return;
            }
        }
    }

    /// Drive one open connection until it drops or a command stops it.
    async fn pump(&mut self, connection: BridgeConnection) -> PumpExit {
        let BridgeConnection { socket, mut events } = connection;
        self.snapshot
            .send_modify(|s| s.socket = Some(Arc::clone(&socket)));

        loop {
            let step = tokio::select! {
                biased;
                cmd = self.commands.recv() => PumpStep::Command(cmd),
                event = events.recv() => PumpStep::Event(event),
            };

            match step {
                PumpStep::Command(cmd) => {
                    self.handle_command(cmd, Some(&socket)).await;
                    return PumpExit::Stopped;
                }
                PumpStep::Event(None) => {
                    socket.close().await;
                    return PumpExit::Dropped("event feed closed".to_owned());
                }
                PumpStep::Event(Some(event)) => {
                    if let Some(exit) = self.on_event(event, &socket).await {
                        return exit;
                    }
                }
            }
        }
    }

    async fn on_event(
        &mut self,
        event: BridgeEvent,
        socket: &Arc<dyn BridgeSocket>,
    ) -> Option<PumpExit> {
        match event {
            BridgeEvent::Qr { code } => {
                let published = code.clone();
                self.enter(
                    SessionTrigger::PairingCode,
                    |s| s.pairing_code = Some(code),
                    Some(EventKind::PairingCodeIssued { code: published }),
                    None,
                )
                .await;
                None
            }
            BridgeEvent::Connected { phone } => {
                let phone = phone.as_deref().and_then(normalize_phone);
                self.attempt = 0;
                let entered = self
                    .enter(
                        SessionTrigger::Opened,
                        |s| {
                            s.pairing_code = None;
                            s.phone.clone_from(&phone);
                        },
                        Some(EventKind::Connected {
                            phone: phone.clone(),
                        }),
                        None,
                    )
                    .await;
                if entered {
                    let recorded = self
                        .ctx
                        .store
                        .set_bridge_phone(&self.user, phone.as_deref())
                        .await;
                    if let Err(e) = recorded {
                        warn!(user = %self.user, error = %e, "failed to record bridge phone");
                    }
                }
                None
            }
            BridgeEvent::Disconnected { reason } => {
                socket.close().await;
                if reason.is_logged_out() {
                    info!(user = %self.user, %reason, "bridge session logged out remotely");
                    self.ctx.forget_device(&self.user).await;
                    self.enter(
                        SessionTrigger::Closed { logged_out: true },
                        clear_connection,
                        Some(EventKind::Disconnected {
                            reason: reason.to_string(),
                            logged_out: true,
                        }),
                        Some(reason.as_str()),
                    )
                    .await;
                    Some(PumpExit::Stopped)
                } else {
                    Some(PumpExit::Dropped(reason.to_string()))
                }
            }
            other @ (BridgeEvent::Message { .. } | BridgeEvent::Receipt { .. }) => {
                let own_phone = self.snapshot.borrow().phone.clone();
                if let Some(item) = normalize_event(&self.user, &other, own_phone.as_deref()) {
                    let envelope = InboundEnvelope {
                        user: self.user.clone(),
                        items: vec![item],
                    };
                    if self.ctx.inbound_tx.send(envelope).await.is_err() {
                        warn!(user = %self.user, "inbound channel closed, dropping bridge event");
                    }
                }
                None
            }
        }
    }

    /// Enter `Reconnecting` and wait out the backoff.
    ///
    /// Returns `false` when the actor should stop (cancelled or exhausted).
    async fn schedule_reconnect(&mut self, reason: String) -> bool {
        self.enter(
            SessionTrigger::Closed { logged_out: false },
            clear_connection,
            Some(EventKind::Disconnected {
                reason: reason.clone(),
                logged_out: false,
            }),
            Some(&reason),
        )
        .await;

        self.attempt = self.attempt.saturating_add(1);
        if self.ctx.policy.exhausted(self.attempt) {
            warn!(user = %self.user, attempts = self.attempt - 1, "reconnect attempts exhausted");
            self.enter(
                SessionTrigger::Disconnect,
                |s| {
                    clear_connection(s);
                    s.exhausted = true;
                },
                Some(EventKind::Disconnected {
                    reason: EXHAUSTED_REASON.to_owned(),
                    logged_out: false,
                }),
                Some(EXHAUSTED_REASON),
            )
            .await;
            return false;
        }

        let delay = self.ctx.policy.delay(self.attempt);
        info!(
            user = %self.user,
            attempt = self.attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "bridge reconnect scheduled"
        );

        let cancelled = tokio::select! {
            biased;
            cmd = self.commands.recv() => Some(cmd),
            () = tokio::time::sleep(delay) => None,
        };
        if let Some(cmd) = cancelled {
            self.handle_command(cmd, None).await;
            return false;
        }

        self.enter(SessionTrigger::Init, |_| {}, None, None).await;
        true
    }

    async fn handle_command(
        &mut self,
        cmd: Option<Command>,
        socket: Option<&Arc<dyn BridgeSocket>>,
    ) {
        match cmd {
            Some(Command::Disconnect(done)) => {
                if let Some(socket) = socket {
                    if let Err(e) = socket.logout().await {
                        warn!(
                            user = %self.user,
                            error = %e,
                            "bridge logout failed, closing anyway"
                        );
                    }
                    socket.close().await;
                }
                self.ctx.forget_device(&self.user).await;
                let entered = self
                    .enter(
                        SessionTrigger::Disconnect,
                        |s| {
                            clear_connection(s);
                            s.phone = None;
                        },
                        Some(EventKind::Disconnected {
                            reason: DISCONNECT_REASON.to_owned(),
                            logged_out: true,
                        }),
                        None,
                    )
                    .await;
                if !entered {
                    self.ctx.mirror(&self.user, HealthStatus::Disconnected, None).await;
                }
                let _ = done.send(());
            }
            Some(Command::Shutdown(done)) => {
                if let Some(socket) = socket {
                    socket.close().await;
                }
                self.ctx.mirror(&self.user, HealthStatus::Disconnected, None).await;
                let _ = done.send(());
            }
            None => {
                if let Some(socket) = socket {
                    socket.close().await;
                }
            }
        }
    }

    /// Apply `trigger`; on a real transition update the snapshot, mirror the
    /// health and publish `event`. Returns whether the state changed.
    async fn enter(
        &self,
        trigger: SessionTrigger,
        update: impl FnOnce(&mut SessionSnapshot),
        event: Option<EventKind>,
        last_error: Option<&str>,
    ) -> bool {
        let current = self.snapshot.borrow().state;
        let Some(next) = transition(current, trigger) else {
            debug!(user = %self.user, state = %current, ?trigger, "trigger ignored");
            return false;
        };

        self.snapshot.send_modify(|s| {
            s.state = next;
            update(s);
        });
        info!(user = %self.user, from = %current, to = %next, "session state changed");
        self.ctx.mirror(&self.user, next.health(), last_error).await;
        if let Some(event) = event {
            self.ctx.events.publish(&self.user, event);
        }
        true
    }
}

fn clear_connection(snapshot: &mut SessionSnapshot) {
    snapshot.socket = None;
    snapshot.pairing_code = None;
}
