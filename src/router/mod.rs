//! Unified router: the single entry point for sends and inbound ingestion.
//!
//! A send resolves the user's active integration, dispatches to the matching
//! transport under a bounded timeout, records every attempt, and retries once
//! through the shared fallback sender when the failure qualifies and the
//! integration allows it. Sends for one user are serialised by a per-user
//! FIFO lock, so they are dispatched and recorded in submission order while
//! other users proceed independently.

pub mod autoreply;
pub mod registry;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventPublisher};
use crate::session::{SessionManager, SessionState};
use crate::store::{Integration, MessageStore, OutboundRecord, StoreError};
use crate::transport::cloud::webhook_changes;
use crate::transport::{
    DeliveryPath, InboundEnvelope, InboundItem, OutboundMessage, SendContext, SendReceipt,
    TransportError,
};
use crate::types::{
    normalize_phone, DeliveryStatus, Direction, MessageKind, TransportKind, UserRef,
};

pub use self::autoreply::spawn_auto_reply;
pub use self::registry::TransportRegistry;

/// A send submitted by a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendRequest {
    /// Recipient phone number or JID, in any common format.
    pub recipient: String,
    /// Text body, or the template name for template sends.
    pub content: String,
    /// Requested message type.
    pub kind: MessageKind,
}

impl SendRequest {
    /// A plain text send.
    pub fn text(recipient: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            recipient: recipient.into(),
            content: content.into(),
            kind: MessageKind::Text,
        }
    }
}

/// Result of a successful send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOutcome {
    /// Provider message id.
    pub message_id: String,
    /// Transport that delivered the message.
    pub transport: TransportKind,
    /// Whether the shared fallback sender rescued a failed primary attempt.
    pub fell_back: bool,
    /// Which delivery path succeeded.
    pub path: DeliveryPath,
}

/// Why a send did not produce a message id.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Recipient could not be parsed as a phone number.
    #[error("invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Empty message body.
    #[error("message content is empty")]
    EmptyContent,

    /// The user has no active integration.
    #[error("no active integration for {0}")]
    NoIntegration(String),

    /// The user's integration is switched off.
    #[error("integration for {0} is disabled")]
    IntegrationDisabled(String),

    /// The recipient is blocked by the user.
    #[error("contact {0} is blocked")]
    ContactBlocked(String),

    /// The transport (and fallback, if attempted) failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Store access failed before dispatch.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl SendError {
    /// Machine-readable kind for API callers.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRecipient(_) => "invalid_recipient",
            Self::EmptyContent => "empty_content",
            Self::NoIntegration(_) => "no_integration",
            Self::IntegrationDisabled(_) => "integration_disabled",
            Self::ContactBlocked(_) => "contact_blocked",
            Self::Transport(e) => e.code(),
            Self::Store(_) => "internal",
        }
    }
}

/// Integration record plus live session and credit state.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationStatus {
    /// Active integration, if configured.
    pub integration: Option<Integration>,
    /// Live bridge session state, for personal-bridge integrations.
    pub session: Option<SessionState>,
    /// Shared fallback credit balance.
    pub credits: i64,
}

/// Counts from one [`Router::ingest`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestReport {
    /// New messages stored.
    pub stored: usize,
    /// Messages ignored as already stored.
    pub duplicates: usize,
    /// Receipts that advanced a delivery status.
    pub statuses: usize,
    /// Webhook items that could not be attributed to any user.
    pub unrouted: usize,
}

impl std::ops::AddAssign for IngestReport {
    fn add_assign(&mut self, other: Self) {
        self.stored += other.stored;
        self.duplicates += other.duplicates;
        self.statuses += other.statuses;
        self.unrouted += other.unrouted;
    }
}

/// Routes sends to transports and inbound events to the store.
pub struct Router {
    store: MessageStore,
    registry: TransportRegistry,
    sessions: Arc<SessionManager>,
    events: EventPublisher,
    send_timeout: Duration,
    fallback_number: Option<String>,
    user_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("registry", &self.registry)
            .field("send_timeout", &self.send_timeout)
            .finish_non_exhaustive()
    }
}

impl Router {
    /// Create a router over the registered transports.
    pub fn new(
        store: MessageStore,
        registry: TransportRegistry,
        sessions: Arc<SessionManager>,
        events: EventPublisher,
        send_timeout: Duration,
    ) -> Self {
        Self {
            store,
            registry,
            sessions,
            events,
            send_timeout,
            fallback_number: None,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Set the platform fallback sender's phone number id, so webhook
    /// traffic addressed to it is attributed per user.
    #[must_use]
    pub fn with_fallback_number(mut self, phone_number_id: Option<String>) -> Self {
        self.fallback_number = phone_number_id;
        self
    }

    /// The store this router records into.
    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// The event publisher this router emits on.
    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// The bridge session manager.
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Send a message on behalf of `user`.
    ///
    /// # Errors
    ///
    /// Returns [`SendError`] when validation fails, the integration is
    /// missing or disabled, the contact is blocked, or every permitted
    /// transport attempt failed. When the fallback was attempted and also
    /// failed, the fallback's error is returned.
    pub async fn send_message(
        &self,
        user: &UserRef,
        request: SendRequest,
    ) -> Result<SendOutcome, SendError> {
        let recipient = normalize_phone(&request.recipient)
            .ok_or_else(|| SendError::InvalidRecipient(request.recipient.clone()))?;
        if request.content.trim().is_empty() {
            return Err(SendError::EmptyContent);
        }

        let lock = self.user_lock(user).await;
        let _guard = lock.lock().await;

        let integration = self
            .store
            .active_integration(user)
            .await?
            .ok_or_else(|| SendError::NoIntegration(user.key()))?;
        if !integration.enabled {
            return Err(SendError::IntegrationDisabled(user.key()));
        }
        if self.store.is_blocked(user, &recipient).await? {
            return Err(SendError::ContactBlocked(recipient));
        }

        let primary = integration.transport;
        let fallback_enabled = integration.fallback_enabled;
        let ctx = SendContext {
            user: user.clone(),
            integration,
        };
        let message = OutboundMessage {
            recipient,
            content: request.content,
            kind: request.kind,
        };

        let primary_err = match self.attempt(&ctx, primary, &message).await {
            Ok(receipt) => {
                return Ok(self
                    .record_success(&ctx, primary, &message, receipt, false)
                    .await)
            }
            Err(e) => {
                self.record_failure(&ctx, primary, &message, &e).await;
                e
            }
        };

        let may_fall_back = primary != TransportKind::SharedFallback
            && fallback_enabled
            && primary_err.is_fallback_eligible();
        if !may_fall_back {
            return Err(primary_err.into());
        }

        info!(
            user = %user,
            transport = %primary,
            error = %primary_err,
            "primary transport failed, retrying through shared fallback"
        );
        match self.attempt(&ctx, TransportKind::SharedFallback, &message).await {
            Ok(receipt) => Ok(self
                .record_success(&ctx, TransportKind::SharedFallback, &message, receipt, true)
                .await),
            Err(e) => {
                self.record_failure(&ctx, TransportKind::SharedFallback, &message, &e)
                    .await;
                Err(e.into())
            }
        }
    }

    /// Store inbound items and apply receipts.
    pub async fn ingest(&self, envelope: InboundEnvelope) -> IngestReport {
        let mut report = IngestReport::default();
        let user = envelope.user;

        for item in envelope.items {
            match item {
                InboundItem::Message(message) => match self.store.record_inbound(&message).await {
                    Ok(Some(stored)) => {
                        report.stored += 1;
                        if let Err(e) = self.store.record_received(&user).await {
                            warn!(user = %user, error = %e, "failed to count received message");
                        }
                        debug!(
                            user = %user,
                            transport = %message.transport,
                            message_id = %message.provider_message_id,
                            "inbound message stored"
                        );
                        self.events
                            .publish(&user, EventKind::MessageReceived { message: stored });
                    }
                    Ok(None) => report.duplicates += 1,
                    Err(e) => warn!(
                        user = %user,
                        message_id = %message.provider_message_id,
                        error = %e,
                        "failed to store inbound message"
                    ),
                },
                InboundItem::Status {
                    transport,
                    provider_message_id,
                    status,
                } => match self
                    .store
                    .update_delivery_status(transport, &provider_message_id, status)
                    .await
                {
                    Ok(true) => report.statuses += 1,
                    Ok(false) => debug!(
                        user = %user,
                        message_id = %provider_message_id,
                        status = status.as_str(),
                        "receipt ignored"
                    ),
                    Err(e) => warn!(user = %user, error = %e, "failed to apply receipt"),
                },
            }
        }
        report
    }

    /// Route a cloud webhook batch to its users and ingest it.
    ///
    /// Changes addressed to a user's own number go to that user. Changes
    /// addressed to the platform fallback number are attributed per item:
    /// receipts to the sender of the original message, replies to the user
    /// who last wrote to that contact through the fallback sender.
    pub async fn ingest_webhook(&self, payload: &Value) -> IngestReport {
        let mut report = IngestReport::default();
        for (phone_number_id, value) in webhook_changes(payload) {
            if self.fallback_number.as_deref() == Some(phone_number_id.as_str()) {
                report += self.ingest_fallback_change(value).await;
                continue;
            }

            let user = match self.store.find_user_by_cloud_number(&phone_number_id).await {
                Ok(Some(user)) => user,
                Ok(None) => {
                    debug!(phone_number_id = %phone_number_id, "webhook change for unknown number");
                    report.unrouted += 1;
                    continue;
                }
                Err(e) => {
                    warn!(phone_number_id = %phone_number_id, error = %e, "webhook routing failed");
                    report.unrouted += 1;
                    continue;
                }
            };
            let Some(cloud) = self.registry.get(TransportKind::Cloud) else {
                warn!("cloud transport is not registered, webhook change dropped");
                report.unrouted += 1;
                continue;
            };
            let items = cloud.normalize_inbound(&user, value);
            report += self.ingest(InboundEnvelope { user, items }).await;
        }
        report
    }

    async fn ingest_fallback_change(&self, value: &Value) -> IngestReport {
        let mut report = IngestReport::default();
        let Some(fallback) = self.registry.get(TransportKind::SharedFallback) else {
            warn!("fallback transport is not registered, webhook change dropped");
            report.unrouted += 1;
            return report;
        };

        // Items are normalised unattributed, then re-addressed one by one.
        let unattributed = UserRef::user(String::new());
        for item in fallback.normalize_inbound(&unattributed, value) {
            let owner = match &item {
                InboundItem::Message(m) => {
                    self.store
                        .last_sender_to(TransportKind::SharedFallback, &m.from)
                        .await
                }
                InboundItem::Status {
                    provider_message_id,
                    ..
                } => self
                    .store
                    .find_message(
                        TransportKind::SharedFallback,
                        Direction::Outbound,
                        provider_message_id,
                    )
                    .await
                    .map(|m| m.map(|m| m.user)),
            };
            let user = match owner {
                Ok(Some(user)) => user,
                Ok(None) => {
                    debug!("fallback webhook item without a known sender");
                    report.unrouted += 1;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "fallback webhook routing failed");
                    report.unrouted += 1;
                    continue;
                }
            };
            let item = match item {
                InboundItem::Message(mut m) => {
                    m.user = user.clone();
                    InboundItem::Message(m)
                }
                status => status,
            };
            report += self
                .ingest(InboundEnvelope {
                    user,
                    items: vec![item],
                })
                .await;
        }
        report
    }

    /// Consume the session manager's inbound channel until it closes.
    pub async fn run_ingest(self: Arc<Self>, mut rx: mpsc::Receiver<InboundEnvelope>) {
        while let Some(envelope) = rx.recv().await {
            self.ingest(envelope).await;
        }
        debug!("inbound ingest loop stopped");
    }

    /// Integration, live session state and credit balance for `user`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on store failure.
    pub async fn integration_status(
        &self,
        user: &UserRef,
    ) -> Result<IntegrationStatus, StoreError> {
        let integration = self.store.active_integration(user).await?;
        let session = match &integration {
            Some(i) if i.transport == TransportKind::PersonalBridge => {
                Some(self.sessions.state(user).await)
            }
            _ => None,
        };
        let credits = self.store.credit_balance(user).await?;
        Ok(IntegrationStatus {
            integration,
            session,
            credits,
        })
    }

    async fn user_lock(&self, user: &UserRef) -> Arc<Mutex<()>> {
        let mut locks = self.user_locks.lock().await;
        Arc::clone(locks.entry(user.key()).or_default())
    }

    async fn attempt(
        &self,
        ctx: &SendContext,
        kind: TransportKind,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError> {
        let transport = self
            .registry
            .get(kind)
            .ok_or_else(|| {
                TransportError::Internal(format!("{kind} transport is not registered"))
            })?;
        match tokio::time::timeout(self.send_timeout, transport.send(ctx, message)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::timed_out(kind)),
        }
    }

    async fn record_success(
        &self,
        ctx: &SendContext,
        transport: TransportKind,
        message: &OutboundMessage,
        receipt: SendReceipt,
        fell_back: bool,
    ) -> SendOutcome {
        let kind = match receipt.path {
            DeliveryPath::Template => MessageKind::Template,
            DeliveryPath::Direct | DeliveryPath::FreeformAfterTemplate => message.kind,
        };
        let record = OutboundRecord {
            user: ctx.user.clone(),
            recipient: message.recipient.clone(),
            body: message.content.clone(),
            kind,
            transport,
            provider_message_id: Some(receipt.message_id.clone()),
            status: DeliveryStatus::Sent,
            error: None,
        };
        if let Err(e) = self.store.record_outbound(&record).await {
            warn!(
                user = %ctx.user,
                message_id = %receipt.message_id,
                error = %e,
                "failed to record sent message"
            );
        }
        if let Err(e) = self.store.record_send_success(&ctx.user, transport).await {
            warn!(user = %ctx.user, error = %e, "failed to count sent message");
        }

        info!(
            user = %ctx.user,
            transport = %transport,
            message_id = %receipt.message_id,
            path = receipt.path.as_str(),
            fell_back,
            "message sent"
        );
        self.events.publish(
            &ctx.user,
            EventKind::MessageSent {
                message_id: receipt.message_id.clone(),
                transport,
                recipient: message.recipient.clone(),
                fell_back,
            },
        );

        SendOutcome {
            message_id: receipt.message_id,
            transport,
            fell_back,
            path: receipt.path,
        }
    }

    async fn record_failure(
        &self,
        ctx: &SendContext,
        transport: TransportKind,
        message: &OutboundMessage,
        error: &TransportError,
    ) {
        let text = error.to_string();
        let record = OutboundRecord {
            user: ctx.user.clone(),
            recipient: message.recipient.clone(),
            body: message.content.clone(),
            kind: message.kind,
            transport,
            provider_message_id: None,
            status: DeliveryStatus::Failed,
            error: Some(text.clone()),
        };
        if let Err(e) = self.store.record_outbound(&record).await {
            warn!(user = %ctx.user, error = %e, "failed to record failed attempt");
        }
        if let Err(e) = self
            .store
            .record_send_failure(&ctx.user, transport, error.health(), &text)
            .await
        {
            warn!(user = %ctx.user, error = %e, "failed to count send failure");
        }

        warn!(
            user = %ctx.user,
            transport = %transport,
            code = error.code(),
            error = %text,
            "send attempt failed"
        );
        self.events.publish(
            &ctx.user,
            EventKind::SendFailed {
                transport,
                recipient: message.recipient.clone(),
                error: text,
                code: error.code(),
            },
        );
    }
}
