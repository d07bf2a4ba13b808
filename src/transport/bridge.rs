//! Personal-bridge transport: sends through the user's live session socket.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::bridge::{BridgeError, BridgeEvent};
use crate::bridge::events::timestamp_to_rfc3339;
use crate::session::SessionManager;
use crate::store::NormalizedMessage;
use crate::types::{normalize_phone, DeliveryStatus, TransportKind, UserRef};

use super::{
    DeliveryPath, InboundItem, OutboundMessage, SendContext, SendReceipt, Transport,
    TransportError,
};

impl From<BridgeError> for TransportError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::NotConnected | BridgeError::Unavailable(_) => Self::NotConnected,
            BridgeError::Http(e) if e.is_timeout() => {
                Self::timed_out(TransportKind::PersonalBridge)
            }
            BridgeError::Http(e) => Self::TransportRejected {
                transport: TransportKind::PersonalBridge,
                reason: e.to_string(),
            },
            BridgeError::Rejected(reason) => Self::TransportRejected {
                transport: TransportKind::PersonalBridge,
                reason: super::sanitize_error_body(&reason),
            },
        }
    }
}

/// Normalise one bridge event into an inbound item.
///
/// Echoes of our own messages, lifecycle events and unparseable numbers or
/// statuses yield `None`.
pub fn normalize_event(
    user: &UserRef,
    event: &BridgeEvent,
    own_phone: Option<&str>,
) -> Option<InboundItem> {
    match event {
        BridgeEvent::Message {
            from,
            text,
            message_id,
            timestamp,
            push_name,
            from_me,
        } => {
            if *from_me || message_id.trim().is_empty() {
                return None;
            }
            let Some(from) = normalize_phone(from) else {
                debug!(user = %user, "bridge message from unparseable sender skipped");
                return None;
            };
            Some(InboundItem::Message(NormalizedMessage {
                user: user.clone(),
                transport: TransportKind::PersonalBridge,
                provider_message_id: message_id.clone(),
                from,
                to: own_phone.map(str::to_owned),
                body: text.clone(),
                sender_name: push_name.clone().filter(|n| !n.trim().is_empty()),
                timestamp: timestamp.and_then(timestamp_to_rfc3339),
            }))
        }
        BridgeEvent::Receipt { message_id, status } => {
            let status = DeliveryStatus::parse(&status.to_ascii_lowercase()).ok()?;
            Some(InboundItem::Status {
                transport: TransportKind::PersonalBridge,
                provider_message_id: message_id.clone(),
                status,
            })
        }
        BridgeEvent::Qr { .. }
        | BridgeEvent::Connected { .. }
        | BridgeEvent::Disconnected { .. } => None,
    }
}

/// Transport backed by the session manager's live sockets.
#[derive(Debug, Clone)]
pub struct BridgeTransport {
    sessions: Arc<SessionManager>,
}

impl BridgeTransport {
    /// Wrap the session manager.
    pub fn new(sessions: Arc<SessionManager>) -> Self {
        Self { sessions }
    }
}

#[async_trait]
impl Transport for BridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PersonalBridge
    }

    async fn send(
        &self,
        ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError> {
        let message_id = self
            .sessions
            .send(&ctx.user, &message.recipient, &message.content, message.kind)
            .await?;
        Ok(SendReceipt {
            message_id,
            path: DeliveryPath::Direct,
        })
    }

    fn normalize_inbound(&self, user: &UserRef, raw: &serde_json::Value) -> Vec<InboundItem> {
        match serde_json::from_value::<BridgeEvent>(raw.clone()) {
            Ok(event) => normalize_event(user, &event, None).into_iter().collect(),
            Err(e) => {
                debug!(user = %user, error = %e, "unrecognised bridge event skipped");
                Vec::new()
            }
        }
    }
}
