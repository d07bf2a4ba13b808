//! Typed lifecycle and message event bus.
//!
//! Producers (session actors, the router) publish [`Event`]s; consumers (the
//! real-time SSE channel, the auto-reply trigger) subscribe. Delivery is best
//! effort: a subscriber that falls behind skips the events it missed. Events
//! of one user keep their publish order because each user's events come from
//! a single session actor or from sends serialised by the router's per-user
//! lock.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{trace, warn};
use uuid::Uuid;

use crate::store::StoredMessage;
use crate::types::{TransportKind, UserRef};

/// Default channel capacity.
pub const DEFAULT_EVENT_BUFFER: usize = 1024;

/// One published event.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Unique id, used as the SSE event id.
    pub id: Uuid,
    /// User the event belongs to.
    pub user: UserRef,
    /// Publish time.
    pub at: DateTime<Utc>,
    /// Payload.
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Event payloads.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A bridge session produced a new pairing code.
    PairingCodeIssued {
        /// Raw pairing payload.
        code: String,
    },
    /// A bridge session is connected.
    Connected {
        /// Phone number of the paired device, when known.
        phone: Option<String>,
    },
    /// A bridge session lost its connection or was logged out.
    Disconnected {
        /// Close reason reported by the transport.
        reason: String,
        /// Whether the session needs re-pairing.
        logged_out: bool,
    },
    /// A new inbound message was stored.
    MessageReceived {
        /// The stored message.
        message: StoredMessage,
    },
    /// An outbound message was accepted by a transport.
    MessageSent {
        /// Provider message id.
        message_id: String,
        /// Transport that delivered it.
        transport: TransportKind,
        /// Counterpart number.
        recipient: String,
        /// Whether the shared fallback sender was used after a primary failure.
        fell_back: bool,
    },
    /// An outbound attempt failed.
    SendFailed {
        /// Transport that failed.
        transport: TransportKind,
        /// Counterpart number.
        recipient: String,
        /// Error text.
        error: String,
        /// Machine-readable error kind.
        code: &'static str,
    },
}

impl EventKind {
    /// Wire name of the event, as used in the `type` field.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PairingCodeIssued { .. } => "pairing_code_issued",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::MessageReceived { .. } => "message_received",
            Self::MessageSent { .. } => "message_sent",
            Self::SendFailed { .. } => "send_failed",
        }
    }
}

/// Cloneable publishing handle.
#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<Event>,
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER)
    }
}

impl EventPublisher {
    /// Create a bus retaining at most `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Publish an event. Never blocks; having no subscribers is fine.
    pub fn publish(&self, user: &UserRef, kind: EventKind) {
        let name = kind.name();
        let event = Event {
            id: Uuid::new_v4(),
            user: user.clone(),
            at: Utc::now(),
            kind,
        };
        match self.tx.send(event) {
            Ok(receivers) => trace!(user = %user, event = name, receivers, "event published"),
            Err(_) => trace!(user = %user, event = name, "event dropped, no subscribers"),
        }
    }

    /// Subscribe to every user's events.
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            user: None,
        }
    }

    /// Subscribe to one user's events.
    pub fn subscribe_user(&self, user: &UserRef) -> EventSubscription {
        EventSubscription {
            rx: self.tx.subscribe(),
            user: Some(user.clone()),
        }
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

/// A subscriber's view of the bus.
#[derive(Debug)]
pub struct EventSubscription {
    rx: broadcast::Receiver<Event>,
    user: Option<UserRef>,
}

impl EventSubscription {
    /// Wait for the next matching event. Returns `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Whether an event passes this subscription's user filter.
    pub fn matches(&self, event: &Event) -> bool {
        self.user.as_ref().map_or(true, |u| *u == event.user)
    }

    /// Consume the subscription, returning the raw receiver and filter.
    pub fn into_parts(self) -> (broadcast::Receiver<Event>, Option<UserRef>) {
        (self.rx, self.user)
    }
}
