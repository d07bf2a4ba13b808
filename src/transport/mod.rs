//! Transport abstraction shared by every way of reaching WhatsApp.
//!
//! Defines the [`Transport`] trait, the classified [`TransportError`]
//! taxonomy and the request/receipt types passed between the router and the
//! adapters.
//!
//! Three adapters are implemented:
//! - [`cloud::CloudTransport`]: vendor business API with the user's own credentials
//! - [`bridge::BridgeTransport`]: the user's paired device through the session manager
//! - [`fallback::FallbackTransport`]: the platform's shared sender, metered by credits

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::Serialize;

use crate::store::{Integration, NormalizedMessage};
use crate::types::{DeliveryStatus, HealthStatus, MessageKind, TransportKind, UserRef};

pub mod bridge;
pub mod cloud;
pub mod fallback;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Classified transport failure.
///
/// Adapters classify every failure into one of these kinds before it reaches
/// the router; only [`TransportRejected`](Self::TransportRejected) and
/// [`NotConnected`](Self::NotConnected) are eligible for the fallback retry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No usable credentials; the user must reconfigure.
    #[error("{transport} credentials missing: {detail}")]
    CredentialMissing {
        /// Transport whose credentials are missing.
        transport: TransportKind,
        /// What exactly is missing.
        detail: String,
    },

    /// The personal bridge session is not connected right now.
    #[error("personal bridge session is not connected")]
    NotConnected,

    /// The provider refused or failed the call.
    #[error("{transport} rejected the message: {reason}")]
    TransportRejected {
        /// Transport that rejected.
        transport: TransportKind,
        /// Provider reason, sanitised.
        reason: String,
    },

    /// The shared fallback balance is zero.
    #[error("shared fallback credits exhausted")]
    CreditExhausted,

    /// The personal bridge session was logged out and needs re-pairing.
    #[error("personal bridge session is logged out, re-pairing required")]
    LoggedOut,

    /// Local bookkeeping failed before the provider was reached.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Whether the router may retry once through the shared fallback sender.
    pub fn is_fallback_eligible(&self) -> bool {
        matches!(self, Self::TransportRejected { .. } | Self::NotConnected)
    }

    /// Machine-readable kind, as exposed to API callers and in events.
    pub fn code(&self) -> &'static str {
        match self {
            Self::CredentialMissing { .. } => "credential_missing",
            Self::NotConnected => "not_connected",
            Self::TransportRejected { .. } => "transport_rejected",
            Self::CreditExhausted => "credit_exhausted",
            Self::LoggedOut => "logged_out",
            Self::Internal(_) => "internal",
        }
    }

    /// Health to mirror on the integration after this failure.
    pub fn health(&self) -> HealthStatus {
        match self {
            Self::NotConnected | Self::LoggedOut => HealthStatus::Disconnected,
            _ => HealthStatus::Degraded,
        }
    }

    /// A timed-out provider call.
    pub fn timed_out(transport: TransportKind) -> Self {
        Self::TransportRejected {
            transport,
            reason: "timed out".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// Request / receipt types
// ---------------------------------------------------------------------------

/// Who is sending, with the integration the send was resolved against.
#[derive(Debug, Clone)]
pub struct SendContext {
    /// Sending user.
    pub user: UserRef,
    /// The user's active integration.
    pub integration: Integration,
}

/// A message to deliver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Normalised recipient phone number.
    pub recipient: String,
    /// Text body, or the template name for template sends.
    pub content: String,
    /// Requested message type.
    pub kind: MessageKind,
}

/// Which path actually delivered a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryPath {
    /// Sent as requested.
    Direct,
    /// Sent as a pre-approved template.
    Template,
    /// The template was rejected and the free-form retry succeeded.
    FreeformAfterTemplate,
}

impl DeliveryPath {
    /// Stable label for logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Template => "template",
            Self::FreeformAfterTemplate => "freeform_after_template",
        }
    }
}

/// Successful delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendReceipt {
    /// Provider message id.
    pub message_id: String,
    /// Path that succeeded.
    pub path: DeliveryPath,
}

/// One normalised item from a raw provider event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundItem {
    /// A new inbound message.
    Message(NormalizedMessage),
    /// A delivery receipt for an outbound message.
    Status {
        /// Transport that sent the original message.
        transport: TransportKind,
        /// Provider id of the outbound message.
        provider_message_id: String,
        /// New status.
        status: DeliveryStatus,
    },
}

/// Normalised inbound items for one user, handed to the router's ingest loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundEnvelope {
    /// Receiving user.
    pub user: UserRef,
    /// Messages and receipts, in provider order.
    pub items: Vec<InboundItem>,
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// One way of delivering WhatsApp messages.
///
/// Implementations must be `Send + Sync`; the router shares them across all
/// users' send tasks.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is.
    fn kind(&self) -> TransportKind;

    /// Deliver a message.
    ///
    /// # Errors
    ///
    /// Returns a classified [`TransportError`].
    async fn send(
        &self,
        ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError>;

    /// Normalise a raw provider event addressed to `user`.
    ///
    /// Unrecognised or malformed parts are skipped.
    fn normalize_inbound(&self, user: &UserRef, raw: &serde_json::Value) -> Vec<InboundItem>;
}

// ---------------------------------------------------------------------------
// Utility
// ---------------------------------------------------------------------------

/// Cloud API access tokens as they appear in echoed error bodies.
static ACCESS_TOKEN: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"EAA[A-Za-z0-9]{20,}").ok());

/// Collapse and redact a provider error body before it is logged or stored.
pub(crate) fn sanitize_error_body(raw: &str) -> String {
    const MAX_ERROR_BODY_CHARS: usize = 256;

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    let sanitized = match ACCESS_TOKEN.as_ref() {
        Some(token) => token.replace_all(&collapsed, "[REDACTED]").into_owned(),
        None => collapsed,
    };

    if sanitized.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = sanitized.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    sanitized
}
