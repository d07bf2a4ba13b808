//! Shared fallback transport: the platform's own cloud sender, metered by
//! a per-user credit balance.
//!
//! A credit is reserved with a single conditional decrement before the
//! provider call and refunded if the call fails or is abandoned, so only
//! successful sends consume credit and the balance never goes negative.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};

use crate::credentials::{resolve_platform_fallback, PlatformCredentials};
use crate::store::MessageStore;
use crate::types::{MessageKind, TransportKind, UserRef};

use super::cloud::{normalize_change, CloudApi, CloudPayload, TemplateSettings};
use super::{
    DeliveryPath, InboundItem, OutboundMessage, SendContext, SendReceipt, Transport, TransportError,
};

/// The platform-owned sender.
#[derive(Clone)]
pub struct FallbackTransport {
    api: Arc<dyn CloudApi>,
    store: MessageStore,
    platform: Arc<PlatformCredentials>,
    template: TemplateSettings,
}

impl std::fmt::Debug for FallbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackTransport")
            .field("platform", &self.platform)
            .finish_non_exhaustive()
    }
}

impl FallbackTransport {
    /// Create the transport.
    pub fn new(
        api: Arc<dyn CloudApi>,
        store: MessageStore,
        platform: Arc<PlatformCredentials>,
        template: TemplateSettings,
    ) -> Self {
        Self {
            api,
            store,
            platform,
            template,
        }
    }
}

/// A reserved credit that is refunded unless the send is confirmed.
///
/// Dropping an unconfirmed reservation (for example when the router's send
/// timeout cancels the call) schedules the refund on the runtime.
struct Reservation {
    store: MessageStore,
    user: UserRef,
    settled: bool,
}

impl Reservation {
    fn confirm(mut self) {
        self.settled = true;
    }

    async fn refund(mut self) {
        self.settled = true;
        if let Err(e) = self.store.refund_credit(&self.user).await {
            warn!(user = %self.user, error = %e, "credit refund failed");
        }
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let store = self.store.clone();
        let user = self.user.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = store.refund_credit(&user).await {
                        warn!(user = %user, error = %e, "credit refund failed");
                    }
                });
            }
            Err(_) => warn!(user = %user, "no runtime to refund reserved credit"),
        }
    }
}

#[async_trait]
impl Transport for FallbackTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::SharedFallback
    }

    async fn send(
        &self,
        ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError> {
        let (credentials, source) = resolve_platform_fallback(&self.platform)?;

        let reserved = self
            .store
            .try_reserve_credit(&ctx.user)
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))?;
        if !reserved {
            debug!(user = %ctx.user, "fallback send refused, no credits");
            return Err(TransportError::CreditExhausted);
        }
        let reservation = Reservation {
            store: self.store.clone(),
            user: ctx.user.clone(),
            settled: false,
        };
        debug!(user = %ctx.user, ?source, "fallback credit reserved");

        let (payload, path) = match message.kind {
            MessageKind::Template => (
                CloudPayload::Template {
                    to: message.recipient.clone(),
                    name: if message.content.trim().is_empty() {
                        self.template.name.clone()
                    } else {
                        message.content.clone()
                    },
                    language: self.template.language.clone(),
                },
                DeliveryPath::Template,
            ),
            MessageKind::Text => (
                CloudPayload::Text {
                    to: message.recipient.clone(),
                    body: message.content.clone(),
                },
                DeliveryPath::Direct,
            ),
        };

        match self.api.send(&credentials, &payload).await {
            Ok(message_id) => {
                reservation.confirm();
                Ok(SendReceipt { message_id, path })
            }
            Err(e) => {
                reservation.refund().await;
                Err(e.classify(TransportKind::SharedFallback))
            }
        }
    }

    fn normalize_inbound(&self, user: &UserRef, raw: &Value) -> Vec<InboundItem> {
        normalize_change(user, TransportKind::SharedFallback, raw)
    }
}
