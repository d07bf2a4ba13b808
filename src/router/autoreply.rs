//! Auto-reply: answers inbound messages with the integration's configured
//! text through the normal send path.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::events::{EventKind, EventPublisher};
use crate::store::StoredMessage;
use crate::types::Direction;

use super::{Router, SendRequest};

/// Subscribe to inbound messages and reply to each when the user's
/// integration has auto-reply switched on.
///
/// The subscription is taken before this returns, so no message published
/// afterwards is missed. Each reply runs on its own task; a slow transport
/// for one user does not hold up replies for others.
pub fn spawn_auto_reply(router: Arc<Router>, events: &EventPublisher) -> JoinHandle<()> {
    let mut subscription = events.subscribe();
    tokio::spawn(async move {
        while let Some(event) = subscription.recv().await {
            let EventKind::MessageReceived { message } = event.kind else {
                continue;
            };
            if message.direction != Direction::Inbound {
                continue;
            }
            let router = Arc::clone(&router);
            tokio::spawn(async move { reply_to(&router, &message).await });
        }
        debug!("auto-reply loop stopped");
    })
}

async fn reply_to(router: &Router, message: &StoredMessage) {
    let user = &message.user;
    let integration = match router.store().active_integration(user).await {
        Ok(Some(i)) => i,
        Ok(None) => return,
        Err(e) => {
            warn!(user = %user, error = %e, "auto-reply skipped, integration lookup failed");
            return;
        }
    };

    let text = integration.auto_reply_text.trim();
    if !integration.enabled || !integration.auto_reply_enabled || text.is_empty() {
        return;
    }
    // Never answer our own device's self-chat.
    if integration.bridge_phone.as_deref() == Some(message.sender.as_str()) {
        return;
    }
    match router.store().is_blocked(user, &message.sender).await {
        Ok(false) => {}
        Ok(true) => {
            debug!(user = %user, contact = %message.sender, "auto-reply skipped, contact blocked");
            return;
        }
        Err(e) => {
            warn!(user = %user, error = %e, "auto-reply skipped, block lookup failed");
            return;
        }
    }

    match router
        .send_message(user, SendRequest::text(message.sender.clone(), text))
        .await
    {
        Ok(outcome) => info!(
            user = %user,
            contact = %message.sender,
            message_id = %outcome.message_id,
            transport = %outcome.transport,
            "auto-reply sent"
        ),
        Err(e) => warn!(user = %user, contact = %message.sender, error = %e, "auto-reply failed"),
    }
}
