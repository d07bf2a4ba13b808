//! Event feed from the bridge sidecar.
//!
//! Long-polls `/sessions/{key}/events/poll` and forwards every event to the
//! owning session actor over an mpsc channel. A lost sidecar is reported as
//! a synthetic `disconnected` event so reconnect policy stays in one place.

use std::time::Duration;

use chrono::{DateTime, SecondsFormat};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Delay before re-polling after a non-success status.
const RETRY_DELAY_SECS: u64 = 5;

/// Reason attached to the synthetic event emitted when the sidecar is lost.
pub const UNREACHABLE_REASON: &str = "bridge_unreachable";

/// Why a device connection closed.
///
/// The sidecar reports either a text reason or a numeric status code.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(from = "RawReason")]
pub struct DisconnectReason(pub String);

#[derive(Deserialize)]
#[serde(untagged)]
enum RawReason {
    Code(i64),
    Text(String),
}

impl From<RawReason> for DisconnectReason {
    fn from(raw: RawReason) -> Self {
        match raw {
            RawReason::Code(code) => Self(code.to_string()),
            RawReason::Text(text) => Self(text),
        }
    }
}

impl Default for DisconnectReason {
    fn default() -> Self {
        Self("unknown".to_owned())
    }
}

impl DisconnectReason {
    /// Build a reason from text.
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }

    /// Whether the device was logged out and must be paired again.
    pub fn is_logged_out(&self) -> bool {
        let folded: String = self
            .0
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        folded == "loggedout" || folded == "401"
    }

    /// The raw reason text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An event from a user's device session.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BridgeEvent {
    /// A pairing code (QR payload) was issued.
    Qr {
        /// Opaque payload to render as a scannable code.
        code: String,
    },
    /// The device connection is open.
    Connected {
        /// Device phone number or JID, when reported.
        #[serde(default)]
        phone: Option<String>,
    },
    /// The device connection closed.
    Disconnected {
        /// Close reason.
        #[serde(default)]
        reason: DisconnectReason,
    },
    /// A message arrived (or was echoed from our own device).
    Message {
        /// Sender JID or number.
        from: String,
        /// Text content.
        text: String,
        /// Provider message id.
        message_id: String,
        /// Unix timestamp in seconds.
        #[serde(default)]
        timestamp: Option<i64>,
        /// Sender display name.
        #[serde(default)]
        push_name: Option<String>,
        /// Whether we sent it.
        #[serde(default)]
        from_me: bool,
    },
    /// Delivery receipt for one of our messages.
    Receipt {
        /// Provider message id.
        message_id: String,
        /// Receipt status text.
        status: String,
    },
}

impl BridgeEvent {
    /// Short label for logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Qr { .. } => "qr",
            Self::Connected { .. } => "connected",
            Self::Disconnected { .. } => "disconnected",
            Self::Message { .. } => "message",
            Self::Receipt { .. } => "receipt",
        }
    }
}

/// Render a bridge unix timestamp as RFC 3339.
pub fn timestamp_to_rfc3339(secs: i64) -> Option<String> {
    DateTime::from_timestamp(secs, 0).map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Poll the sidecar until the receiver goes away or the sidecar is lost.
///
/// Long-poll timeouts are normal and re-polled immediately. A transport
/// error or an unknown session ends the feed with a synthetic
/// `disconnected` event.
pub(crate) async fn poll_events(
    client: reqwest::Client,
    poll_url: String,
    poll_timeout: Duration,
    event_tx: mpsc::Sender<BridgeEvent>,
) {
    loop {
        let response = client.get(&poll_url).timeout(poll_timeout).send().await;
        match response {
            Ok(resp) if resp.status().is_success() => match resp.json::<Vec<BridgeEvent>>().await {
                Ok(events) => {
                    for event in events {
                        debug!(event = event.label(), "bridge event received");
                        if event_tx.send(event).await.is_err() {
                            // Receiver dropped: the session closed the socket.
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "malformed bridge event batch, skipping"),
            },
            Ok(resp) if resp.status() == reqwest::StatusCode::NOT_FOUND => {
                warn!(url = %poll_url, "bridge session no longer exists");
                let _ = event_tx
                    .send(BridgeEvent::Disconnected {
                        reason: DisconnectReason::new("session_not_found"),
                    })
                    .await;
                return;
            }
            Ok(resp) => {
                debug!(status = %resp.status(), "event poll returned non-200");
                tokio::time::sleep(Duration::from_secs(RETRY_DELAY_SECS)).await;
            }
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(error = %e, url = %poll_url, "bridge event poll failed");
                let _ = event_tx
                    .send(BridgeEvent::Disconnected {
                        reason: DisconnectReason::new(UNREACHABLE_REASON),
                    })
                    .await;
                return;
            }
        }
    }
}
