//! Personal-device bridge: connector and socket abstractions plus the HTTP
//! sidecar implementation.
//!
//! The device protocol itself runs in a sidecar process that hosts one
//! session per platform user. This module talks to it over HTTP and turns
//! its long-poll event feed into a channel of [`BridgeEvent`]s. Lifecycle
//! decisions (reconnect, logout handling) belong to the session manager;
//! this layer only reports what happened.

pub mod client;
pub mod events;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::types::UserRef;

pub use self::client::HttpBridgeConnector;
pub use self::events::{BridgeEvent, DisconnectReason};

/// Errors from the bridge sidecar.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// HTTP request to the sidecar failed.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The sidecar is not reachable or returned an unusable response.
    #[error("bridge sidecar unavailable: {0}")]
    Unavailable(String),

    /// The session exists but has no open device connection.
    #[error("bridge session not connected")]
    NotConnected,

    /// The sidecar refused the request.
    #[error("bridge rejected request: {0}")]
    Rejected(String),
}

/// A live device connection owned by one session actor.
#[async_trait]
pub trait BridgeSocket: Send + Sync {
    /// Send a text message, returning the provider message id.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] when the sidecar refuses or is unreachable.
    async fn send_text(&self, to: &str, text: &str) -> Result<String, BridgeError>;

    /// Log the device out, invalidating its pairing.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] when the sidecar is unreachable.
    async fn logout(&self) -> Result<(), BridgeError>;

    /// Stop the event feed and release the connection. Idempotent.
    async fn close(&self);
}

/// A freshly opened connection: the socket plus its event feed.
pub struct BridgeConnection {
    /// Handle used for sends and teardown.
    pub socket: Arc<dyn BridgeSocket>,
    /// Lifecycle and message events, in the order the sidecar produced them.
    pub events: mpsc::Receiver<BridgeEvent>,
}

impl std::fmt::Debug for BridgeConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeConnection").finish_non_exhaustive()
    }
}

/// Opens device connections for users.
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    /// Start (or resume) the user's device session.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] if the session cannot be started.
    async fn connect(&self, user: &UserRef) -> Result<BridgeConnection, BridgeError>;

    /// Delete the stored pairing material so the next connect starts fresh.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError`] if the sidecar cannot be reached.
    async fn discard_credentials(&self, user: &UserRef) -> Result<(), BridgeError>;
}
