//! HTTP client for the bridge sidecar.
//!
//! Every session is addressed by the user's registry key
//! (`/sessions/user:42/...`). Responses use the sidecar's
//! `{success, data, error}` envelope.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::types::UserRef;

use super::events::poll_events;
use super::{BridgeConnection, BridgeConnector, BridgeError, BridgeSocket};

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for normal operations.
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Events buffered between the poll task and the session actor.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Response envelope from the bridge HTTP API.
#[derive(Deserialize)]
struct BridgeResponse<T> {
    #[serde(default)]
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: String,
}

/// Connector that starts sessions on the HTTP sidecar.
#[derive(Debug, Clone)]
pub struct HttpBridgeConnector {
    client: reqwest::Client,
    base_url: String,
    poll_timeout: Duration,
}

impl HttpBridgeConnector {
    /// Create a connector pointing at the given base URL.
    pub fn new(base_url: impl Into<String>, poll_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|e| {
                warn!(error = %e, "failed to build HTTP client with timeouts, using default");
                reqwest::Client::default()
            });
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            poll_timeout,
        }
    }

    /// Returns the base URL of the sidecar.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn session_url(&self, user: &UserRef) -> String {
        format!("{}/sessions/{}", self.base_url, user.key())
    }

    /// Whether the sidecar answers its health endpoint.
    pub async fn ping(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        matches!(self.client.get(&url).send().await, Ok(resp) if resp.status().is_success())
    }
}

#[async_trait]
impl BridgeConnector for HttpBridgeConnector {
    async fn connect(&self, user: &UserRef) -> Result<BridgeConnection, BridgeError> {
        let session_url = self.session_url(user);
        let resp = self
            .client
            .post(format!("{session_url}/start"))
            .send()
            .await
            .map_err(|e| BridgeError::Unavailable(e.to_string()))?;
        envelope::<serde_json::Value>(resp).await?;
        info!(user = %user, "bridge session started");

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poll_task = tokio::spawn(poll_events(
            self.client.clone(),
            format!("{session_url}/events/poll"),
            self.poll_timeout,
            tx,
        ));

        let socket = HttpBridgeSocket {
            client: self.client.clone(),
            session_url,
            poll_task: Mutex::new(Some(poll_task)),
        };
        Ok(BridgeConnection {
            socket: Arc::new(socket),
            events: rx,
        })
    }

    async fn discard_credentials(&self, user: &UserRef) -> Result<(), BridgeError> {
        let resp = self.client.delete(self.session_url(user)).send().await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(user = %user, "no stored bridge credentials to discard");
            return Ok(());
        }
        envelope::<serde_json::Value>(resp).await?;
        info!(user = %user, "bridge credentials discarded");
        Ok(())
    }
}

/// Socket for one started sidecar session.
struct HttpBridgeSocket {
    client: reqwest::Client,
    session_url: String,
    poll_task: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl BridgeSocket for HttpBridgeSocket {
    async fn send_text(&self, to: &str, text: &str) -> Result<String, BridgeError> {
        let body = serde_json::json!({ "to": to, "text": text });
        let resp = self
            .client
            .post(format!("{}/send", self.session_url))
            .json(&body)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::CONFLICT {
            return Err(BridgeError::NotConnected);
        }
        let sent = envelope::<SentMessage>(resp)
            .await?
            .ok_or_else(|| BridgeError::Rejected("send response without message id".to_owned()))?;
        debug!(message_id = %sent.message_id, "message sent via bridge");
        Ok(sent.message_id)
    }

    async fn logout(&self) -> Result<(), BridgeError> {
        let resp = self
            .client
            .post(format!("{}/logout", self.session_url))
            .send()
            .await?;
        envelope::<serde_json::Value>(resp).await?;
        Ok(())
    }

    async fn close(&self) {
        if let Some(task) = self.poll_task.lock().await.take() {
            task.abort();
        }
    }
}

/// Unwrap the sidecar envelope, mapping failures to [`BridgeError`].
async fn envelope<T: serde::de::DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<Option<T>, BridgeError> {
    let status = resp.status();
    let text = resp.text().await?;
    let parsed: Option<BridgeResponse<T>> = serde_json::from_str(&text).ok();

    match parsed {
        Some(body) if status.is_success() && body.success => Ok(body.data),
        Some(body) => Err(BridgeError::Rejected(
            body.error.unwrap_or_else(|| format!("HTTP {status}")),
        )),
        None if status.is_server_error() => Err(BridgeError::Unavailable(format!("HTTP {status}"))),
        None => Err(BridgeError::Rejected(format!("HTTP {status}: unparseable body"))),
    }
}
