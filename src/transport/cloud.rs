//! Cloud business-messaging transport.
//!
//! Sends with the user's own access token and sender number through a
//! [`CloudApi`]. The vendor only accepts free-form text inside a window
//! opened by the counterpart, so a first contact is opened with the
//! configured pre-approved template; a rejected template is retried once as
//! free-form text and the path that succeeded is reported.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::bridge::events::timestamp_to_rfc3339;
use crate::credentials::{resolve_user_cloud, CloudCredentials};
use crate::store::{MessageStore, NormalizedMessage};
use crate::types::{normalize_phone, DeliveryStatus, MessageKind, TransportKind, UserRef};

use super::{
    sanitize_error_body, DeliveryPath, InboundItem, OutboundMessage, SendContext, SendReceipt,
    Transport, TransportError,
};

/// HTTP connect timeout for the reqwest client.
const CONNECT_TIMEOUT_SECS: u64 = 5;

/// HTTP request timeout for a send.
const REQUEST_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Wire payloads
// ---------------------------------------------------------------------------

/// One outbound request to the cloud API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloudPayload {
    /// Free-form text.
    Text {
        /// Recipient number.
        to: String,
        /// Message body.
        body: String,
    },
    /// Pre-approved template without parameters.
    Template {
        /// Recipient number.
        to: String,
        /// Template name.
        name: String,
        /// Template language code.
        language: String,
    },
}

impl CloudPayload {
    /// JSON request body.
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text { to, body } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "text",
                "text": { "preview_url": false, "body": body },
            }),
            Self::Template { to, name, language } => json!({
                "messaging_product": "whatsapp",
                "recipient_type": "individual",
                "to": to,
                "type": "template",
                "template": { "name": name, "language": { "code": language } },
            }),
        }
    }

    /// Whether this is a template send.
    pub fn is_template(&self) -> bool {
        matches!(self, Self::Template { .. })
    }
}

/// Template used to open a conversation with a new contact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateSettings {
    /// Template name.
    pub name: String,
    /// Template language code.
    pub language: String,
}

// ---------------------------------------------------------------------------
// API client
// ---------------------------------------------------------------------------

/// Failure of one cloud API call, before transport classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CloudApiError {
    /// The API answered with an error status.
    #[error("HTTP {status}: {message}")]
    Rejected {
        /// HTTP status.
        status: u16,
        /// Vendor error code, e.g. `131047` (re-engagement window closed).
        code: Option<i64>,
        /// Vendor error message, sanitised.
        message: String,
    },
    /// The call did not complete in time.
    #[error("request timed out")]
    Timeout,
    /// The API could not be reached.
    #[error("network error: {0}")]
    Network(String),
    /// The API answered success without a message id.
    #[error("unexpected response: {0}")]
    Malformed(String),
}

impl CloudApiError {
    /// Classify for the transport that made the call.
    pub fn classify(self, transport: TransportKind) -> TransportError {
        match self {
            Self::Timeout => TransportError::timed_out(transport),
            other => TransportError::TransportRejected {
                transport,
                reason: other.to_string(),
            },
        }
    }
}

/// Sends payloads to the vendor API.
#[async_trait]
pub trait CloudApi: Send + Sync {
    /// Send one payload as the sender identified by `credentials`.
    ///
    /// # Errors
    ///
    /// Returns [`CloudApiError`] on any failure.
    async fn send(
        &self,
        credentials: &CloudCredentials,
        payload: &CloudPayload,
    ) -> Result<String, CloudApiError>;
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    messages: Vec<SentId>,
}

#[derive(Deserialize)]
struct SentId {
    id: String,
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<i64>,
}

/// Graph-style HTTP implementation of [`CloudApi`].
#[derive(Debug, Clone)]
pub struct HttpCloudApi {
    client: reqwest::Client,
    api_base: String,
    api_version: String,
}

impl HttpCloudApi {
    /// Create a client for `{api_base}/{api_version}`.
    pub fn new(api_base: impl Into<String>, api_version: impl Into<String>) -> Self {
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
            api_base: api_base.into().trim_end_matches('/').to_owned(),
            api_version: api_version.into(),
        }
    }

    fn messages_url(&self, phone_number_id: &str) -> String {
        format!("{}/{}/{}/messages", self.api_base, self.api_version, phone_number_id)
    }
}

#[async_trait]
impl CloudApi for HttpCloudApi {
    async fn send(
        &self,
        credentials: &CloudCredentials,
        payload: &CloudPayload,
    ) -> Result<String, CloudApiError> {
        let response = self
            .client
            .post(self.messages_url(&credentials.phone_number_id))
            .bearer_auth(&credentials.access_token)
            .json(&payload.to_json())
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    CloudApiError::Timeout
                } else {
                    CloudApiError::Network(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| CloudApiError::Network(e.to_string()))?;

        if !status.is_success() {
            let (code, message) = match serde_json::from_str::<ErrorEnvelope>(&body) {
                Ok(envelope) => (envelope.error.code, sanitize_error_body(&envelope.error.message)),
                Err(_) => (None, sanitize_error_body(&body)),
            };
            return Err(CloudApiError::Rejected {
                status: status.as_u16(),
                code,
                message,
            });
        }

        let parsed: SendResponse = serde_json::from_str(&body)
            .map_err(|e| CloudApiError::Malformed(e.to_string()))?;
        parsed
            .messages
            .into_iter()
            .next()
            .map(|m| m.id)
            .ok_or_else(|| CloudApiError::Malformed("no message id in response".to_owned()))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// The user's own cloud sender.
#[derive(Clone)]
pub struct CloudTransport {
    api: Arc<dyn CloudApi>,
    store: MessageStore,
    template: TemplateSettings,
}

impl std::fmt::Debug for CloudTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudTransport")
            .field("template", &self.template)
            .finish_non_exhaustive()
    }
}

impl CloudTransport {
    /// Create the transport.
    pub fn new(api: Arc<dyn CloudApi>, store: MessageStore, template: TemplateSettings) -> Self {
        Self {
            api,
            store,
            template,
        }
    }

    fn template_payload(&self, to: &str, name: Option<&str>) -> CloudPayload {
        CloudPayload::Template {
            to: to.to_owned(),
            name: name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or(self.template.name.as_str())
                .to_owned(),
            language: self.template.language.clone(),
        }
    }
}

#[async_trait]
impl Transport for CloudTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Cloud
    }

    async fn send(
        &self,
        ctx: &SendContext,
        message: &OutboundMessage,
    ) -> Result<SendReceipt, TransportError> {
        let (credentials, source) = resolve_user_cloud(&ctx.integration)?;
        debug!(user = %ctx.user, ?source, "cloud credentials resolved");
        let to = &message.recipient;

        if message.kind == MessageKind::Template {
            let payload = self.template_payload(to, Some(&message.content));
            let message_id = self
                .api
                .send(&credentials, &payload)
                .await
                .map_err(|e| e.classify(TransportKind::Cloud))?;
            return Ok(SendReceipt {
                message_id,
                path: DeliveryPath::Template,
            });
        }

        let text = CloudPayload::Text {
            to: to.clone(),
            body: message.content.clone(),
        };

        let has_history = self
            .store
            .has_inbound_history(&ctx.user, to)
            .await
            .map_err(|e| TransportError::Internal(e.to_string()))?;

        if has_history {
            let message_id = self
                .api
                .send(&credentials, &text)
                .await
                .map_err(|e| e.classify(TransportKind::Cloud))?;
            return Ok(SendReceipt {
                message_id,
                path: DeliveryPath::Direct,
            });
        }

        let template = self.template_payload(to, None);
        match self.api.send(&credentials, &template).await {
            Ok(message_id) => {
                info!(
                    user = %ctx.user,
                    path = DeliveryPath::Template.as_str(),
                    "first contact opened with template"
                );
                Ok(SendReceipt {
                    message_id,
                    path: DeliveryPath::Template,
                })
            }
            Err(template_err) => {
                warn!(
                    user = %ctx.user,
                    error = %template_err,
                    "template rejected, retrying as free-form text"
                );
                let message_id = self
                    .api
                    .send(&credentials, &text)
                    .await
                    .map_err(|e| e.classify(TransportKind::Cloud))?;
                info!(
                    user = %ctx.user,
                    path = DeliveryPath::FreeformAfterTemplate.as_str(),
                    "free-form retry after template rejection succeeded"
                );
                Ok(SendReceipt {
                    message_id,
                    path: DeliveryPath::FreeformAfterTemplate,
                })
            }
        }
    }

    fn normalize_inbound(&self, user: &UserRef, raw: &Value) -> Vec<InboundItem> {
        normalize_change(user, TransportKind::Cloud, raw)
    }
}

// ---------------------------------------------------------------------------
// Webhook normalisation
// ---------------------------------------------------------------------------

/// Split a webhook delivery into `(phone_number_id, change value)` pairs.
pub fn webhook_changes(body: &Value) -> Vec<(String, &Value)> {
    let mut out = Vec::new();
    for entry in body.get("entry").and_then(Value::as_array).into_iter().flatten() {
        for change in entry.get("changes").and_then(Value::as_array).into_iter().flatten() {
            let Some(value) = change.get("value") else {
                continue;
            };
            let phone_number_id = value
                .pointer("/metadata/phone_number_id")
                .and_then(Value::as_str);
            match phone_number_id {
                Some(id) => out.push((id.to_owned(), value)),
                None => debug!("webhook change without phone_number_id skipped"),
            }
        }
    }
    out
}

/// Normalise one webhook change value received for `user` on `transport`.
pub fn normalize_change(
    user: &UserRef,
    transport: TransportKind,
    value: &Value,
) -> Vec<InboundItem> {
    let own_number = value
        .pointer("/metadata/display_phone_number")
        .and_then(Value::as_str)
        .and_then(normalize_phone);
    let contacts = value.get("contacts").and_then(Value::as_array);
    let name_for = |wa_id: &str| -> Option<String> {
        contacts?
            .iter()
            .find(|c| c.get("wa_id").and_then(Value::as_str) == Some(wa_id))?
            .pointer("/profile/name")
            .and_then(Value::as_str)
            .map(str::to_owned)
    };

    let mut items = Vec::new();

    for message in value.get("messages").and_then(Value::as_array).into_iter().flatten() {
        let id = message.get("id").and_then(Value::as_str).unwrap_or_default();
        let raw_from = message.get("from").and_then(Value::as_str).unwrap_or_default();
        let Some(from) = normalize_phone(raw_from).filter(|_| !id.is_empty()) else {
            debug!(user = %user, "webhook message without id or sender skipped");
            continue;
        };
        let timestamp = message
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<i64>().ok())
            .and_then(timestamp_to_rfc3339);

        items.push(InboundItem::Message(NormalizedMessage {
            user: user.clone(),
            transport,
            provider_message_id: id.to_owned(),
            from,
            to: own_number.clone(),
            body: message_body(message),
            sender_name: name_for(raw_from),
            timestamp,
        }));
    }

    for status in value.get("statuses").and_then(Value::as_array).into_iter().flatten() {
        let id = status.get("id").and_then(Value::as_str);
        let parsed = status
            .get("status")
            .and_then(Value::as_str)
            .and_then(|s| DeliveryStatus::parse(s).ok());
        if let (Some(id), Some(status)) = (id, parsed) {
            items.push(InboundItem::Status {
                transport,
                provider_message_id: id.to_owned(),
                status,
            });
        }
    }

    items
}

/// Best text rendering of a webhook message of any type.
fn message_body(message: &Value) -> String {
    let kind = message.get("type").and_then(Value::as_str).unwrap_or("text");
    let text = match kind {
        "text" => message.pointer("/text/body"),
        "button" => message.pointer("/button/text"),
        "interactive" => message
            .pointer("/interactive/button_reply/title")
            .or_else(|| message.pointer("/interactive/list_reply/title")),
        media => message.pointer(&format!("/{media}/caption")),
    };
    text.and_then(Value::as_str)
        .map(str::to_owned)
        .unwrap_or_else(|| format!("[{kind}]"))
}
