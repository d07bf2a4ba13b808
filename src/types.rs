//! Shared domain vocabulary: user identity, transport kinds, directions and
//! delivery states.
//!
//! Enums that are persisted in SQLite carry an `as_str`/`parse` pair so the
//! stored text stays stable independently of serde renames.

use std::fmt;

use chrono::{SecondsFormat, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Error returned when a stored or submitted enum value is not recognised.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid {field} value: {value}")]
pub struct ParseEnumError {
    /// Which field failed to parse.
    pub field: &'static str,
    /// The offending raw value.
    pub value: String,
}

fn invalid(field: &'static str, value: &str) -> ParseEnumError {
    ParseEnumError {
        field,
        value: value.to_owned(),
    }
}

/// Kind of platform account that owns an integration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserKind {
    /// A regular platform user.
    User,
    /// A reseller account.
    Reseller,
}

impl UserKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Reseller => "reseller",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised user kind.
    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "user" => Ok(Self::User),
            "reseller" => Ok(Self::Reseller),
            other => Err(invalid("user_kind", other)),
        }
    }
}

/// A sender identity on the platform: one user id of one kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserRef {
    /// Platform user identifier.
    pub id: String,
    /// Account kind.
    pub kind: UserKind,
}

impl UserRef {
    /// Build a reference for a regular user.
    pub fn user(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: UserKind::User,
        }
    }

    /// Build a reference with an explicit kind.
    pub fn new(id: impl Into<String>, kind: UserKind) -> Self {
        Self {
            id: id.into(),
            kind,
        }
    }

    /// Stable map/registry key, e.g. `user:42`.
    pub fn key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.id)
    }
}

impl fmt::Display for UserRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind.as_str(), self.id)
    }
}

/// Which transport carried (or should carry) a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Vendor-hosted business messaging API with the user's own credentials.
    Cloud,
    /// The user's own WhatsApp account through the device-pairing bridge.
    PersonalBridge,
    /// Platform-owned sender identity, metered by credits.
    SharedFallback,
}

impl TransportKind {
    /// Every transport kind, in registry order.
    pub const ALL: [TransportKind; 3] = [Self::Cloud, Self::PersonalBridge, Self::SharedFallback];

    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cloud => "cloud",
            Self::PersonalBridge => "personal_bridge",
            Self::SharedFallback => "shared_fallback",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised transport.
    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "cloud" => Ok(Self::Cloud),
            "personal_bridge" => Ok(Self::PersonalBridge),
            "shared_fallback" => Ok(Self::SharedFallback),
            other => Err(invalid("transport", other)),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message direction relative to the platform user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from a counterpart.
    Inbound,
    /// Sent to a counterpart.
    Outbound,
}

impl Direction {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound => "inbound",
            Self::Outbound => "outbound",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised direction.
    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "inbound" => Ok(Self::Inbound),
            "outbound" => Ok(Self::Outbound),
            other => Err(invalid("direction", other)),
        }
    }
}

/// Delivery state of a message.
///
/// `Sent < Delivered < Read` only moves forward; `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    /// Accepted locally, not yet confirmed by the provider.
    Pending,
    /// Accepted by the provider.
    Sent,
    /// Delivered to the recipient's device.
    Delivered,
    /// Read by the recipient.
    Read,
    /// Delivery attempt failed.
    Failed,
}

impl DeliveryStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    /// Parse from a SQLite or provider text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised status.
    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" | "server_ack" => Ok(Self::Sent),
            "delivered" | "delivery_ack" => Ok(Self::Delivered),
            "read" | "played" => Ok(Self::Read),
            "failed" | "error" => Ok(Self::Failed),
            other => Err(invalid("status", other)),
        }
    }

    /// Ordering rank used for forward-only updates.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::Delivered => 2,
            Self::Read => 3,
            Self::Failed => 4,
        }
    }

    /// Whether moving from `self` to `next` is a forward transition.
    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        match self {
            Self::Failed | Self::Read => false,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Integration health as mirrored from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// No check has run yet.
    Unknown,
    /// Last interaction succeeded.
    Healthy,
    /// Recent failures, still usable.
    Degraded,
    /// Transport is not connected.
    Disconnected,
}

impl HealthStatus {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Disconnected => "disconnected",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised health status.
    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "unknown" => Ok(Self::Unknown),
            "healthy" => Ok(Self::Healthy),
            "degraded" => Ok(Self::Degraded),
            "disconnected" => Ok(Self::Disconnected),
            other => Err(invalid("health", other)),
        }
    }
}

/// Outbound message type requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Free-form text.
    #[default]
    Text,
    /// Pre-approved template.
    Template,
}

impl MessageKind {
    /// Returns the string representation stored in SQLite.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Template => "template",
        }
    }

    /// Parse from a SQLite text value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is not a recognised message kind.
    pub fn parse(s: &str) -> Result<Self, ParseEnumError> {
        match s {
            "text" => Ok(Self::Text),
            "template" => Ok(Self::Template),
            other => Err(invalid("message_kind", other)),
        }
    }
}

/// Normalise a phone number or WhatsApp JID to bare digits.
///
/// Returns `None` when nothing usable remains.
pub fn normalize_phone(raw: &str) -> Option<String> {
    let without_jid = raw.split('@').next().unwrap_or_default();
    // Multi-device JIDs carry a `:device` suffix before the domain.
    let without_device = without_jid.split(':').next().unwrap_or_default();
    let digits = match Regex::new(r"\D") {
        Ok(re) => re.replace_all(without_device, "").into_owned(),
        Err(_) => without_device.chars().filter(char::is_ascii_digit).collect(),
    };
    if digits.is_empty() {
        None
    } else {
        Some(digits)
    }
}

/// Current UTC time in the millisecond RFC 3339 form used for stored timestamps.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
