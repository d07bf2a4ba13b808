//! Message records: de-duplicated inbound ingestion, append-only outbound log.
//!
//! A provider message id is stored at most once per (transport, direction).
//! Outbound attempts are always appended, including failed attempts and
//! fallback retries, each tagged with the transport actually used.

use serde::Serialize;
use tracing::{debug, trace};

use crate::types::{
    now_timestamp, DeliveryStatus, Direction, MessageKind, TransportKind, UserKind, UserRef,
};

use super::{MessageStore, Page, StoreError};

/// An inbound message normalised from any transport's raw event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedMessage {
    /// Platform user the message was addressed to.
    pub user: UserRef,
    /// Transport that received it.
    pub transport: TransportKind,
    /// Provider-assigned message id.
    pub provider_message_id: String,
    /// Counterpart phone number (normalised).
    pub from: String,
    /// Our receiving number, when the provider reports it.
    pub to: Option<String>,
    /// Text body.
    pub body: String,
    /// Counterpart display name, when the provider reports it.
    pub sender_name: Option<String>,
    /// Provider timestamp (RFC 3339), when available.
    pub timestamp: Option<String>,
}

/// One outbound delivery attempt to be appended to the log.
#[derive(Debug, Clone)]
pub struct OutboundRecord {
    /// Sending user.
    pub user: UserRef,
    /// Counterpart phone number (normalised).
    pub recipient: String,
    /// Text body (or template name for template sends).
    pub body: String,
    /// Text or template.
    pub kind: MessageKind,
    /// Transport actually used for this attempt.
    pub transport: TransportKind,
    /// Provider id when the attempt was accepted.
    pub provider_message_id: Option<String>,
    /// Resulting status.
    pub status: DeliveryStatus,
    /// Failure text for failed attempts.
    pub error: Option<String>,
}

/// A persisted message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    /// Database ID.
    pub id: i64,
    /// Owning conversation.
    pub conversation_id: i64,
    /// Owning user.
    pub user: UserRef,
    /// Provider message id, absent for failed attempts.
    pub provider_message_id: Option<String>,
    /// Inbound or outbound.
    pub direction: Direction,
    /// Sender number (empty when our own number is unknown).
    pub sender: String,
    /// Recipient number (empty when our own number is unknown).
    pub recipient: String,
    /// Text body.
    pub body: String,
    /// Text or template.
    pub message_kind: MessageKind,
    /// Transport used.
    pub transport: TransportKind,
    /// Delivery status.
    pub status: DeliveryStatus,
    /// Failure text.
    pub error: Option<String>,
    /// Creation time.
    pub created_at: String,
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: i64,
    conversation_id: i64,
    user_id: String,
    user_kind: String,
    provider_message_id: Option<String>,
    direction: String,
    sender: String,
    recipient: String,
    body: String,
    message_kind: String,
    transport: String,
    status: String,
    error: Option<String>,
    created_at: String,
}

impl TryFrom<MessageRow> for StoredMessage {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id,
            conversation_id: row.conversation_id,
            user: UserRef::new(row.user_id, UserKind::parse(&row.user_kind)?),
            provider_message_id: row.provider_message_id,
            direction: Direction::parse(&row.direction)?,
            sender: row.sender,
            recipient: row.recipient,
            body: row.body,
            message_kind: MessageKind::parse(&row.message_kind)?,
            transport: TransportKind::parse(&row.transport)?,
            status: DeliveryStatus::parse(&row.status)?,
            error: row.error,
            created_at: row.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, conversation_id, user_id, user_kind, provider_message_id, \
     direction, sender, recipient, body, message_kind, transport, status, error, created_at \
     FROM messages";

impl MessageStore {
    /// Persist an inbound message unless it was already stored.
    ///
    /// Returns `None` for a duplicate provider id. A new message bumps the
    /// conversation's unread counter and marks the contact as having written.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for an empty provider id, or
    /// [`StoreError::Database`] on SQLite failure.
    pub async fn record_inbound(
        &self,
        message: &NormalizedMessage,
    ) -> Result<Option<StoredMessage>, StoreError> {
        if message.provider_message_id.trim().is_empty() {
            return Err(StoreError::InvalidInput(
                "inbound message without provider id".to_owned(),
            ));
        }

        let conversation = self.conversation_for(&message.user, &message.from).await?;
        let now = now_timestamp();

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, user_id, user_kind, provider_message_id, \
             direction, sender, recipient, body, message_kind, transport, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'inbound', ?5, ?6, ?7, 'text', ?8, 'delivered', ?9) \
             ON CONFLICT (transport, direction, provider_message_id) DO NOTHING",
        )
        .bind(conversation.id)
        .bind(&message.user.id)
        .bind(message.user.kind.as_str())
        .bind(&message.provider_message_id)
        .bind(&message.from)
        .bind(message.to.as_deref().unwrap_or_default())
        .bind(&message.body)
        .bind(message.transport.as_str())
        .bind(&now)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            debug!(
                user = %message.user,
                message_id = %message.provider_message_id,
                transport = %message.transport,
                "duplicate inbound message ignored"
            );
            return Ok(None);
        }

        let id = result.last_insert_rowid();
        self.touch_conversation(conversation.id, &message.body, &now, 1)
            .await?;
        self.mark_inbound_seen(&message.user, &message.from, message.sender_name.as_deref())
            .await?;
        trace!(user = %message.user, id, "inbound message stored");

        self.message(id).await.map(Some)
    }

    /// Append an outbound attempt.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn record_outbound(
        &self,
        record: &OutboundRecord,
    ) -> Result<StoredMessage, StoreError> {
        let conversation = self.conversation_for(&record.user, &record.recipient).await?;
        let now = now_timestamp();

        let result = sqlx::query(
            "INSERT INTO messages (conversation_id, user_id, user_kind, provider_message_id, \
             direction, sender, recipient, body, message_kind, transport, status, error, \
             created_at) \
             VALUES (?1, ?2, ?3, ?4, 'outbound', '', ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )
        .bind(conversation.id)
        .bind(&record.user.id)
        .bind(record.user.kind.as_str())
        .bind(record.provider_message_id.as_deref())
        .bind(&record.recipient)
        .bind(&record.body)
        .bind(record.kind.as_str())
        .bind(record.transport.as_str())
        .bind(record.status.as_str())
        .bind(record.error.as_deref())
        .bind(&now)
        .execute(self.pool())
        .await?;

        if record.status != DeliveryStatus::Failed {
            self.touch_conversation(conversation.id, &record.body, &now, 0)
                .await?;
            self.upsert_contact(&record.user, &record.recipient, None)
                .await?;
        }

        self.message(result.last_insert_rowid()).await
    }

    /// Advance the delivery status of an outbound message.
    ///
    /// Returns `false` when the message is unknown or the update would move
    /// the status backwards.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn update_delivery_status(
        &self,
        transport: TransportKind,
        provider_message_id: &str,
        status: DeliveryStatus,
    ) -> Result<bool, StoreError> {
        let current: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, status FROM messages \
             WHERE transport = ?1 AND direction = 'outbound' AND provider_message_id = ?2",
        )
        .bind(transport.as_str())
        .bind(provider_message_id)
        .fetch_optional(self.pool())
        .await?;

        let Some((id, current)) = current else {
            return Ok(false);
        };
        if !DeliveryStatus::parse(&current)?.can_advance_to(status) {
            return Ok(false);
        }

        // Guarded on the observed status so concurrent receipts cannot regress it.
        let result = sqlx::query("UPDATE messages SET status = ?1 WHERE id = ?2 AND status = ?3")
            .bind(status.as_str())
            .bind(id)
            .bind(&current)
            .execute(self.pool())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// A page of a conversation's messages, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the conversation is not the user's.
    pub async fn conversation_messages(
        &self,
        user: &UserRef,
        conversation_id: i64,
        page: Page,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        self.conversation(user, conversation_id).await?;

        let sql = format!(
            "{SELECT_COLUMNS} WHERE conversation_id = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
        );
        let rows: Vec<MessageRow> = sqlx::query_as(&sql)
            .bind(conversation_id)
            .bind(page.sql_limit())
            .bind(page.sql_offset())
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(StoredMessage::try_from).collect()
    }

    /// Look up a message by its provider id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn find_message(
        &self,
        transport: TransportKind,
        direction: Direction,
        provider_message_id: &str,
    ) -> Result<Option<StoredMessage>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE transport = ?1 AND direction = ?2 AND provider_message_id = ?3"
        );
        let row: Option<MessageRow> = sqlx::query_as(&sql)
            .bind(transport.as_str())
            .bind(direction.as_str())
            .bind(provider_message_id)
            .fetch_optional(self.pool())
            .await?;
        row.map(StoredMessage::try_from).transpose()
    }

    /// The user who most recently messaged `recipient` successfully over
    /// `transport`.
    ///
    /// Routes replies addressed to a number shared by many users.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn last_sender_to(
        &self,
        transport: TransportKind,
        recipient: &str,
    ) -> Result<Option<UserRef>, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT user_id, user_kind FROM messages \
             WHERE transport = ?1 AND direction = 'outbound' AND recipient = ?2 \
             AND provider_message_id IS NOT NULL \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(transport.as_str())
        .bind(recipient)
        .fetch_optional(self.pool())
        .await?;
        row.map(|(id, kind)| Ok(UserRef::new(id, UserKind::parse(&kind)?)))
            .transpose()
    }

    async fn message(&self, id: i64) -> Result<StoredMessage, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1");
        let row: MessageRow = sqlx::query_as(&sql)
            .bind(id)
            .fetch_one(self.pool())
            .await?;
        StoredMessage::try_from(row)
    }
}
