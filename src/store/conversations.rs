//! Conversations group messages by (user, counterpart).
//!
//! Created lazily on the first message in either direction and never
//! deleted; archiving only hides them from the default listing.

use serde::Serialize;

use crate::types::{now_timestamp, UserRef};

use super::{MessageStore, Page, StoreError};

/// Row type returned by SQLite queries for conversations.
type ConversationRow = (
    i64,
    String,
    bool,
    bool,
    i64,
    Option<String>,
    Option<String>,
    String,
);

/// Longest preview kept on the conversation row.
const PREVIEW_CHARS: usize = 120;

/// A thread between a user and one counterpart number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    /// Database ID.
    pub id: i64,
    /// Counterpart phone number.
    pub counterpart: String,
    /// Hidden from the default listing.
    pub archived: bool,
    /// Pinned by the user.
    pub pinned: bool,
    /// Inbound messages not yet read.
    pub unread_count: i64,
    /// Time of the newest message.
    pub last_message_at: Option<String>,
    /// Truncated body of the newest message.
    pub last_message_preview: Option<String>,
    /// Creation time.
    pub created_at: String,
}

fn conversation_from_row(row: ConversationRow) -> Conversation {
    let (
        id,
        counterpart,
        archived,
        pinned,
        unread_count,
        last_message_at,
        last_message_preview,
        created_at,
    ) = row;
    Conversation {
        id,
        counterpart,
        archived,
        pinned,
        unread_count,
        last_message_at,
        last_message_preview,
        created_at,
    }
}

const SELECT_COLUMNS: &str = "SELECT id, counterpart, archived, pinned, unread_count, \
     last_message_at, last_message_preview, created_at FROM conversations";

fn preview(body: &str) -> String {
    body.chars().take(PREVIEW_CHARS).collect()
}

impl MessageStore {
    /// Get or create the conversation for `(user, counterpart)`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn conversation_for(
        &self,
        user: &UserRef,
        counterpart: &str,
    ) -> Result<Conversation, StoreError> {
        sqlx::query(
            "INSERT INTO conversations (user_id, user_kind, counterpart, created_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (user_id, user_kind, counterpart) DO NOTHING",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(counterpart)
        .bind(now_timestamp())
        .execute(self.pool())
        .await?;

        let sql =
            format!("{SELECT_COLUMNS} WHERE user_id = ?1 AND user_kind = ?2 AND counterpart = ?3");
        let row: ConversationRow = sqlx::query_as(&sql)
            .bind(&user.id)
            .bind(user.kind.as_str())
            .bind(counterpart)
            .fetch_one(self.pool())
            .await?;
        Ok(conversation_from_row(row))
    }

    /// Load one of the user's conversations by ID.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the conversation does not exist or
    /// belongs to another user.
    pub async fn conversation(&self, user: &UserRef, id: i64) -> Result<Conversation, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE id = ?1 AND user_id = ?2 AND user_kind = ?3");
        let row: Option<ConversationRow> = sqlx::query_as(&sql)
            .bind(id)
            .bind(&user.id)
            .bind(user.kind.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.map(conversation_from_row)
            .ok_or_else(|| StoreError::NotFound {
                entity: "conversation",
                id: id.to_string(),
            })
    }

    /// List the user's conversations, most recent activity first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn list_conversations(
        &self,
        user: &UserRef,
        page: Page,
        include_archived: bool,
    ) -> Result<Vec<Conversation>, StoreError> {
        let sql = format!(
            "{SELECT_COLUMNS} WHERE user_id = ?1 AND user_kind = ?2 AND (?3 OR NOT archived) \
             ORDER BY COALESCE(last_message_at, created_at) DESC, id DESC LIMIT ?4 OFFSET ?5"
        );
        let rows: Vec<ConversationRow> = sqlx::query_as(&sql)
            .bind(&user.id)
            .bind(user.kind.as_str())
            .bind(include_archived)
            .bind(page.sql_limit())
            .bind(page.sql_offset())
            .fetch_all(self.pool())
            .await?;
        Ok(rows.into_iter().map(conversation_from_row).collect())
    }

    /// Archive or unarchive a conversation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the conversation is not the user's.
    pub async fn set_archived(
        &self,
        user: &UserRef,
        id: i64,
        archived: bool,
    ) -> Result<Conversation, StoreError> {
        self.update_flag(user, id, "archived", archived).await
    }

    /// Pin or unpin a conversation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the conversation is not the user's.
    pub async fn set_pinned(
        &self,
        user: &UserRef,
        id: i64,
        pinned: bool,
    ) -> Result<Conversation, StoreError> {
        self.update_flag(user, id, "pinned", pinned).await
    }

    /// Reset the unread counter.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] if the conversation is not the user's.
    pub async fn mark_read(&self, user: &UserRef, id: i64) -> Result<Conversation, StoreError> {
        sqlx::query(
            "UPDATE conversations SET unread_count = 0 \
             WHERE id = ?1 AND user_id = ?2 AND user_kind = ?3",
        )
        .bind(id)
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        self.conversation(user, id).await
    }

    /// Record a new message on the conversation row.
    pub(crate) async fn touch_conversation(
        &self,
        conversation_id: i64,
        body: &str,
        at: &str,
        unread_increment: i64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE conversations SET last_message_at = ?1, last_message_preview = ?2, \
             unread_count = unread_count + ?3 WHERE id = ?4",
        )
        .bind(at)
        .bind(preview(body))
        .bind(unread_increment)
        .bind(conversation_id)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    async fn update_flag(
        &self,
        user: &UserRef,
        id: i64,
        column: &'static str,
        value: bool,
    ) -> Result<Conversation, StoreError> {
        // `column` is one of two literals chosen above, never caller input.
        let sql = format!(
            "UPDATE conversations SET {column} = ?1 \
             WHERE id = ?2 AND user_id = ?3 AND user_kind = ?4"
        );
        sqlx::query(&sql)
            .bind(value)
            .bind(id)
            .bind(&user.id)
            .bind(user.kind.as_str())
            .execute(self.pool())
            .await?;
        self.conversation(user, id).await
    }
}
