//! Per-user address book.
//!
//! A contact tracks whether the counterpart has ever messaged the user (the
//! cloud transport must open with a template otherwise) and a block flag.

use serde::Serialize;
use tracing::trace;

use crate::types::{now_timestamp, UserRef};

use super::{MessageStore, StoreError};

/// Row type returned by SQLite queries for contacts.
type ContactRow = (i64, String, Option<String>, bool, bool, String);

/// A counterpart phone number in a user's address book.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    /// Database ID.
    pub id: i64,
    /// Normalised phone number.
    pub phone: String,
    /// Display name, if known.
    pub name: Option<String>,
    /// Whether any inbound message was ever received from this number.
    pub has_inbound: bool,
    /// Whether outbound sends and auto-replies are suppressed.
    pub blocked: bool,
    /// Creation time.
    pub created_at: String,
}

fn contact_from_row((id, phone, name, has_inbound, blocked, created_at): ContactRow) -> Contact {
    Contact {
        id,
        phone,
        name,
        has_inbound,
        blocked,
        created_at,
    }
}

impl MessageStore {
    /// Insert a contact, or fill in its name if one was not known.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn upsert_contact(
        &self,
        user: &UserRef,
        phone: &str,
        name: Option<&str>,
    ) -> Result<Contact, StoreError> {
        sqlx::query(
            "INSERT INTO contacts (user_id, user_kind, phone, name, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (user_id, user_kind, phone) \
             DO UPDATE SET name = COALESCE(contacts.name, excluded.name)",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(phone)
        .bind(name)
        .bind(now_timestamp())
        .execute(self.pool())
        .await?;
        trace!(user = %user, phone, "contact upserted");

        self.contact(user, phone)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "contact",
                id: phone.to_owned(),
            })
    }

    /// Load a contact by phone number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn contact(
        &self,
        user: &UserRef,
        phone: &str,
    ) -> Result<Option<Contact>, StoreError> {
        let row: Option<ContactRow> = sqlx::query_as(
            "SELECT id, phone, name, has_inbound, blocked, created_at FROM contacts \
             WHERE user_id = ?1 AND user_kind = ?2 AND phone = ?3",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(phone)
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map(contact_from_row))
    }

    /// Remember that `phone` has messaged the user at least once.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn mark_inbound_seen(
        &self,
        user: &UserRef,
        phone: &str,
        name: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO contacts (user_id, user_kind, phone, name, has_inbound, created_at) \
             VALUES (?1, ?2, ?3, ?4, TRUE, ?5) \
             ON CONFLICT (user_id, user_kind, phone) \
             DO UPDATE SET has_inbound = TRUE, name = COALESCE(contacts.name, excluded.name)",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(phone)
        .bind(name)
        .bind(now_timestamp())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Whether any inbound message from `phone` is on file.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn has_inbound_history(
        &self,
        user: &UserRef,
        phone: &str,
    ) -> Result<bool, StoreError> {
        Ok(self
            .contact(user, phone)
            .await?
            .is_some_and(|c| c.has_inbound))
    }

    /// Block or unblock a counterpart. Creates the contact if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn set_blocked(
        &self,
        user: &UserRef,
        phone: &str,
        blocked: bool,
    ) -> Result<Contact, StoreError> {
        sqlx::query(
            "INSERT INTO contacts (user_id, user_kind, phone, blocked, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5) \
             ON CONFLICT (user_id, user_kind, phone) DO UPDATE SET blocked = excluded.blocked",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(phone)
        .bind(blocked)
        .bind(now_timestamp())
        .execute(self.pool())
        .await?;

        self.contact(user, phone)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "contact",
                id: phone.to_owned(),
            })
    }

    /// Whether a counterpart is blocked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn is_blocked(&self, user: &UserRef, phone: &str) -> Result<bool, StoreError> {
        Ok(self.contact(user, phone).await?.is_some_and(|c| c.blocked))
    }
}
