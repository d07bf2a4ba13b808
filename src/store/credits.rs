//! Shared fallback credit ledger.
//!
//! Balances are granted by the billing collaborator and consumed one credit
//! per successful shared-fallback send. Consumption is a single conditional
//! decrement, so the balance can never go negative under concurrent sends.

use tracing::{debug, info};

use crate::types::{now_timestamp, UserRef};

use super::{MessageStore, StoreError};

/// Largest balance a user may hold.
pub const MAX_CREDIT_BALANCE: i64 = 1_000_000_000;

impl MessageStore {
    /// Add `amount` credits to the user's balance and return the new balance.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidInput`] for a non-positive amount or one
    /// that would lift the balance above [`MAX_CREDIT_BALANCE`], or
    /// [`StoreError::Database`] on SQLite failure.
    pub async fn grant_credits(&self, user: &UserRef, amount: i64) -> Result<i64, StoreError> {
        if amount <= 0 {
            return Err(StoreError::InvalidInput(format!(
                "credit grant must be positive, got {amount}"
            )));
        }
        let Some(headroom) = MAX_CREDIT_BALANCE.checked_sub(amount).filter(|h| *h >= 0) else {
            return Err(StoreError::InvalidInput(format!(
                "credit grant of {amount} exceeds the maximum balance of {MAX_CREDIT_BALANCE}"
            )));
        };

        // The guard keeps the check and the increment in one statement.
        let result = sqlx::query(
            "INSERT INTO credit_balances (user_id, user_kind, balance, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT (user_id, user_kind) \
             DO UPDATE SET balance = balance + excluded.balance, updated_at = excluded.updated_at \
             WHERE balance <= ?5",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(amount)
        .bind(now_timestamp())
        .bind(headroom)
        .execute(self.pool())
        .await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::InvalidInput(format!(
                "credit grant of {amount} would exceed the maximum balance of {MAX_CREDIT_BALANCE}"
            )));
        }

        let balance = self.credit_balance(user).await?;
        info!(user = %user, amount, balance, "credits granted");
        Ok(balance)
    }

    /// Current balance (zero when the user never had credits).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn credit_balance(&self, user: &UserRef) -> Result<i64, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as(
            "SELECT balance FROM credit_balances WHERE user_id = ?1 AND user_kind = ?2",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .fetch_optional(self.pool())
        .await?;
        Ok(row.map_or(0, |(b,)| b))
    }

    /// Atomically take one credit if the balance is positive.
    ///
    /// Returns `false` without side effects when the balance is exhausted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn try_reserve_credit(&self, user: &UserRef) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE credit_balances SET balance = balance - 1, updated_at = ?1 \
             WHERE user_id = ?2 AND user_kind = ?3 AND balance > 0",
        )
        .bind(now_timestamp())
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        let reserved = result.rows_affected() == 1;
        debug!(user = %user, reserved, "credit reservation");
        Ok(reserved)
    }

    /// Return a reserved credit after the send it was reserved for failed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn refund_credit(&self, user: &UserRef) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE credit_balances SET balance = balance + 1, updated_at = ?1 \
             WHERE user_id = ?2 AND user_kind = ?3",
        )
        .bind(now_timestamp())
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        debug!(user = %user, "credit refunded");
        Ok(())
    }
}
