//! Message store backed by SQLite.
//!
//! Persists integrations, contacts, conversations, messages and the shared
//! fallback credit ledger. The schema is applied inline via `include_str!`
//! on every open; all statements are idempotent.
//!
//! # Concurrency
//!
//! Counters and the credit balance are only ever changed by single
//! `UPDATE ... SET x = x + n` statements, so concurrent writers never lose an
//! update. Conversation creation uses `INSERT .. ON CONFLICT DO NOTHING`
//! followed by a select, which is safe under concurrent inbound and outbound
//! traffic for the same pair.

pub mod contacts;
pub mod conversations;
pub mod credits;
pub mod integrations;
pub mod messages;

use std::path::Path;

use serde::Deserialize;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::debug;

use crate::types::ParseEnumError;

pub use self::contacts::Contact;
pub use self::credits::MAX_CREDIT_BALANCE;
pub use self::conversations::Conversation;
pub use self::integrations::{Integration, IntegrationConfig};
pub use self::messages::{NormalizedMessage, OutboundRecord, StoredMessage};

/// Schema applied on every open.
const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// Largest page a caller may request.
pub const MAX_PAGE_SIZE: u32 = 200;

/// Page size used when the caller does not specify one.
pub const DEFAULT_PAGE_SIZE: u32 = 50;

/// Errors from the message store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("corrupt row: {0}")]
    Corrupt(#[from] ParseEnumError),

    /// The requested record does not exist.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of record.
        entity: &'static str,
        /// Identifier that was looked up.
        id: String,
    },

    /// Caller supplied an invalid value.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Offset pagination with a bounded page size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Page {
    /// Maximum rows to return (clamped to `1..=MAX_PAGE_SIZE`).
    #[serde(default = "default_limit")]
    pub limit: u32,
    /// Rows to skip.
    #[serde(default)]
    pub offset: u32,
}

fn default_limit() -> u32 {
    DEFAULT_PAGE_SIZE
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: DEFAULT_PAGE_SIZE,
            offset: 0,
        }
    }
}

impl Page {
    /// Build a page with the given limit and offset.
    pub fn new(limit: u32, offset: u32) -> Self {
        Self { limit, offset }
    }

    /// Limit clamped to the allowed range, as bound in SQL.
    pub fn sql_limit(&self) -> i64 {
        i64::from(self.limit.clamp(1, MAX_PAGE_SIZE))
    }

    /// Offset as bound in SQL.
    pub fn sql_offset(&self) -> i64 {
        i64::from(self.offset)
    }
}

/// Gateway to the SQLite database holding all messaging state.
#[derive(Debug, Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Open (or create) the database at `path` and apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created, the database
    /// cannot be opened, or the schema fails to apply.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::InvalidInput(format!(
                    "failed to create database directory {}: {e}",
                    parent.display()
                ))
            })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5))
            .pragma("trusted_schema", "OFF")
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(8)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        store.migrate().await?;
        debug!(path = %path.display(), "message store opened");
        Ok(store)
    }

    /// Wrap an existing pool. Call [`migrate`](Self::migrate) before use if
    /// the schema has not been applied.
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Apply the schema.
    ///
    /// # Errors
    ///
    /// Returns an error if any schema statement fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA_SQL).execute(&self.pool).await?;
        Ok(())
    }

    /// Returns a reference to the underlying SQLite pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}
