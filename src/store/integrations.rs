//! Integration records: one active transport configuration per user.
//!
//! Switching transport kind deactivates the previous record rather than
//! deleting it, so the history of a user's integrations is preserved. A
//! partial unique index guarantees at most one active row per user.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::{debug, info};

use crate::credentials::CloudCredentials;
use crate::types::{now_timestamp, HealthStatus, TransportKind, UserKind, UserRef};

use super::{MessageStore, StoreError};

/// Integration configuration supplied by the surrounding application.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IntegrationConfig {
    /// Transport the user wants to send through.
    pub integration_type: TransportKind,
    /// Cloud API credentials (only meaningful for the cloud transport).
    #[serde(default)]
    pub credentials: Option<CloudCredentials>,
    /// Whether inbound messages trigger the canned reply.
    #[serde(default)]
    pub auto_reply_enabled: bool,
    /// Canned reply text.
    #[serde(default)]
    pub auto_reply_text: String,
    /// Whether qualifying failures retry through the shared fallback sender.
    #[serde(default)]
    pub fallback_enabled: bool,
    /// Whether the integration may send at all.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl IntegrationConfig {
    /// Minimal config selecting a transport with everything else defaulted.
    pub fn for_transport(integration_type: TransportKind) -> Self {
        Self {
            integration_type,
            credentials: None,
            auto_reply_enabled: false,
            auto_reply_text: String::new(),
            fallback_enabled: false,
            enabled: true,
        }
    }
}

/// A persisted integration record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Integration {
    /// Database ID.
    pub id: i64,
    /// Owning user.
    pub user: UserRef,
    /// Transport kind of this record.
    pub transport: TransportKind,
    /// Whether this is the user's current integration.
    pub active: bool,
    /// Whether sending is enabled.
    pub enabled: bool,
    /// Cloud credentials, never serialized.
    #[serde(skip)]
    pub cloud: Option<CloudCredentials>,
    /// Phone number of the paired device, once known.
    pub bridge_phone: Option<String>,
    /// Auto-reply switch.
    pub auto_reply_enabled: bool,
    /// Canned reply text.
    pub auto_reply_text: String,
    /// Fallback switch.
    pub fallback_enabled: bool,
    /// Mirrored health.
    pub health: HealthStatus,
    /// When health was last updated.
    pub last_health_check: Option<String>,
    /// Cumulative failures.
    pub error_count: i64,
    /// Most recent failure text.
    pub last_error: Option<String>,
    /// Successful sends.
    pub sent_count: i64,
    /// Inbound messages received.
    pub received_count: i64,
    /// Last send or receive.
    pub last_activity: Option<String>,
    /// Creation time.
    pub created_at: String,
}

#[derive(FromRow)]
struct IntegrationRow {
    id: i64,
    user_id: String,
    user_kind: String,
    transport: String,
    active: bool,
    enabled: bool,
    cloud_access_token: Option<String>,
    cloud_phone_number_id: Option<String>,
    cloud_business_account_id: Option<String>,
    bridge_phone: Option<String>,
    auto_reply_enabled: bool,
    auto_reply_text: String,
    fallback_enabled: bool,
    health: String,
    last_health_check: Option<String>,
    error_count: i64,
    last_error: Option<String>,
    sent_count: i64,
    received_count: i64,
    last_activity: Option<String>,
    created_at: String,
}

impl TryFrom<IntegrationRow> for Integration {
    type Error = StoreError;

    fn try_from(row: IntegrationRow) -> Result<Self, Self::Error> {
        let cloud = match (row.cloud_access_token, row.cloud_phone_number_id) {
            (Some(access_token), Some(phone_number_id)) => Some(CloudCredentials {
                access_token,
                phone_number_id,
                business_account_id: row.cloud_business_account_id,
            }),
            _ => None,
        };
        Ok(Self {
            id: row.id,
            user: UserRef::new(row.user_id, UserKind::parse(&row.user_kind)?),
            transport: TransportKind::parse(&row.transport)?,
            active: row.active,
            enabled: row.enabled,
            cloud,
            bridge_phone: row.bridge_phone,
            auto_reply_enabled: row.auto_reply_enabled,
            auto_reply_text: row.auto_reply_text,
            fallback_enabled: row.fallback_enabled,
            health: HealthStatus::parse(&row.health)?,
            last_health_check: row.last_health_check,
            error_count: row.error_count,
            last_error: row.last_error,
            sent_count: row.sent_count,
            received_count: row.received_count,
            last_activity: row.last_activity,
            created_at: row.created_at,
        })
    }
}

const SELECT_COLUMNS: &str = "SELECT id, user_id, user_kind, transport, active, enabled, \
     cloud_access_token, cloud_phone_number_id, cloud_business_account_id, bridge_phone, \
     auto_reply_enabled, auto_reply_text, fallback_enabled, health, last_health_check, \
     error_count, last_error, sent_count, received_count, last_activity, created_at \
     FROM integrations";

impl MessageStore {
    /// Apply a user's integration config.
    ///
    /// Same transport kind as the active record: updated in place. Different
    /// kind: the active record is deactivated and a new active one inserted.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn configure_integration(
        &self,
        user: &UserRef,
        config: &IntegrationConfig,
    ) -> Result<Integration, StoreError> {
        let now = now_timestamp();
        let (token, number, account) = match &config.credentials {
            Some(c) => (
                Some(c.access_token.as_str()),
                Some(c.phone_number_id.as_str()),
                c.business_account_id.as_deref(),
            ),
            None => (None, None, None),
        };

        let mut tx = self.pool().begin().await?;

        let current: Option<(i64, String)> = sqlx::query_as(
            "SELECT id, transport FROM integrations \
             WHERE user_id = ?1 AND user_kind = ?2 AND active",
        )
        .bind(&user.id)
        .bind(user.kind.as_str())
        .fetch_optional(&mut *tx)
        .await?;

        match current {
            Some((id, transport)) if transport == config.integration_type.as_str() => {
                sqlx::query(
                    "UPDATE integrations SET enabled = ?1, cloud_access_token = ?2, \
                     cloud_phone_number_id = ?3, cloud_business_account_id = ?4, \
                     auto_reply_enabled = ?5, auto_reply_text = ?6, fallback_enabled = ?7, \
                     updated_at = ?8 WHERE id = ?9",
                )
                .bind(config.enabled)
                .bind(token)
                .bind(number)
                .bind(account)
                .bind(config.auto_reply_enabled)
                .bind(&config.auto_reply_text)
                .bind(config.fallback_enabled)
                .bind(&now)
                .bind(id)
                .execute(&mut *tx)
                .await?;
                debug!(user = %user, integration_id = id, "integration updated in place");
            }
            previous => {
                if let Some((id, transport)) = previous {
                    sqlx::query(
                        "UPDATE integrations SET active = FALSE, updated_at = ?1 WHERE id = ?2",
                    )
                    .bind(&now)
                    .bind(id)
                    .execute(&mut *tx)
                    .await?;
                    info!(
                        user = %user,
                        from = %transport,
                        to = %config.integration_type,
                        "integration transport switched"
                    );
                }
                sqlx::query(
                    "INSERT INTO integrations (user_id, user_kind, transport, active, enabled, \
                     cloud_access_token, cloud_phone_number_id, cloud_business_account_id, \
                     auto_reply_enabled, auto_reply_text, fallback_enabled, created_at, \
                     updated_at) \
                     VALUES (?1, ?2, ?3, TRUE, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?11)",
                )
                .bind(&user.id)
                .bind(user.kind.as_str())
                .bind(config.integration_type.as_str())
                .bind(config.enabled)
                .bind(token)
                .bind(number)
                .bind(account)
                .bind(config.auto_reply_enabled)
                .bind(&config.auto_reply_text)
                .bind(config.fallback_enabled)
                .bind(&now)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        self.active_integration(user)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                entity: "integration",
                id: user.key(),
            })
    }

    /// The user's active integration, if any.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn active_integration(
        &self,
        user: &UserRef,
    ) -> Result<Option<Integration>, StoreError> {
        let sql = format!("{SELECT_COLUMNS} WHERE user_id = ?1 AND user_kind = ?2 AND active");
        let row: Option<IntegrationRow> = sqlx::query_as(&sql)
            .bind(&user.id)
            .bind(user.kind.as_str())
            .fetch_optional(self.pool())
            .await?;
        row.map(Integration::try_from).transpose()
    }

    /// Every integration the user ever had, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn integration_history(
        &self,
        user: &UserRef,
    ) -> Result<Vec<Integration>, StoreError> {
        let sql =
            format!("{SELECT_COLUMNS} WHERE user_id = ?1 AND user_kind = ?2 ORDER BY id DESC");
        let rows: Vec<IntegrationRow> = sqlx::query_as(&sql)
            .bind(&user.id)
            .bind(user.kind.as_str())
            .fetch_all(self.pool())
            .await?;
        rows.into_iter().map(Integration::try_from).collect()
    }

    /// Find the user whose active cloud integration owns a sender number.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn find_user_by_cloud_number(
        &self,
        phone_number_id: &str,
    ) -> Result<Option<UserRef>, StoreError> {
        let row: Option<(String, String)> = sqlx::query_as(
            "SELECT user_id, user_kind FROM integrations \
             WHERE cloud_phone_number_id = ?1 AND active AND transport = 'cloud' \
             ORDER BY id DESC LIMIT 1",
        )
        .bind(phone_number_id)
        .fetch_optional(self.pool())
        .await?;
        row.map(|(id, kind)| Ok(UserRef::new(id, UserKind::parse(&kind)?)))
            .transpose()
    }

    /// Users whose active integration is an enabled personal bridge.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on SQLite failure or a corrupt row.
    pub async fn active_bridge_users(&self) -> Result<Vec<UserRef>, StoreError> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT user_id, user_kind FROM integrations \
             WHERE active AND enabled AND transport = 'personal_bridge' \
             ORDER BY id",
        )
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(id, kind)| Ok::<_, StoreError>(UserRef::new(id, UserKind::parse(&kind)?)))
            .collect()
    }

    /// Mirror a health change for the user's active integration of `transport`.
    ///
    /// Returns `false` when the user has no active integration of that kind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn record_health(
        &self,
        user: &UserRef,
        transport: TransportKind,
        health: HealthStatus,
        last_error: Option<&str>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE integrations SET health = ?1, last_health_check = ?2, \
             last_error = COALESCE(?3, last_error), updated_at = ?2 \
             WHERE user_id = ?4 AND user_kind = ?5 AND active AND transport = ?6",
        )
        .bind(health.as_str())
        .bind(now_timestamp())
        .bind(last_error)
        .bind(&user.id)
        .bind(user.kind.as_str())
        .bind(transport.as_str())
        .execute(self.pool())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Record the resolved device phone number of a paired bridge session.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn set_bridge_phone(
        &self,
        user: &UserRef,
        phone: Option<&str>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE integrations SET bridge_phone = ?1, updated_at = ?2 \
             WHERE user_id = ?3 AND user_kind = ?4 AND active AND transport = 'personal_bridge'",
        )
        .bind(phone)
        .bind(now_timestamp())
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Count a successful send against the active integration.
    ///
    /// Health flips to healthy only when `transport` is the integration's own
    /// transport; a send rescued by the fallback sender leaves it untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn record_send_success(
        &self,
        user: &UserRef,
        transport: TransportKind,
    ) -> Result<(), StoreError> {
        let now = now_timestamp();
        sqlx::query(
            "UPDATE integrations SET sent_count = sent_count + 1, last_activity = ?1, \
             health = CASE WHEN transport = ?2 THEN 'healthy' ELSE health END, \
             last_health_check = CASE WHEN transport = ?2 THEN ?1 ELSE last_health_check END, \
             updated_at = ?1 \
             WHERE user_id = ?3 AND user_kind = ?4 AND active",
        )
        .bind(&now)
        .bind(transport.as_str())
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Count a failed send against the active integration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn record_send_failure(
        &self,
        user: &UserRef,
        transport: TransportKind,
        health: HealthStatus,
        error: &str,
    ) -> Result<(), StoreError> {
        let now = now_timestamp();
        sqlx::query(
            "UPDATE integrations SET error_count = error_count + 1, last_error = ?1, \
             health = CASE WHEN transport = ?2 THEN ?3 ELSE health END, \
             last_health_check = ?4, updated_at = ?4 \
             WHERE user_id = ?5 AND user_kind = ?6 AND active",
        )
        .bind(error)
        .bind(transport.as_str())
        .bind(health.as_str())
        .bind(&now)
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }

    /// Count an inbound message against the active integration.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on SQLite failure.
    pub async fn record_received(&self, user: &UserRef) -> Result<(), StoreError> {
        let now = now_timestamp();
        sqlx::query(
            "UPDATE integrations SET received_count = received_count + 1, last_activity = ?1, \
             updated_at = ?1 WHERE user_id = ?2 AND user_kind = ?3 AND active",
        )
        .bind(&now)
        .bind(&user.id)
        .bind(user.kind.as_str())
        .execute(self.pool())
        .await?;
        Ok(())
    }
}
