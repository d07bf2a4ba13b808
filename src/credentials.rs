//! Credential loading and per-transport credential resolution.
//!
//! Process-wide secrets (platform access token, webhook secrets, API token)
//! are loaded from a private `.env` file. Per-user cloud credentials live on
//! the user's integration record. Resolution is two explicit, ordered steps
//! so that "user never configured credentials" stays distinguishable from
//! "intentionally using the platform default".

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::store::Integration;
use crate::transport::TransportError;

/// Runtime credentials loaded from the `.env` file.
#[derive(Clone, Default)]
pub struct Credentials {
    vars: BTreeMap<String, String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("keys", &self.vars.keys().collect::<Vec<_>>())
            .field("values", &"[REDACTED]")
            .finish()
    }
}

impl Credentials {
    /// Build credentials from a key-value map.
    pub fn from_map(vars: BTreeMap<String, String>) -> Self {
        Self { vars }
    }

    /// Returns a credential value for a key, if present and non-empty.
    ///
    /// Falls back to the process environment when the `.env` file does not
    /// define the key.
    pub fn get(&self, key: &str) -> Option<String> {
        self.vars
            .get(key)
            .cloned()
            .or_else(|| std::env::var(key).ok())
            .filter(|v| !v.trim().is_empty())
    }

    /// Returns a required credential or an error when missing.
    ///
    /// # Errors
    ///
    /// Returns an error when the key is not defined anywhere.
    pub fn require(&self, key: &str) -> anyhow::Result<String> {
        self.get(key)
            .ok_or_else(|| anyhow::anyhow!("missing required credential: {key}"))
    }
}

/// Load credentials from a specific `.env` path.
///
/// A missing file yields empty credentials (the process environment is
/// still consulted by [`Credentials::get`]).
///
/// # Errors
///
/// Returns an error if permissions are too broad or parsing fails.
pub fn load_credentials(path: &Path) -> anyhow::Result<Credentials> {
    if !path.exists() {
        debug!(path = %path.display(), "no credentials file, using process environment only");
        return Ok(Credentials::default());
    }

    validate_private_permissions(path)?;

    let mut vars = BTreeMap::new();
    let iter = dotenvy::from_path_iter(path)
        .with_context(|| format!("failed to read credentials at {}", path.display()))?;

    for item in iter {
        let (key, value) = item.with_context(|| {
            format!(
                "failed to parse key-value entry in credentials file {}",
                path.display()
            )
        })?;
        vars.insert(key, value);
    }

    Ok(Credentials { vars })
}

#[cfg(unix)]
fn validate_private_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect credentials file {}", path.display()))?;
    let mode = metadata.permissions().mode() & 0o777;

    if mode & 0o077 != 0 {
        return Err(anyhow::anyhow!(
            "credentials file {} must be 0600, found {:o}",
            path.display(),
            mode
        ));
    }

    Ok(())
}

#[cfg(not(unix))]
fn validate_private_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

// ---------------------------------------------------------------------------
// Cloud API credentials
// ---------------------------------------------------------------------------

/// Access token and sender number for the cloud business-messaging API.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudCredentials {
    /// Bearer token issued by the vendor.
    pub access_token: String,
    /// Registered sender phone number id.
    pub phone_number_id: String,
    /// Business account id, informational.
    #[serde(default)]
    pub business_account_id: Option<String>,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudCredentials")
            .field("access_token", &"[REDACTED]")
            .field("phone_number_id", &self.phone_number_id)
            .field("business_account_id", &self.business_account_id)
            .finish()
    }
}

impl CloudCredentials {
    /// Whether both required fields carry a value.
    pub fn is_complete(&self) -> bool {
        !self.access_token.trim().is_empty() && !self.phone_number_id.trim().is_empty()
    }
}

/// Platform-owned secrets shared by every user.
#[derive(Clone, Default)]
pub struct PlatformCredentials {
    /// Cloud credentials of the shared fallback sender, if configured.
    pub fallback: Option<CloudCredentials>,
    /// Webhook verification token for the GET handshake.
    pub webhook_verify_token: Option<String>,
    /// App secret used to sign webhook deliveries.
    pub webhook_app_secret: Option<String>,
    /// Bearer token protecting the internal API.
    pub api_token: Option<String>,
}

impl std::fmt::Debug for PlatformCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlatformCredentials")
            .field("fallback", &self.fallback)
            .field(
                "webhook_verify_token",
                &self.webhook_verify_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("webhook_app_secret", &self.webhook_app_secret.as_ref().map(|_| "[REDACTED]"))
            .field("api_token", &self.api_token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

/// Names of the variables that hold platform secrets.
#[derive(Debug, Clone)]
pub struct PlatformCredentialKeys<'a> {
    /// Variable holding the shared fallback access token.
    pub fallback_access_token: &'a str,
    /// Variable holding the shared fallback phone number id.
    pub fallback_phone_number_id: &'a str,
    /// Variable holding the webhook verification token.
    pub webhook_verify_token: &'a str,
    /// Variable holding the webhook app secret.
    pub webhook_app_secret: &'a str,
    /// Variable holding the internal API bearer token.
    pub api_token: &'a str,
}

impl PlatformCredentials {
    /// Assemble platform credentials from loaded `.env` values.
    pub fn from_credentials(creds: &Credentials, keys: &PlatformCredentialKeys<'_>) -> Self {
        let fallback = match (
            creds.get(keys.fallback_access_token),
            creds.get(keys.fallback_phone_number_id),
        ) {
            (Some(access_token), Some(phone_number_id)) => Some(CloudCredentials {
                access_token,
                phone_number_id,
                business_account_id: None,
            }),
            _ => None,
        };
        Self {
            fallback,
            webhook_verify_token: creds.get(keys.webhook_verify_token),
            webhook_app_secret: creds.get(keys.webhook_app_secret),
            api_token: creds.get(keys.api_token),
        }
    }
}

/// Which resolution step produced a credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialSource {
    /// Step 1: the user's own integration config.
    UserConfig,
    /// Step 2: the platform-wide default.
    PlatformDefault,
}

/// Resolve cloud credentials for a user's own cloud transport.
///
/// Only step 1 applies: the platform default is never used on behalf of a
/// user's own cloud sender.
///
/// # Errors
///
/// Returns [`TransportError::CredentialMissing`] when the integration has no
/// complete cloud credentials.
pub fn resolve_user_cloud(
    integration: &Integration,
) -> Result<(CloudCredentials, CredentialSource), TransportError> {
    integration
        .cloud
        .as_ref()
        .filter(|c| c.is_complete())
        .cloned()
        .map(|c| (c, CredentialSource::UserConfig))
        .ok_or_else(|| TransportError::CredentialMissing {
            transport: crate::types::TransportKind::Cloud,
            detail: "integration has no cloud access token or phone number id".to_owned(),
        })
}

/// Resolve credentials for the shared fallback sender.
///
/// Only step 2 applies: the fallback transport always speaks as the platform.
///
/// # Errors
///
/// Returns [`TransportError::CredentialMissing`] when the platform fallback
/// sender is not configured.
pub fn resolve_platform_fallback(
    platform: &PlatformCredentials,
) -> Result<(CloudCredentials, CredentialSource), TransportError> {
    platform
        .fallback
        .as_ref()
        .filter(|c| c.is_complete())
        .cloned()
        .map(|c| (c, CredentialSource::PlatformDefault))
        .ok_or_else(|| TransportError::CredentialMissing {
            transport: crate::types::TransportKind::SharedFallback,
            detail: "platform fallback sender is not configured".to_owned(),
        })
}
