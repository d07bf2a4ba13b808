//! Cloud API webhook: subscription handshake and signed event delivery.

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use tracing::{debug, info, warn};

use super::error::ApiError;
use super::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Header carrying `sha256=<hex hmac of the raw body>`.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Query of the GET handshake.
#[derive(Debug, Deserialize)]
pub struct Handshake {
    #[serde(rename = "hub.mode")]
    mode: Option<String>,
    #[serde(rename = "hub.verify_token")]
    verify_token: Option<String>,
    #[serde(rename = "hub.challenge")]
    challenge: Option<String>,
}

/// GET /webhooks/cloud
///
/// Echoes `hub.challenge` when the mode is `subscribe` and the token matches
/// the configured verification token.
pub async fn verify(State(state): State<AppState>, Query(query): Query<Handshake>) -> Response {
    let expected = state.platform.webhook_verify_token.as_deref();
    match (query.mode.as_deref(), query.verify_token.as_deref(), expected) {
        (Some("subscribe"), Some(presented), Some(expected)) if presented == expected => {
            info!("webhook subscription verified");
            (StatusCode::OK, query.challenge.unwrap_or_default()).into_response()
        }
        _ => {
            warn!("webhook verification rejected");
            ApiError::new(StatusCode::FORBIDDEN, "forbidden", "webhook verification failed")
                .into_response()
        }
    }
}

/// POST /webhooks/cloud
///
/// Answers 200 for any correctly signed delivery, even when nothing in it
/// could be routed, so the provider does not redeliver.
pub async fn receive(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = state.platform.webhook_app_secret.as_deref() {
        let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
        if !signature_matches(secret, &body, signature) {
            warn!("webhook delivery with invalid signature rejected");
            return ApiError::new(StatusCode::UNAUTHORIZED, "bad_signature", "invalid signature")
                .into_response();
        }
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "webhook body is not JSON, ignored");
            return Json(json!({ "success": true })).into_response();
        }
    };

    let report = state.router.ingest_webhook(&payload).await;
    debug!(
        stored = report.stored,
        duplicates = report.duplicates,
        statuses = report.statuses,
        unrouted = report.unrouted,
        "webhook delivery processed"
    );
    Json(json!({ "success": true })).into_response()
}

/// Check `sha256=<hex>` against the HMAC-SHA256 of `body`.
pub fn signature_matches(secret: &str, body: &[u8], header: Option<&str>) -> bool {
    let Some(hex_digest) = header.and_then(|h| h.strip_prefix("sha256=")) else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// `sha256=<hex>` signature header value for `body`.
pub fn sign(secret: &str, body: &[u8]) -> Option<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(body);
    Some(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}
