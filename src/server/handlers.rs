//! Handlers for the internal `/v1/{kind}/{user_id}/...` API.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use base64::Engine;
use qrcode::render::svg;
use qrcode::QrCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::router::SendRequest;
use crate::session::PairingStatus;
use crate::store::{IntegrationConfig, Page, DEFAULT_PAGE_SIZE};
use crate::types::{normalize_phone, MessageKind, UserKind, UserRef};

use super::error::ApiError;
use super::AppState;

type ApiResult = Result<Json<Value>, ApiError>;

// ============================================================================
// Path / body types
// ============================================================================

/// `/v1/{kind}/{user_id}`
#[derive(Debug, Deserialize)]
pub struct UserPath {
    kind: UserKind,
    user_id: String,
}

impl UserPath {
    pub(crate) fn user(&self) -> UserRef {
        UserRef::new(self.user_id.clone(), self.kind)
    }
}

/// `/v1/{kind}/{user_id}/conversations/{id}`
#[derive(Debug, Deserialize)]
pub struct ConversationPath {
    kind: UserKind,
    user_id: String,
    id: i64,
}

/// `/v1/{kind}/{user_id}/contacts/{phone}`
#[derive(Debug, Deserialize)]
pub struct ContactPath {
    kind: UserKind,
    user_id: String,
    phone: String,
}

/// Body of `POST messages`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageBody {
    recipient_phone: String,
    content: String,
    #[serde(default)]
    message_type: MessageKind,
}

/// Query of `GET conversations`.
#[derive(Debug, Deserialize)]
pub struct ConversationQuery {
    limit: Option<u32>,
    offset: Option<u32>,
    #[serde(default)]
    archived: bool,
}

/// Body of `PATCH conversations/{id}`.
#[derive(Debug, Deserialize)]
pub struct ConversationPatch {
    archived: Option<bool>,
    pinned: Option<bool>,
}

/// Body of `POST contacts/{phone}/block`.
#[derive(Debug, Deserialize)]
pub struct BlockBody {
    blocked: bool,
}

/// Body of `POST credits`.
#[derive(Debug, Deserialize)]
pub struct CreditGrant {
    amount: i64,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.router.sessions().active_sessions().await,
    }))
}

/// PUT /v1/{kind}/{user_id}/integration
pub async fn put_integration(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Json(config): Json<IntegrationConfig>,
) -> ApiResult {
    let user = path.user();
    let integration = state.router.sessions().configure(&user, &config).await?;
    info!(user = %user, transport = %integration.transport, "integration configured");
    Ok(Json(json!({ "success": true, "integration": integration })))
}

/// GET /v1/{kind}/{user_id}/integration
pub async fn get_integration(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
) -> ApiResult {
    let status = state.router.integration_status(&path.user()).await?;
    Ok(Json(json!({ "success": true, "status": status })))
}

/// POST /v1/{kind}/{user_id}/session
pub async fn start_session(State(state): State<AppState>, Path(path): Path<UserPath>) -> ApiResult {
    let outcome = state.router.sessions().init(&path.user()).await?;
    Ok(Json(json!({ "success": true, "session": outcome })))
}

/// DELETE /v1/{kind}/{user_id}/session
pub async fn stop_session(State(state): State<AppState>, Path(path): Path<UserPath>) -> ApiResult {
    state.router.sessions().disconnect(&path.user()).await;
    Ok(Json(json!({ "success": true })))
}

/// GET /v1/{kind}/{user_id}/session/pairing-code
///
/// `{status, code?, svg?}`; `svg` is a data URL of the QR image.
pub async fn pairing_code(State(state): State<AppState>, Path(path): Path<UserPath>) -> ApiResult {
    let status = state.router.sessions().pairing_code(&path.user()).await;
    let svg = match &status {
        PairingStatus::Ready { code } => qr_data_url(code),
        _ => None,
    };
    let mut body = serde_json::to_value(&status)
        .map_err(|e| {
            ApiError::new(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal",
                format!("unserializable pairing status: {e}"),
            )
        })?;
    if let (Some(map), Some(svg)) = (body.as_object_mut(), svg) {
        map.insert("svg".to_owned(), Value::String(svg));
    }
    Ok(Json(body))
}

/// POST /v1/{kind}/{user_id}/messages
pub async fn send_message(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Json(body): Json<SendMessageBody>,
) -> ApiResult {
    let request = SendRequest {
        recipient: body.recipient_phone,
        content: body.content,
        kind: body.message_type,
    };
    let outcome = state.router.send_message(&path.user(), request).await?;
    Ok(Json(json!({
        "success": true,
        "messageId": outcome.message_id,
        "transport": outcome.transport,
        "fellBack": outcome.fell_back,
        "path": outcome.path,
    })))
}

/// GET /v1/{kind}/{user_id}/conversations
pub async fn list_conversations(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Query(query): Query<ConversationQuery>,
) -> ApiResult {
    let page = Page::new(
        query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        query.offset.unwrap_or(0),
    );
    let conversations = state
        .router
        .store()
        .list_conversations(&path.user(), page, query.archived)
        .await?;
    Ok(Json(json!({ "success": true, "conversations": conversations })))
}

/// GET /v1/{kind}/{user_id}/conversations/{id}/messages
pub async fn conversation_messages(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
    Query(page): Query<Page>,
) -> ApiResult {
    let user = UserRef::new(path.user_id, path.kind);
    let messages = state
        .router
        .store()
        .conversation_messages(&user, path.id, page)
        .await?;
    Ok(Json(json!({ "success": true, "messages": messages })))
}

/// PATCH /v1/{kind}/{user_id}/conversations/{id}
pub async fn update_conversation(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
    Json(patch): Json<ConversationPatch>,
) -> ApiResult {
    if patch.archived.is_none() && patch.pinned.is_none() {
        return Err(ApiError::bad_request("nothing to update"));
    }
    let user = UserRef::new(path.user_id, path.kind);
    let store = state.router.store();
    let mut conversation = store.conversation(&user, path.id).await?;
    if let Some(archived) = patch.archived {
        conversation = store.set_archived(&user, path.id, archived).await?;
    }
    if let Some(pinned) = patch.pinned {
        conversation = store.set_pinned(&user, path.id, pinned).await?;
    }
    Ok(Json(json!({ "success": true, "conversation": conversation })))
}

/// POST /v1/{kind}/{user_id}/conversations/{id}/read
pub async fn mark_read(
    State(state): State<AppState>,
    Path(path): Path<ConversationPath>,
) -> ApiResult {
    let user = UserRef::new(path.user_id, path.kind);
    let conversation = state.router.store().mark_read(&user, path.id).await?;
    Ok(Json(json!({ "success": true, "conversation": conversation })))
}

/// POST /v1/{kind}/{user_id}/contacts/{phone}/block
pub async fn block_contact(
    State(state): State<AppState>,
    Path(path): Path<ContactPath>,
    Json(body): Json<BlockBody>,
) -> ApiResult {
    let phone = normalize_phone(&path.phone)
        .ok_or_else(|| ApiError::bad_request(format!("invalid phone number: {}", path.phone)))?;
    let user = UserRef::new(path.user_id, path.kind);
    let contact = state
        .router
        .store()
        .set_blocked(&user, &phone, body.blocked)
        .await?;
    Ok(Json(json!({ "success": true, "contact": contact })))
}

/// POST /v1/{kind}/{user_id}/credits
pub async fn grant_credits(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    Json(grant): Json<CreditGrant>,
) -> ApiResult {
    let user = path.user();
    let balance = state
        .router
        .store()
        .grant_credits(&user, grant.amount)
        .await?;
    info!(user = %user, amount = grant.amount, balance, "credits granted");
    Ok(Json(json!({ "success": true, "balance": balance })))
}

// ============================================================================
// Helpers
// ============================================================================

/// Render a pairing payload as a `data:image/svg+xml;base64,...` QR image.
fn qr_data_url(payload: &str) -> Option<String> {
    let code = match QrCode::new(payload.as_bytes()) {
        Ok(code) => code,
        Err(e) => {
            warn!(error = %e, "pairing code does not fit a QR image");
            return None;
        }
    };
    let image = code
        .render::<svg::Color<'_>>()
        .min_dimensions(256, 256)
        .build();
    let encoded = base64::engine::general_purpose::STANDARD.encode(image);
    Some(format!("data:image/svg+xml;base64,{encoded}"))
}
