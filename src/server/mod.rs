//! HTTP surface built on axum.
//!
//! Routes:
//! - `GET /health` (public)
//! - `GET|POST /webhooks/cloud` (public, signature-checked)
//! - `/v1/{kind}/{user_id}/...` (bearer token, when configured)

mod auth;
mod error;
mod handlers;
mod sse;
mod webhook;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::middleware;
use axum::routing::{get, patch, post};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::credentials::PlatformCredentials;
use crate::router::Router;

pub use self::auth::ApiAuth;
pub use self::error::ApiError;
pub use self::webhook::{sign as sign_webhook, signature_matches, SIGNATURE_HEADER};

/// Shared state for request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The unified router; also the way to the store, events and sessions.
    pub router: Arc<Router>,
    /// Webhook verification secrets.
    pub platform: Arc<PlatformCredentials>,
    /// `/v1` bearer token.
    pub auth: ApiAuth,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("platform", &self.platform)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

/// Build the full route table.
pub fn build_router(state: AppState) -> axum::Router {
    let api = axum::Router::new()
        .route(
            "/v1/{kind}/{user_id}/integration",
            get(handlers::get_integration).put(handlers::put_integration),
        )
        .route(
            "/v1/{kind}/{user_id}/session",
            post(handlers::start_session).delete(handlers::stop_session),
        )
        .route(
            "/v1/{kind}/{user_id}/session/pairing-code",
            get(handlers::pairing_code),
        )
        .route("/v1/{kind}/{user_id}/messages", post(handlers::send_message))
        .route(
            "/v1/{kind}/{user_id}/conversations",
            get(handlers::list_conversations),
        )
        .route(
            "/v1/{kind}/{user_id}/conversations/{id}",
            patch(handlers::update_conversation),
        )
        .route(
            "/v1/{kind}/{user_id}/conversations/{id}/messages",
            get(handlers::conversation_messages),
        )
        .route(
            "/v1/{kind}/{user_id}/conversations/{id}/read",
            post(handlers::mark_read),
        )
        .route(
            "/v1/{kind}/{user_id}/contacts/{phone}/block",
            post(handlers::block_contact),
        )
        .route("/v1/{kind}/{user_id}/credits", post(handlers::grant_credits))
        .route("/v1/{kind}/{user_id}/events", get(sse::user_events))
        .route_layer(middleware::from_fn_with_state(
            state.auth.clone(),
            auth::require_bearer,
        ));

    axum::Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/webhooks/cloud",
            get(webhook::verify).post(webhook::receive),
        )
        .merge(api)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `addr` and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
pub async fn serve<F>(addr: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind http server to {addr}"))?;
    info!(addr, "http server listening");

    axum::serve(listener, build_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server error")?;
    Ok(())
}
