//! HTTP error mapping.
//!
//! Every failure leaves the API as `{"success": false, "error", "code"}` so
//! callers can tell "needs re-pairing" from "temporarily unavailable" from
//! "out of credits" without parsing prose.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::error;

use crate::router::SendError;
use crate::session::SessionError;
use crate::store::StoreError;
use crate::transport::TransportError;

/// An error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl ApiError {
    /// Build an error with an explicit status and code.
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    /// 400 with code `bad_request`.
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    /// 404 with code `not_found`.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", message)
    }

    /// HTTP status.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Machine-readable kind.
    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "success": false,
            "error": self.message,
            "code": self.code,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<TransportError> for ApiError {
    fn from(e: TransportError) -> Self {
        let status = match &e {
            TransportError::CredentialMissing { .. } => StatusCode::FAILED_DEPENDENCY,
            TransportError::NotConnected | TransportError::LoggedOut => StatusCode::CONFLICT,
            TransportError::CreditExhausted => StatusCode::PAYMENT_REQUIRED,
            TransportError::TransportRejected { .. } => StatusCode::BAD_GATEWAY,
            TransportError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.code(), e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { .. } => Self::not_found(e.to_string()),
            StoreError::InvalidInput(_) => Self::bad_request(e.to_string()),
            StoreError::Database(_) | StoreError::Corrupt(_) => {
                error!(error = %e, "store failure");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal",
                    "internal storage error",
                )
            }
        }
    }
}

impl From<SendError> for ApiError {
    fn from(e: SendError) -> Self {
        let code = e.code();
        match e {
            SendError::Transport(t) => t.into(),
            SendError::Store(s) => s.into(),
            SendError::InvalidRecipient(_) | SendError::EmptyContent => {
                Self::new(StatusCode::BAD_REQUEST, code, e.to_string())
            }
            SendError::NoIntegration(_) => Self::new(StatusCode::NOT_FOUND, code, e.to_string()),
            SendError::IntegrationDisabled(_) => {
                Self::new(StatusCode::CONFLICT, code, e.to_string())
            }
            SendError::ContactBlocked(_) => Self::new(StatusCode::FORBIDDEN, code, e.to_string()),
        }
    }
}

impl From<SessionError> for ApiError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::NotConfigured(_) => {
                Self::new(StatusCode::CONFLICT, "not_configured", e.to_string())
            }
            SessionError::Disabled(_) => {
                Self::new(StatusCode::CONFLICT, "integration_disabled", e.to_string())
            }
            SessionError::Store(s) => s.into(),
        }
    }
}
