//! Error kinds surfaced to clients, over both HTTP and WebSocket frames.
//!
//! Every error that crosses the boundary carries a stable `code`, a human
//! message, and the server timestamp. Internals (SQL text, upstream bodies,
//! stack traces) never leave the process.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::util::now_ms;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("invalid JSON format")]
    InvalidJson,
    #[error("validation error: {0}")]
    Validation(String),
    #[error("rate limit exceeded, slow down")]
    RateLimitExceeded,
    #[error("authentication failed: {0}")]
    AuthFailed(String),
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("session not found")]
    SessionNotFound,
    #[error("session is full")]
    SessionFull,
    #[error("anchor not found")]
    AnchorNotFound,
    #[error("session anchor limit reached")]
    AnchorLimitExceeded,
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
    #[error("persistence failure")]
    Persistence(String),
    #[error("internal error")]
    Internal(String),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidJson => "INVALID_JSON",
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::AuthFailed(_) => "AUTH_FAILED",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::SessionNotFound => "SESSION_NOT_FOUND",
            Self::SessionFull => "SESSION_FULL",
            Self::AnchorNotFound => "ANCHOR_NOT_FOUND",
            Self::AnchorLimitExceeded => "ANCHOR_LIMIT_EXCEEDED",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::Persistence(_) => "PERSISTENCE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidJson | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::RateLimitExceeded => StatusCode::TOO_MANY_REQUESTS,
            Self::AuthFailed(_) => StatusCode::UNAUTHORIZED,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::SessionNotFound | Self::AnchorNotFound => StatusCode::NOT_FOUND,
            Self::SessionFull | Self::AnchorLimitExceeded => StatusCode::CONFLICT,
            Self::UpstreamUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Persistence(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a client. Persistence/internal details stay in
    /// the logs.
    pub fn public_message(&self) -> String {
        match self {
            Self::Persistence(_) => "persistence failure".to_string(),
            Self::Internal(_) => "internal error".to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": true,
            "code": self.code(),
            "message": self.public_message(),
            "timestamp": now_ms(),
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(ApiError::RateLimitExceeded.code(), "RATE_LIMIT_EXCEEDED");
        assert_eq!(ApiError::InvalidJson.code(), "INVALID_JSON");
        assert_eq!(ApiError::SessionFull.code(), "SESSION_FULL");
    }

    #[test]
    fn internal_details_do_not_leak() {
        let err = ApiError::Persistence("connection refused at 10.0.0.3".into());
        assert_eq!(err.public_message(), "persistence failure");
        let err = ApiError::Internal("index out of bounds".into());
        assert_eq!(err.public_message(), "internal error");
    }

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::SessionNotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::UpstreamUnavailable("localization".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            ApiError::AuthFailed("expired".into()).status(),
            StatusCode::UNAUTHORIZED
        );
    }
}
