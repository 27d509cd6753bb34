//! HTTP error responses.

use crate::auth::AuthError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use huddle_core::TokenError;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Errors returned from HTTP handlers.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request is missing something or is not a WebSocket upgrade.
    #[error("{0}")]
    BadRequest(String),

    /// The caller is not authorized.
    #[error("{0}")]
    Forbidden(String),

    /// No such route, method or handle.
    #[error("{0}")]
    NotFound(String),

    /// The router task is not running.
    #[error("{0}")]
    Unavailable(String),
}

impl ApiError {
    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Short machine-readable error name.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::BadRequest(_) => "BadRequest",
            Self::Forbidden(_) => "Forbidden",
            Self::NotFound(_) => "NotFound",
            Self::Unavailable(_) => "Unavailable",
        }
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(ErrorResponse {
            error: self.name(),
            message: self.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<TokenError> for ApiError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Missing => Self::Forbidden("Missing authorization bearer token".into()),
            TokenError::Invalid | TokenError::IdentityMismatch(_) => {
                Self::Forbidden("Token invalid or expired".into())
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingAuthorization => Self::Forbidden("Authorization token required.".into()),
            AuthError::NotBearer => Self::Forbidden("Bearer token required".into()),
            other => {
                debug!(error = %other, "Rejected bearer token");
                Self::Forbidden("Could not validate authorization JWT.".into())
            }
        }
    }
}
