use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::{
    auth::{jwt::TokenError, password::HashError},
    store::StoreError,
};

/// Errors surfaced by the auth manager and the request guard.
///
/// Messages are stable and low-cardinality; infrastructure details are logged
/// where the error is converted and never carried into a response.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    NotFound(String),

    #[error("store operation timed out")]
    StoreTimeout,

    #[error("store unavailable")]
    StoreUnavailable,

    #[error("{0}")]
    Persistence(String),

    #[error("{0}")]
    Configuration(String),

    #[error("{0}")]
    Hashing(String),
}

impl AuthError {
    pub fn status(&self) -> StatusCode {
        match self {
            AuthError::Validation(_) => StatusCode::BAD_REQUEST,
            AuthError::Conflict(_) => StatusCode::CONFLICT,
            AuthError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AuthError::NotFound(_) => StatusCode::NOT_FOUND,
            AuthError::StoreTimeout
            | AuthError::StoreUnavailable
            | AuthError::Persistence(_)
            | AuthError::Configuration(_)
            | AuthError::Hashing(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<StoreError> for AuthError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Timeout => AuthError::StoreTimeout,
            StoreError::Unavailable(detail) => {
                error!(error = %detail, "store unavailable");
                AuthError::StoreUnavailable
            }
            StoreError::InvalidId(_) => AuthError::Validation("invalid identifier".into()),
            StoreError::NotFound => AuthError::NotFound("record not found".into()),
            StoreError::Conflict => AuthError::Conflict("unique constraint violated".into()),
            StoreError::Unsupported(detail) | StoreError::Persistence(detail) => {
                error!(error = %detail, "store operation failed");
                AuthError::Persistence("persistence failure".into())
            }
        }
    }
}

impl From<HashError> for AuthError {
    fn from(e: HashError) -> Self {
        error!(error = %e, "password hashing failed");
        AuthError::Hashing("failed to hash password".into())
    }
}

impl From<TokenError> for AuthError {
    fn from(e: TokenError) -> Self {
        match e {
            TokenError::Encoding(detail) => {
                error!(error = %detail, "token signing failed");
                AuthError::Hashing("failed to generate token".into())
            }
            _ => AuthError::Authentication("invalid or expired token".into()),
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_the_taxonomy() {
        assert_eq!(AuthError::Validation("x".into()).status(), StatusCode::BAD_REQUEST);
        assert_eq!(AuthError::Conflict("x".into()).status(), StatusCode::CONFLICT);
        assert_eq!(AuthError::Authentication("x".into()).status(), StatusCode::UNAUTHORIZED);
        assert_eq!(AuthError::NotFound("x".into()).status(), StatusCode::NOT_FOUND);
        assert_eq!(AuthError::StoreTimeout.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(AuthError::StoreUnavailable.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn store_details_do_not_leak_into_messages() {
        let err = AuthError::from(StoreError::Persistence("relation \"users\" does not exist".into()));
        assert_eq!(err.to_string(), "persistence failure");
        let err = AuthError::from(StoreError::Unavailable("connection refused".into()));
        assert_eq!(err.to_string(), "store unavailable");
        assert_eq!(AuthError::from(StoreError::Timeout), AuthError::StoreTimeout);
    }

    #[test]
    fn token_failures_collapse_to_one_message() {
        for e in [TokenError::Malformed, TokenError::SignatureInvalid, TokenError::Expired] {
            assert_eq!(
                AuthError::from(e),
                AuthError::Authentication("invalid or expired token".into())
            );
        }
    }
}
