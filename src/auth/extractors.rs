use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts, Request, State},
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
    middleware::Next,
    response::Response,
};
use tracing::warn;

use super::jwt::TokenKeys;
use crate::error::AuthError;

/// Subject id of the authenticated caller, stored in request extensions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

/// Extracts the token from a `Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Result<&str, AuthError> {
    let header = match header {
        Some(h) if !h.is_empty() => h,
        _ => return Err(AuthError::Authentication("missing header".into())),
    };
    match header.split(' ').collect::<Vec<_>>().as_slice() {
        ["Bearer", token] if !token.is_empty() => Ok(*token),
        _ => Err(AuthError::Authentication("malformed header".into())),
    }
}

/// Resolves the `Authorization` header to a subject id.
pub fn authorize(headers: &HeaderMap, keys: &TokenKeys) -> Result<AuthUser, AuthError> {
    let header = match headers.get(AUTHORIZATION) {
        None => None,
        Some(v) => Some(
            v.to_str()
                .map_err(|_| AuthError::Authentication("malformed header".into()))?,
        ),
    };
    let token = bearer_token(header)?;
    let claims = keys.verify(token).map_err(|e| {
        warn!(error = %e, "invalid or expired token");
        AuthError::Authentication("invalid or expired token".into())
    })?;
    Ok(AuthUser(claims.sub))
}

/// Guards a route: rejects unauthenticated requests and attaches [`AuthUser`]
/// for downstream handlers.
pub async fn require_auth(
    State(keys): State<TokenKeys>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let user = authorize(request.headers(), &keys)?;
    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    TokenKeys: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(user) = parts.extensions.get::<AuthUser>() {
            return Ok(user.clone());
        }
        let keys = TokenKeys::from_ref(state);
        let user = authorize(&parts.headers, &keys)?;
        parts.extensions.insert(user.clone());
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::issue;
    use axum::http::Request as HttpRequest;

    const SECRET: &str = "guard-secret";

    fn parts_with(header: Option<&str>) -> Parts {
        let mut builder = HttpRequest::builder().uri("/auth/profile");
        if let Some(h) = header {
            builder = builder.header(AUTHORIZATION, h);
        }
        builder.body(()).unwrap().into_parts().0
    }

    fn auth_msg(e: AuthError) -> String {
        match e {
            AuthError::Authentication(m) => m,
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn bearer_token_shapes() {
        assert_eq!(bearer_token(Some("Bearer abc")).unwrap(), "abc");
        assert_eq!(auth_msg(bearer_token(None).unwrap_err()), "missing header");
        assert_eq!(auth_msg(bearer_token(Some("")).unwrap_err()), "missing header");
        for bad in ["Bearer", "Bearer ", "bearer abc", "Basic abc", "Bearer a b", "Bearer  abc"] {
            assert_eq!(auth_msg(bearer_token(Some(bad)).unwrap_err()), "malformed header", "{bad}");
        }
    }

    #[test]
    fn authorize_resolves_subject() {
        let keys = TokenKeys::new(SECRET, 60);
        let token = issue("user-1", SECRET, 60).unwrap();
        let parts = parts_with(Some(&format!("Bearer {token}")));
        assert_eq!(authorize(&parts.headers, &keys).unwrap(), AuthUser("user-1".into()));
    }

    #[test]
    fn authorize_rejects_foreign_tokens() {
        let keys = TokenKeys::new(SECRET, 60);
        let token = issue("user-1", "other-secret", 60).unwrap();
        let parts = parts_with(Some(&format!("Bearer {token}")));
        assert_eq!(
            auth_msg(authorize(&parts.headers, &keys).unwrap_err()),
            "invalid or expired token"
        );
    }

    #[tokio::test]
    async fn extractor_prefers_the_guard_result() {
        let state = crate::state::AppState::fake();
        let mut parts = parts_with(None);
        parts.extensions.insert(AuthUser("from-guard".into()));
        let user = AuthUser::from_request_parts(&mut parts, &state).await.unwrap();
        assert_eq!(user.0, "from-guard");

        let mut parts = parts_with(None);
        let err = AuthUser::from_request_parts(&mut parts, &state).await.unwrap_err();
        assert_eq!(auth_msg(err), "missing header");
    }
}
