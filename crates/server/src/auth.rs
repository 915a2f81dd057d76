//! The bearer-token extractor that turns a request's `Authorization`
//! header into a validated [`Principal`], for both REST handlers and the
//! WebSocket upgrade handshake.

use std::ops::Deref;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::TypedHeader;
use axum_extra::headers::{Authorization, authorization::Bearer};
use tmi_common::{AppError, Principal, SigningKeySet, TokenError};

/// The authenticated caller of a request, resolved from its bearer
/// token. A newtype rather than an extractor impl directly on
/// `Principal` — `Principal` and `FromRequestParts` both live outside
/// this crate, so Rust's orphan rule requires a local type at the seam.
pub struct AuthenticatedUser(pub Principal);

impl Deref for AuthenticatedUser {
    type Target = Principal;

    fn deref(&self) -> &Principal {
        &self.0
    }
}

/// Gives a piece of router state a way to hand over the current signing
/// key set. A clone rather than a borrow — the key set is cheap to clone
/// (one active kid plus a handful of retained keys) and a borrow would
/// tie `AuthenticatedUser`'s extraction to holding a lock guard across the
/// call, which doesn't compose with `AsRef`.
pub trait HasSigningKeys {
    fn signing_keys(&self) -> SigningKeySet;
}

impl<T: HasSigningKeys + ?Sized> HasSigningKeys for std::sync::Arc<T> {
    fn signing_keys(&self) -> SigningKeySet {
        (**self).signing_keys()
    }
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: HasSigningKeys + Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let TypedHeader(Authorization(bearer)) =
            TypedHeader::<Authorization<Bearer>>::from_request_parts(parts, state)
                .await
                .map_err(|_| AppError::Unauthenticated)?;

        let claims = state
            .signing_keys()
            .validate(bearer.token())
            .map_err(map_token_error)?;

        Ok(AuthenticatedUser(Principal {
            user_id: claims.sub,
            email: claims.email,
            provider: claims.provider,
            admin: claims.admin,
        }))
    }
}

fn map_token_error(_: TokenError) -> AppError {
    AppError::Unauthenticated
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestState(SigningKeySet);
    impl HasSigningKeys for TestState {
        fn signing_keys(&self) -> SigningKeySet {
            self.0.clone()
        }
    }

    fn state() -> TestState {
        TestState(SigningKeySet::new("tmi", "tmi-clients", "test-secret"))
    }

    #[tokio::test]
    async fn missing_authorization_header_is_unauthenticated() {
        let state = state();
        let request = axum::http::Request::builder().uri("/").body(()).unwrap();
        let (mut parts, _) = request.into_parts();
        let result = AuthenticatedUser::from_request_parts(&mut parts, &state).await;
        assert!(matches!(result, Err(AppError::Unauthenticated)));
    }

    #[tokio::test]
    async fn valid_token_resolves_to_principal() {
        let state = state();
        let user_id = uuid::Uuid::new_v4();
        let token = state
            .0
            .mint(user_id, "a@example.com", "test", false, 900)
            .unwrap();
        let request = axum::http::Request::builder()
            .uri("/")
            .header("authorization", format!("Bearer {token}"))
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        let user = AuthenticatedUser::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(user.user_id, user_id);
        assert_eq!(user.email, "a@example.com");
    }

    #[tokio::test]
    async fn malformed_token_is_unauthenticated() {
        let state = state();
        let request = axum::http::Request::builder()
            .uri("/")
            .header("authorization", "Bearer not-a-jwt")
            .body(())
            .unwrap();
        let (mut parts, _) = request.into_parts();
        let result = AuthenticatedUser::from_request_parts(&mut parts, &state).await;
        assert!(matches!(result, Err(AppError::Unauthenticated)));
    }
}
