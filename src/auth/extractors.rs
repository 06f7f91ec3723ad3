use axum::{async_trait, extract::FromRequestParts, http::request::Parts};

use super::services::AuthError;
use crate::accounts::Account;
use crate::state::AppState;
use crate::tokens::TokenError;

/// Resolves the bearer token to its active account.
pub struct AuthAccount(pub Account);

#[async_trait]
impl FromRequestParts<AppState> for AuthAccount {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let auth = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| TokenError::Malformed("missing Authorization header".into()))?;

        let token = auth
            .strip_prefix("Bearer ")
            .or_else(|| auth.strip_prefix("bearer "))
            .ok_or_else(|| TokenError::Malformed("invalid auth scheme".into()))?;

        let account = state.sessions.authenticate(token.trim()).await?;
        Ok(AuthAccount(account))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(authorization: Option<&str>) -> Parts {
        let mut req = Request::builder().uri("/me");
        if let Some(value) = authorization {
            req = req.header(axum::http::header::AUTHORIZATION, value);
        }
        req.body(()).unwrap().into_parts().0
    }

    #[tokio::test]
    async fn bearer_token_resolves_account() {
        let state = AppState::fake();
        let session = state
            .sessions
            .register("a@x.com", "long-enough")
            .await
            .unwrap();
        let mut parts = parts(Some(&format!("Bearer {}", session.access_token)));
        let AuthAccount(account) = AuthAccount::from_request_parts(&mut parts, &state)
            .await
            .unwrap();
        assert_eq!(account.id, session.account.id);
    }

    #[tokio::test]
    async fn missing_or_foreign_scheme_is_rejected() {
        let state = AppState::fake();
        for header in [None, Some("Basic dXNlcjpwYXNz"), Some("Bearer not.a.jwt")] {
            let mut parts = parts(header);
            let err = AuthAccount::from_request_parts(&mut parts, &state)
                .await
                .err()
                .unwrap();
            assert!(err.is_rejection());
            assert_eq!(err.public_message(), "invalid or expired token");
        }
    }
}
