//! Bearer token extractors
//!
//! Client routes authenticate with `Authorization: Bearer <token>`; the
//! token resolves to a user and, optionally, the actor it reads as.

use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::{HeaderMap, request::Parts},
};

use crate::AppState;
use crate::data::AccessToken;
use crate::error::AppError;

fn extract_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(ToOwned::to_owned)
}

async fn authenticate_token(token: &str, state: &AppState) -> Result<AccessToken, AppError> {
    state
        .db
        .find_access_token(token)
        .await?
        .ok_or(AppError::Unauthorized)
}

/// Extractor for an authenticated client.
///
/// # Usage
/// ```ignore
/// async fn handler(CurrentUser(token): CurrentUser) -> impl IntoResponse {
///     token.user_id
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CurrentUser(pub AccessToken);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = parts.extensions.get::<AccessToken>().cloned() {
            return Ok(CurrentUser(token));
        }

        let state = AppState::from_ref(state);
        let token = extract_token_from_headers(&parts.headers).ok_or(AppError::Unauthorized)?;
        let access = authenticate_token(&token, &state).await?;
        parts.extensions.insert(access.clone());

        Ok(CurrentUser(access))
    }
}

/// Optional client extractor
///
/// Anonymous readers get `None`; so does a token that does not resolve.
#[derive(Debug, Clone)]
pub struct MaybeUser(pub Option<AccessToken>);

impl MaybeUser {
    /// Actor whose view of collections the request gets.
    pub fn viewer(&self) -> Option<String> {
        self.0.as_ref().and_then(|token| token.actor_id.clone())
    }
}

#[async_trait]
impl<S> FromRequestParts<S> for MaybeUser
where
    AppState: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        if let Some(token) = parts.extensions.get::<AccessToken>().cloned() {
            return Ok(MaybeUser(Some(token)));
        }

        let app_state = AppState::from_ref(state);
        let access = match extract_token_from_headers(&parts.headers) {
            Some(token) => match authenticate_token(&token, &app_state).await {
                Ok(access) => Some(access),
                Err(e) => {
                    tracing::debug!(error = %e, "Ignoring unusable bearer token");
                    None
                }
            },
            None => None,
        };

        if let Some(access) = &access {
            parts.extensions.insert(access.clone());
        }

        Ok(MaybeUser(access))
    }
}
