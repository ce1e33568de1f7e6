use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts};

use super::api::{ApiError, SharedState};
use super::models::User;

/// The user owning the request's bearer token.
///
/// Rejects with 401 when the header is missing, malformed or the token is
/// unknown. Every handler taking this extractor is scoped to that user.
pub struct CurrentUser(pub User);

fn bearer_token(parts: &Parts) -> Option<String> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ")?.trim();
    (!token.is_empty()).then(|| token.to_string())
}

impl FromRequestParts<SharedState> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &SharedState,
    ) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts).ok_or(ApiError::Unauthorized)?;
        let user = state
            .db
            .call(move |db| db.get_user_by_token(&token))
            .await?
            .ok_or(ApiError::Unauthorized)?;
        Ok(CurrentUser(user))
    }
}
