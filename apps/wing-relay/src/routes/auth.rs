use axum::{
    async_trait,
    extract::{FromRequestParts, Query},
    http::request::Parts,
};
use serde::Deserialize;

use crate::{auth::Caller, state::AppState};

use super::{bearer_token, ApiError};

/// An authenticated end user. Browsers that cannot set headers on an
/// `EventSource` may pass `?token=` instead.
#[derive(Clone, Debug)]
pub struct AuthUser(pub Caller);

#[derive(Debug, Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .or_else(|| {
                Query::<TokenQuery>::try_from_uri(&parts.uri)
                    .ok()
                    .and_then(|Query(query)| query.token)
            })
            .ok_or(ApiError::Unauthorized)?;
        let caller = state.auth.verify(&token).await?;
        Ok(AuthUser(caller))
    }
}

impl AuthUser {
    pub fn user_id(&self) -> &str {
        &self.0.user_id
    }
}
