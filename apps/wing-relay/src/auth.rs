use std::sync::Arc;

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::identity::{IdentityError, IdentityProvider};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("token not recognised")]
    InvalidToken,
    #[error("identity backend unavailable: {0}")]
    Backend(#[from] IdentityError),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(default)]
    pub iss: Option<String>,
    #[serde(default)]
    pub exp: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Signed,
    Opaque,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub user_id: String,
    pub kind: TokenKind,
}

/// Bearer verification: self-contained signed tokens first, then the
/// database-backed opaque tokens.
#[derive(Clone)]
pub struct AuthContext {
    signed: Option<Arc<(DecodingKey, Validation)>>,
    identity: Arc<dyn IdentityProvider>,
}

impl AuthContext {
    pub fn new(
        jwt_secret: Option<&str>,
        jwt_issuer: Option<&str>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        let signed = jwt_secret.map(|secret| {
            let mut validation = Validation::new(Algorithm::HS256);
            if let Some(issuer) = jwt_issuer {
                validation.set_issuer(&[issuer]);
            }
            Arc::new((DecodingKey::from_secret(secret.as_bytes()), validation))
        });
        Self { signed, identity }
    }

    pub fn identity(&self) -> &Arc<dyn IdentityProvider> {
        &self.identity
    }

    pub async fn verify(&self, token: &str) -> Result<Caller, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }

        if let Some(signed) = &self.signed {
            if looks_like_jwt(token) {
                match decode::<Claims>(token, &signed.0, &signed.1) {
                    Ok(data) => {
                        return Ok(Caller {
                            user_id: data.claims.sub,
                            kind: TokenKind::Signed,
                        })
                    }
                    Err(err) => debug!(error = %err, "signed token rejected; trying opaque lookup"),
                }
            }
        }

        match self.identity.lookup_token(token).await? {
            Some(user_id) => Ok(Caller {
                user_id,
                kind: TokenKind::Opaque,
            }),
            None => Err(AuthError::InvalidToken),
        }
    }
}

fn looks_like_jwt(token: &str) -> bool {
    token.split('.').count() == 3
}
