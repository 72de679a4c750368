//! Identity resolution for upgrade requests.

use crate::config::TokenKey;
use crate::error::{GatewayError, Result};
use common::UserId;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Claims carried by access tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(alias = "userId")]
    pub user_id: UserId,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

/// Query string of `GET /ws`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConnectQuery {
    pub token: Option<String>,
    pub user_id: Option<UserId>,
}

/// Verifies signed access tokens.
pub struct TokenVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    /// HS256 with a shared secret.
    pub fn hs256(secret: &[u8]) -> Self {
        Self {
            key: DecodingKey::from_secret(secret),
            validation: Validation::new(Algorithm::HS256),
        }
    }

    /// RS256 with a PEM-encoded public key.
    pub fn rs256_pem(pem: &[u8]) -> Result<Self> {
        let key = DecodingKey::from_rsa_pem(pem)
            .map_err(|e| GatewayError::Config(format!("invalid RS256 public key: {}", e)))?;
        Ok(Self {
            key,
            validation: Validation::new(Algorithm::RS256),
        })
    }

    /// Build a verifier from configuration, reading key files as needed.
    pub fn from_key(token_key: &TokenKey) -> Result<Self> {
        match token_key {
            TokenKey::Secret(secret) => Ok(Self::hs256(secret.as_bytes())),
            TokenKey::PublicKeyPath(path) => {
                let pem = std::fs::read(path).map_err(|e| {
                    GatewayError::Config(format!("cannot read JWT_PUBLIC_KEY_PATH {}: {}", path, e))
                })?;
                Self::rs256_pem(&pem)
            }
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims> {
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|e| GatewayError::Unauthorized(format!("invalid token: {}", e)))?;
        Ok(data.claims)
    }
}

/// Establishes which user an upgrade request belongs to.
pub struct IdentityResolver {
    verifier: Option<TokenVerifier>,
    trust_user_id_param: bool,
}

impl IdentityResolver {
    pub fn new(verifier: Option<TokenVerifier>, trust_user_id_param: bool) -> Self {
        Self {
            verifier,
            trust_user_id_param,
        }
    }

    /// A token wins over `user_id`; `user_id` is only honored when trusted.
    pub fn resolve(&self, query: &ConnectQuery) -> Result<UserId> {
        if let Some(token) = query.token.as_deref().filter(|t| !t.is_empty()) {
            let verifier = self.verifier.as_ref().ok_or_else(|| {
                GatewayError::Unauthorized("token verification is not configured".to_string())
            })?;
            let claims = verifier.verify(token)?;
            debug!("Token verified for user {}", claims.user_id);
            return valid_user_id(claims.user_id);
        }

        match query.user_id {
            Some(user_id) if self.trust_user_id_param => valid_user_id(user_id),
            Some(_) => Err(GatewayError::Unauthorized(
                "user_id parameter is not accepted".to_string(),
            )),
            None => Err(GatewayError::Unauthorized("missing credentials".to_string())),
        }
    }
}

fn valid_user_id(user_id: UserId) -> Result<UserId> {
    if user_id <= 0 {
        return Err(GatewayError::Unauthorized(format!(
            "invalid user id {}",
            user_id
        )));
    }
    Ok(user_id)
}
