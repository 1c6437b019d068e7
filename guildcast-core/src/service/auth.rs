//! Caller identity resolution.
//!
//! Session issuance lives in the external account service; this side only
//! validates the HS256 token it minted and resolves the caller's
//! `UserId`. A missing or invalid token is a hard rejection, never a
//! degraded path.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::{models::UserId, Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the user id
    pub sub: String,
    /// Expiry, seconds since the epoch
    pub exp: i64,
}

/// Validates bearer tokens shared with the session-issuing service.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish()
    }
}

impl TokenService {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Validate a token and resolve the caller's identity
    pub fn validate(&self, token: &str) -> Result<UserId> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map_err(|e| Error::Authentication(format!("Invalid token: {e}")))?;

        if data.claims.sub.is_empty() {
            return Err(Error::Authentication("Token missing subject".to_string()));
        }

        Ok(UserId::from_string(data.claims.sub))
    }

    /// Mint a token for a user. The production issuer is the external
    /// account service; this exists for local development and tests.
    pub fn issue(&self, user_id: &UserId, ttl: chrono::Duration) -> Result<String> {
        let claims = Claims {
            sub: user_id.as_str().to_string(),
            exp: (chrono::Utc::now() + ttl).timestamp(),
        };

        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let service = TokenService::new("test-secret");
        let user_id = UserId::new();

        let token = service
            .issue(&user_id, chrono::Duration::minutes(5))
            .unwrap();
        let resolved = service.validate(&token).unwrap();

        assert_eq!(resolved, user_id);
    }

    #[test]
    fn test_rejects_garbage() {
        let service = TokenService::new("test-secret");
        assert!(service.validate("not-a-token").is_err());
    }

    #[test]
    fn test_rejects_wrong_secret() {
        let issuer = TokenService::new("secret-a");
        let validator = TokenService::new("secret-b");

        let token = issuer
            .issue(&UserId::new(), chrono::Duration::minutes(5))
            .unwrap();
        assert!(validator.validate(&token).is_err());
    }

    #[test]
    fn test_rejects_expired() {
        let service = TokenService::new("test-secret");
        let token = service
            .issue(&UserId::new(), chrono::Duration::seconds(-120))
            .unwrap();
        assert!(service.validate(&token).is_err());
    }
}
