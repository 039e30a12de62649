//! JWT issuing and verification.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::ApiError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Account id.
    pub sub: String,
    pub email: String,
    /// `member` or `admin`.
    pub role: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            expiry_hours,
        }
    }

    pub fn create_token(&self, account_id: Uuid, email: &str, role: &str) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = Claims {
            sub: account_id.to_string(),
            email: email.to_string(),
            role: role.to_string(),
            iat: now,
            exp: now + self.expiry_hours * 3600,
        };
        encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| ApiError::Internal(format!("failed to sign token: {e}")))
    }

    pub fn verify_token(&self, token: &str) -> Result<Claims, ApiError> {
        decode::<Claims>(token, &self.decoding_key, &Validation::default())
            .map(|data| data.claims)
            .map_err(|_| ApiError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn round_trips_claims() {
        let manager = JwtManager::new("test-secret", 24);
        let account_id = Uuid::new_v4();
        let token = manager.create_token(account_id, "user@example.com", "member").unwrap();

        let claims = manager.verify_token(&token).unwrap();
        assert_eq!(claims.sub, account_id.to_string());
        assert_eq!(claims.email, "user@example.com");
        assert_eq!(claims.role, "member");
    }

    #[test]
    fn rejects_token_signed_with_other_secret() {
        let manager = JwtManager::new("secret-a", 24);
        let other = JwtManager::new("secret-b", 24);
        let token = manager
            .create_token(Uuid::new_v4(), "user@example.com", "member")
            .unwrap();
        assert!(other.verify_token(&token).is_err());
    }

    #[test]
    fn rejects_garbage_token() {
        let manager = JwtManager::new("test-secret", 24);
        assert!(manager.verify_token("not-a-jwt").is_err());
    }
}
