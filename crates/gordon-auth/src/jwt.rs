//! JWT token generation and validation.
//!
//! `JwtManager` issues and validates tokens carrying `scopes: Vec<String>`,
//! matching the `repository:<repo>:<push|pull|*>` / `admin:*:*` scope
//! model.

use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::AuthError;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject: the authenticated principal's identifier.
    pub sub: String,
    pub scopes: Vec<String>,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_validity: Duration,
}

impl JwtManager {
    pub fn new(secret: &str, token_validity_secs: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_validity: Duration::seconds(token_validity_secs),
        }
    }

    pub fn generate_token(&self, subject: &str, scopes: &[String]) -> Result<String, AuthError> {
        let now = Utc::now();
        let exp = now + self.token_validity;

        let claims = Claims {
            sub: subject.to_string(),
            scopes: scopes.to_vec(),
            exp: exp.timestamp(),
            iat: now.timestamp(),
        };

        debug!(subject, "issuing jwt");
        encode(&Header::default(), &claims, &self.encoding_key).map_err(AuthError::Jwt)
    }

    pub fn validate_token(&self, token: &str) -> Result<Claims, AuthError> {
        let data = decode::<Claims>(token, &self.decoding_key, &Validation::default())?;

        if data.claims.exp < Utc::now().timestamp() {
            return Err(AuthError::TokenExpired);
        }

        Ok(data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_and_validates_a_token() {
        let manager = JwtManager::new("test-secret", 3600);
        let token = manager
            .generate_token("ci-bot", &["repository:app:push".to_string()])
            .unwrap();

        let claims = manager.validate_token(&token).unwrap();
        assert_eq!(claims.sub, "ci-bot");
        assert_eq!(claims.scopes, vec!["repository:app:push".to_string()]);
    }

    #[test]
    fn rejects_garbage_tokens() {
        let manager = JwtManager::new("test-secret", 3600);
        assert!(manager.validate_token("not-a-jwt").is_err());
    }

    #[test]
    fn rejects_expired_tokens() {
        let manager = JwtManager::new("test-secret", -3600);
        let token = manager.generate_token("ci-bot", &[]).unwrap();
        assert!(manager.validate_token(&token).is_err());
    }
}
