//! Bearer token issuance and verification for the admin auth shim (§4.8).

use chrono::Utc;
use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::errors::{Error, Result};

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionClaims {
    pub sub: String,
    pub exp: i64,
    pub iat: i64,
}

impl SessionClaims {
    fn new(config: &Config) -> Self {
        let now = Utc::now();
        let exp = now + chrono::Duration::from_std(config.token_lifetime).unwrap_or(chrono::Duration::hours(24));
        Self { sub: "admin".to_string(), exp: exp.timestamp(), iat: now.timestamp() }
    }
}

pub fn create_session_token(config: &Config) -> Result<String> {
    let claims = SessionClaims::new(config);
    let key = EncodingKey::from_secret(config.token_secret.as_bytes());
    encode(&Header::default(), &claims, &key).map_err(|e| Error::Internal(format!("create token: {e}")))
}

pub fn verify_session_token(token: &str, config: &Config) -> Result<()> {
    let key = DecodingKey::from_secret(config.token_secret.as_bytes());
    decode::<SessionClaims>(token, &key, &Validation::default())
        .map(|_| ())
        .map_err(|e| match e.kind() {
            jsonwebtoken::errors::ErrorKind::InvalidToken
            | jsonwebtoken::errors::ErrorKind::InvalidSignature
            | jsonwebtoken::errors::ErrorKind::ExpiredSignature
            | jsonwebtoken::errors::ErrorKind::InvalidIssuer
            | jsonwebtoken::errors::ErrorKind::Json(_)
            | jsonwebtoken::errors::ErrorKind::Utf8(_) => Error::Unauthenticated,
            _ => Error::Internal(format!("verify token: {e}")),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config() -> Config {
        Config { token_secret: "test-secret".to_string(), ..Default::default() }
    }

    #[test]
    fn create_and_verify_round_trip() {
        let config = config();
        let token = create_session_token(&config).unwrap();
        assert!(verify_session_token(&token, &config).is_ok());
    }

    #[test]
    fn wrong_secret_is_unauthenticated_not_internal() {
        let config = config();
        let token = create_session_token(&config).unwrap();
        let wrong = Config { token_secret: "other-secret".to_string(), ..Default::default() };
        assert!(matches!(verify_session_token(&token, &wrong), Err(Error::Unauthenticated)));
    }

    #[test]
    fn expired_token_is_unauthenticated() {
        let config = Config { token_lifetime: Duration::from_secs(0), ..config() };
        let claims = SessionClaims {
            sub: "admin".to_string(),
            exp: Utc::now().timestamp() - 10,
            iat: Utc::now().timestamp() - 20,
        };
        let key = EncodingKey::from_secret(config.token_secret.as_bytes());
        let token = encode(&Header::default(), &claims, &key).unwrap();
        assert!(matches!(verify_session_token(&token, &config), Err(Error::Unauthenticated)));
    }

    #[test]
    fn malformed_token_is_unauthenticated() {
        let config = config();
        assert!(matches!(verify_session_token("not-a-jwt", &config), Err(Error::Unauthenticated)));
    }
}
