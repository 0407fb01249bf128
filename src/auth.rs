//! Signed, expiring session tokens.
//!
//! HS256 JWTs carrying the user id, an optional role and an optional token
//! type (for example `reset` for password-reset links).
//!
//! # Configuration
//!
//! - `JWT_SECRET`: Required. At least 32 characters.
//! - `JWT_EXPIRES_IN_SECS`: Optional. Token lifetime, default 7 days.

use crate::config::EnvSource;
use crate::{Error, Result};
use chrono::Utc;
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation, decode, encode,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Minimum secret key length.
const MIN_SECRET_LENGTH: usize = 32;

/// Minimum distinct characters in a secret.
const MIN_UNIQUE_CHARS: usize = 8;

/// Default token lifetime.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Signing secret variable.
pub const ENV_JWT_SECRET: &str = "JWT_SECRET";
/// Token lifetime variable, in seconds.
pub const ENV_JWT_TTL_SECS: &str = "JWT_EXPIRES_IN_SECS";

/// Token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id.
    pub id: i64,
    /// Role, e.g. `admin`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    /// Token purpose.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
    /// Issued at (Unix seconds).
    pub iat: u64,
    /// Expires at (Unix seconds).
    pub exp: u64,
}

/// Issues and verifies tokens.
#[derive(Clone)]
pub struct TokenService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
    ttl: Duration,
}

impl fmt::Debug for TokenService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenService")
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenService {
    /// Creates a service signing with `secret`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the secret is too short or too uniform.
    pub fn new(secret: &SecretString, ttl: Duration) -> Result<Self> {
        let raw = secret.expose_secret();
        if raw.len() < MIN_SECRET_LENGTH {
            return Err(Error::InvalidInput(format!(
                "JWT secret must be at least {MIN_SECRET_LENGTH} characters (got {})",
                raw.len()
            )));
        }
        let unique: std::collections::HashSet<char> = raw.chars().collect();
        if unique.len() < MIN_UNIQUE_CHARS {
            return Err(Error::InvalidInput(format!(
                "JWT secret has insufficient entropy: only {} unique characters",
                unique.len()
            )));
        }

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.leeway = 0;
        validation.required_spec_claims = ["exp".to_string()].into_iter().collect();

        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(raw.as_bytes())),
            decoding_key: Arc::new(DecodingKey::from_secret(raw.as_bytes())),
            validation,
            ttl,
        })
    }

    /// Creates a service from `JWT_SECRET` and `JWT_EXPIRES_IN_SECS`.
    ///
    /// # Errors
    ///
    /// Returns an error if the secret is missing or rejected.
    pub fn from_env(env: &EnvSource) -> Result<Self> {
        let secret = env
            .get(ENV_JWT_SECRET)
            .ok_or_else(|| Error::operation("jwt_config", format!("{ENV_JWT_SECRET} is not set")))?;
        let ttl = env
            .get(ENV_JWT_TTL_SECS)
            .and_then(|s| s.trim().parse().ok())
            .map_or(DEFAULT_TOKEN_TTL, Duration::from_secs);
        Self::new(&SecretString::from(secret), ttl)
    }

    /// Issues a token for user `id`.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue(&self, id: i64, role: Option<&str>, token_type: Option<&str>) -> Result<String> {
        let iat = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
        let claims = TokenClaims {
            id,
            role: role.map(String::from),
            token_type: token_type.map(String::from),
            iat,
            exp: iat.saturating_add(self.ttl.as_secs()),
        };
        self.sign(&claims)
    }

    /// Signs explicit claims.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn sign(&self, claims: &TokenClaims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| Error::operation("jwt_sign", e))
    }

    /// Verifies a token and returns its claims.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the token is malformed, expired or
    /// signed with another key.
    pub fn verify(&self, token: &str) -> Result<TokenClaims> {
        let data: TokenData<TokenClaims> = decode(token, &self.decoding_key, &self.validation)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                Error::Unauthorized(format!("invalid token: {e}"))
            })?;
        Ok(data.claims)
    }

    /// Verifies a `Bearer <token>` header value.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Unauthorized`] if the header is malformed or the token is rejected.
    pub fn verify_header(&self, header: &str) -> Result<TokenClaims> {
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| Error::Unauthorized("invalid Authorization header format".to_string()))?;
        self.verify(token.trim())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "library-desk-signing-key-0123456789";

    fn service() -> TokenService {
        TokenService::new(&SecretString::from(SECRET.to_string()), DEFAULT_TOKEN_TTL)
            .expect("service")
    }

    #[test]
    fn test_issue_then_verify() {
        let service = service();
        let token = service.issue(7, Some("admin"), None).expect("issue");
        let claims = service.verify(&token).expect("verify");

        assert_eq!(claims.id, 7);
        assert_eq!(claims.role.as_deref(), Some("admin"));
        assert!(claims.token_type.is_none());
        assert_eq!(claims.exp - claims.iat, DEFAULT_TOKEN_TTL.as_secs());
    }

    #[test]
    fn test_expired_token_is_unauthorized() {
        let service = service();
        let now = u64::try_from(Utc::now().timestamp()).expect("now");
        let token = service
            .sign(&TokenClaims {
                id: 1,
                role: None,
                token_type: Some("reset".into()),
                iat: now - 7200,
                exp: now - 3600,
            })
            .expect("sign");
        assert!(matches!(service.verify(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_foreign_signature_is_unauthorized() {
        let other = TokenService::new(
            &SecretString::from("a-different-key-for-another-deployment".to_string()),
            DEFAULT_TOKEN_TTL,
        )
        .expect("other");
        let token = other.issue(1, None, None).expect("issue");
        assert!(matches!(service().verify(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_header_parsing() {
        let service = service();
        let token = service.issue(3, None, Some("verify")).expect("issue");
        let claims = service.verify_header(&format!("Bearer {token}")).expect("header");
        assert_eq!(claims.token_type.as_deref(), Some("verify"));
        assert!(matches!(service.verify_header(&token), Err(Error::Unauthorized(_))));
    }

    #[test]
    fn test_weak_secrets_rejected() {
        assert!(TokenService::new(&SecretString::from("short".to_string()), DEFAULT_TOKEN_TTL).is_err());
        assert!(
            TokenService::new(&SecretString::from("a".repeat(40)), DEFAULT_TOKEN_TTL).is_err()
        );
    }

    #[test]
    fn test_from_env() {
        assert!(TokenService::from_env(&EnvSource::empty()).is_err());
        let env = EnvSource::from_pairs([(ENV_JWT_SECRET, SECRET), (ENV_JWT_TTL_SECS, "60")]);
        let service = TokenService::from_env(&env).expect("service");
        let claims = service.verify(&service.issue(1, None, None).expect("issue")).expect("verify");
        assert_eq!(claims.exp - claims.iat, 60);
    }
}
