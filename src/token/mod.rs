//! Token Service: short-lived, job-scoped bearer tokens that gate WebSocket
//! streaming without the socket having to re-present the API key on every
//! reconnect. Modeled on the worker auth middleware's bearer-token check,
//! but HMAC-signed and self-describing instead of looked up in a shared map.

use std::time::{SystemTime, UNIX_EPOCH};

use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const TOKEN_TTL_SECS: u64 = 86_400;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token encoding failed: {0}")]
    Encode(String),

    #[error("token is malformed or signature is invalid")]
    Invalid,

    #[error("token has expired")]
    Expired,

    #[error("token is scoped to a different job")]
    JobMismatch,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: u64,
    /// Per-token id; stays stable across the token's lifetime, unlike a
    /// per-connection id, so a post-auth rate limit can key off it.
    pub jti: String,
    pub scope: String,
    pub job_id: Uuid,
}

/// Issues and verifies job-scoped stream tokens with a single shared HMAC
/// secret (the process's configured `JWT_KEY`).
pub struct TokenService {
    secret: Vec<u8>,
}

impl TokenService {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Signs a token scoped to `job_id`. The caller is responsible for
    /// having already authenticated `api_key` against the admission
    /// gateway — this only mints the envelope.
    pub fn issue(&self, job_id: Uuid) -> Result<String, TokenError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        let claims = Claims {
            sub: "api_client".to_string(),
            exp: now + TOKEN_TTL_SECS,
            jti: format!("{job_id}_{now}"),
            scope: format!("job:{job_id}:read"),
            job_id,
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(&self.secret),
        )
        .map_err(|e| TokenError::Encode(e.to_string()))
    }

    /// Verifies the token's signature and expiry, then checks it was issued
    /// for `expected_job_id`. A token scoped to job A must never authorize a
    /// stream connection to job B, even if both tokens are otherwise valid.
    pub fn verify(&self, token: &str, expected_job_id: Uuid) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.required_spec_claims.clear();

        let data = decode::<Claims>(token, &DecodingKey::from_secret(&self.secret), &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => TokenError::Expired,
                _ => TokenError::Invalid,
            })?;

        if data.claims.job_id != expected_job_id {
            return Err(TokenError::JobMismatch);
        }

        Ok(data.claims)
    }
}
