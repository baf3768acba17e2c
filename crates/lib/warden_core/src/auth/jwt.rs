//! JWT token issuance and verification.
//!
//! Access tokens carry `sub`, refresh tokens carry `jti`. Both claim sets
//! reject unknown fields, so a token can only pass the verification path it
//! was issued for.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::{Validation, decode, decode_header, encode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::AuthError;
use super::keys::KeyProvider;

/// Tolerated clock skew on `exp` and `nbf`, in seconds.
pub const CLOCK_SKEW_LEEWAY_SECS: u64 = 180;

/// Claims of a short-lived access token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccessClaims {
    pub iss: String,
    pub sub: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Claims of a refresh token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefreshClaims {
    pub iss: String,
    pub jti: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

/// Signs and verifies tokens with one pinned algorithm and issuer.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    keys: Arc<KeyProvider>,
}

impl TokenIssuer {
    pub fn new(keys: Arc<KeyProvider>) -> Self {
        Self { keys }
    }

    pub fn keys(&self) -> &KeyProvider {
        &self.keys
    }

    pub fn access_claims(&self, subject: Uuid, now: DateTime<Utc>) -> AccessClaims {
        let (iat, exp) = window(now, self.keys.access_token_ttl());
        AccessClaims {
            iss: self.keys.issuer().to_string(),
            sub: subject.to_string(),
            iat,
            nbf: iat,
            exp,
        }
    }

    pub fn refresh_claims(&self, jti: Uuid, now: DateTime<Utc>) -> RefreshClaims {
        let (iat, exp) = window(now, self.keys.refresh_token_ttl());
        RefreshClaims {
            iss: self.keys.issuer().to_string(),
            jti: jti.to_string(),
            iat,
            nbf: iat,
            exp,
        }
    }

    /// Sign `claims` into a compact token.
    pub fn issue<C: Serialize>(&self, claims: &C) -> Result<String, AuthError> {
        let header = jsonwebtoken::Header::new(self.keys.algorithm());
        encode(&header, claims, self.keys.encoding_key())
            .map_err(|e| AuthError::Internal(format!("jwt encode: {e}")))
    }

    pub fn verify_access(&self, token: &str) -> Result<AccessClaims, AuthError> {
        self.verify(token, &["exp", "nbf", "iss", "sub"])
    }

    pub fn verify_refresh(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        self.verify(token, &["exp", "nbf", "iss"])
    }

    fn verify<C: DeserializeOwned>(&self, token: &str, required: &[&str]) -> Result<C, AuthError> {
        let expected = self.keys.algorithm();
        let header =
            decode_header(token).map_err(|e| rejected(format!("malformed header: {e}")))?;
        if header.alg != expected {
            return Err(rejected(format!(
                "signing method {:?} does not match configured {expected:?}",
                header.alg
            )));
        }

        let mut validation = Validation::new(expected);
        validation.leeway = CLOCK_SKEW_LEEWAY_SECS;
        validation.validate_nbf = true;
        validation.validate_aud = false;
        validation.set_issuer(&[self.keys.issuer()]);
        validation.set_required_spec_claims(required);

        decode::<C>(token, self.keys.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| rejected(e.to_string()))
    }
}

fn window(now: DateTime<Utc>, ttl: std::time::Duration) -> (i64, i64) {
    let iat = now.timestamp();
    let ttl_secs = i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX);
    (iat, iat.saturating_add(ttl_secs))
}

/// Log `detail` and wrap it in the opaque verification error.
pub(crate) fn rejected(detail: String) -> AuthError {
    debug!(reason = %detail, "token rejected");
    AuthError::VerificationError(detail)
}
