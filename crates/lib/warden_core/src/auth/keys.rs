//! Signing algorithm resolution and key material.
//!
//! A [`KeyProvider`] is built once by the composition root and shared
//! read-only afterwards. Building it parses every key and signs a test
//! token, so unusable material is rejected before any request is served.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::{ConfigError, KeyMaterial, SigningSettings};

/// HMAC secrets shorter than this are accepted but logged.
const MIN_RECOMMENDED_SECRET_LEN: usize = 32;

/// Supported signing algorithm families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SigningFamily {
    Hmac,
    Rsa,
    RsaPss,
    Ecdsa,
    EdDsa,
}

impl FromStr for SigningFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HMAC" => Ok(Self::Hmac),
            "RSA" => Ok(Self::Rsa),
            "RSA-PSS" | "RSAPSS" => Ok(Self::RsaPss),
            "ECDSA" => Ok(Self::Ecdsa),
            "EDDSA" => Ok(Self::EdDsa),
            other => Err(format!(
                "unknown signing method {other:?}, expected one of HMAC, RSA, RSA-PSS, ECDSA, EdDSA"
            )),
        }
    }
}

impl fmt::Display for SigningFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Hmac => "HMAC",
            Self::Rsa => "RSA",
            Self::RsaPss => "RSA-PSS",
            Self::Ecdsa => "ECDSA",
            Self::EdDsa => "EdDSA",
        };
        f.write_str(name)
    }
}

impl SigningFamily {
    /// Resolve the concrete JWT algorithm for this family and digest size.
    pub fn algorithm(self, size: Option<u16>) -> Result<Algorithm, ConfigError> {
        if self == Self::EdDsa {
            return Ok(Algorithm::EdDSA);
        }
        let size = size.ok_or(ConfigError::Missing("SIGN_SIZE"))?;
        let alg = match (self, size) {
            (Self::Hmac, 256) => Algorithm::HS256,
            (Self::Hmac, 384) => Algorithm::HS384,
            (Self::Hmac, 512) => Algorithm::HS512,
            (Self::Rsa, 256) => Algorithm::RS256,
            (Self::Rsa, 384) => Algorithm::RS384,
            (Self::Rsa, 512) => Algorithm::RS512,
            (Self::RsaPss, 256) => Algorithm::PS256,
            (Self::RsaPss, 384) => Algorithm::PS384,
            (Self::RsaPss, 512) => Algorithm::PS512,
            (Self::Ecdsa, 256) => Algorithm::ES256,
            (Self::Ecdsa, 384) => Algorithm::ES384,
            (family, size) => {
                return Err(ConfigError::Unsupported(format!(
                    "{family} with size {size} is not available"
                )));
            }
        };
        Ok(alg)
    }

    /// The family a concrete algorithm belongs to.
    pub fn of(alg: Algorithm) -> Self {
        match alg {
            Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Self::Hmac,
            Algorithm::RS256 | Algorithm::RS384 | Algorithm::RS512 => Self::Rsa,
            Algorithm::PS256 | Algorithm::PS384 | Algorithm::PS512 => Self::RsaPss,
            Algorithm::ES256 | Algorithm::ES384 => Self::Ecdsa,
            Algorithm::EdDSA => Self::EdDsa,
        }
    }
}

/// Ready-to-use signing and verification keys plus token policy.
pub struct KeyProvider {
    algorithm: Algorithm,
    issuer: String,
    access_token_ttl: Duration,
    refresh_token_ttl: Duration,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl fmt::Debug for KeyProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyProvider")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("access_token_ttl", &self.access_token_ttl)
            .field("refresh_token_ttl", &self.refresh_token_ttl)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct SelfCheckClaims {
    exp: i64,
}

impl KeyProvider {
    /// Parse key material and verify that it can sign and verify a token.
    pub fn from_settings(settings: &SigningSettings) -> Result<Self, ConfigError> {
        let algorithm = settings.family.algorithm(settings.size)?;
        let (encoding_key, decoding_key) = load_keys(settings)?;

        let provider = Self {
            algorithm,
            issuer: settings.issuer.clone(),
            access_token_ttl: settings.access_token_ttl,
            refresh_token_ttl: settings.refresh_token_ttl,
            encoding_key,
            decoding_key,
        };
        provider.self_check()?;

        info!(
            algorithm = ?provider.algorithm,
            issuer = %provider.issuer,
            "signing keys loaded"
        );
        Ok(provider)
    }

    /// Concrete algorithm every token must be signed with.
    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    pub fn family(&self) -> SigningFamily {
        SigningFamily::of(self.algorithm)
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn access_token_ttl(&self) -> Duration {
        self.access_token_ttl
    }

    pub fn refresh_token_ttl(&self) -> Duration {
        self.refresh_token_ttl
    }

    pub fn encoding_key(&self) -> &EncodingKey {
        &self.encoding_key
    }

    pub fn decoding_key(&self) -> &DecodingKey {
        &self.decoding_key
    }

    fn self_check(&self) -> Result<(), ConfigError> {
        let claims = SelfCheckClaims {
            exp: Utc::now().timestamp() + 60,
        };
        let token = encode(&Header::new(self.algorithm), &claims, &self.encoding_key).map_err(
            |e| ConfigError::KeyMaterial(format!("signing with {:?} failed: {e}", self.algorithm)),
        )?;

        let mut validation = Validation::new(self.algorithm);
        validation.validate_aud = false;
        decode::<SelfCheckClaims>(&token, &self.decoding_key, &validation)
            .map_err(|e| ConfigError::KeyMaterial(format!("key pair does not verify: {e}")))?;
        Ok(())
    }
}

fn load_keys(settings: &SigningSettings) -> Result<(EncodingKey, DecodingKey), ConfigError> {
    match settings.family {
        SigningFamily::Hmac => hmac_keys(settings),
        SigningFamily::Rsa | SigningFamily::RsaPss => {
            pem_keys(settings, EncodingKey::from_rsa_pem, DecodingKey::from_rsa_pem)
        }
        SigningFamily::Ecdsa => {
            pem_keys(settings, EncodingKey::from_ec_pem, DecodingKey::from_ec_pem)
        }
        SigningFamily::EdDsa => {
            pem_keys(settings, EncodingKey::from_ed_pem, DecodingKey::from_ed_pem)
        }
    }
}

type PemParser<K> = fn(&[u8]) -> jsonwebtoken::errors::Result<K>;

fn pem_keys(
    settings: &SigningSettings,
    from_private: PemParser<EncodingKey>,
    from_public: PemParser<DecodingKey>,
) -> Result<(EncodingKey, DecodingKey), ConfigError> {
    let private_pem = required_material(settings.private_key.as_ref(), "PRIVATE_KEY")?;
    let public_pem = required_material(settings.public_key.as_ref(), "PUBLIC_KEY")?;
    let parse_failed = |which: &str, e: jsonwebtoken::errors::Error| {
        let family = settings.family;
        ConfigError::KeyMaterial(format!("{family} {which} PEM could not be parsed: {e}"))
    };
    let encoding_key = from_private(&private_pem).map_err(|e| parse_failed("private", e))?;
    let decoding_key = from_public(&public_pem).map_err(|e| parse_failed("public", e))?;
    Ok((encoding_key, decoding_key))
}

/// The same secret signs and verifies.
fn hmac_keys(settings: &SigningSettings) -> Result<(EncodingKey, DecodingKey), ConfigError> {
    let secret = settings
        .secret
        .as_deref()
        .ok_or(ConfigError::Missing("SECRET_KEY"))?;
    if secret.len() < MIN_RECOMMENDED_SECRET_LEN {
        warn!(
            len = secret.len(),
            "HMAC secret is shorter than {MIN_RECOMMENDED_SECRET_LEN} bytes"
        );
    }
    Ok((
        EncodingKey::from_secret(secret.as_bytes()),
        DecodingKey::from_secret(secret.as_bytes()),
    ))
}

fn required_material(
    material: Option<&KeyMaterial>,
    key: &'static str,
) -> Result<Vec<u8>, ConfigError> {
    material.ok_or(ConfigError::Missing(key))?.load()
}
