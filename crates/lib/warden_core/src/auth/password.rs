//! Password digests via PBKDF2-HMAC.
//!
//! The salt is the digest of a caller-supplied salt source (the username),
//! hashed with the same configured primitive that drives the HMAC.

use std::fmt;
use std::str::FromStr;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use sha2::Digest;
use subtle::ConstantTimeEq;

use super::AuthError;
use crate::config::HasherSettings;

/// Hash primitive used for both the salt digest and the PBKDF2 HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashPrimitive {
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
    Sha3_224,
    Sha3_256,
    Sha3_384,
    Sha3_512,
}

impl HashPrimitive {
    pub fn name(self) -> &'static str {
        match self {
            HashPrimitive::Sha1 => "SHA1",
            HashPrimitive::Sha224 => "SHA224",
            HashPrimitive::Sha256 => "SHA256",
            HashPrimitive::Sha384 => "SHA384",
            HashPrimitive::Sha512 => "SHA512",
            HashPrimitive::Sha3_224 => "SHA3_224",
            HashPrimitive::Sha3_256 => "SHA3_256",
            HashPrimitive::Sha3_384 => "SHA3_384",
            HashPrimitive::Sha3_512 => "SHA3_512",
        }
    }
}

impl fmt::Display for HashPrimitive {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashPrimitive {
    type Err = String;

    /// Accepts `SHA384`, `sha3_256` and `SHA3-256` spellings.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        match normalized.as_str() {
            "SHA1" => Ok(HashPrimitive::Sha1),
            "SHA224" => Ok(HashPrimitive::Sha224),
            "SHA256" => Ok(HashPrimitive::Sha256),
            "SHA384" => Ok(HashPrimitive::Sha384),
            "SHA512" => Ok(HashPrimitive::Sha512),
            "SHA3_224" => Ok(HashPrimitive::Sha3_224),
            "SHA3_256" => Ok(HashPrimitive::Sha3_256),
            "SHA3_384" => Ok(HashPrimitive::Sha3_384),
            "SHA3_512" => Ok(HashPrimitive::Sha3_512),
            _ => Err(format!("unknown hash method {s:?}")),
        }
    }
}

/// Derives and compares password digests with fixed settings.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    settings: HasherSettings,
}

macro_rules! pbkdf2_with {
    ($digest:ty, $plaintext:expr, $salt_source:expr, $rounds:expr, $out:expr) => {{
        let salt = <$digest as Digest>::digest($salt_source);
        pbkdf2::pbkdf2_hmac::<$digest>($plaintext, &salt, $rounds, $out);
    }};
}

impl PasswordHasher {
    pub fn new(settings: HasherSettings) -> Self {
        Self { settings }
    }

    /// Derive the base64 digest for `plaintext`.
    ///
    /// Deterministic for a given `(plaintext, salt_source)` and settings.
    pub fn derive_digest(&self, plaintext: &str, salt_source: &str) -> String {
        STANDARD.encode(self.derive_raw(plaintext.as_bytes(), salt_source.as_bytes()))
    }

    /// Check `plaintext` against a stored base64 digest in constant time.
    ///
    /// A stored value that is not valid base64 is an error, not a mismatch.
    pub fn compare(
        &self,
        stored: &str,
        plaintext: &str,
        salt_source: &str,
    ) -> Result<bool, AuthError> {
        let expected = STANDARD.decode(stored)?;
        let actual = self.derive_raw(plaintext.as_bytes(), salt_source.as_bytes());
        Ok(bool::from(expected.as_slice().ct_eq(actual.as_slice())))
    }

    fn derive_raw(&self, plaintext: &[u8], salt_source: &[u8]) -> Vec<u8> {
        let rounds = self.settings.iterations;
        let mut out = vec![0u8; self.settings.key_length];
        let buf = out.as_mut_slice();
        match self.settings.primitive {
            HashPrimitive::Sha1 => pbkdf2_with!(sha1::Sha1, plaintext, salt_source, rounds, buf),
            HashPrimitive::Sha224 => {
                pbkdf2_with!(sha2::Sha224, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha256 => {
                pbkdf2_with!(sha2::Sha256, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha384 => {
                pbkdf2_with!(sha2::Sha384, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha512 => {
                pbkdf2_with!(sha2::Sha512, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha3_224 => {
                pbkdf2_with!(sha3::Sha3_224, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha3_256 => {
                pbkdf2_with!(sha3::Sha3_256, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha3_384 => {
                pbkdf2_with!(sha3::Sha3_384, plaintext, salt_source, rounds, buf)
            }
            HashPrimitive::Sha3_512 => {
                pbkdf2_with!(sha3::Sha3_512, plaintext, salt_source, rounds, buf)
            }
        }
        out
    }
}
