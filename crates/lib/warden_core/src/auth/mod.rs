//! Authentication and token lifecycle logic.
//!
//! Provides signing keys, password digests, JWT issuance/verification, the
//! refresh-token version chain and the rotation protocol built on top of it.

pub mod jwt;
pub mod keys;
pub mod password;
pub mod queries;
pub mod rotation;
pub mod service;
pub mod store;

use thiserror::Error;

pub use store::StoreError;

/// Authentication errors.
///
/// Display strings are safe to show to callers: the detail carried by
/// `VerificationError` is for internal logs only and is never formatted.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid credentials")]
    CredentialError,

    #[error("Token verification failed")]
    VerificationError(String),

    #[error("Refresh token expired or invalidated")]
    ReuseDetected,

    #[error("Stored password digest is malformed")]
    HashDecodeError(#[from] base64::DecodeError),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Persistence error")]
    StoreError(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AuthError {
    /// True for every failure that must surface as a bare "unauthorized".
    pub fn is_unauthorized(&self) -> bool {
        matches!(
            self,
            AuthError::CredentialError
                | AuthError::VerificationError(_)
                | AuthError::ReuseDetected
                | AuthError::HashDecodeError(_)
        )
    }
}
