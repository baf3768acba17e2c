//! # warden_core
//!
//! Core credential and token lifecycle logic for Warden.
//!
//! Everything here is transport-agnostic: signing keys, password digests,
//! token issuance and verification, the refresh-token version chain and
//! the per-client rate limiter.

pub mod auth;
pub mod config;
pub mod migrate;
pub mod rate_limit;

/// Returns the crate version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_is_not_empty() {
        assert!(!version().is_empty());
    }
}
