//! Credential flows: sign-up and login.

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::AuthError;
use super::password::PasswordHasher;
use super::rotation::{TokenPair, TokenRotation};
use super::store::{CredentialStore, StoreError};

const MAX_USERNAME_LEN: usize = 64;
const MIN_PASSWORD_LEN: usize = 8;

/// Salt source for lookups of unknown users, so they cost one derivation.
const DUMMY_SALT_SOURCE: &str = "warden-unknown-user";

/// Entry point for the delivery layer.
#[derive(Clone)]
pub struct AuthService {
    hasher: PasswordHasher,
    credentials: Arc<dyn CredentialStore>,
    rotation: TokenRotation,
}

impl AuthService {
    pub fn new(
        hasher: PasswordHasher,
        credentials: Arc<dyn CredentialStore>,
        rotation: TokenRotation,
    ) -> Self {
        Self {
            hasher,
            credentials,
            rotation,
        }
    }

    pub fn rotation(&self) -> &TokenRotation {
        &self.rotation
    }

    /// Derive the digest that would be stored for `username`/`password`.
    pub async fn hash_credential(
        &self,
        username: &str,
        password: &str,
    ) -> Result<String, AuthError> {
        let hasher = self.hasher.clone();
        let (username, password) = (username.to_string(), password.to_string());
        tokio::task::spawn_blocking(move || hasher.derive_digest(&password, &username))
            .await
            .map_err(|e| AuthError::Internal(format!("digest task: {e}")))
    }

    /// Register a new credential and return its user id.
    pub async fn sign_up(&self, username: &str, password: &str) -> Result<Uuid, AuthError> {
        let username = validate_username(username)?;
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(AuthError::ValidationError(format!(
                "password must be at least {MIN_PASSWORD_LEN} characters"
            )));
        }

        let digest = self.hash_credential(username, password).await?;
        let user_id = self
            .credentials
            .create(username, &digest)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => AuthError::Conflict("username is already taken".into()),
                other => AuthError::StoreError(other),
            })?;
        info!(%user_id, "credential created");
        Ok(user_id)
    }

    /// Check a username/password pair and start a new token family.
    pub async fn login(&self, username: &str, password: &str) -> Result<TokenPair, AuthError> {
        let username = validate_username(username)?;
        let Some(stored) = self.credentials.find_by_username(username).await? else {
            self.hash_credential(DUMMY_SALT_SOURCE, password).await?;
            return Err(AuthError::CredentialError);
        };

        let hasher = self.hasher.clone();
        let (digest, plaintext, salt_source) = (
            stored.password_digest,
            password.to_string(),
            stored.username,
        );
        let matched = tokio::task::spawn_blocking(move || {
            hasher.compare(&digest, &plaintext, &salt_source)
        })
        .await
        .map_err(|e| AuthError::Internal(format!("digest task: {e}")))?;

        match matched {
            Ok(true) => self.rotation.issue_tokens(stored.user_id).await,
            Ok(false) => {
                info!(user_id = %stored.user_id, "login rejected");
                Err(AuthError::CredentialError)
            }
            Err(e) => {
                warn!(
                    user_id = %stored.user_id,
                    error = %e,
                    "stored password digest is unreadable"
                );
                Err(e)
            }
        }
    }
}

fn validate_username(raw: &str) -> Result<&str, AuthError> {
    let username = raw.trim();
    if username.is_empty() {
        return Err(AuthError::ValidationError("username is required".into()));
    }
    if username.chars().count() > MAX_USERNAME_LEN {
        return Err(AuthError::ValidationError(format!(
            "username must be at most {MAX_USERNAME_LEN} characters"
        )));
    }
    Ok(username)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::jwt::TokenIssuer;
    use crate::auth::keys::test_support::hmac_provider;
    use crate::auth::store::{MemoryCredentialStore, MemoryVersionChainStore};
    use crate::config::HasherSettings;

    fn service() -> (AuthService, Arc<MemoryCredentialStore>) {
        let credentials = Arc::new(MemoryCredentialStore::new());
        let rotation = TokenRotation::new(
            TokenIssuer::new(Arc::new(hmac_provider())),
            Arc::new(MemoryVersionChainStore::new()),
        );
        let hasher = PasswordHasher::new(HasherSettings {
            iterations: 1000,
            ..HasherSettings::default()
        });
        (
            AuthService::new(hasher, credentials.clone(), rotation),
            credentials,
        )
    }

    #[tokio::test]
    async fn sign_up_then_login() {
        let (service, credentials) = service();
        let user_id = service.sign_up("alice", "correct horse").await.unwrap();

        let stored = credentials.find_by_username("alice").await.unwrap().unwrap();
        assert_ne!(stored.password_digest, "correct horse");
        assert_eq!(
            stored.password_digest,
            service.hash_credential("alice", "correct horse").await.unwrap()
        );

        let pair = service.login("alice", "correct horse").await.unwrap();
        assert_eq!(pair.version, 1);
        assert_eq!(
            service.rotation().verify_access_token(&pair.access_token).unwrap(),
            user_id
        );
    }

    #[tokio::test]
    async fn wrong_password_and_unknown_user_look_the_same() {
        let (service, _) = service();
        service.sign_up("alice", "correct horse").await.unwrap();

        let wrong = service.login("alice", "battery staple").await.unwrap_err();
        let unknown = service.login("mallory", "correct horse").await.unwrap_err();
        assert!(matches!(wrong, AuthError::CredentialError));
        assert!(matches!(unknown, AuthError::CredentialError));
        assert_eq!(wrong.to_string(), unknown.to_string());
    }

    #[tokio::test]
    async fn duplicate_username_is_a_conflict() {
        let (service, _) = service();
        service.sign_up("alice", "correct horse").await.unwrap();
        let err = service.sign_up("alice", "another password").await.unwrap_err();
        assert!(matches!(err, AuthError::Conflict(_)));
    }

    #[tokio::test]
    async fn input_is_validated() {
        let (service, _) = service();
        assert!(matches!(
            service.sign_up("   ", "correct horse").await,
            Err(AuthError::ValidationError(_))
        ));
        assert!(matches!(
            service.sign_up("alice", "short").await,
            Err(AuthError::ValidationError(_))
        ));
        assert!(matches!(
            service.sign_up(&"x".repeat(65), "correct horse").await,
            Err(AuthError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn corrupt_digest_is_distinct_from_mismatch() {
        let (service, credentials) = service();
        credentials.create("bob", "%%% not base64 %%%").await.unwrap();
        let err = service.login("bob", "whatever-password").await.unwrap_err();
        assert!(matches!(err, AuthError::HashDecodeError(_)));
        assert!(err.is_unauthorized());
    }
}
