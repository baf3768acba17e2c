//! Single-use refresh tokens with family invalidation on replay.
//!
//! Every refresh token has a row in the version chain. Rotating the current
//! (maximum version) token appends a child row; presenting anything else
//! deletes the owner's whole chain and forces a new login.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::AuthError;
use super::jwt::{TokenIssuer, rejected};
use super::store::{StoreError, VersionChainEntry, VersionChainStore};

/// Access and refresh token issued together.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
    /// Version of the refresh token in its chain.
    pub version: i32,
}

/// Orchestrates the token issuer and the version-chain store.
#[derive(Clone)]
pub struct TokenRotation {
    issuer: TokenIssuer,
    chain: Arc<dyn VersionChainStore>,
}

impl TokenRotation {
    pub fn new(issuer: TokenIssuer, chain: Arc<dyn VersionChainStore>) -> Self {
        Self { issuer, chain }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    /// Start a fresh chain for `user_id`, superseding any previous one.
    pub async fn issue_tokens(&self, user_id: Uuid) -> Result<TokenPair, AuthError> {
        let entry = self.chain.begin_family(Uuid::new_v4(), user_id).await?;
        info!(%user_id, "issued new token family");
        self.sign_pair(&entry).await
    }

    /// Exchange the current refresh token for a new pair.
    ///
    /// A token that verifies but is not its owner's current version is a
    /// replay: the owner's chain is deleted and [`AuthError::ReuseDetected`]
    /// is returned.
    pub async fn rotate(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.issuer.verify_refresh(refresh_token)?;
        let jti = Uuid::parse_str(&claims.jti)
            .map_err(|e| rejected(format!("jti is not a uuid: {e}")))?;

        let Some(user_id) = self.chain.find_current_owner(jti).await? else {
            return self.reject_reuse(jti).await;
        };

        let entry = match self.chain.insert(Uuid::new_v4(), Some(jti), user_id).await {
            Ok(entry) => entry,
            // Lost a race against another rotation of the same parent.
            Err(StoreError::Conflict(_)) => return self.reject_reuse(jti).await,
            Err(e) => return Err(e.into()),
        };
        debug!(%user_id, version = entry.version, "rotated refresh token");
        self.sign_pair(&entry).await
    }

    /// Delete every refresh token of `user_id`.
    pub async fn invalidate(&self, user_id: Uuid) -> Result<u64, AuthError> {
        let removed = self.chain.delete_family(user_id).await?;
        info!(%user_id, removed, "token family invalidated");
        Ok(removed)
    }

    /// Subject of a valid access token.
    pub fn verify_access_token(&self, token: &str) -> Result<Uuid, AuthError> {
        let claims = self.issuer.verify_access(token)?;
        Uuid::parse_str(&claims.sub)
            .map_err(|e| rejected(format!("sub is not a uuid: {e}")))
    }

    /// Invalidation must succeed; its failure is returned instead of the
    /// reuse error.
    async fn reject_reuse(&self, jti: Uuid) -> Result<TokenPair, AuthError> {
        let removed = self.chain.delete_family_of(jti).await?;
        warn!(%jti, removed, "refresh token reuse detected");
        Err(AuthError::ReuseDetected)
    }

    async fn sign_pair(&self, entry: &VersionChainEntry) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let signed = self
            .issuer
            .issue(&self.issuer.access_claims(entry.user_id, now))
            .and_then(|access| {
                let refresh = self.issuer.issue(&self.issuer.refresh_claims(entry.jti, now))?;
                Ok((access, refresh))
            });

        match signed {
            Ok((access_token, refresh_token)) => Ok(TokenPair {
                access_token,
                refresh_token,
                expires_in: self.issuer.keys().access_token_ttl().as_secs(),
                version: entry.version,
            }),
            Err(e) => {
                if let Err(cleanup) = self.chain.delete_entry(entry.jti).await {
                    warn!(
                        jti = %entry.jti,
                        error = %cleanup,
                        "failed to remove abandoned refresh token row"
                    );
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::auth::jwt::{AccessClaims, RefreshClaims};
    use crate::auth::keys::test_support::{hmac_provider, mismatched_provider};
    use crate::auth::store::MemoryVersionChainStore;

    fn rotation() -> (TokenRotation, Arc<MemoryVersionChainStore>) {
        let store = Arc::new(MemoryVersionChainStore::new());
        let issuer = TokenIssuer::new(Arc::new(hmac_provider()));
        (TokenRotation::new(issuer, store.clone()), store)
    }

    #[tokio::test]
    async fn login_starts_at_version_one() {
        let (rotation, store) = rotation();
        let user = Uuid::new_v4();
        let pair = rotation.issue_tokens(user).await.unwrap();
        assert_eq!(pair.version, 1);
        assert_eq!(pair.expires_in, 300);
        assert_eq!(rotation.verify_access_token(&pair.access_token).unwrap(), user);

        let family = store.family(user).await;
        assert_eq!(family.len(), 1);
        assert_eq!(family[0].parent_id, None);
    }

    #[tokio::test]
    async fn nth_rotation_has_version_n() {
        let (rotation, store) = rotation();
        let user = Uuid::new_v4();
        let mut pair = rotation.issue_tokens(user).await.unwrap();
        for expected in 2..=10 {
            pair = rotation.rotate(&pair.refresh_token).await.unwrap();
            assert_eq!(pair.version, expected);
            assert_eq!(rotation.verify_access_token(&pair.access_token).unwrap(), user);
        }
        assert_eq!(store.family(user).await.len(), 10);
    }

    #[tokio::test]
    async fn replay_invalidates_the_whole_family() {
        let (rotation, store) = rotation();
        let user = Uuid::new_v4();

        let first = rotation.issue_tokens(user).await.unwrap();
        assert_eq!(first.version, 1);

        let second = rotation.rotate(&first.refresh_token).await.unwrap();
        assert_eq!(second.version, 2);

        let replay = rotation.rotate(&first.refresh_token).await.unwrap_err();
        assert!(matches!(replay, AuthError::ReuseDetected));
        assert!(store.family(user).await.is_empty());

        let after = rotation.rotate(&second.refresh_token).await.unwrap_err();
        assert!(matches!(after, AuthError::ReuseDetected));
    }

    #[tokio::test]
    async fn second_login_supersedes_first() {
        let (rotation, store) = rotation();
        let user = Uuid::new_v4();
        let stale = rotation.issue_tokens(user).await.unwrap();
        let fresh = rotation.issue_tokens(user).await.unwrap();
        assert_eq!(fresh.version, 1);
        assert_eq!(store.family(user).await.len(), 1);

        assert!(matches!(
            rotation.rotate(&stale.refresh_token).await,
            Err(AuthError::ReuseDetected)
        ));
    }

    #[tokio::test]
    async fn reuse_of_one_user_leaves_others_alone() {
        let (rotation, store) = rotation();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a = rotation.issue_tokens(alice).await.unwrap();
        let b = rotation.issue_tokens(bob).await.unwrap();

        rotation.rotate(&a.refresh_token).await.unwrap();
        assert!(rotation.rotate(&a.refresh_token).await.is_err());

        assert_eq!(store.family(bob).await.len(), 1);
        assert_eq!(rotation.rotate(&b.refresh_token).await.unwrap().version, 2);
    }

    #[tokio::test]
    async fn concurrent_rotations_of_one_token_do_not_both_succeed() {
        let (rotation, store) = rotation();
        let user = Uuid::new_v4();
        let pair = rotation.issue_tokens(user).await.unwrap();

        let (left, right) = tokio::join!(
            rotation.rotate(&pair.refresh_token),
            rotation.rotate(&pair.refresh_token)
        );
        let successes = [&left, &right].iter().filter(|r| r.is_ok()).count();
        assert!(successes <= 1);
        assert!(
            [&left, &right]
                .iter()
                .any(|r| matches!(r, Err(AuthError::ReuseDetected)))
        );
        assert!(store.family(user).await.is_empty());
    }

    #[tokio::test]
    async fn invalidate_removes_every_row() {
        let (rotation, store) = rotation();
        let user = Uuid::new_v4();
        let pair = rotation.issue_tokens(user).await.unwrap();
        let pair = rotation.rotate(&pair.refresh_token).await.unwrap();

        assert_eq!(rotation.invalidate(user).await.unwrap(), 2);
        assert!(store.family(user).await.is_empty());
        assert!(rotation.rotate(&pair.refresh_token).await.is_err());
    }

    #[tokio::test]
    async fn access_token_cannot_be_rotated() {
        let (rotation, _) = rotation();
        let pair = rotation.issue_tokens(Uuid::new_v4()).await.unwrap();
        let err = rotation.rotate(&pair.access_token).await.unwrap_err();
        assert!(matches!(err, AuthError::VerificationError(_)));
    }

    #[tokio::test]
    async fn unknown_jti_is_treated_as_reuse() {
        let (rotation, _) = rotation();
        let issuer = rotation.issuer();
        let token = issuer
            .issue(&issuer.refresh_claims(Uuid::new_v4(), Utc::now()))
            .unwrap();
        assert!(matches!(
            rotation.rotate(&token).await,
            Err(AuthError::ReuseDetected)
        ));
    }

    #[tokio::test]
    async fn refresh_token_with_malformed_jti_is_a_verification_error() {
        let (rotation, _) = rotation();
        let issuer = rotation.issuer();
        let token = issuer
            .issue(&RefreshClaims {
                jti: "not-a-uuid".into(),
                ..issuer.refresh_claims(Uuid::new_v4(), Utc::now())
            })
            .unwrap();
        let err = rotation.rotate(&token).await.unwrap_err();
        assert!(matches!(err, AuthError::VerificationError(_)));
        assert_eq!(err.to_string(), "Token verification failed");
    }

    #[test]
    fn access_token_with_malformed_subject_is_a_verification_error() {
        let (rotation, _) = rotation();
        let issuer = rotation.issuer();
        let token = issuer
            .issue(&AccessClaims {
                sub: "not-a-uuid".into(),
                ..issuer.access_claims(Uuid::new_v4(), Utc::now())
            })
            .unwrap();
        assert!(matches!(
            rotation.verify_access_token(&token),
            Err(AuthError::VerificationError(_))
        ));
    }

    #[tokio::test]
    async fn signing_failure_removes_the_new_row() {
        let store = Arc::new(MemoryVersionChainStore::new());
        let issuer = TokenIssuer::new(Arc::new(mismatched_provider()));
        let rotation = TokenRotation::new(issuer, store.clone());
        let user = Uuid::new_v4();

        let err = rotation.issue_tokens(user).await.unwrap_err();
        assert!(matches!(err, AuthError::Internal(_)));
        assert!(store.family(user).await.is_empty());
    }

    /// Version chain whose family deletions always fail.
    struct BrokenInvalidation(MemoryVersionChainStore);

    #[async_trait]
    impl VersionChainStore for BrokenInvalidation {
        async fn begin_family(
            &self,
            jti: Uuid,
            user_id: Uuid,
        ) -> Result<VersionChainEntry, StoreError> {
            self.0.begin_family(jti, user_id).await
        }

        async fn insert(
            &self,
            jti: Uuid,
            parent_id: Option<Uuid>,
            user_id: Uuid,
        ) -> Result<VersionChainEntry, StoreError> {
            self.0.insert(jti, parent_id, user_id).await
        }

        async fn find_current_owner(&self, jti: Uuid) -> Result<Option<Uuid>, StoreError> {
            self.0.find_current_owner(jti).await
        }

        async fn delete_entry(&self, jti: Uuid) -> Result<(), StoreError> {
            self.0.delete_entry(jti).await
        }

        async fn delete_family(&self, _user_id: Uuid) -> Result<u64, StoreError> {
            Err(StoreError::Db(sqlx::Error::PoolClosed))
        }

        async fn delete_family_of(&self, _jti: Uuid) -> Result<u64, StoreError> {
            Err(StoreError::Db(sqlx::Error::PoolClosed))
        }
    }

    #[tokio::test]
    async fn failed_invalidation_is_reported() {
        let store = Arc::new(BrokenInvalidation(MemoryVersionChainStore::new()));
        let rotation = TokenRotation::new(TokenIssuer::new(Arc::new(hmac_provider())), store);
        let first = rotation.issue_tokens(Uuid::new_v4()).await.unwrap();
        rotation.rotate(&first.refresh_token).await.unwrap();

        let err = rotation.rotate(&first.refresh_token).await.unwrap_err();
        assert!(matches!(err, AuthError::StoreError(StoreError::Db(_))));
    }
}
