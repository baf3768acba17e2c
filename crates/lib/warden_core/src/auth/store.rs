//! Persistence contracts for credentials and the refresh-token version chain.
//!
//! PostgreSQL implementations live in [`super::queries`]; the in-memory ones
//! here follow the same rules and back tests and the development server.

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),

    /// A uniqueness rule was violated.
    #[error("Conflict: {0}")]
    Conflict(String),
}

/// One issued refresh token.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct VersionChainEntry {
    pub jti: Uuid,
    pub parent_id: Option<Uuid>,
    pub user_id: Uuid,
    pub version: i32,
}

/// A stored login credential.
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct StoredCredential {
    pub user_id: Uuid,
    pub username: String,
    pub password_digest: String,
}

/// Ledger of refresh tokens used for reuse detection.
///
/// For each user the row with the highest version is the only valid refresh
/// token. A parent can be rotated at most once: a second child for the same
/// parent fails with [`StoreError::Conflict`].
#[async_trait]
pub trait VersionChainStore: Send + Sync {
    /// Replace the user's whole chain with a single version 1 row.
    async fn begin_family(&self, jti: Uuid, user_id: Uuid) -> Result<VersionChainEntry, StoreError>;

    /// Insert a row whose version is `version(parent) + 1`, or 1 when the
    /// parent is absent or not given.
    async fn insert(
        &self,
        jti: Uuid,
        parent_id: Option<Uuid>,
        user_id: Uuid,
    ) -> Result<VersionChainEntry, StoreError>;

    /// Owner of `jti`, only if `jti` is its owner's maximum version.
    async fn find_current_owner(&self, jti: Uuid) -> Result<Option<Uuid>, StoreError>;

    /// Delete a single row.
    async fn delete_entry(&self, jti: Uuid) -> Result<(), StoreError>;

    /// Delete every row for `user_id`, returning how many were removed.
    async fn delete_family(&self, user_id: Uuid) -> Result<u64, StoreError>;

    /// Delete every row belonging to whoever owns `jti`.
    async fn delete_family_of(&self, jti: Uuid) -> Result<u64, StoreError>;
}

/// Username/digest storage.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// Store a new credential and return the generated user id.
    async fn create(&self, username: &str, password_digest: &str) -> Result<Uuid, StoreError>;

    async fn find_by_username(&self, username: &str)
    -> Result<Option<StoredCredential>, StoreError>;
}

/// In-memory [`VersionChainStore`].
#[derive(Debug, Default)]
pub struct MemoryVersionChainStore {
    rows: Mutex<HashMap<Uuid, VersionChainEntry>>,
}

impl MemoryVersionChainStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of a user's rows ordered by version.
    pub async fn family(&self, user_id: Uuid) -> Vec<VersionChainEntry> {
        let rows = self.rows.lock().await;
        let mut family: Vec<_> = rows
            .values()
            .filter(|row| row.user_id == user_id)
            .cloned()
            .collect();
        family.sort_by_key(|row| row.version);
        family
    }
}

fn insert_row(
    rows: &mut HashMap<Uuid, VersionChainEntry>,
    jti: Uuid,
    parent_id: Option<Uuid>,
    user_id: Uuid,
) -> Result<VersionChainEntry, StoreError> {
    if rows.contains_key(&jti) {
        return Err(StoreError::Conflict(format!("jti {jti} already recorded")));
    }
    if let Some(parent) = parent_id
        && rows.values().any(|row| row.parent_id == Some(parent))
    {
        return Err(StoreError::Conflict(format!("parent {parent} already rotated")));
    }

    let parent = parent_id.and_then(|p| rows.get(&p));
    let entry = VersionChainEntry {
        jti,
        parent_id: parent.map(|p| p.jti),
        user_id,
        version: parent.map_or(1, |p| p.version + 1),
    };
    rows.insert(jti, entry.clone());
    Ok(entry)
}

fn remove_family(rows: &mut HashMap<Uuid, VersionChainEntry>, user_id: Uuid) -> u64 {
    let before = rows.len();
    rows.retain(|_, row| row.user_id != user_id);
    (before - rows.len()) as u64
}

#[async_trait]
impl VersionChainStore for MemoryVersionChainStore {
    async fn begin_family(
        &self,
        jti: Uuid,
        user_id: Uuid,
    ) -> Result<VersionChainEntry, StoreError> {
        let mut rows = self.rows.lock().await;
        remove_family(&mut rows, user_id);
        insert_row(&mut rows, jti, None, user_id)
    }

    async fn insert(
        &self,
        jti: Uuid,
        parent_id: Option<Uuid>,
        user_id: Uuid,
    ) -> Result<VersionChainEntry, StoreError> {
        let mut rows = self.rows.lock().await;
        insert_row(&mut rows, jti, parent_id, user_id)
    }

    async fn find_current_owner(&self, jti: Uuid) -> Result<Option<Uuid>, StoreError> {
        let rows = self.rows.lock().await;
        let Some(row) = rows.get(&jti) else {
            return Ok(None);
        };
        let max = rows
            .values()
            .filter(|other| other.user_id == row.user_id)
            .map(|other| other.version)
            .max()
            .unwrap_or(row.version);
        Ok((row.version == max).then_some(row.user_id))
    }

    async fn delete_entry(&self, jti: Uuid) -> Result<(), StoreError> {
        let mut rows = self.rows.lock().await;
        rows.remove(&jti);
        for row in rows.values_mut() {
            if row.parent_id == Some(jti) {
                row.parent_id = None;
            }
        }
        Ok(())
    }

    async fn delete_family(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        Ok(remove_family(&mut rows, user_id))
    }

    async fn delete_family_of(&self, jti: Uuid) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        match rows.get(&jti).map(|row| row.user_id) {
            Some(user_id) => Ok(remove_family(&mut rows, user_id)),
            None => Ok(0),
        }
    }
}

/// In-memory [`CredentialStore`].
#[derive(Debug, Default)]
pub struct MemoryCredentialStore {
    by_username: Mutex<HashMap<String, StoredCredential>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn create(&self, username: &str, password_digest: &str) -> Result<Uuid, StoreError> {
        let mut by_username = self.by_username.lock().await;
        if by_username.contains_key(username) {
            return Err(StoreError::Conflict(format!("username {username:?} is taken")));
        }
        let user_id = Uuid::now_v7();
        by_username.insert(
            username.to_string(),
            StoredCredential {
                user_id,
                username: username.to_string(),
                password_digest: password_digest.to_string(),
            },
        );
        Ok(user_id)
    }

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<StoredCredential>, StoreError> {
        Ok(self.by_username.lock().await.get(username).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn first_row_is_version_one() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let entry = store.insert(Uuid::new_v4(), None, user).await.unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.parent_id, None);
    }

    #[tokio::test]
    async fn child_increments_parent_version() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let first = store.insert(Uuid::new_v4(), None, user).await.unwrap();
        let second = store
            .insert(Uuid::new_v4(), Some(first.jti), user)
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_eq!(second.parent_id, Some(first.jti));
    }

    #[tokio::test]
    async fn orphaned_parent_falls_back_to_version_one() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let entry = store
            .insert(Uuid::new_v4(), Some(Uuid::new_v4()), user)
            .await
            .unwrap();
        assert_eq!(entry.version, 1);
        assert_eq!(entry.parent_id, None);
    }

    #[tokio::test]
    async fn parent_can_only_be_rotated_once() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let first = store.insert(Uuid::new_v4(), None, user).await.unwrap();
        store
            .insert(Uuid::new_v4(), Some(first.jti), user)
            .await
            .unwrap();
        let err = store
            .insert(Uuid::new_v4(), Some(first.jti), user)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn only_the_maximum_version_has_a_current_owner() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let first = store.insert(Uuid::new_v4(), None, user).await.unwrap();
        assert_eq!(store.find_current_owner(first.jti).await.unwrap(), Some(user));

        let second = store
            .insert(Uuid::new_v4(), Some(first.jti), user)
            .await
            .unwrap();
        assert_eq!(store.find_current_owner(first.jti).await.unwrap(), None);
        assert_eq!(store.find_current_owner(second.jti).await.unwrap(), Some(user));
        assert_eq!(store.find_current_owner(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn begin_family_supersedes_previous_chain() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let old = store.insert(Uuid::new_v4(), None, user).await.unwrap();
        let fresh = store.begin_family(Uuid::new_v4(), user).await.unwrap();
        assert_eq!(fresh.version, 1);
        assert_eq!(store.family(user).await, vec![fresh]);
        assert_eq!(store.find_current_owner(old.jti).await.unwrap(), None);
    }

    #[tokio::test]
    async fn family_deletion_is_scoped_to_one_user() {
        let store = MemoryVersionChainStore::new();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let a1 = store.insert(Uuid::new_v4(), None, alice).await.unwrap();
        store.insert(Uuid::new_v4(), Some(a1.jti), alice).await.unwrap();
        let b1 = store.insert(Uuid::new_v4(), None, bob).await.unwrap();

        assert_eq!(store.delete_family_of(a1.jti).await.unwrap(), 2);
        assert!(store.family(alice).await.is_empty());
        assert_eq!(store.family(bob).await, vec![b1.clone()]);

        assert_eq!(store.delete_family(bob).await.unwrap(), 1);
        assert_eq!(store.delete_family_of(b1.jti).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleting_an_entry_orphans_its_child() {
        let store = MemoryVersionChainStore::new();
        let user = Uuid::new_v4();
        let first = store.insert(Uuid::new_v4(), None, user).await.unwrap();
        let second = store
            .insert(Uuid::new_v4(), Some(first.jti), user)
            .await
            .unwrap();
        store.delete_entry(first.jti).await.unwrap();
        let family = store.family(user).await;
        assert_eq!(family.len(), 1);
        assert_eq!(family[0].jti, second.jti);
        assert_eq!(family[0].parent_id, None);
    }

    #[tokio::test]
    async fn usernames_are_unique() {
        let store = MemoryCredentialStore::new();
        let id = store.create("alice", "digest").await.unwrap();
        let err = store.create("alice", "other").await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        let found = store.find_by_username("alice").await.unwrap().unwrap();
        assert_eq!(found.user_id, id);
        assert_eq!(found.password_digest, "digest");
        assert!(store.find_by_username("bob").await.unwrap().is_none());
    }
}
