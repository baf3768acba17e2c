//! PostgreSQL-backed stores.

use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use super::store::{
    CredentialStore, StoreError, StoredCredential, VersionChainEntry, VersionChainStore,
};

const UNIQUE_VIOLATION: &str = "23505";

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err
            .code()
            .is_some_and(|code| code.as_ref() == UNIQUE_VIOLATION),
        _ => false,
    }
}

/// Turn a unique violation into [`StoreError::Conflict`].
fn conflict_or_db(err: sqlx::Error, what: &str) -> StoreError {
    if is_unique_violation(&err) {
        StoreError::Conflict(what.to_string())
    } else {
        StoreError::Db(err)
    }
}

/// [`VersionChainStore`] over the `version_chain` table.
#[derive(Debug, Clone)]
pub struct PgVersionChainStore {
    pool: PgPool,
}

impl PgVersionChainStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl VersionChainStore for PgVersionChainStore {
    async fn begin_family(
        &self,
        jti: Uuid,
        user_id: Uuid,
    ) -> Result<VersionChainEntry, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM version_chain WHERE user_id = $1")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
        let entry = sqlx::query_as::<_, VersionChainEntry>(
            "INSERT INTO version_chain (jti, parent_id, user_id, version) \
             VALUES ($1, NULL, $2, 1) \
             RETURNING jti, parent_id, user_id, version",
        )
        .bind(jti)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| conflict_or_db(e, "jti already recorded"))?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn insert(
        &self,
        jti: Uuid,
        parent_id: Option<Uuid>,
        user_id: Uuid,
    ) -> Result<VersionChainEntry, StoreError> {
        let entry = sqlx::query_as::<_, VersionChainEntry>(
            "INSERT INTO version_chain (jti, parent_id, user_id, version) \
             SELECT $1::uuid, parent.jti, $3::uuid, COALESCE(parent.version + 1, 1) \
             FROM (SELECT 1) AS seed \
             LEFT JOIN version_chain parent ON parent.jti = $2::uuid \
             RETURNING jti, parent_id, user_id, version",
        )
        .bind(jti)
        .bind(parent_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or_db(e, "refresh token already rotated"))?;
        Ok(entry)
    }

    async fn find_current_owner(&self, jti: Uuid) -> Result<Option<Uuid>, StoreError> {
        let owner = sqlx::query_scalar::<_, Uuid>(
            "SELECT vc.user_id FROM version_chain vc \
             WHERE vc.jti = $1 \
               AND vc.version = ( \
                 SELECT MAX(latest.version) FROM version_chain latest \
                 WHERE latest.user_id = vc.user_id \
               )",
        )
        .bind(jti)
        .fetch_optional(&self.pool)
        .await?;
        Ok(owner)
    }

    async fn delete_entry(&self, jti: Uuid) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM version_chain WHERE jti = $1")
            .bind(jti)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_family(&self, user_id: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM version_chain WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_family_of(&self, jti: Uuid) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "DELETE FROM version_chain \
             WHERE user_id = (SELECT owner.user_id FROM version_chain owner WHERE owner.jti = $1)",
        )
        .bind(jti)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}

/// [`CredentialStore`] over the `credentials` table.
#[derive(Debug, Clone)]
pub struct PgCredentialStore {
    pool: PgPool,
}

impl PgCredentialStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn create(&self, username: &str, password_digest: &str) -> Result<Uuid, StoreError> {
        let user_id = sqlx::query_scalar::<_, Uuid>(
            "INSERT INTO credentials (username, password_digest) VALUES ($1, $2) RETURNING id",
        )
        .bind(username)
        .bind(password_digest)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| conflict_or_db(e, "username is taken"))?;
        Ok(user_id)
    }

    async fn find_by_username(
        &self,
        username: &str,
    ) -> Result<Option<StoredCredential>, StoreError> {
        let row = sqlx::query_as::<_, StoredCredential>(
            "SELECT id AS user_id, username, password_digest FROM credentials WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }
}
