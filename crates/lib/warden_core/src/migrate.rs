//! Embedded schema migrations for the credential and version-chain tables.

use sqlx::PgPool;
use sqlx::migrate::{MigrateError, Migrator};
use tracing::info;

/// Migrations compiled in from `warden_core/migrations/`.
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Bring the schema up to date.
pub async fn migrate(pool: &PgPool) -> Result<(), MigrateError> {
    MIGRATOR.run(pool).await?;
    info!(count = MIGRATOR.iter().count(), "database schema is up to date");
    Ok(())
}
