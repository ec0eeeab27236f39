//! Shared fixtures for storage tests.

use crate::auth::AuthContext;
use crate::db_migration;
use crate::domains::permission::UserRole;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tempfile::TempDir;

/// Fresh migrated database in a throwaway directory. Keep the `TempDir` alive for the test's duration.
pub async fn test_pool() -> (SqlitePool, TempDir) {
    let dir = TempDir::new().unwrap();
    let options = SqliteConnectOptions::new()
        .filename(dir.path().join("cpdb.sqlite"))
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .unwrap();

    db_migration::initialize_database(&pool).await.unwrap();

    sqlx::query("INSERT INTO users (uid, users_name, full_name, lang) VALUES (1, 'admin', 'Administrator', 'en'), (2, 'operator', 'Survey Operator', 'de'), (3, 'viewer', 'Read Only', 'en')")
        .execute(&pool)
        .await
        .unwrap();

    (pool, dir)
}

pub fn admin() -> AuthContext {
    AuthContext::new(1, UserRole::SuperAdmin, "en")
}

pub fn operator() -> AuthContext {
    AuthContext::new(2, UserRole::Operator, "de")
}

pub fn viewer() -> AuthContext {
    AuthContext::new(3, UserRole::Operator, "en")
}
