use std::sync::Arc;

// Public modules
pub mod auth;
pub mod domains;
pub mod errors;
pub mod globals;
pub mod types;
pub mod validation;

// Private modules
mod db_migration;

#[cfg(test)]
mod test_support;

pub use domains::cpdb::CpdbServices;

/// Initialize the library against the given database URL.
/// This function must be called before any other function in the library.
pub async fn initialize(db_url: &str) -> errors::ServiceResult<Arc<CpdbServices>> {
    globals::initialize(db_url).await
}

/// Get a reference to the SQLite connection pool
/// This is primarily for internal use
pub fn get_db_pool() -> errors::ServiceResult<sqlx::SqlitePool> {
    globals::get_db_pool()
}
