use crate::db_migration;
use crate::domains::cpdb::service::CpdbServices;
use crate::domains::settings::CpdbSettings;
use crate::errors::{ServiceError, ServiceResult};
use lazy_static::lazy_static;
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

// Global state definitions
lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref INITIALIZED: AtomicBool = AtomicBool::new(false);

    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref SERVICES: Mutex<Option<Arc<CpdbServices>>> = Mutex::new(None);
}

pub fn get_db_pool() -> ServiceResult<SqlitePool> {
    DB_POOL.lock()
        .map_err(|_| ServiceError::ServiceUnavailable("DB_POOL lock poisoned".to_string()))?
        .clone()
        .ok_or_else(|| ServiceError::ServiceUnavailable("Database pool not initialized".to_string()))
}

pub fn get_services() -> ServiceResult<Arc<CpdbServices>> {
    SERVICES.lock()
        .map_err(|_| ServiceError::ServiceUnavailable("SERVICES lock poisoned".to_string()))?
        .clone()
        .ok_or_else(|| ServiceError::ServiceUnavailable("Services not initialized".to_string()))
}

/// Initialize global services once; later calls return the bundle built by the first.
pub async fn initialize(db_url: &str) -> ServiceResult<Arc<CpdbServices>> {
    let _guard = INIT_MUTEX.lock().await;

    if INITIALIZED.load(Ordering::Acquire) {
        return get_services();
    }

    let result = initialize_internal(db_url).await;

    if result.is_ok() {
        INITIALIZED.store(true, Ordering::Release);
    }

    result
}

async fn initialize_internal(db_url: &str) -> ServiceResult<Arc<CpdbServices>> {
    // Initialize logging first
    if std::env::var("RUST_LOG").is_err() {
        #[cfg(debug_assertions)]
        std::env::set_var("RUST_LOG", "debug");
        #[cfg(not(debug_assertions))]
        std::env::set_var("RUST_LOG", "info");
    }

    let _ = env_logger::try_init();

    log::info!("Starting internal initialization");
    log::debug!("Database URL: {}", db_url);

    let settings = CpdbSettings::from_env()?;
    log::debug!("Loaded settings: {:?}", settings);

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect(db_url)
        .await
        .map_err(|e| {
            log::error!("Database connection failed: {}", e);
            ServiceError::Configuration(format!("Database connection failed: {}", e))
        })?;

    *DB_POOL.lock()
        .map_err(|_| ServiceError::ServiceUnavailable("DB_POOL lock poisoned".to_string()))? = Some(pool.clone());

    db_migration::initialize_database(&pool).await?;

    let services = Arc::new(CpdbServices::new(pool, settings));
    *SERVICES.lock()
        .map_err(|_| ServiceError::ServiceUnavailable("SERVICES lock poisoned".to_string()))? = Some(services.clone());

    log::info!("Initialization complete");
    Ok(services)
}
