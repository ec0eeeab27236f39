use crate::auth::AuthContext;
use crate::domains::permission::{GlobalPermission, PermissionAction, SurveyResource};
use crate::errors::{DbError, DomainResult};
use async_trait::async_trait;
use sqlx::SqlitePool;

/// Answers permission questions before destructive or cross-table operations.
#[async_trait]
pub trait PermissionService: Send + Sync {
    async fn has_global_permission(
        &self,
        auth: &AuthContext,
        permission: GlobalPermission,
        action: PermissionAction,
    ) -> DomainResult<bool>;

    async fn has_survey_permission(
        &self,
        auth: &AuthContext,
        survey_id: i64,
        resource: SurveyResource,
        action: PermissionAction,
    ) -> DomainResult<bool>;

    /// Superadmin role, or a user holding the global `superadmin` read flag.
    async fn is_superadmin(&self, auth: &AuthContext) -> DomainResult<bool> {
        if auth.is_superadmin() {
            return Ok(true);
        }
        self.has_global_permission(auth, GlobalPermission::Superadmin, PermissionAction::Read).await
    }
}

/// SQLite implementation over the `permissions` table
pub struct SqlitePermissionService {
    pool: SqlitePool,
}

impl SqlitePermissionService {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn has_flag(
        &self,
        entity: &str,
        entity_id: i64,
        uid: i64,
        permission: &str,
        action: PermissionAction,
    ) -> DomainResult<bool> {
        let sql = format!(
            "SELECT COUNT(*) FROM permissions WHERE entity = ? AND entity_id = ? AND uid = ? AND permission = ? AND {} = 1",
            action.column()
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(entity)
            .bind(entity_id)
            .bind(uid)
            .bind(permission)
            .fetch_one(&self.pool)
            .await
            .map_err(DbError::from)?;
        Ok(count > 0)
    }

    /// Upsert a permission row with the given flags switched on.
    pub async fn grant(
        &self,
        uid: i64,
        entity: &str,
        entity_id: i64,
        permission: &str,
        actions: &[PermissionAction],
    ) -> DomainResult<()> {
        let flag = |a: PermissionAction| actions.contains(&a) as i64;
        sqlx::query(
            "INSERT INTO permissions (entity, entity_id, uid, permission, create_p, read_p, update_p, delete_p)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (entity, entity_id, uid, permission) DO UPDATE SET
                create_p = excluded.create_p,
                read_p = excluded.read_p,
                update_p = excluded.update_p,
                delete_p = excluded.delete_p"
        )
        .bind(entity)
        .bind(entity_id)
        .bind(uid)
        .bind(permission)
        .bind(flag(PermissionAction::Create))
        .bind(flag(PermissionAction::Read))
        .bind(flag(PermissionAction::Update))
        .bind(flag(PermissionAction::Delete))
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}

#[async_trait]
impl PermissionService for SqlitePermissionService {
    async fn has_global_permission(
        &self,
        auth: &AuthContext,
        permission: GlobalPermission,
        action: PermissionAction,
    ) -> DomainResult<bool> {
        if auth.is_superadmin() {
            return Ok(true);
        }
        self.has_flag("global", 0, auth.user_id, permission.as_str(), action).await
    }

    async fn has_survey_permission(
        &self,
        auth: &AuthContext,
        survey_id: i64,
        resource: SurveyResource,
        action: PermissionAction,
    ) -> DomainResult<bool> {
        if self.is_superadmin(auth).await? {
            return Ok(true);
        }
        self.has_flag("survey", survey_id, auth.user_id, resource.as_str(), action).await
    }
}
