pub mod has_permission;
pub mod service;

pub use has_permission::{GlobalPermission, PermissionAction, SurveyResource, UserRole};
pub use service::{PermissionService, SqlitePermissionService};
