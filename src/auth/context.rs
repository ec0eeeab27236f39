use crate::types::UserRole;

/// Represents the authentication context for the current operation.
/// Read-only input; the core never mutates it.
#[derive(Debug, Clone)]
pub struct AuthContext {
    /// The ID of the authenticated user
    pub user_id: i64,

    /// The role of the authenticated user
    pub role: UserRole,

    /// Preferred language of the operator, used when naming attributes
    pub language: String,
}

impl AuthContext {
    /// Create a new authentication context
    pub fn new(user_id: i64, role: UserRole, language: &str) -> Self {
        Self {
            user_id,
            role,
            language: language.to_string(),
        }
    }

    pub fn is_superadmin(&self) -> bool {
        matches!(self.role, UserRole::SuperAdmin)
    }
}
