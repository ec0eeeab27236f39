use serde::{Deserialize, Serialize};

// --- User Role Definition ---

/// Role of the operator driving a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UserRole {
    SuperAdmin,
    Operator,
}

impl UserRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserRole::SuperAdmin => "superadmin",
            UserRole::Operator => "operator",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "superadmin" => Some(UserRole::SuperAdmin),
            "operator" => Some(UserRole::Operator),
            _ => None,
        }
    }
}

// --- Permission Vocabulary ---

/// Platform-wide permission families stored with `entity = 'global'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GlobalPermission {
    Superadmin,
    ParticipantPanel,
    Surveys,
}

impl GlobalPermission {
    pub fn as_str(&self) -> &'static str {
        match self {
            GlobalPermission::Superadmin => "superadmin",
            GlobalPermission::ParticipantPanel => "participantpanel",
            GlobalPermission::Surveys => "surveys",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "superadmin" => Some(GlobalPermission::Superadmin),
            "participantpanel" => Some(GlobalPermission::ParticipantPanel),
            "surveys" => Some(GlobalPermission::Surveys),
            _ => None,
        }
    }
}

/// Per-survey resources stored with `entity = 'survey'`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SurveyResource {
    Tokens,
    Responses,
    SurveySettings,
}

impl SurveyResource {
    pub fn as_str(&self) -> &'static str {
        match self {
            SurveyResource::Tokens => "tokens",
            SurveyResource::Responses => "responses",
            SurveyResource::SurveySettings => "surveysettings",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "tokens" => Some(SurveyResource::Tokens),
            "responses" => Some(SurveyResource::Responses),
            "surveysettings" => Some(SurveyResource::SurveySettings),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PermissionAction {
    Create,
    Read,
    Update,
    Delete,
}

impl PermissionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionAction::Create => "create",
            PermissionAction::Read => "read",
            PermissionAction::Update => "update",
            PermissionAction::Delete => "delete",
        }
    }

    /// Flag column in the `permissions` table. Closed set, safe to splice into SQL.
    pub fn column(&self) -> &'static str {
        match self {
            PermissionAction::Create => "create_p",
            PermissionAction::Read => "read_p",
            PermissionAction::Update => "update_p",
            PermissionAction::Delete => "delete_p",
        }
    }

    pub fn all() -> [PermissionAction; 4] {
        [
            PermissionAction::Create,
            PermissionAction::Read,
            PermissionAction::Update,
            PermissionAction::Delete,
        ]
    }
}
