//! Permission and role-grant models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Permission categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionCategory {
    Reports,
    Users,
    Roles,
    Documents,
    System,
}

impl PermissionCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionCategory::Reports => "reports",
            PermissionCategory::Users => "users",
            PermissionCategory::Roles => "roles",
            PermissionCategory::Documents => "documents",
            PermissionCategory::System => "system",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "reports" => Some(PermissionCategory::Reports),
            "users" => Some(PermissionCategory::Users),
            "roles" => Some(PermissionCategory::Roles),
            "documents" => Some(PermissionCategory::Documents),
            "system" => Some(PermissionCategory::System),
            _ => None,
        }
    }
}

/// Sort key for permission listings. An explicit tag rather than a raw
/// string so an unknown key is a parse error, not a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionSort {
    Name,
    Category,
    Created,
}

impl PermissionSort {
    /// The column this sort key orders by.
    pub fn column(&self) -> &'static str {
        match self {
            PermissionSort::Name => "permission_name",
            PermissionSort::Category => "category_code",
            PermissionSort::Created => "created_utc",
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        match key {
            "name" => Some(PermissionSort::Name),
            "category" => Some(PermissionSort::Category),
            "created" => Some(PermissionSort::Created),
            _ => None,
        }
    }
}

/// Permission entity. Deactivation is a flag flip, never row deletion;
/// inactive permissions are excluded from every resolved set even while
/// grant rows still reference them.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Permission {
    pub permission_id: Uuid,
    pub permission_name: String,
    pub category_code: String,
    pub is_active: bool,
    pub created_utc: DateTime<Utc>,
}

impl Permission {
    pub fn new(permission_name: String, category: PermissionCategory) -> Self {
        Self {
            permission_id: Uuid::new_v4(),
            permission_name,
            category_code: category.as_str().to_string(),
            is_active: true,
            created_utc: Utc::now(),
        }
    }

    pub fn category(&self) -> Option<PermissionCategory> {
        PermissionCategory::parse(&self.category_code)
    }
}

/// Role-grant association: at most one row per (role, permission) pair.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RoleGrant {
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub granted_by: Option<Uuid>,
    pub granted_utc: DateTime<Utc>,
}

impl RoleGrant {
    pub fn new(role_id: Uuid, permission_id: Uuid, granted_by: Option<Uuid>) -> Self {
        Self {
            role_id,
            permission_id,
            granted_by,
            granted_utc: Utc::now(),
        }
    }
}
