//! Role model - named bundles of granted permissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Role entity. The label is unique; permissions attach via
/// [`RoleGrant`](crate::models::RoleGrant) rows, members via the
/// `user_roles` association.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub role_id: Uuid,
    pub role_label: String,
    pub created_utc: DateTime<Utc>,
}

impl Role {
    pub fn new(role_label: String) -> Self {
        Self {
            role_id: Uuid::new_v4(),
            role_label,
            created_utc: Utc::now(),
        }
    }
}
