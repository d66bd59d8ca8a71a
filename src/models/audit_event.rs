//! Audit event model - structured activity logging.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Audit event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    UserRegistered,
    UserLogin,
    LoginFailed,
    TwoFactorChallenged,
    TwoFactorVerified,
    TwoFactorRejected,
    TokenRefreshed,
    TokenRejected,
    UserLogout,
    SessionsRevoked,
    PermissionGranted,
    PermissionRevoked,
    PermissionDeactivated,
    RoleAssigned,
    RoleUnassigned,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::UserRegistered => "user_registered",
            AuditEventType::UserLogin => "user_login",
            AuditEventType::LoginFailed => "login_failed",
            AuditEventType::TwoFactorChallenged => "two_factor_challenged",
            AuditEventType::TwoFactorVerified => "two_factor_verified",
            AuditEventType::TwoFactorRejected => "two_factor_rejected",
            AuditEventType::TokenRefreshed => "token_refreshed",
            AuditEventType::TokenRejected => "token_rejected",
            AuditEventType::UserLogout => "user_logout",
            AuditEventType::SessionsRevoked => "sessions_revoked",
            AuditEventType::PermissionGranted => "permission_granted",
            AuditEventType::PermissionRevoked => "permission_revoked",
            AuditEventType::PermissionDeactivated => "permission_deactivated",
            AuditEventType::RoleAssigned => "role_assigned",
            AuditEventType::RoleUnassigned => "role_unassigned",
        }
    }
}

/// Audit event entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub actor_user_id: Option<Uuid>,
    pub event_type_code: String,
    pub event_data: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}

impl AuditEvent {
    /// Event attributed to a user.
    pub fn user_action(
        actor_user_id: Uuid,
        event_type: AuditEventType,
        event_data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            actor_user_id: Some(actor_user_id),
            event_type_code: event_type.as_str().to_string(),
            event_data,
            created_utc: Utc::now(),
        }
    }

    /// Event with no attributable actor (e.g. a failed login for an
    /// unknown identifier).
    pub fn system_action(
        event_type: AuditEventType,
        event_data: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            actor_user_id: None,
            event_type_code: event_type.as_str().to_string(),
            event_data,
            created_utc: Utc::now(),
        }
    }
}
