//! User model - identities with role memberships and two-factor state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// User lifecycle states. Users are never hard-deleted; the `Deleted`
/// state excludes them from every lookup path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserState {
    Active,
    Deleted,
}

impl UserState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserState::Active => "active",
            UserState::Deleted => "deleted",
        }
    }

    pub fn parse(code: &str) -> Option<Self> {
        match code {
            "active" => Some(UserState::Active),
            "deleted" => Some(UserState::Deleted),
            _ => None,
        }
    }
}

/// User entity.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub two_factor_enabled: bool,
    /// SHA-256 hash of the pending two-factor code, if one was issued.
    /// At most one code is pending per user; issuing a new one overwrites it.
    #[serde(skip_serializing)]
    pub two_factor_code_hash: Option<String>,
    pub two_factor_expiry_utc: Option<DateTime<Utc>>,
    pub last_login_utc: Option<DateTime<Utc>>,
    pub user_state_code: String,
    pub created_utc: DateTime<Utc>,
}

impl User {
    pub fn new(username: String, email: String, password_hash: String) -> Self {
        Self {
            user_id: Uuid::new_v4(),
            username,
            email,
            password_hash,
            two_factor_enabled: false,
            two_factor_code_hash: None,
            two_factor_expiry_utc: None,
            last_login_utc: None,
            user_state_code: UserState::Active.as_str().to_string(),
            created_utc: Utc::now(),
        }
    }

    pub fn is_deleted(&self) -> bool {
        UserState::parse(&self.user_state_code) == Some(UserState::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_is_active() {
        let user = User::new(
            "jsmith".to_string(),
            "jsmith@example.com".to_string(),
            "$argon2id$hash".to_string(),
        );
        assert!(!user.is_deleted());
        assert!(!user.two_factor_enabled);
        assert!(user.two_factor_code_hash.is_none());
        assert!(user.last_login_utc.is_none());
    }

    #[test]
    fn test_state_round_trip() {
        assert_eq!(UserState::parse("active"), Some(UserState::Active));
        assert_eq!(UserState::parse("deleted"), Some(UserState::Deleted));
        assert_eq!(UserState::parse("suspended"), None);
    }
}
