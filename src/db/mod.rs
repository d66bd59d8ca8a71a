//! Persistence seams. Every method takes a cancellation token; an
//! implementation observing a cancelled token abandons the operation
//! and returns [`ServiceError::Cancelled`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{Permission, PermissionSort, RefreshToken, Role, RoleGrant, User};
use crate::services::ServiceError;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::Database;

/// Roles, permissions, grants and memberships.
#[async_trait]
pub trait PermissionStore: Send + Sync {
    async fn find_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Role>, ServiceError>;

    async fn find_permission_by_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Permission>, ServiceError>;

    async fn list_permissions(
        &self,
        sort: PermissionSort,
        cancel: &CancellationToken,
    ) -> Result<Vec<Permission>, ServiceError>;

    /// Returns whether the flag actually changed.
    async fn set_permission_active(
        &self,
        permission_id: Uuid,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError>;

    /// Names of active permissions granted to the role.
    async fn active_permission_names_for_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ServiceError>;

    /// Role memberships of the user. Empty for unknown and for
    /// soft-deleted users, so a deleted user resolves to no permissions.
    async fn role_ids_for_user(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ServiceError>;

    async fn user_ids_with_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ServiceError>;

    async fn find_grant(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<RoleGrant>, ServiceError>;

    /// Insert grants in one batch; pre-existing rows are left alone.
    async fn insert_grants(
        &self,
        grants: &[RoleGrant],
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    /// Delete (role, permission) grant rows in one batch; returns the
    /// number of rows removed.
    async fn delete_grants(
        &self,
        pairs: &[(Uuid, Uuid)],
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError>;

    async fn insert_membership(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    /// Returns whether a membership row was removed.
    async fn delete_membership(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError>;

    async fn insert_role(
        &self,
        role: &Role,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    async fn insert_permission(
        &self,
        permission: &Permission,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;
}

/// Refresh token records.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_refresh_token(
        &self,
        token: &RefreshToken,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, ServiceError>;

    /// Flip `used_utc` only if it is still unset. Returns whether this
    /// call won the flip.
    async fn mark_refresh_token_used(
        &self,
        token_id: Uuid,
        used_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError>;

    /// Flip `invalidated_utc` only if it is still unset. Returns whether
    /// this call won the flip.
    async fn invalidate_refresh_token(
        &self,
        token_id: Uuid,
        invalidated_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError>;

    /// Invalidate every token for the user that is neither used, already
    /// invalidated, nor expired. Returns the count flipped.
    async fn invalidate_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        invalidated_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError>;

    async fn delete_expired_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError>;
}

/// User records and their two-factor state.
#[async_trait]
pub trait IdentityStore: Send + Sync {
    async fn find_user_by_id(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<User>, ServiceError>;

    /// Look up by username or email, case-insensitive. Deleted users are
    /// never returned.
    async fn find_user_by_identifier(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<User>, ServiceError>;

    async fn insert_user(
        &self,
        user: &User,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    async fn set_pending_two_factor(
        &self,
        user_id: Uuid,
        code_hash: &str,
        expiry_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    async fn clear_pending_two_factor(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    async fn update_last_login(
        &self,
        user_id: Uuid,
        login_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError>;

    /// Flip the user to the deleted state; rows are never removed.
    /// Returns whether a live user was flipped. Callers owning a
    /// [`PermissionCache`](crate::services::PermissionCache) drop the
    /// user's entry afterwards.
    async fn mark_user_deleted(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError>;
}
