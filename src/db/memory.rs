//! In-memory store for tests and local development. Mirrors the
//! Postgres semantics, including the monotonic refresh-token flips and
//! the deleted-user exclusion.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::{IdentityStore, PermissionStore, TokenStore};
use crate::models::{
    AuditEvent, Permission, PermissionSort, RefreshToken, Role, RoleGrant, User, UserState,
};
use crate::services::{ActivityLog, ServiceError};

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    memberships: HashSet<(Uuid, Uuid)>,
    grants: HashMap<(Uuid, Uuid), RoleGrant>,
    refresh_tokens: HashMap<Uuid, RefreshToken>,
    events: Vec<AuditEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
    /// Test hook: makes member lookups fail so callers' fallback paths
    /// can be exercised.
    fail_member_lookup: AtomicBool,
}

fn check(cancel: &CancellationToken) -> Result<(), ServiceError> {
    if cancel.is_cancelled() {
        return Err(ServiceError::Cancelled);
    }
    Ok(())
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_user(&self, user: User) {
        self.write().users.insert(user.user_id, user);
    }

    pub fn add_role(&self, role: Role) {
        self.write().roles.insert(role.role_id, role);
    }

    pub fn add_permission(&self, permission: Permission) {
        self.write()
            .permissions
            .insert(permission.permission_id, permission);
    }

    /// Snapshot of the recorded audit events, oldest first.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.read().events.clone()
    }

    pub fn set_fail_member_lookup(&self, fail: bool) {
        self.fail_member_lookup.store(fail, Ordering::SeqCst);
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl PermissionStore for MemoryStore {
    async fn find_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Role>, ServiceError> {
        check(cancel)?;
        Ok(self.read().roles.get(&role_id).cloned())
    }

    async fn find_permission_by_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Permission>, ServiceError> {
        check(cancel)?;
        Ok(self
            .read()
            .permissions
            .values()
            .find(|p| p.permission_name == name)
            .cloned())
    }

    async fn list_permissions(
        &self,
        sort: PermissionSort,
        cancel: &CancellationToken,
    ) -> Result<Vec<Permission>, ServiceError> {
        check(cancel)?;
        let mut permissions: Vec<Permission> = self.read().permissions.values().cloned().collect();
        match sort {
            PermissionSort::Name => permissions.sort_by(|a, b| a.permission_name.cmp(&b.permission_name)),
            PermissionSort::Category => permissions.sort_by(|a, b| a.category_code.cmp(&b.category_code)),
            PermissionSort::Created => permissions.sort_by_key(|p| p.created_utc),
        }
        Ok(permissions)
    }

    async fn set_permission_active(
        &self,
        permission_id: Uuid,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        match inner.permissions.get_mut(&permission_id) {
            Some(permission) if permission.is_active != active => {
                permission.is_active = active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn active_permission_names_for_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ServiceError> {
        check(cancel)?;
        let inner = self.read();
        Ok(inner
            .grants
            .keys()
            .filter(|(r, _)| *r == role_id)
            .filter_map(|(_, permission_id)| inner.permissions.get(permission_id))
            .filter(|p| p.is_active)
            .map(|p| p.permission_name.clone())
            .collect())
    }

    async fn role_ids_for_user(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ServiceError> {
        check(cancel)?;
        let inner = self.read();
        // Deleted users keep their membership rows but resolve to none.
        if !inner.users.get(&user_id).is_some_and(|u| !u.is_deleted()) {
            return Ok(Vec::new());
        }
        Ok(inner
            .memberships
            .iter()
            .filter(|(u, _)| *u == user_id)
            .map(|(_, r)| *r)
            .collect())
    }

    async fn user_ids_with_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ServiceError> {
        check(cancel)?;
        if self.fail_member_lookup.load(Ordering::SeqCst) {
            return Err(ServiceError::Internal(anyhow::anyhow!(
                "member lookup disabled"
            )));
        }
        Ok(self
            .read()
            .memberships
            .iter()
            .filter(|(_, r)| *r == role_id)
            .map(|(u, _)| *u)
            .collect())
    }

    async fn find_grant(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<RoleGrant>, ServiceError> {
        check(cancel)?;
        Ok(self.read().grants.get(&(role_id, permission_id)).cloned())
    }

    async fn insert_grants(
        &self,
        grants: &[RoleGrant],
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        for grant in grants {
            inner
                .grants
                .entry((grant.role_id, grant.permission_id))
                .or_insert_with(|| grant.clone());
        }
        Ok(())
    }

    async fn delete_grants(
        &self,
        pairs: &[(Uuid, Uuid)],
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        let mut removed = 0u64;
        for pair in pairs {
            if inner.grants.remove(pair).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn insert_membership(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        self.write().memberships.insert((user_id, role_id));
        Ok(())
    }

    async fn delete_membership(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        check(cancel)?;
        Ok(self.write().memberships.remove(&(user_id, role_id)))
    }

    async fn insert_role(
        &self,
        role: &Role,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        self.write().roles.insert(role.role_id, role.clone());
        Ok(())
    }

    async fn insert_permission(
        &self,
        permission: &Permission,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        self.write()
            .permissions
            .insert(permission.permission_id, permission.clone());
        Ok(())
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_refresh_token(
        &self,
        token: &RefreshToken,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        self.write()
            .refresh_tokens
            .insert(token.token_id, token.clone());
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        check(cancel)?;
        Ok(self
            .read()
            .refresh_tokens
            .values()
            .find(|t| t.token_hash == token_hash)
            .cloned())
    }

    async fn mark_refresh_token_used(
        &self,
        token_id: Uuid,
        used_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        match inner.refresh_tokens.get_mut(&token_id) {
            Some(token) if token.used_utc.is_none() => {
                token.used_utc = Some(used_utc);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate_refresh_token(
        &self,
        token_id: Uuid,
        invalidated_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        match inner.refresh_tokens.get_mut(&token_id) {
            Some(token) if token.invalidated_utc.is_none() && token.used_utc.is_none() => {
                token.invalidated_utc = Some(invalidated_utc);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn invalidate_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        invalidated_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        let mut flipped = 0u64;
        for token in inner.refresh_tokens.values_mut() {
            if token.user_id == user_id && token.is_valid(invalidated_utc) {
                token.invalidated_utc = Some(invalidated_utc);
                flipped += 1;
            }
        }
        Ok(flipped)
    }

    async fn delete_expired_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        let before = inner.refresh_tokens.len();
        inner.refresh_tokens.retain(|_, t| !t.is_expired(now));
        Ok((before - inner.refresh_tokens.len()) as u64)
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_user_by_id(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<User>, ServiceError> {
        check(cancel)?;
        Ok(self
            .read()
            .users
            .get(&user_id)
            .filter(|u| !u.is_deleted())
            .cloned())
    }

    async fn find_user_by_identifier(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<User>, ServiceError> {
        check(cancel)?;
        let needle = identifier.to_lowercase();
        Ok(self
            .read()
            .users
            .values()
            .find(|u| {
                !u.is_deleted()
                    && (u.username.to_lowercase() == needle || u.email.to_lowercase() == needle)
            })
            .cloned())
    }

    async fn insert_user(
        &self,
        user: &User,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        self.write().users.insert(user.user_id, user.clone());
        Ok(())
    }

    async fn set_pending_two_factor(
        &self,
        user_id: Uuid,
        code_hash: &str,
        expiry_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        if let Some(user) = self.write().users.get_mut(&user_id) {
            user.two_factor_code_hash = Some(code_hash.to_string());
            user.two_factor_expiry_utc = Some(expiry_utc);
        }
        Ok(())
    }

    async fn clear_pending_two_factor(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        if let Some(user) = self.write().users.get_mut(&user_id) {
            user.two_factor_code_hash = None;
            user.two_factor_expiry_utc = None;
        }
        Ok(())
    }

    async fn update_last_login(
        &self,
        user_id: Uuid,
        login_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        check(cancel)?;
        if let Some(user) = self.write().users.get_mut(&user_id) {
            user.last_login_utc = Some(login_utc);
        }
        Ok(())
    }

    async fn mark_user_deleted(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        check(cancel)?;
        let mut inner = self.write();
        match inner.users.get_mut(&user_id) {
            Some(user) if !user.is_deleted() => {
                user.user_state_code = UserState::Deleted.as_str().to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl ActivityLog for MemoryStore {
    async fn append(&self, event: AuditEvent) -> Result<(), ServiceError> {
        self.write().events.push(event);
        Ok(())
    }
}
