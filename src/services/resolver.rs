//! Permission resolution and grant mutation.
//!
//! Answers "does subject X hold permission Y" through the cache, and
//! routes grant/revoke mutations through the store with cache
//! invalidation completing before the mutating call returns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::PermissionStore;
use crate::models::{AuditEvent, AuditEventType, Permission, PermissionSort, RoleGrant};
use crate::services::{ActivityLog, PermissionCache, ServiceError};

/// Per-item disposition of a bulk mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BulkItemStatus {
    Succeeded,
    /// Already in the desired state.
    Skipped,
    /// Role or permission not found, or the batch commit failed.
    Failed,
}

#[derive(Debug, Serialize)]
pub struct BulkItemOutcome {
    pub role_id: Uuid,
    pub permission: String,
    pub status: BulkItemStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Report of a bulk grant/revoke: one disposition per input pair, in
/// input order. Bulk mutations never fail atomically.
#[derive(Debug, Serialize)]
pub struct BulkReport {
    pub items: Vec<BulkItemOutcome>,
}

impl BulkReport {
    pub fn count(&self, status: BulkItemStatus) -> usize {
        self.items.iter().filter(|i| i.status == status).count()
    }
}

pub struct PermissionResolver {
    store: Arc<dyn PermissionStore>,
    cache: Arc<PermissionCache>,
    audit: Arc<dyn ActivityLog>,
}

impl PermissionResolver {
    pub fn new(
        store: Arc<dyn PermissionStore>,
        cache: Arc<PermissionCache>,
        audit: Arc<dyn ActivityLog>,
    ) -> Self {
        Self { store, cache, audit }
    }

    // ==================== Resolution ====================

    /// Never errors: a missing user, missing permission, or store
    /// failure resolves to `false`.
    pub async fn user_has_permission(
        &self,
        user_id: Uuid,
        name: &str,
        cancel: &CancellationToken,
    ) -> bool {
        match self.resolve_user_permissions(user_id, cancel).await {
            Ok(resolved) => resolved.contains(name),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "permission check failed, denying");
                false
            }
        }
    }

    /// Never errors: missing data resolves to `false`.
    pub async fn role_has_permission(
        &self,
        role_id: Uuid,
        name: &str,
        cancel: &CancellationToken,
    ) -> bool {
        match self.resolve_role_permissions(role_id, cancel).await {
            Ok(resolved) => resolved.contains(name),
            Err(e) => {
                tracing::warn!(role_id = %role_id, error = %e, "permission check failed, denying");
                false
            }
        }
    }

    /// The user's resolved permission set; empty on any failure.
    pub async fn get_user_permissions(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> HashSet<String> {
        match self.resolve_user_permissions(user_id, cancel).await {
            Ok(resolved) => (*resolved).clone(),
            Err(e) => {
                tracing::warn!(user_id = %user_id, error = %e, "resolution failed, returning empty set");
                HashSet::new()
            }
        }
    }

    /// The role's resolved permission set; empty on any failure.
    pub async fn get_role_permissions(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> HashSet<String> {
        match self.resolve_role_permissions(role_id, cancel).await {
            Ok(resolved) => (*resolved).clone(),
            Err(e) => {
                tracing::warn!(role_id = %role_id, error = %e, "resolution failed, returning empty set");
                HashSet::new()
            }
        }
    }

    async fn resolve_role_permissions(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Arc<HashSet<String>>, ServiceError> {
        if let Some(resolved) = self.cache.get_role(role_id) {
            return Ok(resolved);
        }

        // Snapshot before the store read; a concurrent invalidation
        // makes the insert a no-op rather than pinning stale state.
        let epoch = self.cache.epoch();
        let names = self
            .store
            .active_permission_names_for_role(role_id, cancel)
            .await?;
        Ok(self
            .cache
            .insert_role(role_id, names.into_iter().collect(), epoch))
    }

    async fn resolve_user_permissions(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Arc<HashSet<String>>, ServiceError> {
        if let Some(resolved) = self.cache.get_user(user_id) {
            return Ok(resolved);
        }

        let epoch = self.cache.epoch();
        let role_ids = self.store.role_ids_for_user(user_id, cancel).await?;
        let mut union: HashSet<String> = HashSet::new();
        for role_id in role_ids {
            let role_set = self.resolve_role_permissions(role_id, cancel).await?;
            union.extend(role_set.iter().cloned());
            // Seed the reverse index so later role-level invalidation can
            // reach this user even without a membership-change event.
            self.cache.register_relationship(role_id, user_id);
        }
        Ok(self.cache.insert_user(user_id, union, epoch))
    }

    // ==================== Grant mutation ====================

    pub async fn grant_permission_to_role(
        &self,
        role_id: Uuid,
        name: &str,
        granted_by: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let permission = self
            .store
            .find_permission_by_name(name, cancel)
            .await?
            .filter(|p| p.is_active)
            .ok_or_else(|| ServiceError::PermissionNotFound(name.to_string()))?;

        let role = self
            .store
            .find_role(role_id, cancel)
            .await?
            .ok_or(ServiceError::RoleNotFound(role_id))?;

        if self
            .store
            .find_grant(role_id, permission.permission_id, cancel)
            .await?
            .is_some()
        {
            tracing::info!(role = %role.role_label, permission = %name, "grant already exists, skipping");
            return Ok(());
        }

        let grant = RoleGrant::new(role_id, permission.permission_id, granted_by);
        self.store
            .insert_grants(std::slice::from_ref(&grant), cancel)
            .await?;

        self.invalidate_role_scope(role_id, cancel).await;
        self.emit(grant_event(role_id, name, granted_by)).await;
        tracing::info!(role = %role.role_label, permission = %name, "permission granted");
        Ok(())
    }

    pub async fn revoke_permission_from_role(
        &self,
        role_id: Uuid,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        // Inactive permissions can still be revoked; only a missing
        // permission makes the grant necessarily absent.
        let Some(permission) = self.store.find_permission_by_name(name, cancel).await? else {
            tracing::info!(role_id = %role_id, permission = %name, "no such permission, nothing to revoke");
            return Ok(());
        };

        let removed = self
            .store
            .delete_grants(&[(role_id, permission.permission_id)], cancel)
            .await?;
        if removed == 0 {
            tracing::info!(role_id = %role_id, permission = %name, "grant absent, nothing to revoke");
            return Ok(());
        }

        self.invalidate_role_scope(role_id, cancel).await;
        self.emit(revoke_event(role_id, name)).await;
        tracing::info!(role_id = %role_id, permission = %name, "permission revoked");
        Ok(())
    }

    /// Grant each (role, permission-name) pair independently: one batch
    /// commit for every row that needs writing, then one invalidation
    /// pass per distinct affected role.
    pub async fn bulk_grant(
        &self,
        pairs: &[(Uuid, String)],
        granted_by: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<BulkReport, ServiceError> {
        let mut items: Vec<BulkItemOutcome> = Vec::with_capacity(pairs.len());
        let mut staged: Vec<RoleGrant> = Vec::new();
        // Index into `items` for each staged grant, so a failed batch
        // commit can be reported per item.
        let mut staged_items: Vec<usize> = Vec::new();

        for (role_id, name) in pairs {
            let disposition = self
                .evaluate_grant(*role_id, name, granted_by, cancel)
                .await?;
            match disposition {
                Ok(Some(grant)) => {
                    staged.push(grant);
                    staged_items.push(items.len());
                    items.push(BulkItemOutcome {
                        role_id: *role_id,
                        permission: name.clone(),
                        status: BulkItemStatus::Succeeded,
                        reason: None,
                    });
                }
                Ok(None) => items.push(BulkItemOutcome {
                    role_id: *role_id,
                    permission: name.clone(),
                    status: BulkItemStatus::Skipped,
                    reason: Some("grant already exists".to_string()),
                }),
                Err(reason) => items.push(BulkItemOutcome {
                    role_id: *role_id,
                    permission: name.clone(),
                    status: BulkItemStatus::Failed,
                    reason: Some(reason),
                }),
            }
        }

        if !staged.is_empty() {
            if let Err(e) = self.store.insert_grants(&staged, cancel).await {
                if matches!(e, ServiceError::Cancelled) {
                    return Err(e);
                }
                tracing::error!(error = %e, "bulk grant batch commit failed");
                for idx in &staged_items {
                    items[*idx].status = BulkItemStatus::Failed;
                    items[*idx].reason = Some("batch commit failed".to_string());
                }
                return Ok(BulkReport { items });
            }

            let affected: HashSet<Uuid> = staged.iter().map(|g| g.role_id).collect();
            for role_id in affected {
                self.invalidate_role_scope(role_id, cancel).await;
            }
            for item in items.iter().filter(|i| i.status == BulkItemStatus::Succeeded) {
                self.emit(grant_event(item.role_id, &item.permission, granted_by))
                    .await;
            }
        }

        Ok(BulkReport { items })
    }

    /// Revoke each pair independently, mirroring [`bulk_grant`]:
    /// one batch delete, one invalidation per distinct affected role.
    pub async fn bulk_revoke(
        &self,
        pairs: &[(Uuid, String)],
        cancel: &CancellationToken,
    ) -> Result<BulkReport, ServiceError> {
        let mut items: Vec<BulkItemOutcome> = Vec::with_capacity(pairs.len());
        let mut staged: Vec<(Uuid, Uuid)> = Vec::new();
        let mut staged_items: Vec<usize> = Vec::new();
        // Permission lookups repeat across pairs; resolve each name once.
        let mut permission_ids: HashMap<String, Option<Permission>> = HashMap::new();

        for (role_id, name) in pairs {
            let permission = match permission_ids.get(name) {
                Some(cached) => cached.clone(),
                None => {
                    let found = self.store.find_permission_by_name(name, cancel).await?;
                    permission_ids.insert(name.clone(), found.clone());
                    found
                }
            };

            let Some(permission) = permission else {
                items.push(BulkItemOutcome {
                    role_id: *role_id,
                    permission: name.clone(),
                    status: BulkItemStatus::Failed,
                    reason: Some("permission not found".to_string()),
                });
                continue;
            };

            if self.store.find_role(*role_id, cancel).await?.is_none() {
                items.push(BulkItemOutcome {
                    role_id: *role_id,
                    permission: name.clone(),
                    status: BulkItemStatus::Failed,
                    reason: Some("role not found".to_string()),
                });
                continue;
            }

            if self
                .store
                .find_grant(*role_id, permission.permission_id, cancel)
                .await?
                .is_none()
            {
                items.push(BulkItemOutcome {
                    role_id: *role_id,
                    permission: name.clone(),
                    status: BulkItemStatus::Skipped,
                    reason: Some("grant does not exist".to_string()),
                });
                continue;
            }

            staged.push((*role_id, permission.permission_id));
            staged_items.push(items.len());
            items.push(BulkItemOutcome {
                role_id: *role_id,
                permission: name.clone(),
                status: BulkItemStatus::Succeeded,
                reason: None,
            });
        }

        if !staged.is_empty() {
            if let Err(e) = self.store.delete_grants(&staged, cancel).await {
                if matches!(e, ServiceError::Cancelled) {
                    return Err(e);
                }
                tracing::error!(error = %e, "bulk revoke batch commit failed");
                for idx in &staged_items {
                    items[*idx].status = BulkItemStatus::Failed;
                    items[*idx].reason = Some("batch commit failed".to_string());
                }
                return Ok(BulkReport { items });
            }

            let affected: HashSet<Uuid> = staged.iter().map(|(role_id, _)| *role_id).collect();
            for role_id in affected {
                self.invalidate_role_scope(role_id, cancel).await;
            }
            for item in items.iter().filter(|i| i.status == BulkItemStatus::Succeeded) {
                self.emit(revoke_event(item.role_id, &item.permission)).await;
            }
        }

        Ok(BulkReport { items })
    }

    /// Evaluate one grant pair. `Ok(Some(_))` stages a new row,
    /// `Ok(None)` means the grant already exists, `Err` carries the
    /// per-item failure reason.
    async fn evaluate_grant(
        &self,
        role_id: Uuid,
        name: &str,
        granted_by: Option<Uuid>,
        cancel: &CancellationToken,
    ) -> Result<Result<Option<RoleGrant>, String>, ServiceError> {
        let Some(permission) = self
            .store
            .find_permission_by_name(name, cancel)
            .await?
            .filter(|p| p.is_active)
        else {
            return Ok(Err("permission not found or inactive".to_string()));
        };

        if self.store.find_role(role_id, cancel).await?.is_none() {
            return Ok(Err("role not found".to_string()));
        }

        if self
            .store
            .find_grant(role_id, permission.permission_id, cancel)
            .await?
            .is_some()
        {
            return Ok(Ok(None));
        }

        Ok(Ok(Some(RoleGrant::new(
            role_id,
            permission.permission_id,
            granted_by,
        ))))
    }

    // ==================== Membership ====================

    pub async fn assign_role_to_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        self.store
            .find_role(role_id, cancel)
            .await?
            .ok_or(ServiceError::RoleNotFound(role_id))?;

        self.store.insert_membership(user_id, role_id, cancel).await?;
        self.cache.register_relationship(role_id, user_id);
        // The user's effective set changed; any cached entry is stale.
        self.cache.invalidate_user(user_id);
        self.emit(AuditEvent::system_action(
            AuditEventType::RoleAssigned,
            Some(json!({ "user_id": user_id, "role_id": role_id })),
        ))
        .await;
        tracing::info!(user_id = %user_id, role_id = %role_id, "role assigned");
        Ok(())
    }

    pub async fn remove_role_from_user(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let removed = self.store.delete_membership(user_id, role_id, cancel).await?;
        if !removed {
            tracing::info!(user_id = %user_id, role_id = %role_id, "membership absent, nothing to remove");
            return Ok(());
        }
        self.cache.unregister_relationship(role_id, user_id);
        self.emit(AuditEvent::system_action(
            AuditEventType::RoleUnassigned,
            Some(json!({ "user_id": user_id, "role_id": role_id })),
        ))
        .await;
        tracing::info!(user_id = %user_id, role_id = %role_id, "role removed");
        Ok(())
    }

    // ==================== Administration ====================

    /// Flip a permission's active flag. Deactivation is logical; grant
    /// rows stay in place but the permission disappears from every
    /// resolved set.
    pub async fn set_permission_active(
        &self,
        name: &str,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let permission = self
            .store
            .find_permission_by_name(name, cancel)
            .await?
            .ok_or_else(|| ServiceError::PermissionNotFound(name.to_string()))?;

        let changed = self
            .store
            .set_permission_active(permission.permission_id, active, cancel)
            .await?;
        if changed {
            // Any role anywhere may reference this permission.
            self.cache.invalidate_all();
            if !active {
                self.emit(AuditEvent::system_action(
                    AuditEventType::PermissionDeactivated,
                    Some(json!({ "permission": name })),
                ))
                .await;
            }
            tracing::info!(permission = %name, active, "permission active flag changed");
        }
        Ok(())
    }

    pub async fn list_permissions(
        &self,
        sort: PermissionSort,
        cancel: &CancellationToken,
    ) -> Result<Vec<Permission>, ServiceError> {
        self.store.list_permissions(sort, cancel).await
    }

    /// Invalidate the role's cache scope. The member list comes from the
    /// store; if that lookup fails after a successful mutation the whole
    /// cache is cleared instead, so no caller can observe stale state.
    async fn invalidate_role_scope(&self, role_id: Uuid, cancel: &CancellationToken) {
        match self.store.user_ids_with_role(role_id, cancel).await {
            Ok(members) => self.cache.invalidate_role(role_id, &members),
            Err(e) => {
                tracing::warn!(role_id = %role_id, error = %e, "member lookup failed, clearing entire cache");
                self.cache.invalidate_all();
            }
        }
    }

    /// Audit emission never affects the caller's result.
    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event).await {
            tracing::warn!(error = %e, "audit append failed");
        }
    }
}

fn grant_event(role_id: Uuid, name: &str, granted_by: Option<Uuid>) -> AuditEvent {
    let data = Some(json!({ "role_id": role_id, "permission": name }));
    match granted_by {
        Some(actor) => AuditEvent::user_action(actor, AuditEventType::PermissionGranted, data),
        None => AuditEvent::system_action(AuditEventType::PermissionGranted, data),
    }
}

fn revoke_event(role_id: Uuid, name: &str) -> AuditEvent {
    AuditEvent::system_action(
        AuditEventType::PermissionRevoked,
        Some(json!({ "role_id": role_id, "permission": name })),
    )
}
