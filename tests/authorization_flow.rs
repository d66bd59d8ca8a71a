//! End-to-end authorization resolution scenarios against the in-memory
//! store.

mod common;

use common::{harness, seed_permission, seed_role, seed_user};
use identity_service::db::IdentityStore;
use identity_service::models::PermissionSort;
use identity_service::services::{BulkItemStatus, ServiceError};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::test]
async fn grant_check_revoke_check() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");

    assert!(!h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);

    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();
    assert!(h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);

    h.resolver
        .revoke_permission_from_role(role.role_id, "ViewReports", &cancel)
        .await
        .unwrap();
    assert!(!h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn duplicate_grant_and_absent_revoke_are_noops() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");

    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();
    // Second grant of the same pair succeeds without effect.
    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();

    h.resolver
        .revoke_permission_from_role(role.role_id, "ViewReports", &cancel)
        .await
        .unwrap();
    // Revoking an absent grant is also a quiet no-op.
    h.resolver
        .revoke_permission_from_role(role.role_id, "ViewReports", &cancel)
        .await
        .unwrap();
}

#[tokio::test]
async fn grant_to_unknown_role_or_permission_fails() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");

    assert!(matches!(
        h.resolver
            .grant_permission_to_role(role.role_id, "NoSuchPermission", None, &cancel)
            .await,
        Err(ServiceError::PermissionNotFound(_))
    ));
    assert!(matches!(
        h.resolver
            .grant_permission_to_role(Uuid::new_v4(), "ViewReports", None, &cancel)
            .await,
        Err(ServiceError::RoleNotFound(_))
    ));
}

#[tokio::test]
async fn role_grant_cascades_to_member_immediately() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();

    // Prime the user's cache entry with the pre-grant state.
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);

    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();

    // No stale read: the mutation invalidated the member's entry.
    assert!(h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn revoke_cascades_to_member_immediately() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();
    assert!(h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);

    h.resolver
        .revoke_permission_from_role(role.role_id, "ViewReports", &cancel)
        .await
        .unwrap();
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn membership_changes_update_resolution() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);

    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    assert!(h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);

    h.resolver
        .remove_role_from_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn deactivated_permission_disappears_from_resolution() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();
    assert!(h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);

    h.resolver
        .set_permission_active("ViewReports", false, &cancel)
        .await
        .unwrap();
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
    assert!(!h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);

    // Reactivation restores the grant without re-granting.
    h.resolver
        .set_permission_active("ViewReports", true, &cancel)
        .await
        .unwrap();
    assert!(h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn inactive_permission_cannot_be_granted() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");

    h.resolver
        .set_permission_active("ViewReports", false, &cancel)
        .await
        .unwrap();
    assert!(matches!(
        h.resolver
            .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
            .await,
        Err(ServiceError::PermissionNotFound(_))
    ));
}

#[tokio::test]
async fn unknown_subjects_resolve_to_false() {
    let h = harness();
    let cancel = CancellationToken::new();

    assert!(!h.resolver.user_has_permission(Uuid::new_v4(), "ViewReports", &cancel).await);
    assert!(!h.resolver.role_has_permission(Uuid::new_v4(), "ViewReports", &cancel).await);
    assert!(h
        .resolver
        .get_user_permissions(Uuid::new_v4(), &cancel)
        .await
        .is_empty());
}

#[tokio::test]
async fn bulk_grant_reports_per_pair_dispositions() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");
    seed_permission(&h, "ManageUsers");

    // Pre-existing grant becomes a skip.
    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();

    let pairs = vec![
        (role.role_id, "ViewReports".to_string()),
        (role.role_id, "ManageUsers".to_string()),
        (role.role_id, "NoSuchPermission".to_string()),
        (Uuid::new_v4(), "ViewReports".to_string()),
    ];
    let report = h.resolver.bulk_grant(&pairs, None, &cancel).await.unwrap();

    assert_eq!(report.items.len(), 4);
    assert_eq!(report.count(BulkItemStatus::Skipped), 1);
    assert_eq!(report.count(BulkItemStatus::Succeeded), 1);
    assert_eq!(report.count(BulkItemStatus::Failed), 2);
    assert!(h.resolver.role_has_permission(role.role_id, "ManageUsers", &cancel).await);
}

#[tokio::test]
async fn bulk_revoke_reports_per_pair_dispositions() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");
    seed_permission(&h, "ManageUsers");

    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();

    let pairs = vec![
        (role.role_id, "ViewReports".to_string()),
        // Never granted: a skip, not a failure.
        (role.role_id, "ManageUsers".to_string()),
        (role.role_id, "NoSuchPermission".to_string()),
    ];
    let report = h.resolver.bulk_revoke(&pairs, &cancel).await.unwrap();

    assert_eq!(report.count(BulkItemStatus::Succeeded), 1);
    assert_eq!(report.count(BulkItemStatus::Skipped), 1);
    assert_eq!(report.count(BulkItemStatus::Failed), 1);
    assert!(!h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn member_lookup_failure_clears_cache_instead_of_going_stale() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);

    // Mutation succeeds, member lookup for invalidation fails; the
    // resolver falls back to clearing everything.
    h.store.set_fail_member_lookup(true);
    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();
    h.store.set_fail_member_lookup(false);

    assert!(h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn list_permissions_honors_sort_key() {
    let h = harness();
    let cancel = CancellationToken::new();
    seed_permission(&h, "ManageUsers");
    seed_permission(&h, "AuditExport");
    seed_permission(&h, "ViewReports");

    let listed = h
        .resolver
        .list_permissions(PermissionSort::Name, &cancel)
        .await
        .unwrap();
    let names: Vec<&str> = listed.iter().map(|p| p.permission_name.as_str()).collect();
    assert_eq!(names, vec!["AuditExport", "ManageUsers", "ViewReports"]);
}

#[tokio::test]
async fn soft_deleted_user_resolves_to_false() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
        .await
        .unwrap();

    assert!(h.store.mark_user_deleted(user.user_id, &cancel).await.unwrap());

    // Membership rows survive, but the deleted user resolves to nothing.
    assert!(!h.resolver.user_has_permission(user.user_id, "ViewReports", &cancel).await);
    assert!(h
        .resolver
        .get_user_permissions(user.user_id, &cancel)
        .await
        .is_empty());

    // A second flip is a no-op; the role itself is unaffected.
    assert!(!h.store.mark_user_deleted(user.user_id, &cancel).await.unwrap());
    assert!(h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);
}

#[tokio::test]
async fn mutations_emit_audit_events() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    let user = seed_user(&h, "jsmith", "correct horse battery staple", false);
    let admin = seed_user(&h, "admin", "correct horse battery staple", false);
    seed_permission(&h, "ViewReports");

    h.resolver
        .grant_permission_to_role(role.role_id, "ViewReports", Some(admin.user_id), &cancel)
        .await
        .unwrap();
    h.resolver
        .assign_role_to_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    h.resolver
        .remove_role_from_user(user.user_id, role.role_id, &cancel)
        .await
        .unwrap();
    h.resolver
        .revoke_permission_from_role(role.role_id, "ViewReports", &cancel)
        .await
        .unwrap();
    h.resolver
        .set_permission_active("ViewReports", false, &cancel)
        .await
        .unwrap();

    let events = h.store.events();
    let codes: Vec<&str> = events.iter().map(|e| e.event_type_code.as_str()).collect();
    assert_eq!(
        codes,
        vec![
            "permission_granted",
            "role_assigned",
            "role_unassigned",
            "permission_revoked",
            "permission_deactivated",
        ]
    );
    // The grant is attributed to the granting actor.
    assert_eq!(events[0].actor_user_id, Some(admin.user_id));
}

#[tokio::test]
async fn bulk_mutations_emit_one_event_per_succeeded_pair() {
    let h = harness();
    let cancel = CancellationToken::new();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");
    seed_permission(&h, "ManageUsers");

    let pairs = vec![
        (role.role_id, "ViewReports".to_string()),
        (role.role_id, "ManageUsers".to_string()),
        (role.role_id, "NoSuchPermission".to_string()),
    ];
    h.resolver.bulk_grant(&pairs, None, &cancel).await.unwrap();

    let granted = h
        .store
        .events()
        .iter()
        .filter(|e| e.event_type_code == "permission_granted")
        .count();
    assert_eq!(granted, 2);
}

#[tokio::test]
async fn cancellation_propagates_from_mutations() {
    let h = harness();
    let role = seed_role(&h, "Manager");
    seed_permission(&h, "ViewReports");

    let cancel = CancellationToken::new();
    cancel.cancel();

    assert!(matches!(
        h.resolver
            .grant_permission_to_role(role.role_id, "ViewReports", None, &cancel)
            .await,
        Err(ServiceError::Cancelled)
    ));
    // Checks fail closed rather than erroring.
    assert!(!h.resolver.role_has_permission(role.role_id, "ViewReports", &cancel).await);
}
