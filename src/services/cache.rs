//! In-memory resolved-permission cache with scoped invalidation.
//!
//! Holds the resolved permission sets for users and roles plus a
//! bidirectional role↔user index used to scope cascade invalidation.
//! The index is a best-effort accelerator: it starts empty after a
//! restart and may lag concurrent mutations, so invalidation-critical
//! cascades always receive a store-derived member list as ground truth
//! and union the index in on top.
//!
//! Reads go through `DashMap` and never take the write path; index
//! mutations lock only the touched map shard. No I/O happens here.

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::services::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubjectKind {
    User,
    Role,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub kind: SubjectKind,
    pub id: Uuid,
}

impl CacheKey {
    pub fn user(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::User,
            id,
        }
    }

    pub fn role(id: Uuid) -> Self {
        Self {
            kind: SubjectKind::Role,
            id,
        }
    }
}

struct CacheEntry {
    permissions: Arc<HashSet<String>>,
    /// Absolute deadline, millis since the Unix epoch.
    expires_at_ms: i64,
    /// Bumped on every hit; the entry dies when it goes unread for the
    /// sliding window.
    last_access_ms: AtomicI64,
}

pub struct PermissionCache {
    entries: DashMap<CacheKey, CacheEntry>,
    role_members: DashMap<Uuid, HashSet<Uuid>>,
    user_roles: DashMap<Uuid, HashSet<Uuid>>,
    /// Bumped before every invalidation. Writers snapshot it before
    /// reading the store; an insert whose snapshot is stale is dropped,
    /// so a resolution that raced a mutation cannot pin pre-mutation
    /// state into the cache.
    epoch: AtomicU64,
    user_ttl_ms: i64,
    role_ttl_ms: i64,
    sliding_ttl_ms: i64,
    clock: Arc<dyn Clock>,
}

impl PermissionCache {
    pub fn new(config: &CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            role_members: DashMap::new(),
            user_roles: DashMap::new(),
            epoch: AtomicU64::new(0),
            user_ttl_ms: config.user_ttl_minutes * 60_000,
            role_ttl_ms: config.role_ttl_minutes * 60_000,
            sliding_ttl_ms: config.sliding_ttl_minutes * 60_000,
            clock,
        }
    }

    pub fn get_user(&self, user_id: Uuid) -> Option<Arc<HashSet<String>>> {
        self.get(CacheKey::user(user_id))
    }

    pub fn get_role(&self, role_id: Uuid) -> Option<Arc<HashSet<String>>> {
        self.get(CacheKey::role(role_id))
    }

    fn get(&self, key: CacheKey) -> Option<Arc<HashSet<String>>> {
        let now_ms = self.clock.now().timestamp_millis();
        {
            let entry = self.entries.get(&key)?;
            let stale = now_ms >= entry.expires_at_ms
                || now_ms >= entry.last_access_ms.load(Ordering::Relaxed) + self.sliding_ttl_ms;
            if !stale {
                entry.last_access_ms.store(now_ms, Ordering::Relaxed);
                return Some(Arc::clone(&entry.permissions));
            }
        }
        // Drop the shard guard before removing.
        self.entries.remove(&key);
        None
    }

    /// Snapshot the invalidation counter before computing a set to
    /// insert. `insert_user`/`insert_role` discard the insert if an
    /// invalidation landed in between.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn bump_epoch(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn insert_user(
        &self,
        user_id: Uuid,
        permissions: HashSet<String>,
        observed_epoch: u64,
    ) -> Arc<HashSet<String>> {
        self.insert(CacheKey::user(user_id), permissions, self.user_ttl_ms, observed_epoch)
    }

    pub fn insert_role(
        &self,
        role_id: Uuid,
        permissions: HashSet<String>,
        observed_epoch: u64,
    ) -> Arc<HashSet<String>> {
        self.insert(CacheKey::role(role_id), permissions, self.role_ttl_ms, observed_epoch)
    }

    fn insert(
        &self,
        key: CacheKey,
        permissions: HashSet<String>,
        ttl_ms: i64,
        observed_epoch: u64,
    ) -> Arc<HashSet<String>> {
        let permissions = Arc::new(permissions);
        if self.epoch() != observed_epoch {
            // An invalidation raced the computation; the set may already
            // be stale. Serve it to this caller but do not cache it.
            return permissions;
        }
        let now_ms = self.clock.now().timestamp_millis();
        self.entries.insert(
            key,
            CacheEntry {
                permissions: Arc::clone(&permissions),
                expires_at_ms: now_ms + ttl_ms,
                last_access_ms: AtomicI64::new(now_ms),
            },
        );
        // Invalidators bump the epoch before removing keys, so a bump
        // observed here means the removal may have missed this insert.
        if self.epoch() != observed_epoch {
            self.entries.remove(&key);
        }
        permissions
    }

    pub fn invalidate_user(&self, user_id: Uuid) {
        self.bump_epoch();
        self.entries.remove(&CacheKey::user(user_id));
    }

    /// Drop the role's entry and cascade to every user holding the role.
    ///
    /// `store_members` is the member list as the store currently sees it
    /// and is authoritative; the reverse-index hint is unioned in so a
    /// lagging index cannot leave an already-registered user stale.
    pub fn invalidate_role(&self, role_id: Uuid, store_members: &[Uuid]) {
        self.bump_epoch();
        self.entries.remove(&CacheKey::role(role_id));

        let hinted: Vec<Uuid> = self
            .role_members
            .get(&role_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default();

        for user_id in store_members.iter().copied().chain(hinted) {
            self.entries.remove(&CacheKey::user(user_id));
        }
    }

    /// Clear every cached entry and the reverse index. Used after bulk
    /// administrative changes where per-scope invalidation is not worth
    /// computing.
    pub fn invalidate_all(&self) {
        self.bump_epoch();
        self.entries.clear();
        self.role_members.clear();
        self.user_roles.clear();
    }

    pub fn register_relationship(&self, role_id: Uuid, user_id: Uuid) {
        self.role_members.entry(role_id).or_default().insert(user_id);
        self.user_roles.entry(user_id).or_default().insert(role_id);
    }

    /// Remove the relationship and invalidate the user's entry: their
    /// effective permissions changed.
    pub fn unregister_relationship(&self, role_id: Uuid, user_id: Uuid) {
        if let Some(mut members) = self.role_members.get_mut(&role_id) {
            members.remove(&user_id);
        }
        if let Some(mut roles) = self.user_roles.get_mut(&user_id) {
            roles.remove(&role_id);
        }
        self.invalidate_user(user_id);
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ManualClock;
    use chrono::{Duration, Utc};

    fn cache_with_clock() -> (PermissionCache, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let cache = PermissionCache::new(&CacheConfig::default(), clock.clone());
        (cache, clock)
    }

    fn perms(names: &[&str]) -> HashSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_miss_then_hit() {
        let (cache, _clock) = cache_with_clock();
        let user_id = Uuid::new_v4();

        assert!(cache.get_user(user_id).is_none());
        cache.insert_user(user_id, perms(&["ViewReports"]), cache.epoch());

        let resolved = cache.get_user(user_id).expect("entry should be present");
        assert!(resolved.contains("ViewReports"));
    }

    #[test]
    fn test_absolute_expiry() {
        let (cache, clock) = cache_with_clock();
        let role_id = Uuid::new_v4();
        cache.insert_role(role_id, perms(&["ManageUsers"]), cache.epoch());

        // Keep the sliding window alive with frequent reads; the absolute
        // deadline still wins.
        for _ in 0..16 {
            clock.advance(Duration::minutes(4));
            cache.get_role(role_id);
        }
        assert!(cache.get_role(role_id).is_none());
    }

    #[test]
    fn test_sliding_expiry() {
        let (cache, clock) = cache_with_clock();
        let user_id = Uuid::new_v4();
        cache.insert_user(user_id, perms(&["ViewReports"]), cache.epoch());

        clock.advance(Duration::minutes(4));
        assert!(cache.get_user(user_id).is_some(), "within sliding window");

        clock.advance(Duration::minutes(4));
        assert!(cache.get_user(user_id).is_some(), "read bumped the window");

        clock.advance(Duration::minutes(6));
        assert!(cache.get_user(user_id).is_none(), "went unread past the window");
    }

    #[test]
    fn test_role_entries_outlive_user_entries() {
        let (cache, clock) = cache_with_clock();
        let user_id = Uuid::new_v4();
        let role_id = Uuid::new_v4();
        cache.insert_user(user_id, perms(&["A"]), cache.epoch());
        cache.insert_role(role_id, perms(&["A"]), cache.epoch());

        // Past the 30-minute user TTL, under the 60-minute role TTL, with
        // reads keeping the sliding window alive.
        for _ in 0..10 {
            clock.advance(Duration::minutes(4));
            cache.get_user(user_id);
            cache.get_role(role_id);
        }
        assert!(cache.get_user(user_id).is_none());
        assert!(cache.get_role(role_id).is_some());
    }

    #[test]
    fn test_invalidate_role_cascades_to_registered_users() {
        let (cache, _clock) = cache_with_clock();
        let role_id = Uuid::new_v4();
        let member = Uuid::new_v4();
        let bystander = Uuid::new_v4();

        cache.insert_role(role_id, perms(&["ViewReports"]), cache.epoch());
        cache.insert_user(member, perms(&["ViewReports"]), cache.epoch());
        cache.insert_user(bystander, perms(&["Other"]), cache.epoch());
        cache.register_relationship(role_id, member);

        cache.invalidate_role(role_id, &[]);

        assert!(cache.get_role(role_id).is_none());
        assert!(cache.get_user(member).is_none());
        assert!(cache.get_user(bystander).is_some());
    }

    #[test]
    fn test_invalidate_role_uses_store_members_when_index_empty() {
        // Simulates the post-restart state: cached entries exist but the
        // reverse index has not been rebuilt.
        let (cache, _clock) = cache_with_clock();
        let role_id = Uuid::new_v4();
        let member = Uuid::new_v4();

        cache.insert_user(member, perms(&["ViewReports"]), cache.epoch());
        cache.invalidate_role(role_id, &[member]);

        assert!(cache.get_user(member).is_none());
    }

    #[test]
    fn test_unregister_invalidates_user() {
        let (cache, _clock) = cache_with_clock();
        let role_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        cache.register_relationship(role_id, user_id);
        cache.insert_user(user_id, perms(&["ViewReports"]), cache.epoch());

        cache.unregister_relationship(role_id, user_id);
        assert!(cache.get_user(user_id).is_none());

        // The index no longer associates the user with the role.
        cache.insert_user(user_id, perms(&["ViewReports"]), cache.epoch());
        cache.invalidate_role(role_id, &[]);
        assert!(cache.get_user(user_id).is_some());
    }

    #[test]
    fn test_invalidate_all() {
        let (cache, _clock) = cache_with_clock();
        let role_id = Uuid::new_v4();
        let user_id = Uuid::new_v4();

        cache.insert_role(role_id, perms(&["A"]), cache.epoch());
        cache.insert_user(user_id, perms(&["A"]), cache.epoch());
        cache.register_relationship(role_id, user_id);

        cache.invalidate_all();
        assert_eq!(cache.entry_count(), 0);
        assert!(cache.get_role(role_id).is_none());
        assert!(cache.get_user(user_id).is_none());
    }

    #[test]
    fn test_insert_with_stale_epoch_is_discarded() {
        let (cache, _clock) = cache_with_clock();
        let user_id = Uuid::new_v4();

        // A resolution snapshots the epoch, then loses the race to a
        // mutation that invalidates before the insert lands.
        let observed = cache.epoch();
        cache.invalidate_user(user_id);

        let served = cache.insert_user(user_id, perms(&["ViewReports"]), observed);
        // The caller still gets its computed set, but it is not cached.
        assert!(served.contains("ViewReports"));
        assert!(cache.get_user(user_id).is_none());
    }

    #[test]
    fn test_role_invalidation_discards_stale_member_insert() {
        let (cache, _clock) = cache_with_clock();
        let role_id = Uuid::new_v4();
        let member = Uuid::new_v4();
        cache.register_relationship(role_id, member);

        let observed = cache.epoch();
        cache.invalidate_role(role_id, &[]);

        cache.insert_user(member, perms(&["ViewReports"]), observed);
        assert!(cache.get_user(member).is_none());

        // A fresh snapshot taken after the invalidation caches normally.
        cache.insert_user(member, perms(&["ViewReports"]), cache.epoch());
        assert!(cache.get_user(member).is_some());
    }
}
