//! Shared fixtures for integration tests.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};

use identity_service::config::{CacheConfig, JwtConfig};
use identity_service::db::MemoryStore;
use identity_service::models::{Permission, PermissionCategory, Role, User};
use identity_service::services::{
    AuthService, EmailProvider, JwtService, ManualClock, PermissionCache, PermissionResolver,
    RefreshTokenService, ServiceError, TwoFactorService,
};
use identity_service::utils::hash_password;

/// Email provider that records every two-factor code it is asked to
/// deliver, so tests can submit the real code.
#[derive(Default)]
pub struct CapturingEmail {
    codes: Mutex<Vec<(String, String)>>,
}

impl CapturingEmail {
    pub fn last_code(&self) -> Option<String> {
        self.codes
            .lock()
            .unwrap()
            .last()
            .map(|(_, code)| code.clone())
    }

    pub fn sent_count(&self) -> usize {
        self.codes.lock().unwrap().len()
    }
}

#[async_trait]
impl EmailProvider for CapturingEmail {
    async fn send_two_factor_code(&self, to_email: &str, code: &str) -> Result<(), ServiceError> {
        self.codes
            .lock()
            .unwrap()
            .push((to_email.to_string(), code.to_string()));
        Ok(())
    }

    async fn send_welcome_email(
        &self,
        _to_email: &str,
        _username: &str,
    ) -> Result<(), ServiceError> {
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub email: Arc<CapturingEmail>,
    pub cache: Arc<PermissionCache>,
    pub jwt: Arc<JwtService>,
    pub auth: AuthService,
    pub resolver: PermissionResolver,
}

pub fn harness() -> Harness {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let email = Arc::new(CapturingEmail::default());

    let jwt_config = JwtConfig {
        secret: "test-secret-0123456789abcdef-0123456789".to_string(),
        issuer: "identity-service".to_string(),
        audience: "internal-apps".to_string(),
        access_token_expiry_minutes: 15,
        refresh_token_expiry_days: 7,
    };

    let jwt = Arc::new(JwtService::new(&jwt_config, clock.clone()));
    let tokens = Arc::new(RefreshTokenService::new(store.clone(), clock.clone(), 7));
    let two_factor = Arc::new(TwoFactorService::new(
        store.clone(),
        email.clone(),
        clock.clone(),
        6,
        5,
    ));
    let auth = AuthService::new(
        store.clone(),
        jwt.clone(),
        tokens,
        two_factor,
        email.clone(),
        store.clone(),
        clock.clone(),
    );

    let cache = Arc::new(PermissionCache::new(&CacheConfig::default(), clock.clone()));
    let resolver = PermissionResolver::new(store.clone(), cache.clone(), store.clone());

    Harness {
        store,
        clock,
        email,
        cache,
        jwt,
        auth,
        resolver,
    }
}

pub fn seed_user(harness: &Harness, username: &str, password: &str, two_factor: bool) -> User {
    let mut user = User::new(
        username.to_string(),
        format!("{}@example.com", username),
        hash_password(password).expect("hash"),
    );
    user.two_factor_enabled = two_factor;
    harness.store.add_user(user.clone());
    user
}

pub fn seed_role(harness: &Harness, label: &str) -> Role {
    let role = Role::new(label.to_string());
    harness.store.add_role(role.clone());
    role
}

pub fn seed_permission(harness: &Harness, name: &str) -> Permission {
    let permission = Permission::new(name.to_string(), PermissionCategory::Reports);
    harness.store.add_permission(permission.clone());
    permission
}
