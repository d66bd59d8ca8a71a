//! Postgres-backed store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::future::Future;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::db::{IdentityStore, PermissionStore, TokenStore};
use crate::models::{AuditEvent, Permission, PermissionSort, RefreshToken, Role, RoleGrant, User};
use crate::services::{ActivityLog, ServiceError};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

/// Race a query against cancellation. `biased` so an already-cancelled
/// token wins before the query is polled at all.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::Cancelled),
        result = fut => result.map_err(ServiceError::from),
    }
}

impl Database {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, ServiceError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .connect(&config.url)
            .await?;
        tracing::info!(max_connections = config.max_connections, "Database pool created");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> Result<(), ServiceError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| ServiceError::Internal(anyhow::anyhow!("migration failed: {}", e)))?;
        tracing::info!("Database migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), ServiceError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl PermissionStore for Database {
    async fn find_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<Role>, ServiceError> {
        cancellable(
            cancel,
            sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE role_id = $1")
                .bind(role_id)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn find_permission_by_name(
        &self,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<Permission>, ServiceError> {
        cancellable(
            cancel,
            sqlx::query_as::<_, Permission>("SELECT * FROM permissions WHERE permission_name = $1")
                .bind(name)
                .fetch_optional(&self.pool),
        )
        .await
    }

    async fn list_permissions(
        &self,
        sort: PermissionSort,
        cancel: &CancellationToken,
    ) -> Result<Vec<Permission>, ServiceError> {
        // Sort column comes from a fixed enum, never from user input.
        let query = format!("SELECT * FROM permissions ORDER BY {}", sort.column());
        cancellable(
            cancel,
            sqlx::query_as::<_, Permission>(&query).fetch_all(&self.pool),
        )
        .await
    }

    async fn set_permission_active(
        &self,
        permission_id: Uuid,
        active: bool,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        let result = cancellable(
            cancel,
            sqlx::query(
                "UPDATE permissions SET is_active = $2 \
                 WHERE permission_id = $1 AND is_active <> $2",
            )
            .bind(permission_id)
            .bind(active)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_permission_names_for_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<String>, ServiceError> {
        let rows: Vec<(String,)> = cancellable(
            cancel,
            sqlx::query_as(
                "SELECT p.permission_name FROM role_grants g \
                 JOIN permissions p ON p.permission_id = g.permission_id \
                 WHERE g.role_id = $1 AND p.is_active = TRUE",
            )
            .bind(role_id)
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(|(name,)| name).collect())
    }

    async fn role_ids_for_user(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ServiceError> {
        // Deleted users keep their membership rows but resolve to none.
        let rows: Vec<(Uuid,)> = cancellable(
            cancel,
            sqlx::query_as(
                "SELECT ur.role_id FROM user_roles ur \
                 JOIN users u ON u.user_id = ur.user_id \
                 WHERE ur.user_id = $1 AND u.user_state_code <> 'deleted'",
            )
            .bind(user_id)
            .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn user_ids_with_role(
        &self,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Vec<Uuid>, ServiceError> {
        let rows: Vec<(Uuid,)> = cancellable(
            cancel,
            sqlx::query_as("SELECT user_id FROM user_roles WHERE role_id = $1")
                .bind(role_id)
                .fetch_all(&self.pool),
        )
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn find_grant(
        &self,
        role_id: Uuid,
        permission_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<RoleGrant>, ServiceError> {
        cancellable(
            cancel,
            sqlx::query_as::<_, RoleGrant>(
                "SELECT * FROM role_grants WHERE role_id = $1 AND permission_id = $2",
            )
            .bind(role_id)
            .bind(permission_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn insert_grants(
        &self,
        grants: &[RoleGrant],
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let pool = self.pool.clone();
        let rows = grants.to_vec();
        cancellable(cancel, async move {
            let mut tx = pool.begin().await?;
            for grant in &rows {
                sqlx::query(
                    "INSERT INTO role_grants (role_id, permission_id, granted_by, granted_utc) \
                     VALUES ($1, $2, $3, $4) ON CONFLICT DO NOTHING",
                )
                .bind(grant.role_id)
                .bind(grant.permission_id)
                .bind(grant.granted_by)
                .bind(grant.granted_utc)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await
        })
        .await
    }

    async fn delete_grants(
        &self,
        pairs: &[(Uuid, Uuid)],
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        let pool = self.pool.clone();
        let pairs = pairs.to_vec();
        cancellable(cancel, async move {
            let mut tx = pool.begin().await?;
            let mut removed = 0u64;
            for (role_id, permission_id) in &pairs {
                let result = sqlx::query(
                    "DELETE FROM role_grants WHERE role_id = $1 AND permission_id = $2",
                )
                .bind(role_id)
                .bind(permission_id)
                .execute(&mut *tx)
                .await?;
                removed += result.rows_affected();
            }
            tx.commit().await?;
            Ok(removed)
        })
        .await
    }

    async fn insert_membership(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query(
                "INSERT INTO user_roles (user_id, role_id) VALUES ($1, $2) \
                 ON CONFLICT DO NOTHING",
            )
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn delete_membership(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        let result = cancellable(
            cancel,
            sqlx::query("DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2")
                .bind(user_id)
                .bind(role_id)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_role(
        &self,
        role: &Role,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query("INSERT INTO roles (role_id, role_label, created_utc) VALUES ($1, $2, $3)")
                .bind(role.role_id)
                .bind(&role.role_label)
                .bind(role.created_utc)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn insert_permission(
        &self,
        permission: &Permission,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query(
                "INSERT INTO permissions \
                 (permission_id, permission_name, category_code, is_active, created_utc) \
                 VALUES ($1, $2, $3, $4, $5)",
            )
            .bind(permission.permission_id)
            .bind(&permission.permission_name)
            .bind(&permission.category_code)
            .bind(permission.is_active)
            .bind(permission.created_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl TokenStore for Database {
    async fn insert_refresh_token(
        &self,
        token: &RefreshToken,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query(
                "INSERT INTO refresh_tokens \
                 (token_id, user_id, token_hash, jti, created_utc, expiry_utc, used_utc, invalidated_utc) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(token.token_id)
            .bind(token.user_id)
            .bind(&token.token_hash)
            .bind(&token.jti)
            .bind(token.created_utc)
            .bind(token.expiry_utc)
            .bind(token.used_utc)
            .bind(token.invalidated_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn find_refresh_token_by_hash(
        &self,
        token_hash: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        cancellable(
            cancel,
            sqlx::query_as::<_, RefreshToken>(
                "SELECT * FROM refresh_tokens WHERE token_hash = $1",
            )
            .bind(token_hash)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn mark_refresh_token_used(
        &self,
        token_id: Uuid,
        used_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        // The NULL guard makes concurrent consumers race to one winner.
        let result = cancellable(
            cancel,
            sqlx::query(
                "UPDATE refresh_tokens SET used_utc = $2 \
                 WHERE token_id = $1 AND used_utc IS NULL",
            )
            .bind(token_id)
            .bind(used_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn invalidate_refresh_token(
        &self,
        token_id: Uuid,
        invalidated_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        let result = cancellable(
            cancel,
            sqlx::query(
                "UPDATE refresh_tokens SET invalidated_utc = $2 \
                 WHERE token_id = $1 AND invalidated_utc IS NULL AND used_utc IS NULL",
            )
            .bind(token_id)
            .bind(invalidated_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn invalidate_refresh_tokens_for_user(
        &self,
        user_id: Uuid,
        invalidated_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        let result = cancellable(
            cancel,
            sqlx::query(
                "UPDATE refresh_tokens SET invalidated_utc = $2 \
                 WHERE user_id = $1 AND invalidated_utc IS NULL \
                   AND used_utc IS NULL AND expiry_utc > $2",
            )
            .bind(user_id)
            .bind(invalidated_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }

    async fn delete_expired_refresh_tokens(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        let result = cancellable(
            cancel,
            sqlx::query("DELETE FROM refresh_tokens WHERE expiry_utc <= $1")
                .bind(now)
                .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl IdentityStore for Database {
    async fn find_user_by_id(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<Option<User>, ServiceError> {
        cancellable(
            cancel,
            sqlx::query_as::<_, User>(
                "SELECT * FROM users WHERE user_id = $1 AND user_state_code <> 'deleted'",
            )
            .bind(user_id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn find_user_by_identifier(
        &self,
        identifier: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<User>, ServiceError> {
        cancellable(
            cancel,
            sqlx::query_as::<_, User>(
                "SELECT * FROM users \
                 WHERE (LOWER(username) = LOWER($1) OR LOWER(email) = LOWER($1)) \
                   AND user_state_code <> 'deleted'",
            )
            .bind(identifier)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn insert_user(
        &self,
        user: &User,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query(
                "INSERT INTO users \
                 (user_id, username, email, password_hash, two_factor_enabled, \
                  two_factor_code_hash, two_factor_expiry_utc, last_login_utc, \
                  user_state_code, created_utc) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
            )
            .bind(user.user_id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.two_factor_enabled)
            .bind(&user.two_factor_code_hash)
            .bind(user.two_factor_expiry_utc)
            .bind(user.last_login_utc)
            .bind(&user.user_state_code)
            .bind(user.created_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn set_pending_two_factor(
        &self,
        user_id: Uuid,
        code_hash: &str,
        expiry_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query(
                "UPDATE users SET two_factor_code_hash = $2, two_factor_expiry_utc = $3 \
                 WHERE user_id = $1",
            )
            .bind(user_id)
            .bind(code_hash)
            .bind(expiry_utc)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn clear_pending_two_factor(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query(
                "UPDATE users SET two_factor_code_hash = NULL, two_factor_expiry_utc = NULL \
                 WHERE user_id = $1",
            )
            .bind(user_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn update_last_login(
        &self,
        user_id: Uuid,
        login_utc: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        cancellable(
            cancel,
            sqlx::query("UPDATE users SET last_login_utc = $2 WHERE user_id = $1")
                .bind(user_id)
                .bind(login_utc)
                .execute(&self.pool),
        )
        .await?;
        Ok(())
    }

    async fn mark_user_deleted(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        let result = cancellable(
            cancel,
            sqlx::query(
                "UPDATE users SET user_state_code = 'deleted' \
                 WHERE user_id = $1 AND user_state_code <> 'deleted'",
            )
            .bind(user_id)
            .execute(&self.pool),
        )
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl ActivityLog for Database {
    async fn append(&self, event: AuditEvent) -> Result<(), ServiceError> {
        sqlx::query(
            "INSERT INTO audit_events \
             (event_id, actor_user_id, event_type_code, event_data, created_utc) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.event_id)
        .bind(event.actor_user_id)
        .bind(&event.event_type_code)
        .bind(&event.event_data)
        .bind(event.created_utc)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
