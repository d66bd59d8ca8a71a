//! Refresh token lifecycle: issuance, single-use validation, revocation.

use rand::RngCore;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::db::TokenStore;
use crate::models::RefreshToken;
use crate::services::{Clock, ServiceError};

pub struct RefreshTokenService {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    expiry_days: i64,
}

impl RefreshTokenService {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>, expiry_days: i64) -> Self {
        Self {
            store,
            clock,
            expiry_days,
        }
    }

    /// Mint a refresh token bound to the access token's `jti` and return
    /// the opaque secret. Only the secret's hash is stored.
    pub async fn generate(
        &self,
        user_id: Uuid,
        jti: &str,
        cancel: &CancellationToken,
    ) -> Result<String, ServiceError> {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let secret = hex::encode(bytes);

        let token = RefreshToken::new(user_id, &secret, jti, self.expiry_days, self.clock.now());
        self.store.insert_refresh_token(&token, cancel).await?;

        tracing::debug!(user_id = %user_id, token_id = %token.token_id, "refresh token issued");
        Ok(secret)
    }

    /// Check whether the presented secret identifies a live token bound
    /// to `jti`, without consuming it.
    pub async fn validate(
        &self,
        secret: &str,
        jti: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        Ok(self.checked(secret, jti, cancel).await?.is_some())
    }

    /// Look up the token by hash and run the full validity checks. The
    /// outcome is binary for callers; the distinct rejection causes are
    /// only distinguished in the log.
    pub(crate) async fn checked(
        &self,
        secret: &str,
        jti: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<RefreshToken>, ServiceError> {
        let hash = RefreshToken::hash_token(secret);
        let Some(token) = self.store.find_refresh_token_by_hash(&hash, cancel).await? else {
            tracing::debug!("refresh token not found");
            return Ok(None);
        };

        if token.is_invalidated() {
            tracing::debug!(token_id = %token.token_id, "refresh token was invalidated");
            return Ok(None);
        }
        if token.is_used() {
            // A second presentation of a consumed token can indicate theft.
            tracing::warn!(
                token_id = %token.token_id,
                user_id = %token.user_id,
                "used refresh token presented again"
            );
            return Ok(None);
        }
        if token.is_expired(self.clock.now()) {
            tracing::debug!(token_id = %token.token_id, "refresh token expired");
            return Ok(None);
        }
        if token.jti.as_bytes().ct_eq(jti.as_bytes()).unwrap_u8() != 1 {
            tracing::warn!(
                token_id = %token.token_id,
                user_id = %token.user_id,
                "refresh token presented with mismatched jti"
            );
            return Ok(None);
        }

        Ok(Some(token))
    }

    /// Consume the token identified by the secret. Fails with
    /// `InvalidToken` if the used flag was already set.
    pub async fn mark_used(
        &self,
        secret: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let hash = RefreshToken::hash_token(secret);
        let Some(token) = self.store.find_refresh_token_by_hash(&hash, cancel).await? else {
            return Err(ServiceError::InvalidToken);
        };
        self.mark_used_id(token.token_id, cancel).await
    }

    /// Consume a token by ID. The store flips `used_utc` only when it is
    /// still unset, so concurrent consumers race to a single winner.
    pub(crate) async fn mark_used_id(
        &self,
        token_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let flipped = self
            .store
            .mark_refresh_token_used(token_id, self.clock.now(), cancel)
            .await?;
        if !flipped {
            tracing::warn!(token_id = %token_id, "lost the race to consume refresh token");
            return Err(ServiceError::InvalidToken);
        }
        Ok(())
    }

    /// Invalidate one token. Returns whether a live token was flipped;
    /// unknown or already-dead tokens are a quiet no-op.
    pub async fn invalidate(
        &self,
        secret: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        let hash = RefreshToken::hash_token(secret);
        let Some(token) = self.store.find_refresh_token_by_hash(&hash, cancel).await? else {
            return Ok(false);
        };
        self.store
            .invalidate_refresh_token(token.token_id, self.clock.now(), cancel)
            .await
    }

    /// Invalidate every live token for a user. Returns the count flipped.
    pub async fn invalidate_all_for_user(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        let revoked = self
            .store
            .invalidate_refresh_tokens_for_user(user_id, self.clock.now(), cancel)
            .await?;
        tracing::info!(user_id = %user_id, revoked, "refresh tokens revoked for user");
        Ok(revoked)
    }

    /// Delete rows whose expiry has passed. Run periodically; validity
    /// checks never depend on it.
    pub async fn cleanup_expired(&self, cancel: &CancellationToken) -> Result<u64, ServiceError> {
        let deleted = self
            .store
            .delete_expired_refresh_tokens(self.clock.now(), cancel)
            .await?;
        if deleted > 0 {
            tracing::info!(deleted, "expired refresh tokens removed");
        }
        Ok(deleted)
    }
}
