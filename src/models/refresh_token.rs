//! Refresh token model - opaque, store-backed session credentials.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::FromRow;
use uuid::Uuid;

/// Refresh token record. The opaque secret handed to the client is never
/// stored; only its SHA-256 hash is. The `used`/`invalidated` flips are
/// monotonic: once set they are never reset.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct RefreshToken {
    pub token_id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    /// The `jti` of the access token this refresh token was issued
    /// alongside. Binds the token to one family; a presented `jti` that
    /// does not match makes the token invalid.
    pub jti: String,
    pub created_utc: DateTime<Utc>,
    pub expiry_utc: DateTime<Utc>,
    pub used_utc: Option<DateTime<Utc>>,
    pub invalidated_utc: Option<DateTime<Utc>>,
}

impl RefreshToken {
    pub fn new(
        user_id: Uuid,
        secret: &str,
        jti: &str,
        expiry_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            user_id,
            token_hash: Self::hash_token(secret),
            jti: jti.to_string(),
            created_utc: now,
            expiry_utc: now + Duration::days(expiry_days),
            used_utc: None,
            invalidated_utc: None,
        }
    }

    /// Hash an opaque token secret with SHA-256.
    pub fn hash_token(secret: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(secret.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub fn is_used(&self) -> bool {
        self.used_utc.is_some()
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated_utc.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expiry_utc
    }

    /// valid ⟺ not used, not invalidated, not expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_used() && !self.is_invalidated() && !self.is_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_token_is_valid() {
        let now = Utc::now();
        let token = RefreshToken::new(Uuid::new_v4(), "secret-value", "jti-1", 7, now);
        assert!(token.is_valid(now));
        assert_ne!(token.token_hash, "secret-value");
        assert_eq!(token.jti, "jti-1");
    }

    #[test]
    fn test_used_token_is_invalid() {
        let now = Utc::now();
        let mut token = RefreshToken::new(Uuid::new_v4(), "secret-value", "jti-1", 7, now);
        token.used_utc = Some(now);
        assert!(!token.is_valid(now));
    }

    #[test]
    fn test_expired_token_is_invalid() {
        let now = Utc::now();
        let token = RefreshToken::new(Uuid::new_v4(), "secret-value", "jti-1", 7, now);
        assert!(!token.is_valid(now + Duration::days(8)));
    }

    #[test]
    fn test_hash_is_deterministic() {
        assert_eq!(
            RefreshToken::hash_token("abc"),
            RefreshToken::hash_token("abc")
        );
        assert_ne!(
            RefreshToken::hash_token("abc"),
            RefreshToken::hash_token("abd")
        );
    }
}
