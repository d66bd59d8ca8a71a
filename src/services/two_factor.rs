//! Two-factor step-up: short-lived numeric codes delivered by email.

use chrono::Duration;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::db::IdentityStore;
use crate::models::User;
use crate::services::{Clock, EmailProvider, ServiceError};

pub struct TwoFactorService {
    identity: Arc<dyn IdentityStore>,
    email: Arc<dyn EmailProvider>,
    clock: Arc<dyn Clock>,
    code_digits: u32,
    code_expiry_minutes: i64,
}

impl TwoFactorService {
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        email: Arc<dyn EmailProvider>,
        clock: Arc<dyn Clock>,
        code_digits: u32,
        code_expiry_minutes: i64,
    ) -> Self {
        Self {
            identity,
            email,
            clock,
            code_digits,
            code_expiry_minutes,
        }
    }

    /// Generate a fresh code for the user, store its hash, and email the
    /// plaintext. A pending code is overwritten; only the newest one can
    /// verify. Delivery failure is propagated so the caller does not
    /// leave the user waiting for a code that never went out.
    pub async fn issue_code(
        &self,
        user: &User,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        let code = self.generate_code();
        let expiry = self.clock.now() + Duration::minutes(self.code_expiry_minutes);

        self.identity
            .set_pending_two_factor(user.user_id, &hash_code(&code), expiry, cancel)
            .await?;

        self.email.send_two_factor_code(&user.email, &code).await?;
        tracing::info!(user_id = %user.user_id, "two-factor code issued");
        Ok(())
    }

    /// Verify a submitted code. Success consumes the pending code; a
    /// wrong code leaves it in place so the user can retry until expiry.
    pub async fn verify(
        &self,
        user: &User,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<bool, ServiceError> {
        let (Some(stored_hash), Some(expiry)) =
            (&user.two_factor_code_hash, user.two_factor_expiry_utc)
        else {
            tracing::debug!(user_id = %user.user_id, "no pending two-factor code");
            return Ok(false);
        };

        if self.clock.now() >= expiry {
            tracing::debug!(user_id = %user.user_id, "two-factor code expired");
            return Ok(false);
        }

        let submitted = hash_code(code);
        if stored_hash.as_bytes().ct_eq(submitted.as_bytes()).unwrap_u8() != 1 {
            tracing::debug!(user_id = %user.user_id, "two-factor code mismatch");
            return Ok(false);
        }

        self.identity
            .clear_pending_two_factor(user.user_id, cancel)
            .await?;
        Ok(true)
    }

    fn generate_code(&self) -> String {
        // u64: ten digits already overflows u32.
        let bound = 10u64.pow(self.code_digits);
        let value = rand::thread_rng().gen_range(0..bound);
        format!("{:0width$}", value, width = self.code_digits as usize)
    }
}

pub(crate) fn hash_code(code: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(code.as_bytes());
    hex::encode(hasher.finalize())
}
