//! Authentication orchestration: registration, login with optional
//! two-factor step-up, token refresh rotation, and logout.

use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use validator::Validate;

use crate::db::IdentityStore;
use crate::models::{AuditEvent, AuditEventType, User};
use crate::services::{
    ActivityLog, Clock, EmailProvider, JwtService, RefreshTokenService, ServiceError,
    TwoFactorService,
};
use crate::utils::{hash_password, verify_password};

/// Token pair handed to a fully authenticated client.
#[derive(Debug, Clone, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

/// Outcome of a credential check: either a session, or a pending
/// two-factor challenge the caller must complete first.
#[derive(Debug)]
pub enum LoginOutcome {
    Tokens(TokenResponse),
    TwoFactorRequired { user_id: Uuid },
}

#[derive(Debug, Validate)]
pub struct RegisterRequest {
    #[validate(length(min = 3, max = 32, message = "must be 3-32 characters"))]
    pub username: String,
    #[validate(email(message = "must be a valid email address"))]
    pub email: String,
    #[validate(length(min = 12, message = "must be at least 12 characters"))]
    pub password: String,
}

pub struct AuthService {
    identity: Arc<dyn IdentityStore>,
    jwt: Arc<JwtService>,
    tokens: Arc<RefreshTokenService>,
    two_factor: Arc<TwoFactorService>,
    email: Arc<dyn EmailProvider>,
    audit: Arc<dyn ActivityLog>,
    clock: Arc<dyn Clock>,
}

impl AuthService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        identity: Arc<dyn IdentityStore>,
        jwt: Arc<JwtService>,
        tokens: Arc<RefreshTokenService>,
        two_factor: Arc<TwoFactorService>,
        email: Arc<dyn EmailProvider>,
        audit: Arc<dyn ActivityLog>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            identity,
            jwt,
            tokens,
            two_factor,
            email,
            audit,
            clock,
        }
    }

    pub async fn register(
        &self,
        request: RegisterRequest,
        cancel: &CancellationToken,
    ) -> Result<User, ServiceError> {
        request.validate()?;

        if self
            .identity
            .find_user_by_identifier(&request.username, cancel)
            .await?
            .is_some()
            || self
                .identity
                .find_user_by_identifier(&request.email, cancel)
                .await?
                .is_some()
        {
            return Err(ServiceError::AlreadyRegistered);
        }

        let password_hash = hash_password(&request.password)?;
        let user = User::new(
            request.username.to_lowercase(),
            request.email.to_lowercase(),
            password_hash,
        );
        self.identity.insert_user(&user, cancel).await?;

        // Welcome mail is best-effort; registration already succeeded.
        if let Err(e) = self.email.send_welcome_email(&user.email, &user.username).await {
            tracing::warn!(user_id = %user.user_id, error = %e, "welcome email failed");
        }

        self.emit(AuditEvent::user_action(
            user.user_id,
            AuditEventType::UserRegistered,
            Some(json!({ "username": user.username })),
        ))
        .await;

        tracing::info!(user_id = %user.user_id, username = %user.username, "user registered");
        Ok(user)
    }

    /// Check credentials for a username or email. Users with two-factor
    /// enabled get a challenge instead of tokens; everyone else gets a
    /// session. The rejection cause (unknown identifier vs. wrong
    /// password) is never surfaced to the caller.
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        cancel: &CancellationToken,
    ) -> Result<LoginOutcome, ServiceError> {
        let Some(user) = self
            .identity
            .find_user_by_identifier(identifier, cancel)
            .await?
        else {
            self.emit(AuditEvent::system_action(
                AuditEventType::LoginFailed,
                Some(json!({ "identifier": identifier, "reason": "unknown_identifier" })),
            ))
            .await;
            return Err(ServiceError::InvalidCredentials);
        };

        if !verify_password(password, &user.password_hash) {
            self.emit(AuditEvent::user_action(
                user.user_id,
                AuditEventType::LoginFailed,
                Some(json!({ "reason": "bad_password" })),
            ))
            .await;
            return Err(ServiceError::InvalidCredentials);
        }

        if user.two_factor_enabled {
            self.two_factor.issue_code(&user, cancel).await?;
            self.emit(AuditEvent::user_action(
                user.user_id,
                AuditEventType::TwoFactorChallenged,
                None,
            ))
            .await;
            return Ok(LoginOutcome::TwoFactorRequired {
                user_id: user.user_id,
            });
        }

        let tokens = self.issue_session(&user, cancel).await?;
        self.emit(AuditEvent::user_action(
            user.user_id,
            AuditEventType::UserLogin,
            None,
        ))
        .await;
        Ok(LoginOutcome::Tokens(tokens))
    }

    /// Complete a pending two-factor challenge and issue the session.
    /// The password is not re-checked; the challenge itself proves the
    /// first factor was just presented.
    pub async fn verify_two_factor(
        &self,
        user_id: Uuid,
        code: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, ServiceError> {
        let user = self
            .identity
            .find_user_by_id(user_id, cancel)
            .await?
            .ok_or(ServiceError::UserNotFound)?;

        if !self.two_factor.verify(&user, code, cancel).await? {
            self.emit(AuditEvent::user_action(
                user.user_id,
                AuditEventType::TwoFactorRejected,
                None,
            ))
            .await;
            return Err(ServiceError::InvalidCredentials);
        }

        let tokens = self.issue_session(&user, cancel).await?;
        self.emit(AuditEvent::user_action(
            user.user_id,
            AuditEventType::TwoFactorVerified,
            None,
        ))
        .await;
        Ok(tokens)
    }

    /// Rotate a refresh token: consume the presented one, then mint a
    /// fresh pair. Consumption happens before minting, so a failure
    /// partway leaves the old token dead rather than two live tokens.
    pub async fn refresh(
        &self,
        refresh_secret: &str,
        jti: &str,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, ServiceError> {
        let Some(token) = self.tokens.checked(refresh_secret, jti, cancel).await? else {
            self.emit(AuditEvent::system_action(AuditEventType::TokenRejected, None))
                .await;
            return Err(ServiceError::InvalidToken);
        };

        self.tokens.mark_used_id(token.token_id, cancel).await?;

        let user = self
            .identity
            .find_user_by_id(token.user_id, cancel)
            .await?
            .ok_or(ServiceError::UserNotFound)?;

        let tokens = self.issue_session(&user, cancel).await?;
        self.emit(AuditEvent::user_action(
            user.user_id,
            AuditEventType::TokenRefreshed,
            None,
        ))
        .await;
        Ok(tokens)
    }

    /// Invalidate one refresh token. Idempotent: an unknown or
    /// already-dead token is a quiet success.
    pub async fn logout(
        &self,
        refresh_secret: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ServiceError> {
        if self.tokens.invalidate(refresh_secret, cancel).await? {
            self.emit(AuditEvent::system_action(AuditEventType::UserLogout, None))
                .await;
        }
        Ok(())
    }

    /// Invalidate every live refresh token for a user. Returns the
    /// number of sessions revoked.
    pub async fn logout_everywhere(
        &self,
        user_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<u64, ServiceError> {
        let revoked = self.tokens.invalidate_all_for_user(user_id, cancel).await?;
        if revoked > 0 {
            self.emit(AuditEvent::user_action(
                user_id,
                AuditEventType::SessionsRevoked,
                Some(json!({ "revoked": revoked })),
            ))
            .await;
        }
        Ok(revoked)
    }

    async fn issue_session(
        &self,
        user: &User,
        cancel: &CancellationToken,
    ) -> Result<TokenResponse, ServiceError> {
        let (access_token, jti) = self.jwt.generate_access_token(user)?;
        let refresh_token = self.tokens.generate(user.user_id, &jti, cancel).await?;

        self.identity
            .update_last_login(user.user_id, self.clock.now(), cancel)
            .await?;

        Ok(TokenResponse {
            access_token,
            refresh_token,
            token_type: "Bearer".to_string(),
            expires_in: self.jwt.access_token_expiry_seconds(),
        })
    }

    /// Audit emission never affects the caller's result.
    async fn emit(&self, event: AuditEvent) {
        if let Err(e) = self.audit.append(event).await {
            tracing::warn!(error = %e, "audit append failed");
        }
    }
}
