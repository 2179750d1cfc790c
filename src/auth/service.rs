//! Request-level auth flows.
//!
//! `AuthService` composes the hasher, token issuer, session ledger, lockout
//! tracker and rate limiter over the storage collaborators. Handlers call
//! exactly one method per request.
//!
//! `login`, `refresh`, `verify_email` and `reset_password` run their body in a
//! spawned task:
//! dropping the caller's future (client disconnect) does not cancel the
//! storage writes already in flight.

use chrono::Utc;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use super::config::{AuthConfig, expires_after};
use super::error::AuthError;
use super::hasher::CredentialHasher;
use super::lockout::LockoutTracker;
use super::rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter};
use super::secrets::SecretStore;
use super::sessions::SessionLedger;
use super::token::{AccessClaims, TokenIssuer};
use super::types::{LoginResponse, OkResponse, PublicUser, RefreshResponse};
use super::utils::{
    build_reset_url, build_verify_url, generate_token, normalize_email, valid_email,
    validate_name, validate_password,
};
use crate::store::{
    AuditEntry, CounterStore, CreateUserOutcome, Mailer, NewUser, OneTimeToken, SessionStore,
    TokenKind, TokenStore, User, UserStore,
};

const VERIFY_SUBJECT: &str = "Verify your Finora account";
const RESET_SUBJECT: &str = "Reset your password";
const UNLOCK_ACTION: &str = "user.unlock";

/// Storage and delivery collaborators consumed by the auth core.
#[derive(Clone)]
pub struct Collaborators {
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub tokens: Arc<dyn TokenStore>,
    pub counters: Arc<dyn CounterStore>,
    pub mailer: Arc<dyn Mailer>,
}

#[derive(Clone)]
pub struct AuthService {
    config: Arc<AuthConfig>,
    users: Arc<dyn UserStore>,
    tokens: Arc<dyn TokenStore>,
    mailer: Arc<dyn Mailer>,
    hasher: CredentialHasher,
    issuer: TokenIssuer,
    ledger: SessionLedger,
    lockout: LockoutTracker,
    limiter: RateLimiter,
}

impl AuthService {
    #[must_use]
    pub fn new(
        config: AuthConfig,
        secrets: Arc<SecretStore>,
        collaborators: Collaborators,
        hasher: CredentialHasher,
    ) -> Self {
        let config = Arc::new(config);
        let issuer = TokenIssuer::new(secrets, config.access_ttl());
        let ledger = SessionLedger::new(
            collaborators.sessions,
            collaborators.users.clone(),
            hasher.clone(),
            issuer.clone(),
            config.clone(),
        );
        let lockout = LockoutTracker::new(
            collaborators.counters.clone(),
            collaborators.users.clone(),
            collaborators.mailer.clone(),
            &config,
        );
        let limiter = RateLimiter::new(collaborators.counters, &config);

        Self {
            config,
            users: collaborators.users,
            tokens: collaborators.tokens,
            mailer: collaborators.mailer,
            hasher,
            issuer,
            ledger,
            lockout,
            limiter,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    /// Creates an unverified user and mails a verification link.
    ///
    /// # Errors
    /// `Validation` for malformed input, `EmailExists` for a taken email.
    #[instrument(skip(self, password, name))]
    pub async fn register(
        &self,
        email: &str,
        password: &str,
        name: Option<&str>,
    ) -> Result<PublicUser, AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::Validation("Invalid email"));
        }
        validate_password(password)?;
        let name = validate_name(name)?;

        if self.users.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailExists);
        }

        let password_hash = self.hasher.hash_password(password).await?;
        let user = match self
            .users
            .create_user(NewUser {
                email,
                name,
                password_hash,
            })
            .await?
        {
            CreateUserOutcome::Created(user) => user,
            CreateUserOutcome::Conflict => return Err(AuthError::EmailExists),
        };

        self.send_verification(&user).await?;
        info!(user_id = %user.id, "user registered");
        Ok(PublicUser::from(&user))
    }

    /// # Errors
    /// `AccountLocked` or `InvalidCredentials`; the latter never says which
    /// check failed.
    #[instrument(skip(self, password))]
    pub async fn login(&self, email: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let this = self.clone();
        let email = email.to_string();
        let password = password.to_string();
        tokio::spawn(async move { this.login_inner(&email, &password).await }).await?
    }

    async fn login_inner(&self, email: &str, password: &str) -> Result<LoginResponse, AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email) || password.is_empty() {
            return Err(AuthError::Validation("Invalid email or password"));
        }

        let Some(user) = self.users.find_user_by_email(&email).await? else {
            // Spend one hash so unknown emails cost the same as wrong passwords.
            let _ = self.hasher.hash_password(password).await;
            self.lockout.record_unknown_email_failure(&email).await;
            return Err(AuthError::InvalidCredentials);
        };

        if let Some(until) = LockoutTracker::lock_state(&user, Utc::now()) {
            return Err(AuthError::AccountLocked { until });
        }

        if !self.hasher.verify_password(&user.password_hash, password).await {
            if let Some(until) = self.lockout.record_user_failure(&user).await {
                info!(user_id = %user.id, %until, "login failure reached lockout threshold");
            }
            return Err(AuthError::InvalidCredentials);
        }

        let access_token = self.issuer.sign_access_token(user.id, user.role)?;
        let session = self.ledger.create_session(user.id).await?;
        self.lockout.record_success(user.id).await;

        Ok(LoginResponse {
            access_token,
            expires_in: self.issuer.expires_in(),
            refresh_token: session.refresh_token,
            session_id: session.session_id,
            user: PublicUser::from(&user),
        })
    }

    /// # Errors
    /// `InvalidSession`, `SessionExpired`, `InvalidRefreshToken` or `AccountLocked`.
    #[instrument(skip(self, refresh_token))]
    pub async fn refresh(
        &self,
        session_id: Uuid,
        refresh_token: &str,
    ) -> Result<RefreshResponse, AuthError> {
        let ledger = self.ledger.clone();
        let refresh_token = refresh_token.to_string();
        let rotated =
            tokio::spawn(async move { ledger.refresh(session_id, &refresh_token).await }).await??;

        Ok(RefreshResponse {
            access_token: rotated.access_token,
            refresh_token: rotated.refresh_token,
            session_id: rotated.session_id,
            expires_in: rotated.expires_in,
        })
    }

    /// Always `{ok: true}` unless storage fails.
    ///
    /// # Errors
    /// Propagates storage failures.
    #[instrument(skip(self))]
    pub async fn logout(&self, session_id: Uuid) -> Result<OkResponse, AuthError> {
        self.ledger.logout(session_id).await?;
        Ok(OkResponse::OK)
    }

    /// Consumes the token and marks its owner verified. A storage failure
    /// leaves the token usable.
    ///
    /// # Errors
    /// `InvalidOrExpiredToken` when no unexpired token matches or it was
    /// consumed concurrently.
    #[instrument(skip_all)]
    pub async fn verify_email(&self, raw_token: &str) -> Result<OkResponse, AuthError> {
        let this = self.clone();
        let raw_token = raw_token.to_string();
        tokio::spawn(async move { this.verify_inner(&raw_token).await }).await?
    }

    async fn verify_inner(&self, raw_token: &str) -> Result<OkResponse, AuthError> {
        let candidate = self
            .find_matching(TokenKind::EmailVerification, raw_token)
            .await?
            .ok_or(AuthError::InvalidOrExpiredToken)?;
        let user_id = self
            .users
            .redeem_email_verification(candidate.id)
            .await?
            .ok_or(AuthError::InvalidOrExpiredToken)?;
        info!(%user_id, "email verified");
        Ok(OkResponse::OK)
    }

    /// Mails a reset link when the email belongs to a user. Unknown emails
    /// get the same response.
    ///
    /// # Errors
    /// `RateLimited` after too many requests for the same email.
    #[instrument(skip(self))]
    pub async fn forgot(&self, email: &str) -> Result<OkResponse, AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::Validation("Invalid email"));
        }

        if self
            .limiter
            .check_email(&email, RateLimitAction::ForgotPassword)
            .await
            == RateLimitDecision::Limited
        {
            return Err(AuthError::RateLimited);
        }

        let Some(user) = self.users.find_user_by_email(&email).await? else {
            return Ok(OkResponse::OK);
        };

        let raw = self
            .issue_token(TokenKind::PasswordReset, user.id, self.config.reset_ttl())
            .await?;
        let url = build_reset_url(self.config.frontend_base_url(), &raw);
        let body = format!("<p>Reset: <a href=\"{url}\">reset</a></p>");
        self.deliver(&user, RESET_SUBJECT, &body).await;
        Ok(OkResponse::OK)
    }

    /// Sets a new password and revokes every session of the user. The token,
    /// password and sessions change together or not at all.
    ///
    /// # Errors
    /// `Validation` for a short password, `InvalidOrExpiredToken` for an
    /// unknown, expired or already used token.
    #[instrument(skip_all)]
    pub async fn reset_password(
        &self,
        raw_token: &str,
        new_password: &str,
    ) -> Result<OkResponse, AuthError> {
        validate_password(new_password)?;
        let this = self.clone();
        let raw_token = raw_token.to_string();
        let new_password = new_password.to_string();
        tokio::spawn(async move { this.reset_inner(&raw_token, &new_password).await }).await?
    }

    async fn reset_inner(&self, raw_token: &str, new_password: &str) -> Result<OkResponse, AuthError> {
        let candidate = self
            .find_matching(TokenKind::PasswordReset, raw_token)
            .await?
            .ok_or(AuthError::InvalidOrExpiredToken)?;

        let password_hash = self.hasher.hash_password(new_password).await?;
        let (user_id, revoked) = self
            .users
            .redeem_password_reset(candidate.id, &password_hash)
            .await?
            .ok_or(AuthError::InvalidOrExpiredToken)?;
        info!(%user_id, revoked, "password reset, sessions revoked");
        Ok(OkResponse::OK)
    }

    /// Sends a fresh verification link to an unverified user. Always `{ok: true}`.
    ///
    /// # Errors
    /// `Validation` for a malformed email; storage failures propagate.
    #[instrument(skip(self))]
    pub async fn resend_verification(&self, email: &str) -> Result<OkResponse, AuthError> {
        let email = normalize_email(email);
        if !valid_email(&email) {
            return Err(AuthError::Validation("Invalid email"));
        }

        if self
            .limiter
            .check_email(&email, RateLimitAction::ResendVerification)
            .await
            == RateLimitDecision::Limited
        {
            return Ok(OkResponse::OK);
        }

        if let Some(user) = self.users.find_user_by_email(&email).await? {
            if !user.email_verified {
                self.send_verification(&user).await?;
            }
        }
        Ok(OkResponse::OK)
    }

    /// Clears a lockout on behalf of an admin and records an audit row.
    ///
    /// # Errors
    /// `UserNotFound` for an unknown id.
    #[instrument(skip(self))]
    pub async fn unlock_user(&self, actor_id: Uuid, user_id: Uuid) -> Result<OkResponse, AuthError> {
        if !self.lockout.unlock(user_id).await? {
            return Err(AuthError::UserNotFound);
        }

        let entry = AuditEntry {
            actor_id,
            action: UNLOCK_ACTION.to_string(),
            target_id: user_id,
            metadata: serde_json::json!({}),
        };
        if let Err(err) = self.users.record_audit(entry).await {
            error!(%user_id, "Failed to write audit log: {err:#}");
        }
        info!(%actor_id, %user_id, "account unlocked");
        Ok(OkResponse::OK)
    }

    /// Verifies a bearer access token for request guards.
    #[must_use]
    pub fn authenticate(&self, access_token: &str) -> Option<AccessClaims> {
        self.issuer.verify_access_token(access_token)
    }

    async fn send_verification(&self, user: &User) -> Result<(), AuthError> {
        let raw = self
            .issue_token(
                TokenKind::EmailVerification,
                user.id,
                self.config.verification_ttl(),
            )
            .await?;
        let url = build_verify_url(self.config.app_base_url(), &raw);
        let body = format!("<p>Click <a href=\"{url}\">here</a> to verify your email.</p>");
        self.deliver(user, VERIFY_SUBJECT, &body).await;
        Ok(())
    }

    /// Stores a peppered hash of a fresh token and returns the raw value.
    async fn issue_token(
        &self,
        kind: TokenKind,
        user_id: Uuid,
        ttl: std::time::Duration,
    ) -> Result<String, AuthError> {
        let raw = generate_token()?;
        let token_hash = self
            .hasher
            .hash_with_pepper(&raw, self.config.refresh_pepper())
            .await?;
        let token = OneTimeToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash,
            expires_at: expires_after(Utc::now(), ttl),
        };
        self.tokens.insert_token(kind, &token).await?;
        Ok(raw)
    }

    /// Scans unexpired tokens of `kind` for one whose hash matches `raw`.
    async fn find_matching(
        &self,
        kind: TokenKind,
        raw: &str,
    ) -> Result<Option<OneTimeToken>, AuthError> {
        if raw.is_empty() {
            return Ok(None);
        }
        let candidates = self.tokens.unexpired_tokens(kind, Utc::now()).await?;
        for candidate in candidates {
            if self
                .hasher
                .verify_with_pepper(&candidate.token_hash, raw, self.config.refresh_pepper())
                .await
            {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn deliver(&self, user: &User, subject: &str, body: &str) {
        if let Err(err) = self.mailer.send(&user.email, subject, body).await {
            warn!(user_id = %user.id, "Failed to send \"{subject}\" email: {err:#}");
        }
    }
}
