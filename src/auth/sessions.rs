//! Refresh sessions: creation, rotation on use, revocation.
//!
//! State per session id: `ACTIVE -> ROTATED` on a successful refresh (a new
//! sibling enters `ACTIVE`), or `ACTIVE -> REVOKED` (row deleted) on logout,
//! token mismatch or password reset. Rotated rows are kept for the audit
//! trail and pruned by the sweeper after the retention period.
//!
//! A refresh checks, in order:
//! 1. the row exists (`InvalidSession`)
//! 2. it has not expired (`SessionExpired`, row deleted)
//! 3. the presented token matches (`InvalidRefreshToken`, row deleted)
//! 4. it was not already rotated (`InvalidRefreshToken`, whole family deleted)
//! 5. the owner still exists and is not locked
//!
//! Rotation itself is one guarded store call, so two concurrent refreshes of
//! the same token produce exactly one winner.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::config::{AuthConfig, chrono_duration, expires_after};
use super::error::AuthError;
use super::hasher::CredentialHasher;
use super::token::TokenIssuer;
use super::utils::generate_token;
use crate::store::{CounterStore, Session, SessionStore, TokenStore, UserStore};

/// Returned once at login; the raw refresh token cannot be recovered later.
#[derive(Clone, Debug)]
pub struct IssuedSession {
    pub session_id: Uuid,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct RotatedSession {
    pub session_id: Uuid,
    pub refresh_token: String,
    pub access_token: String,
    pub expires_in: u64,
}

#[derive(Clone)]
pub struct SessionLedger {
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    hasher: CredentialHasher,
    issuer: TokenIssuer,
    config: Arc<AuthConfig>,
}

impl SessionLedger {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        hasher: CredentialHasher,
        issuer: TokenIssuer,
        config: Arc<AuthConfig>,
    ) -> Self {
        Self {
            sessions,
            users,
            hasher,
            issuer,
            config,
        }
    }

    async fn new_session(
        &self,
        user_id: Uuid,
        family_id: Option<Uuid>,
    ) -> Result<(Session, String), AuthError> {
        let id = Uuid::new_v4();
        let refresh_token = generate_token()?;
        let refresh_hash = self
            .hasher
            .hash_with_pepper(&refresh_token, self.config.refresh_pepper())
            .await?;
        let now = Utc::now();
        let session = Session {
            id,
            user_id,
            family_id: family_id.unwrap_or(id),
            refresh_hash,
            expires_at: expires_after(now, self.config.refresh_ttl()),
            rotated: false,
            created_at: now,
        };
        Ok((session, refresh_token))
    }

    /// Starts a new session family for `user_id`.
    ///
    /// # Errors
    /// Propagates hashing and storage failures.
    pub async fn create_session(&self, user_id: Uuid) -> Result<IssuedSession, AuthError> {
        let (session, refresh_token) = self.new_session(user_id, None).await?;
        self.sessions.insert_session(&session).await?;
        Ok(IssuedSession {
            session_id: session.id,
            refresh_token,
            expires_at: session.expires_at,
        })
    }

    /// Exchanges a live `(session_id, refresh_token)` pair for a new pair and
    /// an access token.
    ///
    /// # Errors
    /// `InvalidSession`, `SessionExpired`, `InvalidRefreshToken` or
    /// `AccountLocked`; storage failures propagate as `Internal`.
    pub async fn refresh(
        &self,
        session_id: Uuid,
        presented: &str,
    ) -> Result<RotatedSession, AuthError> {
        let Some(session) = self.sessions.find_session(session_id).await? else {
            return Err(AuthError::InvalidSession);
        };

        let now = Utc::now();
        if session.expires_at <= now {
            self.sessions.delete_session(session.id).await?;
            return Err(AuthError::SessionExpired);
        }

        let matches = self
            .hasher
            .verify_with_pepper(&session.refresh_hash, presented, self.config.refresh_pepper())
            .await;
        if !matches {
            warn!(session_id = %session.id, "refresh token mismatch, revoking session");
            self.sessions.delete_session(session.id).await?;
            return Err(AuthError::InvalidRefreshToken);
        }

        if session.rotated {
            let revoked = self.sessions.delete_session_family(session.family_id).await?;
            warn!(
                family_id = %session.family_id,
                revoked,
                "rotated refresh token reused, revoking session family"
            );
            return Err(AuthError::InvalidRefreshToken);
        }

        let Some(user) = self.users.find_user_by_id(session.user_id).await? else {
            self.sessions.delete_session(session.id).await?;
            return Err(AuthError::InvalidSession);
        };
        if let Some(until) = user.locked_until.filter(|until| *until > now) {
            return Err(AuthError::AccountLocked { until });
        }

        let (next, refresh_token) = self.new_session(user.id, Some(session.family_id)).await?;
        let rotated = self
            .sessions
            .rotate_session(session.id, &session.refresh_hash, &next)
            .await?;
        if !rotated {
            // Lost a concurrent refresh of the same token.
            return Err(AuthError::InvalidRefreshToken);
        }

        let access_token = self.issuer.sign_access_token(user.id, user.role)?;
        Ok(RotatedSession {
            session_id: next.id,
            refresh_token,
            access_token,
            expires_in: self.issuer.expires_in(),
        })
    }

    /// Idempotent; deleting nothing is success.
    ///
    /// # Errors
    /// Propagates storage failures.
    pub async fn logout(&self, session_id: Uuid) -> Result<(), AuthError> {
        self.sessions.delete_session(session_id).await?;
        Ok(())
    }

    /// # Errors
    /// Propagates storage failures.
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> Result<u64, AuthError> {
        Ok(self.sessions.delete_sessions_for_user(user_id).await?)
    }
}

#[derive(Clone)]
pub struct Sweeper {
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenStore>,
    counters: Arc<dyn CounterStore>,
    rotated_retention: Duration,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub sessions: u64,
    pub tokens: u64,
    pub counters: u64,
}

impl Sweeper {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        tokens: Arc<dyn TokenStore>,
        counters: Arc<dyn CounterStore>,
        rotated_retention: Duration,
    ) -> Self {
        Self {
            sessions,
            tokens,
            counters,
            rotated_retention,
        }
    }

    /// Deletes expired sessions and tokens, rotated sessions older than the
    /// retention period and expired counters. Each step fails independently.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> SweepReport {
        let rotated_before = now
            .checked_sub_signed(chrono_duration(self.rotated_retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut report = SweepReport::default();
        match self.sessions.prune_sessions(now, rotated_before).await {
            Ok(count) => report.sessions = count,
            Err(err) => error!("Failed to prune sessions: {err:#}"),
        }
        match self.tokens.prune_tokens(now).await {
            Ok(count) => report.tokens = count,
            Err(err) => error!("Failed to prune one-time tokens: {err:#}"),
        }
        match self.counters.purge_expired().await {
            Ok(count) => report.counters = count,
            Err(err) => error!("Failed to purge counters: {err:#}"),
        }
        report
    }

    /// Runs `sweep_once` every `interval` until the task is aborted.
    #[must_use]
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep_once(Utc::now()).await;
                if report != SweepReport::default() {
                    info!(
                        sessions = report.sessions,
                        tokens = report.tokens,
                        counters = report.counters,
                        "auth sweep removed stale rows"
                    );
                }
            }
        })
    }
}

/// Starts the background sweeper with the configured interval and retention.
#[must_use]
pub fn spawn_sweeper(
    sessions: Arc<dyn SessionStore>,
    tokens: Arc<dyn TokenStore>,
    counters: Arc<dyn CounterStore>,
    config: &AuthConfig,
) -> JoinHandle<()> {
    Sweeper::new(sessions, tokens, counters, config.rotated_retention())
        .spawn(config.sweep_interval())
}
