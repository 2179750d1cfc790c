//! Collaborator interfaces consumed by the auth core.
//!
//! Each collaborator has a narrow trait with a fixed method set. `PgStore`
//! implements the storage traits on `PostgreSQL`; `MemoryStore` and
//! `MemoryCounters` back tests and local runs.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use utoipa::ToSchema;
use uuid::Uuid;

pub mod mailer;
pub mod memory;
pub mod postgres;

pub use mailer::{LogMailer, Mailer, OutboxMailer, OutgoingEmail, RecordingMailer};
pub use memory::{MemoryCounters, MemoryStore};
pub use postgres::PgStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "USER",
            Self::Admin => "ADMIN",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value {
            "USER" => Ok(Self::User),
            "ADMIN" => Ok(Self::Admin),
            other => Err(anyhow::anyhow!("unknown role: {other}")),
        }
    }
}

#[derive(Clone, Debug)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
    pub email_verified: bool,
    pub role: Role,
    pub locked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// True while `locked_until` lies in the future.
    #[must_use]
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.locked_until.is_some_and(|until| until > now)
    }
}

/// Fields needed to create a user; the id is assigned by the store.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub email: String,
    pub name: Option<String>,
    pub password_hash: String,
}

#[derive(Debug)]
pub enum CreateUserOutcome {
    Created(User),
    Conflict,
}

/// A refresh session row. `refresh_hash` is a peppered hash, never the raw token.
#[derive(Clone, Debug)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    pub family_id: Uuid,
    pub refresh_hash: String,
    pub expires_at: DateTime<Utc>,
    pub rotated: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TokenKind {
    EmailVerification,
    PasswordReset,
}

/// Single-use, time-boxed token record (email verification or password reset).
#[derive(Clone, Debug)]
pub struct OneTimeToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct AuditEntry {
    pub actor_id: Uuid,
    pub action: String,
    pub target_id: Uuid,
    pub metadata: serde_json::Value,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>>;
    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>>;
    async fn create_user(&self, user: NewUser) -> Result<CreateUserOutcome>;
    async fn mark_email_verified(&self, id: Uuid) -> Result<()>;
    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()>;
    /// Consumes a verification token and marks its owner verified in one unit.
    ///
    /// Returns `None` when the token was already consumed.
    async fn redeem_email_verification(&self, token_id: Uuid) -> Result<Option<Uuid>>;
    /// Consumes a reset token, stores `password_hash` and deletes every session
    /// of the owner in one unit. Nothing changes when any step fails.
    ///
    /// Returns the owner and the number of revoked sessions, or `None` when the
    /// token was already consumed.
    async fn redeem_password_reset(
        &self,
        token_id: Uuid,
        password_hash: &str,
    ) -> Result<Option<(Uuid, u64)>>;
    /// Returns `false` when no user has the given id.
    async fn set_locked_until(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<bool>;
    async fn record_audit(&self, entry: AuditEntry) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert_session(&self, session: &Session) -> Result<()>;
    async fn find_session(&self, id: Uuid) -> Result<Option<Session>>;
    /// Marks `old_id` rotated and inserts `next` atomically.
    ///
    /// The update only applies while the old row is unrotated and still holds
    /// `expected_hash`. Returns `false` (and inserts nothing) when the guard fails.
    async fn rotate_session(
        &self,
        old_id: Uuid,
        expected_hash: &str,
        next: &Session,
    ) -> Result<bool>;
    async fn delete_session(&self, id: Uuid) -> Result<u64>;
    async fn delete_session_family(&self, family_id: Uuid) -> Result<u64>;
    async fn delete_sessions_for_user(&self, user_id: Uuid) -> Result<u64>;
    /// Deletes expired sessions and rotated sessions created before `rotated_before`.
    async fn prune_sessions(
        &self,
        now: DateTime<Utc>,
        rotated_before: DateTime<Utc>,
    ) -> Result<u64>;
}

#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn insert_token(&self, kind: TokenKind, token: &OneTimeToken) -> Result<()>;
    async fn unexpired_tokens(
        &self,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<OneTimeToken>>;
    /// Deletes the token and returns its owner; `None` if it was already consumed.
    async fn consume_token(&self, kind: TokenKind, id: Uuid) -> Result<Option<Uuid>>;
    async fn prune_tokens(&self, now: DateTime<Utc>) -> Result<u64>;
}

/// Ephemeral counters and flags with optional expiry.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
    /// Atomically increments and returns the new count (missing keys start at 0).
    async fn increment(&self, key: &str) -> Result<i64>;
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;
    async fn delete(&self, keys: &[&str]) -> Result<()>;

    async fn purge_expired(&self) -> Result<u64> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_round_trips_through_str() {
        assert_eq!("ADMIN".parse::<Role>().ok(), Some(Role::Admin));
        assert_eq!("USER".parse::<Role>().ok(), Some(Role::User));
        assert!("root".parse::<Role>().is_err());
        assert_eq!(Role::Admin.to_string(), "ADMIN");
    }

    #[test]
    fn user_lock_respects_now() {
        let now = Utc::now();
        let mut user = User {
            id: Uuid::new_v4(),
            email: "a@example.com".to_string(),
            name: None,
            password_hash: String::new(),
            email_verified: false,
            role: Role::User,
            locked_until: None,
            created_at: now,
        };
        assert!(!user.is_locked(now));
        user.locked_until = Some(now + chrono::Duration::minutes(5));
        assert!(user.is_locked(now));
        user.locked_until = Some(now - chrono::Duration::seconds(1));
        assert!(!user.is_locked(now));
    }
}
