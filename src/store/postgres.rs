//! `PostgreSQL` implementation of the storage collaborators.
//!
//! All statements are parameterized. Each query runs inside a `db.query` span.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};
use std::time::Duration;
use tracing::Instrument;
use uuid::Uuid;

use super::{
    AuditEntry, CounterStore, CreateUserOutcome, NewUser, OneTimeToken, Session, SessionStore,
    TokenKind, TokenStore, User, UserStore,
};

const USER_COLUMNS: &str =
    "id, email, name, password_hash, email_verified, role, locked_until, created_at";

macro_rules! db_span {
    ($operation:expr, $query:expr) => {
        tracing::info_span!(
            "db.query",
            db.system = "postgresql",
            db.operation = $operation,
            db.statement = $query
        )
    };
}

#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn user_from_row(row: &PgRow) -> Result<User> {
    let role: String = row.try_get("role")?;
    Ok(User {
        id: row.try_get("id")?,
        email: row.try_get("email")?,
        name: row.try_get("name")?,
        password_hash: row.try_get("password_hash")?,
        email_verified: row.try_get("email_verified")?,
        role: role.parse()?,
        locked_until: row.try_get("locked_until")?,
        created_at: row.try_get("created_at")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        family_id: row.try_get("family_id")?,
        refresh_hash: row.try_get("refresh_hash")?,
        expires_at: row.try_get("expires_at")?,
        rotated: row.try_get("rotated")?,
        created_at: row.try_get("created_at")?,
    })
}

fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX)
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE email = $1");
        let row = sqlx::query(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to lookup user by email")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        let query = format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query.as_str()))
            .await
            .context("failed to lookup user by id")?;
        row.as_ref().map(user_from_row).transpose()
    }

    async fn create_user(&self, user: NewUser) -> Result<CreateUserOutcome> {
        let query = format!(
            "INSERT INTO users (email, name, password_hash) VALUES ($1, $2, $3) RETURNING {USER_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(&user.email)
            .bind(&user.name)
            .bind(&user.password_hash)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT", query.as_str()))
            .await;

        match row {
            Ok(row) => Ok(CreateUserOutcome::Created(user_from_row(&row)?)),
            Err(err) if is_unique_violation(&err) => Ok(CreateUserOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn mark_email_verified(&self, id: Uuid) -> Result<()> {
        let query = "UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to mark email verified")?;
        Ok(())
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(password_hash)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to update password")?;
        Ok(())
    }

    async fn redeem_email_verification(&self, token_id: Uuid) -> Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await.context("begin verification transaction")?;

        let query = VERIFICATION_QUERIES.consume;
        let row = sqlx::query(query)
            .bind(token_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to consume verification token")?;
        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Ok(None);
        };
        let user_id: Uuid = row.try_get("user_id").context("failed to decode token owner")?;

        let query = "UPDATE users SET email_verified = TRUE, updated_at = NOW() WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to mark email verified")?;

        tx.commit().await.context("commit verification transaction")?;
        Ok(Some(user_id))
    }

    async fn redeem_password_reset(
        &self,
        token_id: Uuid,
        password_hash: &str,
    ) -> Result<Option<(Uuid, u64)>> {
        // Token delete, password update and session purge commit together.
        let mut tx = self.pool.begin().await.context("begin reset transaction")?;

        let query = RESET_QUERIES.consume;
        let row = sqlx::query(query)
            .bind(token_id)
            .fetch_optional(&mut *tx)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to consume reset token")?;
        let Some(row) = row else {
            let _ = tx.rollback().await;
            return Ok(None);
        };
        let user_id: Uuid = row.try_get("user_id").context("failed to decode token owner")?;

        let query = "UPDATE users SET password_hash = $2, updated_at = NOW() WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .execute(&mut *tx)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to update password")?;

        let query = "DELETE FROM sessions WHERE user_id = $1";
        let revoked = sqlx::query(query)
            .bind(user_id)
            .execute(&mut *tx)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to delete user sessions")?
            .rows_affected();

        tx.commit().await.context("commit reset transaction")?;
        Ok(Some((user_id, revoked)))
    }

    async fn set_locked_until(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<bool> {
        let query = "UPDATE users SET locked_until = $2, updated_at = NOW() WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .bind(until)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to update locked_until")?;
        Ok(result.rows_affected() > 0)
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<()> {
        let query = r"
            INSERT INTO audit_log (actor_id, action, target_id, metadata)
            VALUES ($1, $2, $3, $4)
        ";
        sqlx::query(query)
            .bind(entry.actor_id)
            .bind(&entry.action)
            .bind(entry.target_id)
            .bind(sqlx::types::Json(&entry.metadata))
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to insert audit log row")?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        let query = r"
            INSERT INTO sessions (id, user_id, family_id, refresh_hash, expires_at, rotated, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(session.family_id)
            .bind(&session.refresh_hash)
            .bind(session.expires_at)
            .bind(session.rotated)
            .bind(session.created_at)
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>> {
        let query = r"
            SELECT id, user_id, family_id, refresh_hash, expires_at, rotated, created_at
            FROM sessions
            WHERE id = $1
        ";
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .context("failed to lookup session")?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn rotate_session(
        &self,
        old_id: Uuid,
        expected_hash: &str,
        next: &Session,
    ) -> Result<bool> {
        // Flag and child insert commit together; a failed guard rolls back.
        let mut tx = self.pool.begin().await.context("begin rotation transaction")?;

        let query = r"
            UPDATE sessions
            SET rotated = TRUE
            WHERE id = $1
              AND rotated = FALSE
              AND refresh_hash = $2
        ";
        let result = sqlx::query(query)
            .bind(old_id)
            .bind(expected_hash)
            .execute(&mut *tx)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to mark session rotated")?;

        if result.rows_affected() == 0 {
            let _ = tx.rollback().await;
            return Ok(false);
        }

        let query = r"
            INSERT INTO sessions (id, user_id, family_id, refresh_hash, expires_at, rotated, created_at)
            VALUES ($1, $2, $3, $4, $5, FALSE, $6)
        ";
        sqlx::query(query)
            .bind(next.id)
            .bind(next.user_id)
            .bind(next.family_id)
            .bind(&next.refresh_hash)
            .bind(next.expires_at)
            .bind(next.created_at)
            .execute(&mut *tx)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to insert rotated session")?;

        tx.commit().await.context("commit rotation transaction")?;
        Ok(true)
    }

    async fn delete_session(&self, id: Uuid) -> Result<u64> {
        // Logout is idempotent; it's fine if no rows are deleted.
        let query = "DELETE FROM sessions WHERE id = $1";
        let result = sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to delete session")?;
        Ok(result.rows_affected())
    }

    async fn delete_session_family(&self, family_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM sessions WHERE family_id = $1";
        let result = sqlx::query(query)
            .bind(family_id)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to delete session family")?;
        Ok(result.rows_affected())
    }

    async fn delete_sessions_for_user(&self, user_id: Uuid) -> Result<u64> {
        let query = "DELETE FROM sessions WHERE user_id = $1";
        let result = sqlx::query(query)
            .bind(user_id)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to delete user sessions")?;
        Ok(result.rows_affected())
    }

    async fn prune_sessions(
        &self,
        now: DateTime<Utc>,
        rotated_before: DateTime<Utc>,
    ) -> Result<u64> {
        let query = r"
            DELETE FROM sessions
            WHERE expires_at <= $1
               OR (rotated = TRUE AND created_at < $2)
        ";
        let result = sqlx::query(query)
            .bind(now)
            .bind(rotated_before)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to prune sessions")?;
        Ok(result.rows_affected())
    }
}

struct TokenQueries {
    insert: &'static str,
    unexpired: &'static str,
    consume: &'static str,
    prune: &'static str,
}

const VERIFICATION_QUERIES: TokenQueries = TokenQueries {
    insert: "INSERT INTO email_verifications (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
    unexpired: "SELECT id, user_id, token_hash, expires_at FROM email_verifications WHERE expires_at > $1",
    consume: "DELETE FROM email_verifications WHERE id = $1 RETURNING user_id",
    prune: "DELETE FROM email_verifications WHERE expires_at <= $1",
};

const RESET_QUERIES: TokenQueries = TokenQueries {
    insert: "INSERT INTO password_resets (id, user_id, token_hash, expires_at) VALUES ($1, $2, $3, $4)",
    unexpired: "SELECT id, user_id, token_hash, expires_at FROM password_resets WHERE expires_at > $1",
    consume: "DELETE FROM password_resets WHERE id = $1 RETURNING user_id",
    prune: "DELETE FROM password_resets WHERE expires_at <= $1",
};

fn token_queries(kind: TokenKind) -> &'static TokenQueries {
    match kind {
        TokenKind::EmailVerification => &VERIFICATION_QUERIES,
        TokenKind::PasswordReset => &RESET_QUERIES,
    }
}

#[async_trait]
impl TokenStore for PgStore {
    async fn insert_token(&self, kind: TokenKind, token: &OneTimeToken) -> Result<()> {
        let query = token_queries(kind).insert;
        sqlx::query(query)
            .bind(token.id)
            .bind(token.user_id)
            .bind(&token.token_hash)
            .bind(token.expires_at)
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to insert one-time token")?;
        Ok(())
    }

    async fn unexpired_tokens(
        &self,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<OneTimeToken>> {
        let query = token_queries(kind).unexpired;
        let rows = sqlx::query(query)
            .bind(now)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .context("failed to load one-time tokens")?;

        rows.iter()
            .map(|row| {
                Ok(OneTimeToken {
                    id: row.try_get("id")?,
                    user_id: row.try_get("user_id")?,
                    token_hash: row.try_get("token_hash")?,
                    expires_at: row.try_get("expires_at")?,
                })
            })
            .collect()
    }

    async fn consume_token(&self, kind: TokenKind, id: Uuid) -> Result<Option<Uuid>> {
        // First successful delete wins; concurrent consumers see no row.
        let query = token_queries(kind).consume;
        let row = sqlx::query(query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to consume one-time token")?;
        row.map(|row| row.try_get("user_id"))
            .transpose()
            .context("failed to decode token owner")
    }

    async fn prune_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut removed = 0;
        for kind in [TokenKind::EmailVerification, TokenKind::PasswordReset] {
            let query = token_queries(kind).prune;
            let result = sqlx::query(query)
                .bind(now)
                .execute(&self.pool)
                .instrument(db_span!("DELETE", query))
                .await
                .context("failed to prune one-time tokens")?;
            removed += result.rows_affected();
        }
        Ok(removed)
    }
}

#[async_trait]
impl CounterStore for PgStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let query = r"
            SELECT value
            FROM auth_counters
            WHERE key = $1
              AND (expires_at IS NULL OR expires_at > NOW())
        ";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT", query))
            .await
            .context("failed to read counter")?;
        row.map(|row| row.try_get("value"))
            .transpose()
            .context("failed to decode counter value")
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let query = r"
            INSERT INTO auth_counters (key, value, expires_at)
            VALUES ($1, $2, NOW() + ($3 * INTERVAL '1 second'))
            ON CONFLICT (key) DO UPDATE
            SET value = EXCLUDED.value,
                expires_at = EXCLUDED.expires_at
        ";
        sqlx::query(query)
            .bind(key)
            .bind(value)
            .bind(ttl_seconds(ttl))
            .execute(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to set counter")?;
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        // Expired rows restart at 1 and lose their expiry, like a fresh key.
        let query = r"
            INSERT INTO auth_counters (key, value)
            VALUES ($1, '1')
            ON CONFLICT (key) DO UPDATE
            SET value = CASE
                    WHEN auth_counters.expires_at <= NOW() THEN '1'
                    ELSE (auth_counters.value::BIGINT + 1)::TEXT
                END,
                expires_at = CASE
                    WHEN auth_counters.expires_at <= NOW() THEN NULL
                    ELSE auth_counters.expires_at
                END
            RETURNING value::BIGINT AS count
        ";
        let row = sqlx::query(query)
            .bind(key)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT", query))
            .await
            .context("failed to increment counter")?;
        row.try_get("count").context("failed to decode counter")
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let query = r"
            UPDATE auth_counters
            SET expires_at = NOW() + ($2 * INTERVAL '1 second')
            WHERE key = $1
        ";
        sqlx::query(query)
            .bind(key)
            .bind(ttl_seconds(ttl))
            .execute(&self.pool)
            .instrument(db_span!("UPDATE", query))
            .await
            .context("failed to set counter expiry")?;
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<()> {
        let query = "DELETE FROM auth_counters WHERE key = ANY($1)";
        let keys: Vec<String> = keys.iter().map(ToString::to_string).collect();
        sqlx::query(query)
            .bind(&keys)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to delete counters")?;
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let query = "DELETE FROM auth_counters WHERE expires_at <= NOW()";
        let result = sqlx::query(query)
            .execute(&self.pool)
            .instrument(db_span!("DELETE", query))
            .await
            .context("failed to purge counters")?;
        Ok(result.rows_affected())
    }
}
