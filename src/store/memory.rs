//! In-memory collaborators for tests and single-process development runs.

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    AuditEntry, CounterStore, CreateUserOutcome, NewUser, OneTimeToken, Role, Session,
    SessionStore, TokenKind, TokenStore, User, UserStore,
};

#[derive(Default)]
struct MemoryState {
    users: HashMap<Uuid, User>,
    sessions: HashMap<Uuid, Session>,
    tokens: HashMap<TokenKind, HashMap<Uuid, OneTimeToken>>,
    audit: Vec<AuditEntry>,
}

/// Users, sessions and one-time tokens behind a single async mutex.
///
/// Every trait method holds the lock for its whole body, which gives the same
/// atomicity as the guarded SQL statements in `PgStore`.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_user_updates: AtomicBool,
    fail_session_deletes: AtomicBool,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes user row updates fail until cleared.
    pub fn fail_user_updates(&self, fail: bool) {
        self.fail_user_updates.store(fail, Ordering::SeqCst);
    }

    /// Makes bulk session deletes fail until cleared.
    pub fn fail_session_deletes(&self, fail: bool) {
        self.fail_session_deletes.store(fail, Ordering::SeqCst);
    }

    fn check_user_updates(&self) -> Result<()> {
        if self.fail_user_updates.load(Ordering::SeqCst) {
            bail!("user update rejected");
        }
        Ok(())
    }

    fn check_session_deletes(&self) -> Result<()> {
        if self.fail_session_deletes.load(Ordering::SeqCst) {
            bail!("session delete rejected");
        }
        Ok(())
    }

    pub async fn set_role(&self, id: Uuid, role: Role) -> bool {
        let mut state = self.state.lock().await;
        state.users.get_mut(&id).is_some_and(|user| {
            user.role = role;
            true
        })
    }

    pub async fn sessions_for_user(&self, user_id: Uuid) -> Vec<Session> {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .filter(|session| session.user_id == user_id)
            .cloned()
            .collect()
    }

    pub async fn tokens(&self, kind: TokenKind) -> Vec<OneTimeToken> {
        let state = self.state.lock().await;
        state
            .tokens
            .get(&kind)
            .map(|tokens| tokens.values().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    /// Moves a session's expiry; returns `false` when it does not exist.
    pub async fn expire_session(&self, id: Uuid, expires_at: DateTime<Utc>) -> bool {
        let mut state = self.state.lock().await;
        state.sessions.get_mut(&id).is_some_and(|session| {
            session.expires_at = expires_at;
            true
        })
    }

    /// Moves every token of `kind` to `expires_at`.
    pub async fn expire_tokens(&self, kind: TokenKind, expires_at: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        if let Some(tokens) = state.tokens.get_mut(&kind) {
            for token in tokens.values_mut() {
                token.expires_at = expires_at;
            }
        }
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>> {
        let state = self.state.lock().await;
        Ok(state.users.values().find(|user| user.email == email).cloned())
    }

    async fn find_user_by_id(&self, id: Uuid) -> Result<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn create_user(&self, user: NewUser) -> Result<CreateUserOutcome> {
        let mut state = self.state.lock().await;
        if state.users.values().any(|existing| existing.email == user.email) {
            return Ok(CreateUserOutcome::Conflict);
        }
        let created = User {
            id: Uuid::new_v4(),
            email: user.email,
            name: user.name,
            password_hash: user.password_hash,
            email_verified: false,
            role: Role::User,
            locked_until: None,
            created_at: Utc::now(),
        };
        state.users.insert(created.id, created.clone());
        Ok(CreateUserOutcome::Created(created))
    }

    async fn mark_email_verified(&self, id: Uuid) -> Result<()> {
        self.check_user_updates()?;
        if let Some(user) = self.state.lock().await.users.get_mut(&id) {
            user.email_verified = true;
        }
        Ok(())
    }

    async fn update_password(&self, id: Uuid, password_hash: &str) -> Result<()> {
        self.check_user_updates()?;
        if let Some(user) = self.state.lock().await.users.get_mut(&id) {
            user.password_hash = password_hash.to_string();
        }
        Ok(())
    }

    async fn redeem_email_verification(&self, token_id: Uuid) -> Result<Option<Uuid>> {
        let mut state = self.state.lock().await;
        let Some(user_id) = live_token_owner(&state, TokenKind::EmailVerification, token_id) else {
            return Ok(None);
        };
        self.check_user_updates()?;

        remove_token(&mut state, TokenKind::EmailVerification, token_id);
        if let Some(user) = state.users.get_mut(&user_id) {
            user.email_verified = true;
        }
        Ok(Some(user_id))
    }

    async fn redeem_password_reset(
        &self,
        token_id: Uuid,
        password_hash: &str,
    ) -> Result<Option<(Uuid, u64)>> {
        let mut state = self.state.lock().await;
        let Some(user_id) = live_token_owner(&state, TokenKind::PasswordReset, token_id) else {
            return Ok(None);
        };
        // Every failure point is checked before the first mutation.
        self.check_user_updates()?;
        self.check_session_deletes()?;

        remove_token(&mut state, TokenKind::PasswordReset, token_id);
        if let Some(user) = state.users.get_mut(&user_id) {
            user.password_hash = password_hash.to_string();
        }
        let before = state.sessions.len();
        state.sessions.retain(|_, session| session.user_id != user_id);
        Ok(Some((user_id, (before - state.sessions.len()) as u64)))
    }

    async fn set_locked_until(&self, id: Uuid, until: Option<DateTime<Utc>>) -> Result<bool> {
        let mut state = self.state.lock().await;
        Ok(state.users.get_mut(&id).is_some_and(|user| {
            user.locked_until = until;
            true
        }))
    }

    async fn record_audit(&self, entry: AuditEntry) -> Result<()> {
        self.state.lock().await.audit.push(entry);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert_session(&self, session: &Session) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.sessions.contains_key(&session.id) {
            anyhow::bail!("duplicate session id");
        }
        state.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_session(&self, id: Uuid) -> Result<Option<Session>> {
        Ok(self.state.lock().await.sessions.get(&id).cloned())
    }

    async fn rotate_session(
        &self,
        old_id: Uuid,
        expected_hash: &str,
        next: &Session,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        let Some(old) = state.sessions.get_mut(&old_id) else {
            return Ok(false);
        };
        if old.rotated || old.refresh_hash != expected_hash {
            return Ok(false);
        }
        old.rotated = true;
        state.sessions.insert(next.id, next.clone());
        Ok(true)
    }

    async fn delete_session(&self, id: Uuid) -> Result<u64> {
        let removed = self.state.lock().await.sessions.remove(&id);
        Ok(u64::from(removed.is_some()))
    }

    async fn delete_session_family(&self, family_id: Uuid) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state
            .sessions
            .retain(|_, session| session.family_id != family_id);
        Ok((before - state.sessions.len()) as u64)
    }

    async fn delete_sessions_for_user(&self, user_id: Uuid) -> Result<u64> {
        self.check_session_deletes()?;
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, session| session.user_id != user_id);
        Ok((before - state.sessions.len()) as u64)
    }

    async fn prune_sessions(
        &self,
        now: DateTime<Utc>,
        rotated_before: DateTime<Utc>,
    ) -> Result<u64> {
        let mut state = self.state.lock().await;
        let before = state.sessions.len();
        state.sessions.retain(|_, session| {
            session.expires_at > now && !(session.rotated && session.created_at < rotated_before)
        });
        Ok((before - state.sessions.len()) as u64)
    }
}

#[async_trait]
impl TokenStore for MemoryStore {
    async fn insert_token(&self, kind: TokenKind, token: &OneTimeToken) -> Result<()> {
        let mut state = self.state.lock().await;
        state
            .tokens
            .entry(kind)
            .or_default()
            .insert(token.id, token.clone());
        Ok(())
    }

    async fn unexpired_tokens(
        &self,
        kind: TokenKind,
        now: DateTime<Utc>,
    ) -> Result<Vec<OneTimeToken>> {
        let state = self.state.lock().await;
        Ok(state
            .tokens
            .get(&kind)
            .map(|tokens| {
                tokens
                    .values()
                    .filter(|token| token.expires_at > now)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn consume_token(&self, kind: TokenKind, id: Uuid) -> Result<Option<Uuid>> {
        let mut state = self.state.lock().await;
        Ok(state
            .tokens
            .get_mut(&kind)
            .and_then(|tokens| tokens.remove(&id))
            .map(|token| token.user_id))
    }

    async fn prune_tokens(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut state = self.state.lock().await;
        let mut removed = 0;
        for tokens in state.tokens.values_mut() {
            let before = tokens.len();
            tokens.retain(|_, token| token.expires_at > now);
            removed += (before - tokens.len()) as u64;
        }
        Ok(removed)
    }
}

fn live_token_owner(state: &MemoryState, kind: TokenKind, id: Uuid) -> Option<Uuid> {
    state
        .tokens
        .get(&kind)
        .and_then(|tokens| tokens.get(&id))
        .map(|token| token.user_id)
}

fn remove_token(state: &mut MemoryState, kind: TokenKind, id: Uuid) {
    if let Some(tokens) = state.tokens.get_mut(&kind) {
        tokens.remove(&id);
    }
}

struct CounterEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CounterEntry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Counter store with lazy expiry, mirroring the get/set/incr/expire/del contract.
#[derive(Default)]
pub struct MemoryCounters {
    entries: Mutex<HashMap<String, CounterEntry>>,
}

impl MemoryCounters {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounters {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().await;
        let now = Instant::now();
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.entries.lock().await.insert(
            key.to_string(),
            CounterEntry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn increment(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let current = match entries.get(key) {
            Some(entry) if entry.live(now) => entry.value.parse::<i64>()?,
            _ => {
                entries.remove(key);
                0
            }
        };
        let next = current + 1;
        let entry = entries.entry(key.to_string()).or_insert(CounterEntry {
            value: String::new(),
            expires_at: None,
        });
        entry.value = next.to_string();
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        if let Some(entry) = self.entries.lock().await.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn delete(&self, keys: &[&str]) -> Result<()> {
        let mut entries = self.entries.lock().await;
        for key in keys {
            entries.remove(*key);
        }
        Ok(())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let mut entries = self.entries.lock().await;
        let now = Instant::now();
        let before = entries.len();
        entries.retain(|_, entry| entry.live(now));
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    fn session(user_id: Uuid, hash: &str) -> Session {
        let id = Uuid::new_v4();
        Session {
            id,
            user_id,
            family_id: id,
            refresh_hash: hash.to_string(),
            expires_at: Utc::now() + chrono::Duration::days(1),
            rotated: false,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn create_user_rejects_duplicate_email() -> Result<()> {
        let store = MemoryStore::new();
        let new_user = NewUser {
            email: "dup@example.com".to_string(),
            name: None,
            password_hash: "hash".to_string(),
        };
        assert!(matches!(
            store.create_user(new_user.clone()).await?,
            CreateUserOutcome::Created(_)
        ));
        assert!(matches!(
            store.create_user(new_user).await?,
            CreateUserOutcome::Conflict
        ));
        Ok(())
    }

    #[tokio::test]
    async fn rotate_session_is_guarded() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let old = session(user_id, "h1");
        store.insert_session(&old).await?;

        let mut next = session(user_id, "h2");
        next.family_id = old.family_id;
        assert!(!store.rotate_session(old.id, "wrong", &next).await?);
        assert!(store.rotate_session(old.id, "h1", &next).await?);

        let mut again = session(user_id, "h3");
        again.family_id = old.family_id;
        assert!(!store.rotate_session(old.id, "h1", &again).await?);

        let stored = store.find_session(old.id).await?.context("old session")?;
        assert!(stored.rotated);
        assert_eq!(store.delete_session_family(old.family_id).await?, 2);
        Ok(())
    }

    #[tokio::test]
    async fn consume_token_only_once() -> Result<()> {
        let store = MemoryStore::new();
        let token = OneTimeToken {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            token_hash: "hash".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        store
            .insert_token(TokenKind::PasswordReset, &token)
            .await?;
        assert!(store
            .unexpired_tokens(TokenKind::EmailVerification, Utc::now())
            .await?
            .is_empty());
        assert_eq!(
            store.consume_token(TokenKind::PasswordReset, token.id).await?,
            Some(token.user_id)
        );
        assert_eq!(
            store.consume_token(TokenKind::PasswordReset, token.id).await?,
            None
        );
        Ok(())
    }

    fn one_time_token(user_id: Uuid) -> OneTimeToken {
        OneTimeToken {
            id: Uuid::new_v4(),
            user_id,
            token_hash: "hash".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        }
    }

    async fn seeded_user(store: &MemoryStore) -> Result<User> {
        let outcome = store
            .create_user(NewUser {
                email: "reset@example.com".to_string(),
                name: None,
                password_hash: "old-hash".to_string(),
            })
            .await?;
        match outcome {
            CreateUserOutcome::Created(user) => Ok(user),
            CreateUserOutcome::Conflict => anyhow::bail!("unexpected conflict"),
        }
    }

    #[tokio::test]
    async fn redeem_password_reset_applies_all_changes() -> Result<()> {
        let store = MemoryStore::new();
        let user = seeded_user(&store).await?;
        store.insert_session(&session(user.id, "a")).await?;
        store.insert_session(&session(user.id, "b")).await?;
        let token = one_time_token(user.id);
        store.insert_token(TokenKind::PasswordReset, &token).await?;

        let redeemed = store.redeem_password_reset(token.id, "new-hash").await?;
        assert_eq!(redeemed, Some((user.id, 2)));
        assert!(store.sessions_for_user(user.id).await.is_empty());
        assert!(store.tokens(TokenKind::PasswordReset).await.is_empty());
        let stored = store.find_user_by_id(user.id).await?.context("user")?;
        assert_eq!(stored.password_hash, "new-hash");

        assert_eq!(store.redeem_password_reset(token.id, "other").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn redeem_password_reset_failure_changes_nothing() -> Result<()> {
        let store = MemoryStore::new();
        let user = seeded_user(&store).await?;
        store.insert_session(&session(user.id, "a")).await?;
        let token = one_time_token(user.id);
        store.insert_token(TokenKind::PasswordReset, &token).await?;

        store.fail_session_deletes(true);
        assert!(store.redeem_password_reset(token.id, "new-hash").await.is_err());

        assert_eq!(store.sessions_for_user(user.id).await.len(), 1);
        assert_eq!(store.tokens(TokenKind::PasswordReset).await.len(), 1);
        let stored = store.find_user_by_id(user.id).await?.context("user")?;
        assert_eq!(stored.password_hash, "old-hash");
        Ok(())
    }

    #[tokio::test]
    async fn redeem_email_verification_failure_keeps_token() -> Result<()> {
        let store = MemoryStore::new();
        let user = seeded_user(&store).await?;
        let token = one_time_token(user.id);
        store.insert_token(TokenKind::EmailVerification, &token).await?;

        store.fail_user_updates(true);
        assert!(store.redeem_email_verification(token.id).await.is_err());
        assert_eq!(store.tokens(TokenKind::EmailVerification).await.len(), 1);

        store.fail_user_updates(false);
        assert_eq!(store.redeem_email_verification(token.id).await?, Some(user.id));
        let stored = store.find_user_by_id(user.id).await?.context("user")?;
        assert!(stored.email_verified);
        Ok(())
    }

    #[tokio::test]
    async fn prune_sessions_drops_expired_and_old_rotated() -> Result<()> {
        let store = MemoryStore::new();
        let user_id = Uuid::new_v4();
        let mut expired = session(user_id, "a");
        expired.expires_at = Utc::now() - chrono::Duration::seconds(1);
        let mut rotated = session(user_id, "b");
        rotated.rotated = true;
        rotated.created_at = Utc::now() - chrono::Duration::days(30);
        let live = session(user_id, "c");
        for s in [&expired, &rotated, &live] {
            store.insert_session(s).await?;
        }

        let removed = store
            .prune_sessions(Utc::now(), Utc::now() - chrono::Duration::days(7))
            .await?;
        assert_eq!(removed, 2);
        assert!(store.find_session(live.id).await?.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn counters_increment_and_expire() -> Result<()> {
        let counters = MemoryCounters::new();
        assert_eq!(counters.increment("k").await?, 1);
        assert_eq!(counters.increment("k").await?, 2);
        assert_eq!(counters.get("k").await?.as_deref(), Some("2"));

        counters.expire("k", Duration::ZERO).await?;
        assert_eq!(counters.get("k").await?, None);
        assert_eq!(counters.increment("k").await?, 1);

        counters.delete(&["k"]).await?;
        assert_eq!(counters.get("k").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn counters_set_with_expiry() -> Result<()> {
        let counters = MemoryCounters::new();
        counters
            .set_with_expiry("flag", "1", Duration::from_secs(60))
            .await?;
        assert_eq!(counters.get("flag").await?.as_deref(), Some("1"));
        counters.set_with_expiry("gone", "1", Duration::ZERO).await?;
        assert_eq!(counters.get("gone").await?, None);
        assert_eq!(counters.purge_expired().await?, 1);
        Ok(())
    }
}
