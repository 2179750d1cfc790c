//! Failed-login counters and temporary account lockout.
//!
//! Counters live in the counter store under:
//! - `auth:fail:{user_id}` for known users
//! - `auth:fail:email:{email}` for emails with no account
//!
//! The window starts on the increment that creates the key. Reaching the
//! threshold locks the user and clears the counter so the next window starts
//! fresh after the lock. Counter and mail failures are logged and swallowed:
//! login rejection never depends on them.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};
use uuid::Uuid;

use super::config::{AuthConfig, expires_after};
use crate::store::{CounterStore, Mailer, User, UserStore};

const LOCK_SUBJECT: &str = "Your account was locked";

pub(crate) fn user_key(user_id: Uuid) -> String {
    format!("auth:fail:{user_id}")
}

pub(crate) fn email_key(email: &str) -> String {
    format!("auth:fail:email:{email}")
}

#[derive(Clone)]
pub struct LockoutTracker {
    counters: Arc<dyn CounterStore>,
    users: Arc<dyn UserStore>,
    mailer: Arc<dyn Mailer>,
    threshold: i64,
    window: Duration,
    lock_duration: Duration,
}

impl LockoutTracker {
    #[must_use]
    pub fn new(
        counters: Arc<dyn CounterStore>,
        users: Arc<dyn UserStore>,
        mailer: Arc<dyn Mailer>,
        config: &AuthConfig,
    ) -> Self {
        Self {
            counters,
            users,
            mailer,
            threshold: config.lockout_threshold(),
            window: config.lockout_window(),
            lock_duration: config.lock_duration(),
        }
    }

    /// `Some(until)` while the user is locked.
    #[must_use]
    pub fn lock_state(user: &User, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        user.locked_until.filter(|until| *until > now)
    }

    /// Counts a failed login for an existing user; returns the new lock
    /// expiry when this failure reached the threshold.
    pub async fn record_user_failure(&self, user: &User) -> Option<DateTime<Utc>> {
        let key = user_key(user.id);
        let count = self.bump(&key).await?;
        if count < self.threshold {
            return None;
        }

        let until = expires_after(Utc::now(), self.lock_duration);
        match self.users.set_locked_until(user.id, Some(until)).await {
            Ok(_) => {}
            Err(err) => {
                error!(user_id = %user.id, "Failed to lock account: {err:#}");
                return None;
            }
        }
        warn!(user_id = %user.id, %until, "account locked after repeated failed logins");

        if let Err(err) = self.counters.delete(&[key.as_str()]).await {
            warn!("Failed to clear failure counter after lock: {err:#}");
        }

        let minutes = self.lock_duration.as_secs() / 60;
        let body = format!(
            "<p>Your account has been locked for {minutes} minutes due to repeated failed login attempts.</p>"
        );
        if let Err(err) = self.mailer.send(&user.email, LOCK_SUBJECT, &body).await {
            error!(user_id = %user.id, "Failed to send lockout email: {err:#}");
        }
        Some(until)
    }

    /// Counts a failed login for an email with no account. Never touches users.
    pub async fn record_unknown_email_failure(&self, email: &str) {
        let _ = self.bump(&email_key(email)).await;
    }

    /// Clears the per-user counter after a successful login.
    pub async fn record_success(&self, user_id: Uuid) {
        let key = user_key(user_id);
        if let Err(err) = self.counters.delete(&[key.as_str()]).await {
            warn!(%user_id, "Failed to clear failure counter: {err:#}");
        }
    }

    /// Clears the lock and the failure counter. Returns `false` for an unknown user.
    ///
    /// # Errors
    /// Propagates the user update failure; counter failures are logged.
    pub async fn unlock(&self, user_id: Uuid) -> anyhow::Result<bool> {
        if !self.users.set_locked_until(user_id, None).await? {
            return Ok(false);
        }
        let key = user_key(user_id);
        if let Err(err) = self.counters.delete(&[key.as_str()]).await {
            warn!(%user_id, "Failed to clear failure counter on unlock: {err:#}");
        }
        Ok(true)
    }

    /// Increments `key`, arming its window on the first hit.
    async fn bump(&self, key: &str) -> Option<i64> {
        let count = match self.counters.increment(key).await {
            Ok(count) => count,
            Err(err) => {
                warn!("Failed to increment failure counter: {err:#}");
                return None;
            }
        };
        if count == 1 {
            if let Err(err) = self.counters.expire(key, self.window).await {
                warn!("Failed to set failure counter expiry: {err:#}");
            }
        }
        Some(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{
        CreateUserOutcome, MemoryCounters, MemoryStore, NewUser, RecordingMailer,
    };
    use anyhow::{Context, Result};
    use secrecy::SecretString;

    struct Fixture {
        store: Arc<MemoryStore>,
        counters: Arc<MemoryCounters>,
        mailer: Arc<RecordingMailer>,
        tracker: LockoutTracker,
        user: User,
    }

    async fn fixture(mailer: RecordingMailer) -> Result<Fixture> {
        let store = Arc::new(MemoryStore::new());
        let counters = Arc::new(MemoryCounters::new());
        let mailer = Arc::new(mailer);
        let config = AuthConfig::new(
            "http://api.test".to_string(),
            "http://app.test".to_string(),
            SecretString::from("pepper"),
        );
        let tracker = LockoutTracker::new(counters.clone(), store.clone(), mailer.clone(), &config);
        let CreateUserOutcome::Created(user) = store
            .create_user(NewUser {
                email: "bob@example.com".to_string(),
                name: None,
                password_hash: "x".to_string(),
            })
            .await?
        else {
            anyhow::bail!("user not created");
        };
        Ok(Fixture {
            store,
            counters,
            mailer,
            tracker,
            user,
        })
    }

    #[tokio::test]
    async fn fifth_failure_locks_and_notifies() -> Result<()> {
        let fx = fixture(RecordingMailer::new()).await?;
        for _ in 0..4 {
            assert!(fx.tracker.record_user_failure(&fx.user).await.is_none());
        }
        let until = fx
            .tracker
            .record_user_failure(&fx.user)
            .await
            .context("fifth failure should lock")?;

        let stored = fx.store.find_user_by_id(fx.user.id).await?.context("user")?;
        assert_eq!(stored.locked_until, Some(until));
        assert!(LockoutTracker::lock_state(&stored, Utc::now()).is_some());

        let sent = fx.mailer.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].subject, LOCK_SUBJECT);
        assert!(fx.counters.get(&user_key(fx.user.id)).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn mail_failure_does_not_prevent_lock() -> Result<()> {
        let fx = fixture(RecordingMailer::failing()).await?;
        for _ in 0..5 {
            fx.tracker.record_user_failure(&fx.user).await;
        }
        let stored = fx.store.find_user_by_id(fx.user.id).await?.context("user")?;
        assert!(stored.locked_until.is_some());
        Ok(())
    }

    #[tokio::test]
    async fn success_resets_counter() -> Result<()> {
        let fx = fixture(RecordingMailer::new()).await?;
        for _ in 0..4 {
            fx.tracker.record_user_failure(&fx.user).await;
        }
        fx.tracker.record_success(fx.user.id).await;
        for _ in 0..4 {
            assert!(fx.tracker.record_user_failure(&fx.user).await.is_none());
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_email_counts_without_users() -> Result<()> {
        let fx = fixture(RecordingMailer::new()).await?;
        for _ in 0..6 {
            fx.tracker.record_unknown_email_failure("ghost@example.com").await;
        }
        assert_eq!(
            fx.counters.get(&email_key("ghost@example.com")).await?.as_deref(),
            Some("6")
        );
        assert!(fx.store.find_user_by_email("ghost@example.com").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn unlock_clears_lock_and_counter() -> Result<()> {
        let fx = fixture(RecordingMailer::new()).await?;
        fx.tracker.record_user_failure(&fx.user).await;
        fx.store
            .set_locked_until(fx.user.id, Some(Utc::now() + chrono::Duration::minutes(5)))
            .await?;

        assert!(fx.tracker.unlock(fx.user.id).await?);
        let stored = fx.store.find_user_by_id(fx.user.id).await?.context("user")?;
        assert!(stored.locked_until.is_none());
        assert!(fx.counters.get(&user_key(fx.user.id)).await?.is_none());

        assert!(!fx.tracker.unlock(Uuid::new_v4()).await?);
        Ok(())
    }
}
