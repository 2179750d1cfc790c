//! Counter-backed rate limiting for email-driven auth flows.
//!
//! - Forgot password: at most `forgot_limit` requests per email per window
//!   (`ratelimit:forgot:{email}`, increment-and-check).
//! - Resend verification: one request per email per cooldown
//!   (`ratelimit:resend:{email}`, flag with expiry).
//!
//! Counter failures fail open: the flows they guard are best-effort emails.

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use super::config::AuthConfig;
use crate::store::CounterStore;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitAction {
    ForgotPassword,
    ResendVerification,
}

impl RateLimitAction {
    fn key(self, email: &str) -> String {
        match self {
            Self::ForgotPassword => format!("ratelimit:forgot:{email}"),
            Self::ResendVerification => format!("ratelimit:resend:{email}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Clone)]
pub struct RateLimiter {
    counters: Arc<dyn CounterStore>,
    forgot_limit: i64,
    forgot_window: Duration,
    resend_cooldown: Duration,
}

impl RateLimiter {
    #[must_use]
    pub fn new(counters: Arc<dyn CounterStore>, config: &AuthConfig) -> Self {
        Self {
            counters,
            forgot_limit: config.forgot_limit(),
            forgot_window: config.forgot_window(),
            resend_cooldown: config.resend_cooldown(),
        }
    }

    pub async fn check_email(&self, email: &str, action: RateLimitAction) -> RateLimitDecision {
        let key = action.key(email);
        match action {
            RateLimitAction::ForgotPassword => self.check_window(&key).await,
            RateLimitAction::ResendVerification => self.check_cooldown(&key).await,
        }
    }

    async fn check_window(&self, key: &str) -> RateLimitDecision {
        let count = match self.counters.increment(key).await {
            Ok(count) => count,
            Err(err) => {
                warn!("Failed to increment rate limit counter: {err:#}");
                return RateLimitDecision::Allowed;
            }
        };
        if count == 1 {
            if let Err(err) = self.counters.expire(key, self.forgot_window).await {
                warn!("Failed to set rate limit expiry: {err:#}");
            }
        }
        if count > self.forgot_limit {
            RateLimitDecision::Limited
        } else {
            RateLimitDecision::Allowed
        }
    }

    async fn check_cooldown(&self, key: &str) -> RateLimitDecision {
        match self.counters.get(key).await {
            Ok(Some(_)) => return RateLimitDecision::Limited,
            Ok(None) => {}
            Err(err) => {
                warn!("Failed to read cooldown flag: {err:#}");
                return RateLimitDecision::Allowed;
            }
        }
        if let Err(err) = self
            .counters
            .set_with_expiry(key, "1", self.resend_cooldown)
            .await
        {
            warn!("Failed to set cooldown flag: {err:#}");
        }
        RateLimitDecision::Allowed
    }
}
