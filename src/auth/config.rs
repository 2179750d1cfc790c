//! Immutable configuration for the auth core.
//!
//! Built once at startup from CLI arguments and passed to each component.

use secrecy::{ExposeSecret, SecretString};
use std::time::Duration;

const DEFAULT_ACCESS_TTL_SECONDS: u64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_VERIFICATION_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_RESET_TTL_SECONDS: u64 = 60 * 60;
const DEFAULT_LOCKOUT_THRESHOLD: i64 = 5;
const DEFAULT_LOCKOUT_WINDOW_SECONDS: u64 = 30 * 60;
const DEFAULT_LOCK_DURATION_SECONDS: u64 = 30 * 60;
const DEFAULT_FORGOT_LIMIT: i64 = 5;
const DEFAULT_FORGOT_WINDOW_SECONDS: u64 = 60 * 60;
const DEFAULT_RESEND_COOLDOWN_SECONDS: u64 = 60;
const DEFAULT_ROTATED_RETENTION_SECONDS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_SWEEP_INTERVAL_SECONDS: u64 = 15 * 60;

#[derive(Clone, Debug)]
pub struct AuthConfig {
    app_base_url: String,
    frontend_base_url: String,
    refresh_pepper: SecretString,
    access_ttl: Duration,
    refresh_ttl: Duration,
    verification_ttl: Duration,
    reset_ttl: Duration,
    lockout_threshold: i64,
    lockout_window: Duration,
    lock_duration: Duration,
    forgot_limit: i64,
    forgot_window: Duration,
    resend_cooldown: Duration,
    rotated_retention: Duration,
    sweep_interval: Duration,
}

impl AuthConfig {
    #[must_use]
    pub fn new(app_base_url: String, frontend_base_url: String, refresh_pepper: SecretString) -> Self {
        Self {
            app_base_url,
            frontend_base_url,
            refresh_pepper,
            access_ttl: Duration::from_secs(DEFAULT_ACCESS_TTL_SECONDS),
            refresh_ttl: Duration::from_secs(DEFAULT_REFRESH_TTL_SECONDS),
            verification_ttl: Duration::from_secs(DEFAULT_VERIFICATION_TTL_SECONDS),
            reset_ttl: Duration::from_secs(DEFAULT_RESET_TTL_SECONDS),
            lockout_threshold: DEFAULT_LOCKOUT_THRESHOLD,
            lockout_window: Duration::from_secs(DEFAULT_LOCKOUT_WINDOW_SECONDS),
            lock_duration: Duration::from_secs(DEFAULT_LOCK_DURATION_SECONDS),
            forgot_limit: DEFAULT_FORGOT_LIMIT,
            forgot_window: Duration::from_secs(DEFAULT_FORGOT_WINDOW_SECONDS),
            resend_cooldown: Duration::from_secs(DEFAULT_RESEND_COOLDOWN_SECONDS),
            rotated_retention: Duration::from_secs(DEFAULT_ROTATED_RETENTION_SECONDS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECONDS),
        }
    }

    #[must_use]
    pub fn with_access_ttl_seconds(mut self, seconds: u64) -> Self {
        self.access_ttl = Duration::from_secs(seconds);
        self
    }

    #[must_use]
    pub fn with_refresh_ttl_days(mut self, days: u64) -> Self {
        self.refresh_ttl = Duration::from_secs(days.saturating_mul(24 * 60 * 60));
        self
    }

    #[must_use]
    pub fn with_refresh_ttl(mut self, ttl: Duration) -> Self {
        self.refresh_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_verification_ttl(mut self, ttl: Duration) -> Self {
        self.verification_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_reset_ttl(mut self, ttl: Duration) -> Self {
        self.reset_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_lockout(mut self, threshold: i64, window: Duration, lock: Duration) -> Self {
        self.lockout_threshold = threshold.max(1);
        self.lockout_window = window;
        self.lock_duration = lock;
        self
    }

    #[must_use]
    pub fn with_forgot_limit(mut self, limit: i64, window: Duration) -> Self {
        self.forgot_limit = limit.max(1);
        self.forgot_window = window;
        self
    }

    #[must_use]
    pub fn with_resend_cooldown(mut self, cooldown: Duration) -> Self {
        self.resend_cooldown = cooldown;
        self
    }

    #[must_use]
    pub fn with_rotated_retention(mut self, retention: Duration) -> Self {
        self.rotated_retention = retention;
        self
    }

    #[must_use]
    pub fn with_sweep_interval_seconds(mut self, seconds: u64) -> Self {
        self.sweep_interval = Duration::from_secs(seconds.max(1));
        self
    }

    #[must_use]
    pub fn app_base_url(&self) -> &str {
        &self.app_base_url
    }

    #[must_use]
    pub fn frontend_base_url(&self) -> &str {
        &self.frontend_base_url
    }

    pub(crate) fn refresh_pepper(&self) -> &str {
        self.refresh_pepper.expose_secret()
    }

    #[must_use]
    pub fn access_ttl(&self) -> Duration {
        self.access_ttl
    }

    #[must_use]
    pub fn refresh_ttl(&self) -> Duration {
        self.refresh_ttl
    }

    #[must_use]
    pub fn verification_ttl(&self) -> Duration {
        self.verification_ttl
    }

    #[must_use]
    pub fn reset_ttl(&self) -> Duration {
        self.reset_ttl
    }

    #[must_use]
    pub fn lockout_threshold(&self) -> i64 {
        self.lockout_threshold
    }

    #[must_use]
    pub fn lockout_window(&self) -> Duration {
        self.lockout_window
    }

    #[must_use]
    pub fn lock_duration(&self) -> Duration {
        self.lock_duration
    }

    #[must_use]
    pub fn forgot_limit(&self) -> i64 {
        self.forgot_limit
    }

    #[must_use]
    pub fn forgot_window(&self) -> Duration {
        self.forgot_window
    }

    #[must_use]
    pub fn resend_cooldown(&self) -> Duration {
        self.resend_cooldown
    }

    #[must_use]
    pub fn rotated_retention(&self) -> Duration {
        self.rotated_retention
    }

    #[must_use]
    pub fn sweep_interval(&self) -> Duration {
        self.sweep_interval
    }
}

/// Converts a std duration to a chrono duration, saturating on overflow.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

/// `from + duration`, clamped to the largest representable instant.
pub(crate) fn expires_after(
    from: chrono::DateTime<chrono::Utc>,
    duration: Duration,
) -> chrono::DateTime<chrono::Utc> {
    from.checked_add_signed(chrono_duration(duration))
        .unwrap_or(chrono::DateTime::<chrono::Utc>::MAX_UTC)
}
