//! Typed failures returned by the auth core.

use chrono::{DateTime, Utc};

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("Email already registered")]
    EmailExists,
    #[error("Invalid credentials")]
    InvalidCredentials,
    #[error("Account locked until {until}")]
    AccountLocked { until: DateTime<Utc> },
    #[error("Invalid session")]
    InvalidSession,
    #[error("Session expired")]
    SessionExpired,
    #[error("Invalid refresh token")]
    InvalidRefreshToken,
    #[error("Invalid or expired token")]
    InvalidOrExpiredToken,
    #[error("Rate limit exceeded")]
    RateLimited,
    #[error("{0}")]
    Validation(&'static str),
    #[error("User not found")]
    UserNotFound,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl AuthError {
    /// Stable machine-readable kind, used in response bodies and logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::EmailExists => "EMAIL_EXISTS",
            Self::InvalidCredentials => "INVALID_CREDENTIALS",
            Self::AccountLocked { .. } => "ACCOUNT_LOCKED",
            Self::InvalidSession => "INVALID_SESSION",
            Self::SessionExpired => "SESSION_EXPIRED",
            Self::InvalidRefreshToken => "INVALID_REFRESH_TOKEN",
            Self::InvalidOrExpiredToken => "INVALID_OR_EXPIRED_TOKEN",
            Self::RateLimited => "RATE_LIMITED",
            Self::Validation(_) => "VALIDATION",
            Self::UserNotFound => "USER_NOT_FOUND",
            Self::Internal(_) => "INTERNAL",
        }
    }
}

impl From<tokio::task::JoinError> for AuthError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Internal(anyhow::Error::new(err).context("auth task failed"))
    }
}
