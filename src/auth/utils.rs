//! Small helpers for input validation and one-time token handling.

use anyhow::{Context, Result};
use base64::Engine;
use rand::{RngCore, rngs::OsRng};
use regex::Regex;

use super::error::AuthError;

pub(crate) const MIN_PASSWORD_LENGTH: usize = 8;
const NAME_LENGTH: std::ops::RangeInclusive<usize> = 2..=120;

/// Normalize an email for lookup/uniqueness checks.
pub(crate) fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic email format check on already-normalized input.
pub(crate) fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

pub(crate) fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LENGTH {
        return Err(AuthError::Validation("Password must be at least 8 characters"));
    }
    Ok(())
}

/// Trims the display name; blank names become `None`.
pub(crate) fn validate_name(name: Option<&str>) -> Result<Option<String>, AuthError> {
    let Some(name) = name.map(str::trim).filter(|name| !name.is_empty()) else {
        return Ok(None);
    };
    if !NAME_LENGTH.contains(&name.chars().count()) {
        return Err(AuthError::Validation("Name must be between 2 and 120 characters"));
    }
    Ok(Some(name.to_string()))
}

/// 32 random bytes, URL-safe base64. Used for refresh and one-time tokens.
///
/// The raw value is only handed to the client; storage keeps a peppered hash.
pub(crate) fn generate_token() -> Result<String> {
    let mut bytes = [0u8; 32];
    OsRng
        .try_fill_bytes(&mut bytes)
        .context("failed to generate token")?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// API link that confirms an email address.
pub(crate) fn build_verify_url(app_base_url: &str, token: &str) -> String {
    let base = app_base_url.trim_end_matches('/');
    format!("{base}/api/v1/auth/verify?token={token}")
}

/// Frontend page where the user picks a new password.
pub(crate) fn build_reset_url(frontend_base_url: &str, token: &str) -> String {
    let base = frontend_base_url.trim_end_matches('/');
    format!("{base}/reset?token={token}")
}
