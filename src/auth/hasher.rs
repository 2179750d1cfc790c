//! Argon2id hashing for passwords and peppered tokens.
//!
//! Hashes are PHC strings with an embedded random salt. Verification never
//! errors: malformed hashes, join failures and mismatches all read as `false`.
//! Every hash runs on the blocking pool so request workers are never stalled.

use anyhow::{Context, Result, anyhow};
use argon2::password_hash::{
    PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng,
};
use argon2::{Algorithm, Argon2, Params, Version};
use tracing::warn;

#[derive(Clone, Debug)]
pub struct CredentialHasher {
    params: Params,
}

impl Default for CredentialHasher {
    fn default() -> Self {
        Self {
            params: Params::default(),
        }
    }
}

impl CredentialHasher {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Custom cost parameters (tests use tiny ones).
    #[must_use]
    pub fn with_params(params: Params) -> Self {
        Self { params }
    }

    fn argon2(params: Params) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }

    /// # Errors
    /// Returns an error if hashing fails or the blocking task is cancelled.
    pub async fn hash_password(&self, plain: &str) -> Result<String> {
        let params = self.params.clone();
        let plain = plain.to_string();
        tokio::task::spawn_blocking(move || {
            let salt = SaltString::generate(&mut OsRng);
            Self::argon2(params)
                .hash_password(plain.as_bytes(), &salt)
                .map(|hash| hash.to_string())
                .map_err(|err| anyhow!("argon2 hash failed: {err}"))
        })
        .await
        .context("hashing task failed")?
    }

    pub async fn verify_password(&self, hash: &str, plain: &str) -> bool {
        let params = self.params.clone();
        let hash = hash.to_string();
        let plain = plain.to_string();
        let outcome = tokio::task::spawn_blocking(move || {
            PasswordHash::new(&hash).is_ok_and(|parsed| {
                Self::argon2(params)
                    .verify_password(plain.as_bytes(), &parsed)
                    .is_ok()
            })
        })
        .await;

        outcome.unwrap_or_else(|err| {
            warn!("Password verification task failed: {err}");
            false
        })
    }

    /// # Errors
    /// Returns an error if hashing fails.
    pub async fn hash_with_pepper(&self, value: &str, pepper: &str) -> Result<String> {
        self.hash_password(&peppered(value, pepper)).await
    }

    pub async fn verify_with_pepper(&self, hash: &str, value: &str, pepper: &str) -> bool {
        self.verify_password(hash, &peppered(value, pepper)).await
    }
}

fn peppered(value: &str, pepper: &str) -> String {
    format!("{value}|{pepper}")
}

#[cfg(test)]
pub(crate) fn test_hasher() -> CredentialHasher {
    // 8 KiB, one pass: fast enough for unit tests.
    Params::new(8, 1, 1, None).map_or_else(|_| CredentialHasher::new(), CredentialHasher::with_params)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn password_round_trip() -> Result<()> {
        let hasher = test_hasher();
        let hash = hasher.hash_password("Secret123").await?;
        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify_password(&hash, "Secret123").await);
        assert!(!hasher.verify_password(&hash, "Secret124").await);
        Ok(())
    }

    #[tokio::test]
    async fn hashes_are_salted() -> Result<()> {
        let hasher = test_hasher();
        let first = hasher.hash_password("same").await?;
        let second = hasher.hash_password("same").await?;
        assert_ne!(first, second);
        Ok(())
    }

    #[tokio::test]
    async fn verify_never_errors_on_garbage() {
        let hasher = test_hasher();
        assert!(!hasher.verify_password("not-a-phc-string", "x").await);
        assert!(!hasher.verify_password("", "").await);
    }

    #[tokio::test]
    async fn pepper_is_required_to_verify() -> Result<()> {
        let hasher = test_hasher();
        let hash = hasher.hash_with_pepper("token", "pepper-a").await?;
        assert!(hasher.verify_with_pepper(&hash, "token", "pepper-a").await);
        assert!(!hasher.verify_with_pepper(&hash, "token", "pepper-b").await);
        assert!(!hasher.verify_password(&hash, "token").await);
        Ok(())
    }
}
