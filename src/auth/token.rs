//! Short-lived HS256 access tokens.
//!
//! Tokens are signed with the active secret version and carry its `kid`.
//! Verification accepts any unexpired version, so a rotation never
//! invalidates tokens already in flight.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

use super::config::expires_after;
use super::secrets::SecretStore;
use crate::store::Role;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessClaims {
    pub sub: String,
    pub role: Role,
    pub iat: i64,
    pub exp: i64,
}

impl AccessClaims {
    #[must_use]
    pub fn subject_id(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.sub).ok()
    }
}

#[derive(Clone, Debug)]
pub struct TokenIssuer {
    secrets: Arc<SecretStore>,
    access_ttl: Duration,
}

impl TokenIssuer {
    #[must_use]
    pub fn new(secrets: Arc<SecretStore>, access_ttl: Duration) -> Self {
        Self {
            secrets,
            access_ttl,
        }
    }

    /// Lifetime of issued tokens in seconds (`expiresIn` in responses).
    #[must_use]
    pub fn expires_in(&self) -> u64 {
        self.access_ttl.as_secs()
    }

    /// # Errors
    /// Returns an error when no active secret exists or encoding fails.
    pub fn sign_access_token(&self, subject: Uuid, role: Role) -> Result<String> {
        self.sign_at(subject, role, Utc::now())
    }

    pub(crate) fn sign_at(&self, subject: Uuid, role: Role, now: DateTime<Utc>) -> Result<String> {
        let secret = self
            .secrets
            .active_secret()
            .context("cannot sign access token")?;

        let claims = AccessClaims {
            sub: subject.to_string(),
            role,
            iat: now.timestamp(),
            exp: expires_after(now, self.access_ttl).timestamp(),
        };
        let header = Header {
            kid: Some(secret.kid()),
            ..Header::new(Algorithm::HS256)
        };

        encode(
            &header,
            &claims,
            &EncodingKey::from_secret(secret.value.expose_secret().as_bytes()),
        )
        .context("failed to encode access token")
    }

    /// Returns `None` for any malformed, expired or unverifiable token.
    #[must_use]
    pub fn verify_access_token(&self, token: &str) -> Option<AccessClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        self.secrets
            .verification_secrets()
            .iter()
            .find_map(|secret| {
                let key = DecodingKey::from_secret(secret.value.expose_secret().as_bytes());
                decode::<AccessClaims>(token, &key, &validation)
                    .map_err(|err| debug!(kid = %secret.kid(), "access token rejected: {err}"))
                    .ok()
            })
            .map(|data| data.claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::secrets::DEFAULT_GRACE;

    const SECRET_A: &str = "0123456789abcdef0123456789abcdef";
    const SECRET_B: &str = "fedcba9876543210fedcba9876543210";

    fn issuer() -> Result<(Arc<SecretStore>, TokenIssuer)> {
        let secrets = Arc::new(SecretStore::new(DEFAULT_GRACE));
        secrets.rotate_secret(SECRET_A)?;
        let issuer = TokenIssuer::new(secrets.clone(), Duration::from_secs(900));
        Ok((secrets, issuer))
    }

    #[test]
    fn sign_then_verify() -> Result<()> {
        let (_, issuer) = issuer()?;
        let subject = Uuid::new_v4();
        let token = issuer.sign_access_token(subject, Role::Admin)?;

        let claims = issuer.verify_access_token(&token).context("token rejected")?;
        assert_eq!(claims.subject_id(), Some(subject));
        assert_eq!(claims.role, Role::Admin);
        assert_eq!(claims.exp - claims.iat, 900);
        Ok(())
    }

    #[test]
    fn header_names_secret_version() -> Result<()> {
        let (_, issuer) = issuer()?;
        let token = issuer.sign_access_token(Uuid::new_v4(), Role::User)?;
        let header = jsonwebtoken::decode_header(&token)?;
        assert_eq!(header.kid.as_deref(), Some("v1"));
        assert_eq!(header.alg, Algorithm::HS256);
        Ok(())
    }

    #[test]
    fn rejects_garbage_and_tampering() -> Result<()> {
        let (_, issuer) = issuer()?;
        assert!(issuer.verify_access_token("").is_none());
        assert!(issuer.verify_access_token("a.b.c").is_none());

        let token = issuer.sign_access_token(Uuid::new_v4(), Role::User)?;
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(issuer.verify_access_token(&tampered).is_none());
        Ok(())
    }

    #[test]
    fn rejects_expired() -> Result<()> {
        let (_, issuer) = issuer()?;
        let issued = Utc::now() - chrono::Duration::hours(1);
        let token = issuer.sign_at(Uuid::new_v4(), Role::User, issued)?;
        assert!(issuer.verify_access_token(&token).is_none());
        Ok(())
    }

    #[test]
    fn tokens_survive_rotation_within_grace() -> Result<()> {
        let (secrets, issuer) = issuer()?;
        let old = issuer.sign_access_token(Uuid::new_v4(), Role::User)?;

        secrets.rotate_secret(SECRET_B)?;
        let new = issuer.sign_access_token(Uuid::new_v4(), Role::User)?;

        assert!(issuer.verify_access_token(&old).is_some());
        assert!(issuer.verify_access_token(&new).is_some());
        assert_eq!(jsonwebtoken::decode_header(&new)?.kid.as_deref(), Some("v2"));
        Ok(())
    }

    #[test]
    fn tokens_from_unknown_secret_are_rejected() -> Result<()> {
        let (_, issuer) = issuer()?;
        let foreign = Arc::new(SecretStore::new(DEFAULT_GRACE));
        foreign.rotate_secret(SECRET_B)?;
        let other = TokenIssuer::new(foreign, Duration::from_secs(900));

        let token = other.sign_access_token(Uuid::new_v4(), Role::User)?;
        assert!(issuer.verify_access_token(&token).is_none());
        Ok(())
    }

    #[test]
    fn signing_without_secret_fails() {
        let issuer = TokenIssuer::new(Arc::new(SecretStore::new(DEFAULT_GRACE)), Duration::from_secs(60));
        assert!(issuer.sign_access_token(Uuid::new_v4(), Role::User).is_err());
    }
}
