//! Signing secret validation and rotation.
//!
//! ## Validation
//!
//! `SecretsValidator` runs once at startup, before the listener binds. It
//! reports every problem at once so an operator can fix the whole set:
//!
//! - required values that are absent or empty
//! - a signing secret shorter than 32 characters
//! - a loopback database host while `FINORA_ENV=production`
//! - an API key still holding its placeholder
//!
//! Missing optional values are warnings and never block startup.
//!
//! ## Rotation
//!
//! `SecretStore` keeps every signing secret version. The newest unexpired
//! version signs; every unexpired version verifies. Rotating stamps the
//! previous versions with `now + grace` so tokens they signed keep verifying
//! until the grace window closes. Nothing is deleted synchronously.
//!
//! When opened on a directory the versions persist to `jwt-secrets.json`
//! (mode `0600` on Unix).

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};
use url::Url;

use super::config::expires_after;

pub const SIGNING_SECRET_VAR: &str = "FINORA_JWT_SECRET";
pub const DSN_VAR: &str = "FINORA_DSN";
pub const ENVIRONMENT_VAR: &str = "FINORA_ENV";
pub const OPENROUTER_KEY_VAR: &str = "FINORA_OPENROUTER_API_KEY";

pub const MIN_SECRET_LENGTH: usize = 32;
pub const DEFAULT_GRACE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const OPENROUTER_PLACEHOLDER: &str = "sk-or-v1-xxx";
const SECRETS_FILE: &str = "jwt-secrets.json";

#[derive(Debug, thiserror::Error)]
pub enum SecretError {
    #[error("no active signing secret")]
    NoActiveSecret,
    #[error("signing secret must be at least {min} characters")]
    WeakSecret { min: usize },
    #[error("secret storage failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("secret file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct SecretsValidator {
    required: Vec<String>,
    optional: Vec<String>,
}

impl Default for SecretsValidator {
    fn default() -> Self {
        Self::new(
            &[SIGNING_SECRET_VAR, DSN_VAR],
            &[OPENROUTER_KEY_VAR, ENVIRONMENT_VAR],
        )
    }
}

impl SecretsValidator {
    #[must_use]
    pub fn new(required: &[&str], optional: &[&str]) -> Self {
        Self {
            required: required.iter().map(ToString::to_string).collect(),
            optional: optional.iter().map(ToString::to_string).collect(),
        }
    }

    /// Validates a name to value map (typically built from parsed CLI args).
    #[must_use]
    pub fn validate(&self, values: &HashMap<String, String>) -> ValidationReport {
        let present = |name: &str| {
            values
                .get(name)
                .map(String::as_str)
                .filter(|value| !value.trim().is_empty())
        };

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        for name in &self.required {
            if present(name.as_str()).is_none() {
                errors.push(format!("Missing required secret: {name}"));
            }
        }

        for name in &self.optional {
            if present(name.as_str()).is_none() {
                warnings.push(format!("Optional secret not set: {name}"));
            }
        }

        let secret_len = present(SIGNING_SECRET_VAR).map_or(0, |value| value.chars().count());
        if secret_len < MIN_SECRET_LENGTH {
            errors.push(format!(
                "{SIGNING_SECRET_VAR} must be at least {MIN_SECRET_LENGTH} characters"
            ));
        }

        let production = present(ENVIRONMENT_VAR).is_some_and(|env| env == "production");
        if production && present(DSN_VAR).is_some_and(points_at_loopback) {
            errors.push(format!(
                "{DSN_VAR} points at a loopback host in production"
            ));
        }

        if present(OPENROUTER_KEY_VAR).is_some_and(|key| key == OPENROUTER_PLACEHOLDER) {
            errors.push(format!("{OPENROUTER_KEY_VAR} still holds the placeholder value"));
        }

        ValidationReport {
            valid: errors.is_empty(),
            errors,
            warnings,
        }
    }

    /// Validates the current process environment.
    #[must_use]
    pub fn validate_env(&self) -> ValidationReport {
        let names = self
            .required
            .iter()
            .chain(&self.optional)
            .map(String::as_str)
            .chain([SIGNING_SECRET_VAR, DSN_VAR, ENVIRONMENT_VAR, OPENROUTER_KEY_VAR]);

        let values = names
            .filter_map(|name| std::env::var(name).ok().map(|value| (name.to_string(), value)))
            .collect();
        self.validate(&values)
    }
}

/// Checks URL DSNs and libpq `key=value` DSNs, including `host=` overrides.
/// Unix socket paths count as local.
fn points_at_loopback(dsn: &str) -> bool {
    let Ok(url) = Url::parse(dsn) else {
        return dsn
            .split_whitespace()
            .filter_map(|pair| pair.strip_prefix("host="))
            .flat_map(|hosts| hosts.split(','))
            .any(local_host);
    };

    // postgres:// is not a special scheme, so IP literals arrive as domains
    let authority = match url.host() {
        Some(url::Host::Domain(domain)) => local_host(domain),
        Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip).is_loopback(),
        Some(url::Host::Ipv6(ip)) => ip.to_canonical().is_loopback(),
        None => false,
    };
    authority
        || url
            .query_pairs()
            .filter(|(key, _)| key == "host" || key == "hostaddr")
            .any(|(_, hosts)| hosts.split(',').any(local_host))
}

fn local_host(host: &str) -> bool {
    let host = host.trim().trim_start_matches('[').trim_end_matches(']');
    let host = host.strip_suffix('.').unwrap_or(host);
    host.starts_with('/')
        || host.eq_ignore_ascii_case("localhost")
        || host.parse::<IpAddr>().is_ok_and(|ip| ip.to_canonical().is_loopback())
}

/// A signing secret version. `kid` names it in token headers.
#[derive(Clone, Debug)]
pub struct SecretVersion {
    pub version: u32,
    pub value: SecretString,
    pub rotated_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl SecretVersion {
    #[must_use]
    pub fn kid(&self) -> String {
        format!("v{}", self.version)
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now)
    }
}

#[derive(Serialize, Deserialize)]
struct StoredVersion {
    version: u32,
    value: String,
    rotated_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct SecretStore {
    versions: RwLock<Vec<SecretVersion>>,
    grace: Duration,
    path: Option<PathBuf>,
}

impl SecretStore {
    /// In-memory store with no versions yet.
    #[must_use]
    pub fn new(grace: Duration) -> Self {
        Self {
            versions: RwLock::new(Vec::new()),
            grace,
            path: None,
        }
    }

    /// Store backed by `dir/jwt-secrets.json`, loading any existing versions.
    ///
    /// # Errors
    /// Returns an error if the directory or file cannot be read or created.
    pub fn open(dir: &Path, grace: Duration) -> Result<Self, SecretError> {
        fs::create_dir_all(dir)?;
        let path = dir.join(SECRETS_FILE);
        let versions = if path.exists() {
            let stored: Vec<StoredVersion> = serde_json::from_slice(&fs::read(&path)?)?;
            stored
                .into_iter()
                .map(|stored| SecretVersion {
                    version: stored.version,
                    value: SecretString::from(stored.value),
                    rotated_at: stored.rotated_at,
                    expires_at: stored.expires_at,
                })
                .collect()
        } else {
            Vec::new()
        };

        Ok(Self {
            versions: RwLock::new(versions),
            grace,
            path: Some(path),
        })
    }

    /// Rotates `value` in unless a live version already holds it.
    ///
    /// Returns `true` when a rotation happened.
    ///
    /// # Errors
    /// Returns an error if the secret is too short or cannot be persisted.
    pub fn ensure_secret(&self, value: &str) -> Result<bool, SecretError> {
        let now = Utc::now();
        let known = self
            .read()
            .iter()
            .any(|version| version.is_live(now) && version.value.expose_secret() == value);
        if known {
            return Ok(false);
        }
        self.rotate_secret(value)?;
        Ok(true)
    }

    /// Appends a new version and starts the grace window of the older ones.
    ///
    /// # Errors
    /// Returns an error if the secret is too short or cannot be persisted.
    pub fn rotate_secret(&self, value: &str) -> Result<u32, SecretError> {
        self.rotate_secret_at(value, Utc::now())
    }

    pub(crate) fn rotate_secret_at(&self, value: &str, now: DateTime<Utc>) -> Result<u32, SecretError> {
        if value.chars().count() < MIN_SECRET_LENGTH {
            return Err(SecretError::WeakSecret {
                min: MIN_SECRET_LENGTH,
            });
        }

        let grace_ends = expires_after(now, self.grace);
        let mut guard = self.versions.write().unwrap_or_else(PoisonError::into_inner);

        // Stamp a copy; memory only changes once the file write succeeded.
        let mut versions = guard.clone();
        for version in versions.iter_mut().filter(|version| version.is_live(now)) {
            version.expires_at = Some(
                version
                    .expires_at
                    .map_or(grace_ends, |expires_at| expires_at.min(grace_ends)),
            );
        }

        let next = versions.iter().map(|version| version.version).max().unwrap_or(0) + 1;
        versions.push(SecretVersion {
            version: next,
            value: SecretString::from(value.to_string()),
            rotated_at: now,
            expires_at: None,
        });

        if let Some(path) = &self.path {
            persist(path, &versions)?;
        }
        *guard = versions;
        info!(version = next, "signing secret rotated");
        Ok(next)
    }

    /// The newest unexpired version, used for signing.
    ///
    /// # Errors
    /// Returns `SecretError::NoActiveSecret` when every version has expired.
    pub fn active_secret(&self) -> Result<SecretVersion, SecretError> {
        self.active_secret_at(Utc::now())
    }

    pub(crate) fn active_secret_at(&self, now: DateTime<Utc>) -> Result<SecretVersion, SecretError> {
        self.read()
            .iter()
            .filter(|version| version.is_live(now))
            .max_by_key(|version| version.version)
            .cloned()
            .ok_or(SecretError::NoActiveSecret)
    }

    /// Every unexpired version; all are equally acceptable for verification.
    #[must_use]
    pub fn verification_secrets(&self) -> Vec<SecretVersion> {
        self.verification_secrets_at(Utc::now())
    }

    pub(crate) fn verification_secrets_at(&self, now: DateTime<Utc>) -> Vec<SecretVersion> {
        self.read()
            .iter()
            .filter(|version| version.is_live(now))
            .cloned()
            .collect()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<SecretVersion>> {
        self.versions.read().unwrap_or_else(PoisonError::into_inner)
    }
}

fn persist(path: &Path, versions: &[SecretVersion]) -> Result<(), SecretError> {
    let stored: Vec<StoredVersion> = versions
        .iter()
        .map(|version| StoredVersion {
            version: version.version,
            value: version.value.expose_secret().to_string(),
            rotated_at: version.rotated_at,
            expires_at: version.expires_at,
        })
        .collect();

    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, serde_json::to_vec_pretty(&stored)?)?;
    restrict_permissions(&tmp);
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        warn!("Failed to restrict secret file permissions: {err}");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
