//! Authentication core: credentials, access tokens, refresh sessions, lockout
//! and signing secret management.
//!
//! Components, leaves first:
//!
//! - `secrets`: startup validation and multi-version signing secrets.
//! - `hasher`: Argon2id hashing, with a server-side pepper for tokens.
//! - `token`: HS256 access tokens signed with the active secret.
//! - `sessions`: refresh sessions with rotation on use and the sweeper.
//! - `lockout`: failed-login counters and temporary account locks.
//! - `service`: the request-level flows built from the above.
//!
//! ## Token storage
//!
//! Refresh, verification and reset tokens are 32 random bytes (URL-safe
//! base64). Only `argon2id(token|pepper)` is stored. Because the hashes are
//! salted, one-time tokens are found by scanning the unexpired rows of their
//! kind and comparing each hash; the scan is bounded by the token lifetime.

pub mod config;
pub mod error;
pub mod hasher;
pub mod lockout;
pub mod rate_limit;
pub mod secrets;
pub mod service;
pub mod sessions;
pub mod token;
pub mod types;
mod utils;

pub use config::AuthConfig;
pub use error::AuthError;
pub use hasher::CredentialHasher;
pub use lockout::LockoutTracker;
pub use secrets::{SecretError, SecretStore, SecretVersion, SecretsValidator, ValidationReport};
pub use service::{AuthService, Collaborators};
pub use sessions::{SessionLedger, Sweeper, spawn_sweeper};
pub use token::{AccessClaims, TokenIssuer};
