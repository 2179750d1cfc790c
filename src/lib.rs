//! # Finora (authentication and session core)
//!
//! `finora` is the authentication backend of the Finora personal-finance API.
//! It owns password hashing, access token issuance, refresh sessions with
//! rotation, account lockout and signing secret rotation.
//!
//! ## Sessions
//!
//! Login creates a refresh session: an opaque session id plus a random refresh
//! token. Only a peppered Argon2 hash of the refresh token is stored. Every
//! successful refresh marks the presented session `rotated` and creates a new
//! sibling in the same family, so each refresh token is single-use.
//!
//! - **Mismatch:** a wrong refresh token deletes the session (fail closed).
//! - **Reuse:** the right token for an already rotated session revokes the
//!   whole family.
//! - **Password reset:** revokes every session of the user.
//!
//! ## Lockout
//!
//! Five failed logins inside a 30 minute window lock the account for 30
//! minutes. Unknown emails are counted separately and return the same
//! `InvalidCredentials` error as a wrong password.

pub mod auth;
pub mod cli;
pub mod finora;
pub mod store;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

pub const APP_USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);
