//! # nodecp-auth (Authentication, Sessions & Authorization)
//!
//! `nodecp-auth` is the identity core of the NodeCP hosting control panel. It
//! verifies credentials, issues and validates signed access tokens, keeps
//! server-side sessions and answers role-based permission checks.
//!
//! ## Authentication
//!
//! Users log in with a username or email plus password (Argon2id PHC hashes).
//! Accounts with two-factor enabled must also present a TOTP code. Repeated
//! failures lock the account for a configurable period; unknown identifiers and
//! wrong passwords are indistinguishable to the caller.
//!
//! ## Sessions & Tokens
//!
//! A successful login opens a durable session row and mirrors it into an
//! in-process cache. The caller receives a short-lived HS256 access token and a
//! long-lived opaque refresh token; only SHA-256 digests of either are stored.
//! Access tokens are validated statelessly, so revoking a session takes effect
//! when its outstanding access token expires.
//!
//! ## Authorization
//!
//! Users hold roles, roles hold `(resource, action)` permissions. Holders of the
//! `admin` role pass every permission check.

pub mod api;
pub mod auth;
pub mod cli;

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};
