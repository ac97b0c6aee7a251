//! Auth configuration: token lifetimes, lockout and password policy.

use super::password::PasswordPolicy;
use anyhow::{Result, bail};
use chrono::Duration;
use secrecy::SecretString;

/// Upper bound for every configured duration, in seconds (ten years).
pub const MAX_DURATION_SECONDS: i64 = 10 * 365 * 24 * 60 * 60;

const DEFAULT_ACCESS_TOKEN_TTL_SECONDS: i64 = 15 * 60;
const DEFAULT_REFRESH_TOKEN_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;
const DEFAULT_SESSION_TIMEOUT_SECONDS: i64 = 24 * 60 * 60;
const DEFAULT_MAX_FAILED_LOGINS: i32 = 5;
const DEFAULT_LOCKOUT_SECONDS: i64 = 30 * 60;
const DEFAULT_OPERATION_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_CACHE_CAPACITY: u64 = 100_000;
const DEFAULT_TOKEN_ISSUER: &str = "nodecp";

/// Built once at startup and shared by reference; never mutated afterwards.
#[derive(Clone, Debug)]
pub struct AuthConfig {
    jwt_secret: SecretString,
    token_issuer: String,
    access_token_ttl_seconds: i64,
    refresh_token_ttl_seconds: i64,
    session_timeout_seconds: i64,
    max_failed_logins: i32,
    lockout_seconds: i64,
    operation_timeout_seconds: u64,
    cache_capacity: u64,
    password_policy: PasswordPolicy,
}

impl AuthConfig {
    #[must_use]
    pub fn new(jwt_secret: SecretString) -> Self {
        Self {
            jwt_secret,
            token_issuer: DEFAULT_TOKEN_ISSUER.to_string(),
            access_token_ttl_seconds: DEFAULT_ACCESS_TOKEN_TTL_SECONDS,
            refresh_token_ttl_seconds: DEFAULT_REFRESH_TOKEN_TTL_SECONDS,
            session_timeout_seconds: DEFAULT_SESSION_TIMEOUT_SECONDS,
            max_failed_logins: DEFAULT_MAX_FAILED_LOGINS,
            lockout_seconds: DEFAULT_LOCKOUT_SECONDS,
            operation_timeout_seconds: DEFAULT_OPERATION_TIMEOUT_SECONDS,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            password_policy: PasswordPolicy::default(),
        }
    }

    #[must_use]
    pub fn with_token_issuer(mut self, issuer: String) -> Self {
        self.token_issuer = issuer;
        self
    }

    #[must_use]
    pub fn with_access_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.access_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_refresh_token_ttl_seconds(mut self, seconds: i64) -> Self {
        self.refresh_token_ttl_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_session_timeout_seconds(mut self, seconds: i64) -> Self {
        self.session_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_max_failed_logins(mut self, attempts: i32) -> Self {
        self.max_failed_logins = attempts;
        self
    }

    #[must_use]
    pub fn with_lockout_seconds(mut self, seconds: i64) -> Self {
        self.lockout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_operation_timeout_seconds(mut self, seconds: u64) -> Self {
        self.operation_timeout_seconds = seconds;
        self
    }

    #[must_use]
    pub fn with_cache_capacity(mut self, capacity: u64) -> Self {
        self.cache_capacity = capacity;
        self
    }

    #[must_use]
    pub fn with_password_policy(mut self, policy: PasswordPolicy) -> Self {
        self.password_policy = policy;
        self
    }

    /// Check that every duration lies in `1..=MAX_DURATION_SECONDS` and that
    /// the lockout threshold is positive.
    ///
    /// # Errors
    /// Names the first offending setting.
    pub fn validate(&self) -> Result<()> {
        let durations = [
            ("access token ttl", self.access_token_ttl_seconds),
            ("refresh token ttl", self.refresh_token_ttl_seconds),
            ("session timeout", self.session_timeout_seconds),
            ("lockout duration", self.lockout_seconds),
            (
                "operation timeout",
                i64::try_from(self.operation_timeout_seconds).unwrap_or(i64::MAX),
            ),
        ];
        for (name, seconds) in durations {
            if !(1..=MAX_DURATION_SECONDS).contains(&seconds) {
                bail!("{name} must be between 1 and {MAX_DURATION_SECONDS} seconds, got {seconds}");
            }
        }
        if self.max_failed_logins < 1 {
            bail!(
                "max failed logins must be positive, got {}",
                self.max_failed_logins
            );
        }
        Ok(())
    }

    pub(crate) fn jwt_secret(&self) -> &SecretString {
        &self.jwt_secret
    }

    #[must_use]
    pub fn token_issuer(&self) -> &str {
        &self.token_issuer
    }

    #[must_use]
    pub fn access_token_ttl(&self) -> Duration {
        bounded(self.access_token_ttl_seconds)
    }

    #[must_use]
    pub fn refresh_token_ttl(&self) -> Duration {
        bounded(self.refresh_token_ttl_seconds)
    }

    #[must_use]
    pub fn session_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            u64::try_from(self.session_timeout_seconds.min(MAX_DURATION_SECONDS)).unwrap_or(0),
        )
    }

    #[must_use]
    pub fn max_failed_logins(&self) -> i32 {
        self.max_failed_logins
    }

    #[must_use]
    pub fn lockout_duration(&self) -> Duration {
        bounded(self.lockout_seconds)
    }

    #[must_use]
    pub fn operation_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(
            self.operation_timeout_seconds
                .min(u64::try_from(MAX_DURATION_SECONDS).unwrap_or(u64::MAX)),
        )
    }

    #[must_use]
    pub fn cache_capacity(&self) -> u64 {
        self.cache_capacity
    }

    #[must_use]
    pub fn password_policy(&self) -> &PasswordPolicy {
        &self.password_policy
    }
}

fn bounded(seconds: i64) -> Duration {
    Duration::seconds(seconds.clamp(0, MAX_DURATION_SECONDS))
}
