//! Error taxonomy for authentication, sessions and authorization.

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors surfaced by the auth core.
///
/// Credential errors are terminal and safe to show to the caller. Infrastructure
/// failures are wrapped in [`AuthError::Unavailable`] and must be rendered as an
/// opaque server error.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Unknown identifier or wrong password. Both cases share this variant.
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("account is disabled")]
    AccountDisabled,
    #[error("account is locked until {until}")]
    AccountLocked { until: DateTime<Utc> },
    #[error("two-factor code required")]
    TwoFactorRequired,
    #[error("invalid two-factor code")]
    InvalidTwoFactorCode,
    #[error("weak password: {0}")]
    WeakPassword(String),
    #[error("username or email already exists")]
    DuplicateIdentity,
    #[error("invalid token")]
    InvalidToken,
    #[error("invalid refresh token")]
    InvalidRefreshToken,
    #[error("permission denied")]
    PermissionDenied,
    #[error("unknown role: {0}")]
    UnknownRole(String),
    #[error("unknown user: {0}")]
    UnknownUser(uuid::Uuid),
    #[error("service unavailable")]
    Unavailable(#[source] anyhow::Error),
}

impl AuthError {
    /// Wrap a store/cache failure.
    pub fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable(err.into())
    }

    /// True for infrastructure failures that a transport layer may retry.
    #[must_use]
    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

pub type AuthResult<T> = Result<T, AuthError>;

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn locked_error_carries_unlock_time() {
        let until = Utc.with_ymd_and_hms(2030, 1, 2, 3, 4, 5).single();
        let Some(until) = until else {
            panic!("valid timestamp");
        };
        let err = AuthError::AccountLocked { until };
        assert_eq!(
            err.to_string(),
            "account is locked until 2030-01-02 03:04:05 UTC"
        );
    }

    #[test]
    fn unavailable_hides_source_in_display() {
        let err = AuthError::unavailable(anyhow::anyhow!("connection refused on 10.0.0.3"));
        assert!(err.is_unavailable());
        assert_eq!(err.to_string(), "service unavailable");
        assert!(!AuthError::InvalidCredentials.is_unavailable());
    }
}
