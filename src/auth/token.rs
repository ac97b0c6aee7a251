//! Signed, expiring access tokens (HS256 JWT).
//!
//! Validation is a pure function of secret, token and clock. It never touches
//! the session store, so revocation is only enforced at refresh/logout and the
//! short token lifetime bounds how long a revoked token stays usable.

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

use super::models::User;
use super::rbac::ADMIN_ROLE;

const ALGORITHM: &str = "HS256";

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// Identity claims embedded in every access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct Claims {
    pub user_id: Uuid,
    pub username: String,
    pub email: String,
    pub roles: Vec<String>,
    pub session_id: Uuid,
    pub iss: String,
    pub iat: i64,
    pub nbf: i64,
    pub exp: i64,
}

impl Claims {
    /// True when the token carries `role`, or the `admin` super-role.
    #[must_use]
    pub fn has_role(&self, role: &str) -> bool {
        self.roles
            .iter()
            .any(|held| held == role || held == ADMIN_ROLE)
    }
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid issuer")]
    InvalidIssuer,
    #[error("token not yet valid")]
    NotYetValid,
    #[error("token expired")]
    Expired,
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(s: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(s).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Issues and validates access tokens with a server-held symmetric secret.
pub struct TokenCodec {
    secret: SecretString,
    issuer: String,
    ttl: Duration,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenCodec {
    /// # Errors
    /// Returns [`TokenError::EmptySecret`] for an empty signing secret.
    pub fn new(secret: SecretString, issuer: impl Into<String>, ttl: Duration) -> Result<Self, TokenError> {
        if secret.expose_secret().is_empty() {
            return Err(TokenError::EmptySecret);
        }
        Ok(Self {
            secret,
            issuer: issuer.into(),
            ttl,
        })
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    fn mac(&self) -> Result<HmacSha256, TokenError> {
        HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|_| TokenError::EmptySecret)
    }

    /// Mint a token for `user` bound to `session_id`, valid from `now` for the configured TTL.
    ///
    /// # Errors
    /// Returns an error if the claims cannot be encoded.
    pub fn issue(
        &self,
        user: &User,
        session_id: Uuid,
        roles: &[String],
        now: DateTime<Utc>,
    ) -> Result<String, TokenError> {
        let issued_at = now.timestamp();
        let claims = Claims {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            roles: roles.to_vec(),
            session_id,
            iss: self.issuer.clone(),
            iat: issued_at,
            nbf: issued_at,
            exp: (now + self.ttl).timestamp(),
        };
        self.sign(&claims)
    }

    fn sign(&self, claims: &Claims) -> Result<String, TokenError> {
        let header_b64 = b64e_json(&TokenHeader::hs256())?;
        let claims_b64 = b64e_json(claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let mut mac = self.mac()?;
        mac.update(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify signature, algorithm, issuer and time bounds; return the claims.
    ///
    /// # Errors
    /// Returns the first check that fails.
    pub fn validate(&self, token: &str, now: DateTime<Utc>) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let sig_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(TokenError::TokenFormat);
        }

        // Algorithm is pinned; "none" or asymmetric algorithms are never accepted.
        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signature = Base64UrlUnpadded::decode_vec(sig_b64).map_err(|_| TokenError::Base64)?;
        let mut mac = self.mac()?;
        mac.update(header_b64.as_bytes());
        mac.update(b".");
        mac.update(claims_b64.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims: Claims = b64d_json(claims_b64)?;
        if claims.iss != self.issuer {
            return Err(TokenError::InvalidIssuer);
        }
        let now = now.timestamp();
        if claims.nbf > now {
            return Err(TokenError::NotYetValid);
        }
        if claims.exp <= now {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const NOW: i64 = 1_700_000_000;

    fn now() -> DateTime<Utc> {
        match Utc.timestamp_opt(NOW, 0).single() {
            Some(now) => now,
            None => panic!("fixed timestamp"),
        }
    }

    fn codec() -> TokenCodec {
        match TokenCodec::new(
            SecretString::from("test-signing-secret"),
            "nodecp",
            Duration::minutes(15),
        ) {
            Ok(codec) => codec,
            Err(err) => panic!("codec: {err}"),
        }
    }

    fn user() -> User {
        User {
            id: Uuid::from_u128(0x1234),
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
            is_two_factor_enabled: false,
            two_factor_secret: None,
            failed_login_count: 0,
            locked_until: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: now(),
            updated_at: now(),
            deleted_at: None,
        }
    }

    fn forge(header: &str, claims: &str, signature: &str) -> String {
        format!(
            "{}.{}.{}",
            Base64UrlUnpadded::encode_string(header.as_bytes()),
            Base64UrlUnpadded::encode_string(claims.as_bytes()),
            signature
        )
    }

    #[test]
    fn issue_then_validate_returns_embedded_claims() -> Result<(), TokenError> {
        let codec = codec();
        let session_id = Uuid::from_u128(0xabcd);
        let roles = vec!["user".to_string(), "reseller".to_string()];
        let token = codec.issue(&user(), session_id, &roles, now())?;

        let claims = codec.validate(&token, now() + Duration::minutes(14))?;
        assert_eq!(claims.user_id, Uuid::from_u128(0x1234));
        assert_eq!(claims.username, "alice");
        assert_eq!(claims.email, "alice@x.com");
        assert_eq!(claims.roles, roles);
        assert_eq!(claims.session_id, session_id);
        assert_eq!(claims.iss, "nodecp");
        assert_eq!(claims.iat, NOW);
        assert_eq!(claims.nbf, NOW);
        assert_eq!(claims.exp, NOW + 15 * 60);
        Ok(())
    }

    #[test]
    fn expired_token_is_rejected() -> Result<(), TokenError> {
        let codec = codec();
        let token = codec.issue(&user(), Uuid::nil(), &[], now())?;
        assert!(matches!(
            codec.validate(&token, now() + Duration::minutes(15)),
            Err(TokenError::Expired)
        ));
        Ok(())
    }

    #[test]
    fn token_from_the_future_is_rejected() -> Result<(), TokenError> {
        let codec = codec();
        let token = codec.issue(&user(), Uuid::nil(), &[], now())?;
        assert!(matches!(
            codec.validate(&token, now() - Duration::seconds(1)),
            Err(TokenError::NotYetValid)
        ));
        Ok(())
    }

    #[test]
    fn tampered_claims_fail_signature() -> Result<(), TokenError> {
        let codec = codec();
        let token = codec.issue(&user(), Uuid::nil(), &["user".to_string()], now())?;
        let parts: Vec<&str> = token.split('.').collect();
        let mut claims: Claims = b64d_json(parts[1])?;
        claims.roles = vec!["admin".to_string()];
        let tampered = format!("{}.{}.{}", parts[0], b64e_json(&claims)?, parts[2]);

        assert!(matches!(
            codec.validate(&tampered, now()),
            Err(TokenError::InvalidSignature)
        ));
        Ok(())
    }

    #[test]
    fn other_secret_fails_signature() -> Result<(), TokenError> {
        let token = codec().issue(&user(), Uuid::nil(), &[], now())?;
        let other = TokenCodec::new(
            SecretString::from("another-secret"),
            "nodecp",
            Duration::minutes(15),
        )?;
        assert!(matches!(
            other.validate(&token, now()),
            Err(TokenError::InvalidSignature)
        ));
        Ok(())
    }

    #[test]
    fn algorithm_confusion_is_rejected() {
        let codec = codec();
        let claims = r#"{"user_id":"00000000-0000-0000-0000-000000000000","username":"x","email":"x","roles":["admin"],"session_id":"00000000-0000-0000-0000-000000000000","iss":"nodecp","iat":1700000000,"nbf":1700000000,"exp":1800000000}"#;

        let none = forge(r#"{"alg":"none","typ":"JWT"}"#, claims, "");
        assert!(matches!(
            codec.validate(&none, now()),
            Err(TokenError::UnsupportedAlg(alg)) if alg == "none"
        ));

        let rs256 = forge(r#"{"alg":"RS256","typ":"JWT"}"#, claims, "c2ln");
        assert!(matches!(
            codec.validate(&rs256, now()),
            Err(TokenError::UnsupportedAlg(alg)) if alg == "RS256"
        ));
    }

    #[test]
    fn wrong_issuer_is_rejected() -> Result<(), TokenError> {
        let token = codec().issue(&user(), Uuid::nil(), &[], now())?;
        let other = TokenCodec::new(
            SecretString::from("test-signing-secret"),
            "someone-else",
            Duration::minutes(15),
        )?;
        assert!(matches!(
            other.validate(&token, now()),
            Err(TokenError::InvalidIssuer)
        ));
        Ok(())
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        let codec = codec();
        assert!(matches!(
            codec.validate("abc", now()),
            Err(TokenError::TokenFormat)
        ));
        assert!(matches!(
            codec.validate("a.b.c.d", now()),
            Err(TokenError::TokenFormat)
        ));
        assert!(matches!(
            codec.validate("!!.b.c", now()),
            Err(TokenError::Base64)
        ));
    }

    #[test]
    fn empty_secret_is_refused() {
        assert!(matches!(
            TokenCodec::new(SecretString::from(""), "nodecp", Duration::minutes(1)),
            Err(TokenError::EmptySecret)
        ));
    }

    #[test]
    fn has_role_honours_admin_bypass() {
        let mut claims = Claims {
            user_id: Uuid::nil(),
            username: "bob".to_string(),
            email: "bob@x.com".to_string(),
            roles: vec!["user".to_string()],
            session_id: Uuid::nil(),
            iss: "nodecp".to_string(),
            iat: NOW,
            nbf: NOW,
            exp: NOW + 60,
        };
        assert!(claims.has_role("user"));
        assert!(!claims.has_role("reseller"));

        claims.roles.push(ADMIN_ROLE.to_string());
        assert!(claims.has_role("reseller"));
    }
}
