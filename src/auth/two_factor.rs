//! Two-factor verification capability.

use totp_rs::{Algorithm, Secret, TOTP};
use tracing::debug;

const TOTP_DIGITS: usize = 6;
const TOTP_SKEW: u8 = 1;
const TOTP_STEP_SECONDS: u64 = 30;
const TOTP_ISSUER: &str = "NodeCP";

/// `verify(secret, code) -> bool`; implementations decide the algorithm.
pub trait TwoFactorVerifier: Send + Sync {
    fn verify(&self, secret: &str, code: &str) -> bool;
}

/// RFC 6238 TOTP over base32 secrets (SHA1, 6 digits, 30s step, one step of skew).
#[derive(Clone, Copy, Debug, Default)]
pub struct TotpVerifier;

impl TotpVerifier {
    fn totp(secret: &str) -> Option<TOTP> {
        let secret_bytes = match Secret::Encoded(secret.trim().to_string()).to_bytes() {
            Ok(bytes) => bytes,
            Err(err) => {
                debug!("two-factor secret is not valid base32: {err:?}");
                return None;
            }
        };
        match TOTP::new(
            Algorithm::SHA1,
            TOTP_DIGITS,
            TOTP_SKEW,
            TOTP_STEP_SECONDS,
            secret_bytes,
            Some(TOTP_ISSUER.to_string()),
            "account".to_string(),
        ) {
            Ok(totp) => Some(totp),
            Err(err) => {
                debug!("two-factor secret rejected: {err:?}");
                None
            }
        }
    }
}

impl TwoFactorVerifier for TotpVerifier {
    fn verify(&self, secret: &str, code: &str) -> bool {
        let code = code.trim();
        if code.len() != TOTP_DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        Self::totp(secret).is_some_and(|totp| totp.check_current(code).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded_secret() -> String {
        match Secret::Raw(vec![7u8; 20]).to_encoded() {
            Secret::Encoded(secret) => secret,
            Secret::Raw(_) => panic!("expected encoded secret"),
        }
    }

    #[test]
    fn totp_accepts_current_code() {
        let secret = encoded_secret();
        let Some(totp) = TotpVerifier::totp(&secret) else {
            panic!("secret should build a TOTP");
        };
        let code = totp.generate_current().unwrap_or_default();
        assert!(TotpVerifier.verify(&secret, &code));
        assert!(TotpVerifier.verify(&secret, &format!(" {code} ")));
    }

    #[test]
    fn totp_rejects_malformed_codes() {
        let secret = encoded_secret();
        assert!(!TotpVerifier.verify(&secret, ""));
        assert!(!TotpVerifier.verify(&secret, "12345"));
        assert!(!TotpVerifier.verify(&secret, "12a456"));
        assert!(!TotpVerifier.verify(&secret, "1234567"));
    }

    #[test]
    fn totp_rejects_unusable_secrets() {
        assert!(!TotpVerifier.verify("not base32 !!", "123456"));
        // 80-bit secrets are below the 128-bit minimum.
        assert!(!TotpVerifier.verify("JBSWY3DPEHPK3PXP", "123456"));
    }
}
