use crate::auth::config::MAX_DURATION_SECONDS;
use clap::{Arg, ArgAction, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_JWT_SECRET: &str = "jwt-secret";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_ACCESS_TOKEN_TTL: &str = "access-token-ttl-seconds";
pub const ARG_REFRESH_TOKEN_TTL: &str = "refresh-token-ttl-seconds";
pub const ARG_SESSION_TIMEOUT: &str = "session-timeout-seconds";
pub const ARG_MAX_FAILED_LOGINS: &str = "max-failed-logins";
pub const ARG_LOCKOUT_SECONDS: &str = "lockout-seconds";
pub const ARG_OPERATION_TIMEOUT: &str = "operation-timeout-seconds";
pub const ARG_CACHE_CAPACITY: &str = "cache-capacity";
pub const ARG_PASSWORD_MIN_LENGTH: &str = "password-min-length";
pub const ARG_PASSWORD_REQUIRE_UPPER: &str = "password-require-upper";
pub const ARG_PASSWORD_REQUIRE_LOWER: &str = "password-require-lower";
pub const ARG_PASSWORD_REQUIRE_DIGIT: &str = "password-require-digit";
pub const ARG_PASSWORD_REQUIRE_SPECIAL: &str = "password-require-special";

#[derive(Debug)]
pub struct PasswordOptions {
    pub min_length: usize,
    pub require_upper: bool,
    pub require_lower: bool,
    pub require_digit: bool,
    pub require_special: bool,
}

#[derive(Debug)]
pub struct Options {
    pub jwt_secret: SecretString,
    pub token_issuer: String,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub session_timeout_seconds: i64,
    pub max_failed_logins: i32,
    pub lockout_seconds: i64,
    pub operation_timeout_seconds: u64,
    pub cache_capacity: u64,
    pub password: PasswordOptions,
}

impl Options {
    /// Parse auth arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the signing secret is missing or a value is out of range.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let jwt_secret = matches
            .get_one::<String>(ARG_JWT_SECRET)
            .filter(|v| !v.trim().is_empty())
            .map(|v| SecretString::from(v.clone()))
            .ok_or_else(|| anyhow::anyhow!("missing required argument: --{ARG_JWT_SECRET}"))?;

        let seconds = |id: &str| -> anyhow::Result<i64> {
            match matches.get_one::<i64>(id).copied() {
                Some(value) if (1..=MAX_DURATION_SECONDS).contains(&value) => Ok(value),
                Some(value) => Err(anyhow::anyhow!(
                    "--{id} must be between 1 and {MAX_DURATION_SECONDS}, got {value}"
                )),
                None => Err(anyhow::anyhow!("missing required argument: --{id}")),
            }
        };
        let flag = |id: &str| matches.get_one::<bool>(id).copied().unwrap_or(true);

        Ok(Self {
            jwt_secret,
            token_issuer: matches
                .get_one::<String>(ARG_TOKEN_ISSUER)
                .cloned()
                .unwrap_or_else(|| "nodecp".to_string()),
            access_token_ttl_seconds: seconds(ARG_ACCESS_TOKEN_TTL)?,
            refresh_token_ttl_seconds: seconds(ARG_REFRESH_TOKEN_TTL)?,
            session_timeout_seconds: seconds(ARG_SESSION_TIMEOUT)?,
            max_failed_logins: matches
                .get_one::<i32>(ARG_MAX_FAILED_LOGINS)
                .copied()
                .filter(|v| *v > 0)
                .ok_or_else(|| anyhow::anyhow!("--{ARG_MAX_FAILED_LOGINS} must be positive"))?,
            lockout_seconds: seconds(ARG_LOCKOUT_SECONDS)?,
            operation_timeout_seconds: matches
                .get_one::<u64>(ARG_OPERATION_TIMEOUT)
                .copied()
                .filter(|v| (1..=MAX_DURATION_SECONDS.unsigned_abs()).contains(v))
                .ok_or_else(|| {
                    anyhow::anyhow!(
                        "--{ARG_OPERATION_TIMEOUT} must be between 1 and {MAX_DURATION_SECONDS}"
                    )
                })?,
            cache_capacity: matches
                .get_one::<u64>(ARG_CACHE_CAPACITY)
                .copied()
                .unwrap_or(100_000),
            password: PasswordOptions {
                min_length: matches
                    .get_one::<usize>(ARG_PASSWORD_MIN_LENGTH)
                    .copied()
                    .unwrap_or(8),
                require_upper: flag(ARG_PASSWORD_REQUIRE_UPPER),
                require_lower: flag(ARG_PASSWORD_REQUIRE_LOWER),
                require_digit: flag(ARG_PASSWORD_REQUIRE_DIGIT),
                require_special: flag(ARG_PASSWORD_REQUIRE_SPECIAL),
            },
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    let command = with_token_args(command);
    let command = with_lockout_args(command);
    with_password_args(command)
}

fn with_token_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_JWT_SECRET)
                .long(ARG_JWT_SECRET)
                .help("Secret used to sign access tokens (HS256)")
                .env("NODECP_AUTH_JWT_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("Issuer claim stamped on and required from access tokens")
                .env("NODECP_AUTH_TOKEN_ISSUER")
                .default_value("nodecp"),
        )
        .arg(
            Arg::new(ARG_ACCESS_TOKEN_TTL)
                .long(ARG_ACCESS_TOKEN_TTL)
                .help("Access token lifetime in seconds")
                .env("NODECP_AUTH_ACCESS_TOKEN_TTL_SECONDS")
                .default_value("900")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_REFRESH_TOKEN_TTL)
                .long(ARG_REFRESH_TOKEN_TTL)
                .help("Refresh token and session lifetime in seconds")
                .env("NODECP_AUTH_REFRESH_TOKEN_TTL_SECONDS")
                .default_value("604800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_SESSION_TIMEOUT)
                .long(ARG_SESSION_TIMEOUT)
                .help("Time-to-live of cached session entries in seconds")
                .env("NODECP_AUTH_SESSION_TIMEOUT_SECONDS")
                .default_value("86400")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_CACHE_CAPACITY)
                .long(ARG_CACHE_CAPACITY)
                .help("Maximum number of cached sessions")
                .env("NODECP_AUTH_CACHE_CAPACITY")
                .default_value("100000")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_lockout_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_MAX_FAILED_LOGINS)
                .long(ARG_MAX_FAILED_LOGINS)
                .help("Consecutive failed logins before the account is locked")
                .env("NODECP_AUTH_MAX_FAILED_LOGINS")
                .default_value("5")
                .value_parser(clap::value_parser!(i32)),
        )
        .arg(
            Arg::new(ARG_LOCKOUT_SECONDS)
                .long(ARG_LOCKOUT_SECONDS)
                .help("Lockout duration in seconds")
                .env("NODECP_AUTH_LOCKOUT_SECONDS")
                .default_value("1800")
                .value_parser(clap::value_parser!(i64)),
        )
        .arg(
            Arg::new(ARG_OPERATION_TIMEOUT)
                .long(ARG_OPERATION_TIMEOUT)
                .help("Upper bound for a single auth operation in seconds")
                .env("NODECP_AUTH_OPERATION_TIMEOUT_SECONDS")
                .default_value("10")
                .value_parser(clap::value_parser!(u64)),
        )
}

fn with_password_args(command: Command) -> Command {
    let toggle = |id: &'static str, help: &'static str, env: &'static str| {
        Arg::new(id)
            .long(id)
            .help(help)
            .env(env)
            .default_value("true")
            .action(ArgAction::Set)
            .value_parser(clap::value_parser!(bool))
    };

    command
        .arg(
            Arg::new(ARG_PASSWORD_MIN_LENGTH)
                .long(ARG_PASSWORD_MIN_LENGTH)
                .help("Minimum password length")
                .env("NODECP_AUTH_PASSWORD_MIN_LENGTH")
                .default_value("8")
                .value_parser(clap::value_parser!(usize)),
        )
        .arg(toggle(
            ARG_PASSWORD_REQUIRE_UPPER,
            "Require an uppercase letter",
            "NODECP_AUTH_PASSWORD_REQUIRE_UPPER",
        ))
        .arg(toggle(
            ARG_PASSWORD_REQUIRE_LOWER,
            "Require a lowercase letter",
            "NODECP_AUTH_PASSWORD_REQUIRE_LOWER",
        ))
        .arg(toggle(
            ARG_PASSWORD_REQUIRE_DIGIT,
            "Require a digit",
            "NODECP_AUTH_PASSWORD_REQUIRE_DIGIT",
        ))
        .arg(toggle(
            ARG_PASSWORD_REQUIRE_SPECIAL,
            "Require a special character",
            "NODECP_AUTH_PASSWORD_REQUIRE_SPECIAL",
        ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn command() -> Command {
        with_args(Command::new("nodecp-auth"))
    }

    fn cleared<F: FnOnce()>(f: F) {
        temp_env::with_vars(
            [
                ("NODECP_AUTH_JWT_SECRET", None::<&str>),
                ("NODECP_AUTH_ACCESS_TOKEN_TTL_SECONDS", None),
                ("NODECP_AUTH_MAX_FAILED_LOGINS", None),
                ("NODECP_AUTH_PASSWORD_REQUIRE_SPECIAL", None),
                ("NODECP_AUTH_PASSWORD_MIN_LENGTH", None),
            ],
            f,
        );
    }

    #[test]
    fn defaults() {
        cleared(|| {
            let matches = command().get_matches_from(vec!["nodecp-auth", "--jwt-secret", "s3cret"]);
            let options = Options::parse(&matches);
            assert!(options.is_ok());
            if let Ok(options) = options {
                assert_eq!(options.jwt_secret.expose_secret(), "s3cret");
                assert_eq!(options.token_issuer, "nodecp");
                assert_eq!(options.access_token_ttl_seconds, 900);
                assert_eq!(options.refresh_token_ttl_seconds, 604_800);
                assert_eq!(options.session_timeout_seconds, 86_400);
                assert_eq!(options.max_failed_logins, 5);
                assert_eq!(options.lockout_seconds, 1800);
                assert_eq!(options.operation_timeout_seconds, 10);
                assert_eq!(options.cache_capacity, 100_000);
                assert_eq!(options.password.min_length, 8);
                assert!(options.password.require_upper);
                assert!(options.password.require_special);
            }
        });
    }

    #[test]
    fn env_overrides() {
        temp_env::with_vars(
            [
                ("NODECP_AUTH_JWT_SECRET", Some("from-env")),
                ("NODECP_AUTH_ACCESS_TOKEN_TTL_SECONDS", Some("60")),
                ("NODECP_AUTH_MAX_FAILED_LOGINS", Some("3")),
                ("NODECP_AUTH_PASSWORD_REQUIRE_SPECIAL", Some("false")),
                ("NODECP_AUTH_PASSWORD_MIN_LENGTH", Some("12")),
            ],
            || {
                let matches = command().get_matches_from(vec!["nodecp-auth"]);
                let options = Options::parse(&matches);
                assert!(options.is_ok());
                if let Ok(options) = options {
                    assert_eq!(options.jwt_secret.expose_secret(), "from-env");
                    assert_eq!(options.access_token_ttl_seconds, 60);
                    assert_eq!(options.max_failed_logins, 3);
                    assert_eq!(options.password.min_length, 12);
                    assert!(!options.password.require_special);
                    assert!(options.password.require_digit);
                }
            },
        );
    }

    #[test]
    fn missing_secret_is_rejected() {
        cleared(|| {
            let result = command().try_get_matches_from(vec!["nodecp-auth"]);
            assert_eq!(
                result.map_err(|e| e.kind()).err(),
                Some(clap::error::ErrorKind::MissingRequiredArgument)
            );
        });
    }

    #[test]
    fn blank_secret_is_rejected() {
        cleared(|| {
            let matches = command().get_matches_from(vec!["nodecp-auth", "--jwt-secret", "  "]);
            let result = Options::parse(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("--jwt-secret"));
            }
        });
    }

    #[test]
    fn oversized_lockout_is_rejected() {
        cleared(|| {
            let matches = command().get_matches_from(vec![
                "nodecp-auth",
                "--jwt-secret",
                "s3cret",
                "--lockout-seconds",
                "9223372036854775807",
            ]);
            let result = Options::parse(&matches);
            assert!(result.is_err());
            if let Err(err) = result {
                assert!(err.to_string().contains("--lockout-seconds"));
            }
        });
    }

    #[test]
    fn non_positive_ttl_is_rejected() {
        cleared(|| {
            let matches = command().get_matches_from(vec![
                "nodecp-auth",
                "--jwt-secret",
                "s3cret",
                "--access-token-ttl-seconds",
                "0",
            ]);
            assert!(Options::parse(&matches).is_err());
        });
    }
}
