//! Map validated CLI arguments to the action the binary should run.

use crate::auth::password::PasswordPolicy;
use crate::cli::actions::{Action, server::Args};
use crate::cli::commands::{ARG_DSN, ARG_MIGRATE, ARG_PORT, ARG_TRUST_PROXY_HEADERS, auth};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>(ARG_PORT).copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>(ARG_DSN)
        .cloned()
        .context("missing required argument: --dsn")?;

    let auth_opts = auth::Options::parse(matches)?;

    Ok(Action::Server(Args {
        port,
        dsn,
        migrate: matches.get_flag(ARG_MIGRATE),
        trust_proxy_headers: matches.get_flag(ARG_TRUST_PROXY_HEADERS),
        jwt_secret: auth_opts.jwt_secret,
        token_issuer: auth_opts.token_issuer,
        access_token_ttl_seconds: auth_opts.access_token_ttl_seconds,
        refresh_token_ttl_seconds: auth_opts.refresh_token_ttl_seconds,
        session_timeout_seconds: auth_opts.session_timeout_seconds,
        max_failed_logins: auth_opts.max_failed_logins,
        lockout_seconds: auth_opts.lockout_seconds,
        operation_timeout_seconds: auth_opts.operation_timeout_seconds,
        cache_capacity: auth_opts.cache_capacity,
        password_policy: PasswordPolicy {
            min_length: auth_opts.password.min_length,
            require_upper: auth_opts.password.require_upper,
            require_lower: auth_opts.password.require_lower,
            require_digit: auth_opts.password.require_digit,
            require_special: auth_opts.password.require_special,
        },
    }))
}
