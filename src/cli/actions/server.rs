use crate::{
    api,
    auth::{
        AuthConfig, AuthService,
        password::PasswordPolicy,
        store::{PgStore, apply_schema},
    },
    cli::telemetry,
};
use anyhow::{Context, Result};
use secrecy::SecretString;
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info};
use url::Url;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub dsn: String,
    pub migrate: bool,
    pub trust_proxy_headers: bool,
    pub jwt_secret: SecretString,
    pub token_issuer: String,
    pub access_token_ttl_seconds: i64,
    pub refresh_token_ttl_seconds: i64,
    pub session_timeout_seconds: i64,
    pub max_failed_logins: i32,
    pub lockout_seconds: i64,
    pub operation_timeout_seconds: u64,
    pub cache_capacity: u64,
    pub password_policy: PasswordPolicy,
}

impl Args {
    fn auth_config(&self) -> AuthConfig {
        AuthConfig::new(self.jwt_secret.clone())
            .with_token_issuer(self.token_issuer.clone())
            .with_access_token_ttl_seconds(self.access_token_ttl_seconds)
            .with_refresh_token_ttl_seconds(self.refresh_token_ttl_seconds)
            .with_session_timeout_seconds(self.session_timeout_seconds)
            .with_max_failed_logins(self.max_failed_logins)
            .with_lockout_seconds(self.lockout_seconds)
            .with_operation_timeout_seconds(self.operation_timeout_seconds)
            .with_cache_capacity(self.cache_capacity)
            .with_password_policy(self.password_policy.clone())
    }
}

/// Execute the server action.
///
/// # Errors
/// Returns an error if the DSN is invalid, the database is unreachable, the
/// schema cannot be applied or the server fails to start.
pub async fn execute(args: Args) -> Result<()> {
    let dsn = Url::parse(&args.dsn).context("Invalid database connection string")?;

    let pool = PgPoolOptions::new()
        .min_connections(1)
        .max_connections(5)
        .max_lifetime(Duration::from_secs(60 * 2))
        .test_before_acquire(true)
        .connect(dsn.as_str())
        .await
        .context("Failed to connect to database")?;

    if args.migrate {
        apply_schema(&pool).await?;
        info!("Database schema applied");
    }

    let config = args.auth_config();
    debug!(
        issuer = config.token_issuer(),
        max_failed_logins = config.max_failed_logins(),
        "Auth configuration loaded"
    );

    let service = AuthService::builder(config, Arc::new(PgStore::new(pool)))
        .build()
        .context("Failed to build auth service")?;

    let proxy = api::ProxyHeaders {
        trusted: args.trust_proxy_headers,
    };
    let result = api::serve(args.port, Arc::new(service), proxy).await;

    telemetry::shutdown_tracer();

    result
}
