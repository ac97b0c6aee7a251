//! Entry point composing credentials, sessions, tokens and RBAC.
//!
//! Every store-touching operation runs under the configured operation timeout;
//! expiry aborts the store and cache calls together and surfaces as
//! [`AuthError::Unavailable`].

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, instrument};
use utoipa::ToSchema;
use uuid::Uuid;

use super::{
    audit::AuditRecorder,
    cache::{MokaSessionCache, SessionCache},
    clock::{Clock, SystemClock},
    config::AuthConfig,
    credentials::CredentialManager,
    error::{AuthError, AuthResult},
    models::{Origin, PermissionKey, Profile, Role, User},
    password::{Argon2Hasher, PasswordHasher},
    rbac::RbacResolver,
    session::SessionManager,
    store::{RoleStore, SecurityEventSink, SessionStore, UserStore},
    token::{Claims, TokenCodec},
    two_factor::{TotpVerifier, TwoFactorVerifier},
};

/// Tokens handed to a client after login or refresh.
#[derive(Debug, Serialize, ToSchema)]
pub struct LoginResponse {
    pub access_token: String,
    pub refresh_token: String,
    /// Absolute expiry of the session (and of the refresh token).
    pub expires_at: DateTime<Utc>,
    pub user: User,
}

/// Collaborators for [`AuthService`]. Anything not set falls back to the
/// production default.
pub struct AuthServiceBuilder {
    config: AuthConfig,
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    sessions: Arc<dyn SessionStore>,
    events: Arc<dyn SecurityEventSink>,
    cache: Option<Arc<dyn SessionCache>>,
    hasher: Option<Arc<dyn PasswordHasher>>,
    two_factor: Option<Arc<dyn TwoFactorVerifier>>,
    clock: Option<Arc<dyn Clock>>,
}

impl AuthServiceBuilder {
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<dyn SessionCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn with_hasher(mut self, hasher: Arc<dyn PasswordHasher>) -> Self {
        self.hasher = Some(hasher);
        self
    }

    #[must_use]
    pub fn with_two_factor(mut self, verifier: Arc<dyn TwoFactorVerifier>) -> Self {
        self.two_factor = Some(verifier);
        self
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// # Errors
    /// Returns an error if the signing secret is empty or a configured value
    /// is out of range.
    pub fn build(self) -> Result<AuthService> {
        self.config.validate()?;
        let config = Arc::new(self.config);
        let codec = Arc::new(TokenCodec::new(
            config.jwt_secret().clone(),
            config.token_issuer(),
            config.access_token_ttl(),
        )?);
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = self.cache.unwrap_or_else(|| {
            Arc::new(MokaSessionCache::new(
                config.cache_capacity(),
                config.session_timeout(),
            ))
        });
        let hasher = self
            .hasher
            .unwrap_or_else(|| Arc::new(Argon2Hasher::default()));
        let two_factor = self.two_factor.unwrap_or_else(|| Arc::new(TotpVerifier));

        let credentials = CredentialManager::new(
            self.users.clone(),
            self.roles.clone(),
            hasher,
            two_factor,
            AuditRecorder::new(self.events),
            clock.clone(),
            config.clone(),
        );
        let sessions = SessionManager::new(
            self.sessions.clone(),
            self.users.clone(),
            self.roles.clone(),
            cache,
            codec.clone(),
            clock.clone(),
            config.refresh_token_ttl(),
        );
        let rbac = RbacResolver::new(self.users, self.roles, clock.clone());

        Ok(AuthService {
            config,
            codec,
            clock,
            credentials,
            sessions,
            rbac,
            session_store: self.sessions,
        })
    }
}

pub struct AuthService {
    config: Arc<AuthConfig>,
    codec: Arc<TokenCodec>,
    clock: Arc<dyn Clock>,
    credentials: CredentialManager,
    sessions: SessionManager,
    rbac: RbacResolver,
    session_store: Arc<dyn SessionStore>,
}

impl AuthService {
    /// Start building a service over a single store implementing every seam.
    pub fn builder<S>(config: AuthConfig, store: Arc<S>) -> AuthServiceBuilder
    where
        S: UserStore + RoleStore + SessionStore + SecurityEventSink + 'static,
    {
        AuthServiceBuilder {
            config,
            users: store.clone(),
            roles: store.clone(),
            sessions: store.clone(),
            events: store,
            cache: None,
            hasher: None,
            two_factor: None,
            clock: None,
        }
    }

    #[must_use]
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }

    async fn bounded<T>(&self, operation: impl Future<Output = AuthResult<T>>) -> AuthResult<T> {
        tokio::time::timeout(self.config.operation_timeout(), operation)
            .await
            .map_err(AuthError::unavailable)?
    }

    /// Verify credentials and open a session.
    ///
    /// # Errors
    /// Returns the credential error that refused the login, or
    /// [`AuthError::Unavailable`].
    #[instrument(skip(self, password, code, origin))]
    pub async fn authenticate(
        &self,
        identifier: &str,
        password: &str,
        code: Option<&str>,
        origin: &Origin,
    ) -> AuthResult<LoginResponse> {
        self.bounded(async {
            let user = self
                .credentials
                .verify_login(identifier, password, code, origin)
                .await?;
            let roles = self.role_names(user.id).await?;
            let issued = self.sessions.create(&user, &roles, origin).await?;
            Ok(LoginResponse {
                access_token: issued.access_token,
                refresh_token: issued.refresh_token,
                expires_at: issued.session.expires_at,
                user,
            })
        })
        .await
    }

    /// # Errors
    /// Returns [`AuthError::WeakPassword`], [`AuthError::DuplicateIdentity`] or
    /// [`AuthError::Unavailable`].
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        profile: Profile,
    ) -> AuthResult<User> {
        self.bounded(self.credentials.register(username, email, password, profile))
            .await
    }

    /// Stateless check of an access token. Never touches the session store.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidToken`] for any signature, algorithm,
    /// issuer or time-bound failure.
    pub fn validate_token(&self, token: &str) -> AuthResult<Claims> {
        self.codec
            .validate(token, self.clock.now())
            .map_err(|err| {
                debug!("access token rejected: {err}");
                AuthError::InvalidToken
            })
    }

    /// Mint a new access token; the refresh token is returned unchanged.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidRefreshToken`] or [`AuthError::Unavailable`].
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<LoginResponse> {
        self.bounded(async {
            let refreshed = self.sessions.refresh(refresh_token).await?;
            Ok(LoginResponse {
                access_token: refreshed.access_token,
                refresh_token: refresh_token.to_string(),
                expires_at: refreshed.session.expires_at,
                user: refreshed.user,
            })
        })
        .await
    }

    /// Revoke a session. Idempotent.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn logout(&self, session_id: Uuid) -> AuthResult<()> {
        self.bounded(self.sessions.revoke(session_id)).await
    }

    /// Revoke every live session of a user.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn logout_everywhere(&self, user_id: Uuid) -> AuthResult<usize> {
        self.bounded(self.sessions.revoke_all_for_user(user_id))
            .await
    }

    /// Owner of a live session, read through the cache.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn session_owner(&self, session_id: Uuid) -> AuthResult<Option<Uuid>> {
        self.bounded(self.sessions.owner_of(session_id)).await
    }

    /// Change a password and revoke every session of the user.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidCredentials`], [`AuthError::WeakPassword`]
    /// or [`AuthError::Unavailable`].
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        self.bounded(async {
            self.credentials
                .change_password(user_id, current_password, new_password)
                .await?;
            self.sessions.revoke_all_for_user(user_id).await?;
            Ok(())
        })
        .await
    }

    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn has_permission(&self, user_id: Uuid, resource: &str, action: &str) -> AuthResult<bool> {
        self.bounded(self.rbac.has_permission(user_id, resource, action))
            .await
    }

    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn permissions_of(&self, user_id: Uuid) -> AuthResult<BTreeSet<PermissionKey>> {
        self.bounded(self.rbac.permissions_of(user_id)).await
    }

    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn roles_of(&self, user_id: Uuid) -> AuthResult<Vec<Role>> {
        self.bounded(self.rbac.roles_of(user_id)).await
    }

    /// # Errors
    /// Returns [`AuthError::UnknownRole`], [`AuthError::UnknownUser`] or
    /// [`AuthError::Unavailable`].
    pub async fn assign_role(&self, user_id: Uuid, role_name: &str) -> AuthResult<()> {
        self.bounded(self.rbac.assign_role(user_id, role_name)).await
    }

    /// # Errors
    /// Returns [`AuthError::UnknownRole`], [`AuthError::UnknownUser`] or
    /// [`AuthError::Unavailable`].
    pub async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> AuthResult<bool> {
        self.bounded(self.rbac.revoke_role(user_id, role_name)).await
    }

    /// # Errors
    /// Returns [`AuthError::Unavailable`].
    pub async fn define_role(&self, name: &str, display_name: &str, description: &str) -> AuthResult<Role> {
        self.bounded(self.rbac.define_role(name, display_name, description))
            .await
    }

    /// # Errors
    /// Returns [`AuthError::UnknownRole`] or [`AuthError::Unavailable`].
    pub async fn grant(&self, role_name: &str, resource: &str, action: &str) -> AuthResult<()> {
        self.bounded(self.rbac.grant(role_name, resource, action))
            .await
    }

    /// Round-trip to the durable store.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] if the store does not answer.
    pub async fn ping(&self) -> AuthResult<()> {
        self.bounded(async {
            self.session_store
                .ping()
                .await
                .map_err(AuthError::unavailable)
        })
        .await
    }

    async fn role_names(&self, user_id: Uuid) -> AuthResult<Vec<String>> {
        Ok(self
            .rbac
            .roles_of(user_id)
            .await?
            .into_iter()
            .map(|role| role.name)
            .collect())
    }
}
