//! Credential verification, lockout and registration.

use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    audit::AuditRecorder,
    clock::Clock,
    config::AuthConfig,
    error::{AuthError, AuthResult},
    models::{NewRole, NewUser, Origin, Profile, User},
    password::PasswordHasher,
    store::{InsertOutcome, RoleStore, UserStore},
    two_factor::TwoFactorVerifier,
    utils::normalize_email,
};

/// Role attached to every newly registered user.
pub const DEFAULT_ROLE: &str = "user";

pub struct CredentialManager {
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    hasher: Arc<dyn PasswordHasher>,
    two_factor: Arc<dyn TwoFactorVerifier>,
    audit: AuditRecorder,
    clock: Arc<dyn Clock>,
    config: Arc<AuthConfig>,
}

impl CredentialManager {
    #[must_use]
    pub fn new(
        users: Arc<dyn UserStore>,
        roles: Arc<dyn RoleStore>,
        hasher: Arc<dyn PasswordHasher>,
        two_factor: Arc<dyn TwoFactorVerifier>,
        audit: AuditRecorder,
        clock: Arc<dyn Clock>,
        config: Arc<AuthConfig>,
    ) -> Self {
        Self {
            users,
            roles,
            hasher,
            two_factor,
            audit,
            clock,
            config,
        }
    }

    /// Check identifier, password and (when enabled) the two-factor code.
    ///
    /// A wrong password bumps the failed-login counter and may lock the
    /// account. A missing or wrong two-factor code never touches the counter.
    ///
    /// # Errors
    /// Returns the credential error describing why the login was refused, or
    /// [`AuthError::Unavailable`] on store failure.
    #[instrument(skip(self, password, code, origin))]
    pub async fn verify_login(
        &self,
        identifier: &str,
        password: &str,
        code: Option<&str>,
        origin: &Origin,
    ) -> AuthResult<User> {
        let Some(mut user) = self
            .users
            .find_login_candidate(identifier)
            .await
            .map_err(AuthError::unavailable)?
        else {
            debug!("no account matches identifier");
            return Err(AuthError::InvalidCredentials);
        };

        if !user.is_active {
            return Err(AuthError::AccountDisabled);
        }

        let now = self.clock.now();
        if let Some(until) = user.locked_at(now) {
            return Err(AuthError::AccountLocked { until });
        }

        if !self.verify_password(password, &user.password_hash).await? {
            self.record_failure(&user, origin).await?;
            return Err(AuthError::InvalidCredentials);
        }

        if user.is_two_factor_enabled {
            let code = code.map(str::trim).filter(|code| !code.is_empty());
            let Some(code) = code else {
                return Err(AuthError::TwoFactorRequired);
            };
            let verified = user
                .two_factor_secret
                .as_deref()
                .is_some_and(|secret| self.two_factor.verify(secret, code));
            if !verified {
                return Err(AuthError::InvalidTwoFactorCode);
            }
        }

        self.users
            .record_login_success(user.id, now, origin.ip_address.as_deref())
            .await
            .map_err(AuthError::unavailable)?;
        user.failed_login_count = 0;
        user.locked_until = None;
        user.last_login_at = Some(now);
        user.last_login_ip.clone_from(&origin.ip_address);

        info!(user_id = %user.id, "login succeeded");
        Ok(user)
    }

    async fn record_failure(&self, user: &User, origin: &Origin) -> AuthResult<()> {
        let now = self.clock.now();
        let threshold = self.config.max_failed_logins();
        let lock_until = now + self.config.lockout_duration();
        let state = self
            .users
            .register_failed_login(user.id, threshold, lock_until)
            .await
            .map_err(AuthError::unavailable)?;

        self.audit.login_failed(user.id, origin, now).await;
        if state.failed_login_count >= threshold {
            self.audit
                .account_locked(user.id, state.locked_until.unwrap_or(lock_until), origin, now)
                .await;
        }
        Ok(())
    }

    /// Create an active account and attach the default role.
    ///
    /// # Errors
    /// Returns [`AuthError::WeakPassword`] or [`AuthError::DuplicateIdentity`]
    /// when the request is refused.
    #[instrument(skip(self, password, profile))]
    pub async fn register(
        &self,
        username: &str,
        email: &str,
        password: &str,
        profile: Profile,
    ) -> AuthResult<User> {
        self.config
            .password_policy()
            .check(password)
            .map_err(AuthError::WeakPassword)?;

        let username = username.trim().to_string();
        let email = normalize_email(email);
        if self
            .users
            .identity_taken(&username, &email)
            .await
            .map_err(AuthError::unavailable)?
        {
            return Err(AuthError::DuplicateIdentity);
        }

        let password_hash = self.hash_password(password).await?;
        let outcome = self
            .users
            .insert_user(
                NewUser {
                    username,
                    email,
                    password_hash,
                    first_name: profile.first_name,
                    last_name: profile.last_name,
                },
                self.clock.now(),
            )
            .await
            .map_err(AuthError::unavailable)?;
        // Lost a race with a concurrent registration.
        let InsertOutcome::Created(user) = outcome else {
            return Err(AuthError::DuplicateIdentity);
        };

        let role = self
            .roles
            .ensure_role(NewRole {
                name: DEFAULT_ROLE.to_string(),
                display_name: "User".to_string(),
                description: "Default user role".to_string(),
                is_system: true,
            })
            .await
            .map_err(AuthError::unavailable)?;
        self.roles
            .assign_role(user.id, role.id, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?;

        info!(user_id = %user.id, "user registered");
        Ok(user)
    }

    /// Replace the password after verifying the current one.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidCredentials`] if the current password is
    /// wrong and [`AuthError::WeakPassword`] if the new one fails the policy.
    #[instrument(skip(self, current_password, new_password))]
    pub async fn change_password(
        &self,
        user_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> AuthResult<()> {
        let user = self
            .users
            .find_user(user_id)
            .await
            .map_err(AuthError::unavailable)?
            .ok_or(AuthError::InvalidCredentials)?;

        if !self
            .verify_password(current_password, &user.password_hash)
            .await?
        {
            return Err(AuthError::InvalidCredentials);
        }
        self.config
            .password_policy()
            .check(new_password)
            .map_err(AuthError::WeakPassword)?;

        let password_hash = self.hash_password(new_password).await?;
        self.users
            .update_password_hash(user.id, &password_hash, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?;

        info!(%user_id, "password changed");
        Ok(())
    }

    async fn verify_password(&self, password: &str, hash: &str) -> AuthResult<bool> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        let hash = hash.to_string();
        tokio::task::spawn_blocking(move || hasher.verify(&password, &hash))
            .await
            .map_err(AuthError::unavailable)
    }

    async fn hash_password(&self, password: &str) -> AuthResult<String> {
        let hasher = Arc::clone(&self.hasher);
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hasher.hash(&password))
            .await
            .map_err(AuthError::unavailable)?
            .map_err(AuthError::unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{
        clock::ManualClock,
        models::{SecurityEventType, Severity},
        password::Argon2Hasher,
        store::MemoryStore,
    };
    use anyhow::{Result, anyhow};
    use chrono::{Duration, Utc};
    use secrecy::SecretString;

    const PASSWORD: &str = "Sup3r-Secret!";
    const SECRET: &str = "TOTPSECRET";

    struct FixedCode;

    impl TwoFactorVerifier for FixedCode {
        fn verify(&self, secret: &str, code: &str) -> bool {
            secret == SECRET && code == "123456"
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        manager: CredentialManager,
    }

    fn fixture() -> Result<Fixture> {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let manager = CredentialManager::new(
            store.clone(),
            store.clone(),
            Arc::new(Argon2Hasher::with_params(8, 1, 1)?),
            Arc::new(FixedCode),
            AuditRecorder::new(store.clone()),
            clock.clone(),
            Arc::new(AuthConfig::new(SecretString::from("unused"))),
        );
        Ok(Fixture {
            store,
            clock,
            manager,
        })
    }

    async fn alice(fx: &Fixture) -> Result<User> {
        Ok(fx
            .manager
            .register("alice", "Alice@X.com", PASSWORD, Profile::default())
            .await?)
    }

    #[tokio::test]
    async fn register_normalizes_and_attaches_default_role() -> Result<()> {
        let fx = fixture()?;
        let user = alice(&fx).await?;
        assert_eq!(user.email, "alice@x.com");
        assert!(user.is_active);
        assert!(user.password_hash.starts_with("$argon2id$"));

        let roles = fx.store.roles_for_user(user.id).await?;
        assert_eq!(roles.len(), 1);
        assert_eq!(roles[0].name, DEFAULT_ROLE);
        assert!(roles[0].is_system);
        Ok(())
    }

    #[tokio::test]
    async fn register_rejects_duplicates_and_weak_passwords() -> Result<()> {
        let fx = fixture()?;
        alice(&fx).await?;

        let err = fx
            .manager
            .register("alice", "other@x.com", PASSWORD, Profile::default())
            .await;
        assert!(matches!(err, Err(AuthError::DuplicateIdentity)));
        let err = fx
            .manager
            .register("alice2", " ALICE@x.com", PASSWORD, Profile::default())
            .await;
        assert!(matches!(err, Err(AuthError::DuplicateIdentity)));

        let err = fx
            .manager
            .register("bob", "bob@x.com", "password", Profile::default())
            .await;
        assert!(matches!(err, Err(AuthError::WeakPassword(_))));
        Ok(())
    }

    #[tokio::test]
    async fn unknown_user_and_wrong_password_look_identical() -> Result<()> {
        let fx = fixture()?;
        alice(&fx).await?;
        let origin = Origin::default();

        let unknown = fx.manager.verify_login("nobody", PASSWORD, None, &origin).await;
        let wrong = fx.manager.verify_login("alice", "nope", None, &origin).await;
        match (unknown, wrong) {
            (Err(a), Err(b)) => assert_eq!(a.to_string(), b.to_string()),
            _ => return Err(anyhow!("both logins should fail")),
        }
        Ok(())
    }

    #[tokio::test]
    async fn successful_login_resets_counter_and_stamps_origin() -> Result<()> {
        let fx = fixture()?;
        let user = alice(&fx).await?;
        let origin = Origin::new(Some("203.0.113.9".to_string()), None);

        let _ = fx.manager.verify_login("alice", "nope", None, &origin).await;
        let logged_in = fx
            .manager
            .verify_login("alice@x.com", PASSWORD, None, &origin)
            .await?;
        assert_eq!(logged_in.id, user.id);

        let stored = fx.store.user(user.id).await.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(stored.failed_login_count, 0);
        assert_eq!(stored.last_login_at, Some(fx.clock.now()));
        assert_eq!(stored.last_login_ip.as_deref(), Some("203.0.113.9"));
        Ok(())
    }

    #[tokio::test]
    async fn five_failures_lock_even_the_correct_password() -> Result<()> {
        let fx = fixture()?;
        let user = alice(&fx).await?;
        let origin = Origin::default();

        for _ in 0..5 {
            let err = fx.manager.verify_login("alice", "wrong", None, &origin).await;
            assert!(matches!(err, Err(AuthError::InvalidCredentials)));
        }
        let expected_until = fx.clock.now() + Duration::minutes(30);
        let err = fx.manager.verify_login("alice", PASSWORD, None, &origin).await;
        match err {
            Err(AuthError::AccountLocked { until }) => assert_eq!(until, expected_until),
            other => return Err(anyhow!("expected lockout, got {other:?}")),
        }

        let events = fx.store.security_events().await;
        let failed = events
            .iter()
            .filter(|event| event.event_type == SecurityEventType::LoginFailed)
            .count();
        let locked: Vec<_> = events
            .iter()
            .filter(|event| event.event_type == SecurityEventType::AccountLocked)
            .collect();
        assert_eq!(failed, 5);
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].severity, Severity::High);
        assert_eq!(locked[0].user_id, Some(user.id));

        fx.clock.advance(Duration::minutes(30));
        fx.manager
            .verify_login("alice", PASSWORD, None, &origin)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn disabled_and_deleted_accounts() -> Result<()> {
        let fx = fixture()?;
        let user = alice(&fx).await?;
        let origin = Origin::default();

        fx.store.set_active(user.id, false).await?;
        let err = fx.manager.verify_login("alice", PASSWORD, None, &origin).await;
        assert!(matches!(err, Err(AuthError::AccountDisabled)));

        fx.store.set_active(user.id, true).await?;
        fx.store.soft_delete_user(user.id, fx.clock.now()).await?;
        let err = fx.manager.verify_login("alice", PASSWORD, None, &origin).await;
        assert!(matches!(err, Err(AuthError::InvalidCredentials)));

        let err = fx
            .manager
            .register("alice", "new@x.com", PASSWORD, Profile::default())
            .await;
        assert!(matches!(err, Err(AuthError::DuplicateIdentity)));
        Ok(())
    }

    #[tokio::test]
    async fn two_factor_failures_leave_counter_untouched() -> Result<()> {
        let fx = fixture()?;
        let user = alice(&fx).await?;
        fx.store.enable_two_factor(user.id, SECRET).await?;
        let origin = Origin::default();

        let err = fx.manager.verify_login("alice", PASSWORD, None, &origin).await;
        assert!(matches!(err, Err(AuthError::TwoFactorRequired)));
        let err = fx
            .manager
            .verify_login("alice", PASSWORD, Some("  "), &origin)
            .await;
        assert!(matches!(err, Err(AuthError::TwoFactorRequired)));
        let err = fx
            .manager
            .verify_login("alice", PASSWORD, Some("654321"), &origin)
            .await;
        assert!(matches!(err, Err(AuthError::InvalidTwoFactorCode)));

        let stored = fx.store.user(user.id).await.ok_or_else(|| anyhow!("missing"))?;
        assert_eq!(stored.failed_login_count, 0);
        assert!(fx.store.security_events().await.is_empty());

        fx.manager
            .verify_login("alice", PASSWORD, Some("123456"), &origin)
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn change_password_checks_current_and_policy() -> Result<()> {
        let fx = fixture()?;
        let user = alice(&fx).await?;
        let origin = Origin::default();

        let err = fx
            .manager
            .change_password(user.id, "wrong", "N3w-Passw0rd!")
            .await;
        assert!(matches!(err, Err(AuthError::InvalidCredentials)));
        let err = fx.manager.change_password(user.id, PASSWORD, "weak").await;
        assert!(matches!(err, Err(AuthError::WeakPassword(_))));

        fx.manager
            .change_password(user.id, PASSWORD, "N3w-Passw0rd!")
            .await?;
        let err = fx.manager.verify_login("alice", PASSWORD, None, &origin).await;
        assert!(matches!(err, Err(AuthError::InvalidCredentials)));
        fx.manager
            .verify_login("alice", "N3w-Passw0rd!", None, &origin)
            .await?;
        Ok(())
    }
}
