//! Durable storage seams for users, roles, sessions and security events.
//!
//! Every method returns `anyhow::Result`; callers map failures to
//! `AuthError::Unavailable`. Soft-deleted users are invisible to login and
//! permission lookups but still reserve their username and email.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::{NewPermission, NewRole, NewUser, Permission, Role, SecurityEvent, Session, User};

pub use memory::MemoryStore;
pub use postgres::{PgStore, apply_schema};

/// Result of inserting a user under the username/email uniqueness constraint.
#[derive(Debug)]
pub enum InsertOutcome {
    Created(User),
    Conflict,
}

/// Counter state after recording a failed login.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FailedLoginState {
    pub failed_login_count: i32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait UserStore: Send + Sync {
    /// Non-deleted user whose username or normalized email matches, active or
    /// not. When several rows match, an identifier containing `@` prefers the
    /// email match and any other identifier prefers the username match; ties
    /// go to the oldest account.
    async fn find_login_candidate(&self, identifier: &str) -> Result<Option<User>>;

    /// Non-deleted user by id.
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>>;

    /// True if any user, deleted or not, holds the username or email, or holds
    /// an email equal to the username or a username equal to the email
    /// (compared case-insensitively).
    async fn identity_taken(&self, username: &str, email: &str) -> Result<bool>;

    /// Insert unless [`UserStore::identity_taken`] would hold for the new row.
    async fn insert_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<InsertOutcome>;

    /// Atomically increment the failure counter; once it reaches `threshold`
    /// set `locked_until = lock_until`.
    async fn register_failed_login(
        &self,
        user_id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> Result<FailedLoginState>;

    /// Reset the failure counter, clear the lock and stamp the last login.
    async fn record_login_success(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<()>;

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<()>;
}

#[async_trait]
pub trait RoleStore: Send + Sync {
    async fn find_role(&self, name: &str) -> Result<Option<Role>>;

    /// Create the role if absent and return it.
    async fn ensure_role(&self, role: NewRole) -> Result<Role>;

    /// Create the `(resource, action)` permission if absent and return it.
    async fn ensure_permission(&self, permission: NewPermission) -> Result<Permission>;

    /// Idempotent.
    async fn grant_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<()>;

    /// Idempotent.
    async fn assign_role(&self, user_id: Uuid, role_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Returns whether an assignment was removed.
    async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool>;

    /// Roles held by a non-deleted user, ordered by name.
    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>>;

    /// Distinct permissions granted to any of `role_ids`.
    async fn permissions_for_roles(&self, role_ids: &[Uuid]) -> Result<Vec<Permission>>;

    /// Existence check over the user/role/permission join.
    async fn user_has_grant(&self, user_id: Uuid, resource: &str, action: &str) -> Result<bool>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Round-trip to the backing store, for health reporting.
    async fn ping(&self) -> Result<()>;

    async fn insert_session(&self, session: &Session) -> Result<()>;

    /// Unrevoked, unexpired session whose refresh hash matches.
    async fn find_active_by_refresh_hash(
        &self,
        refresh_token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Session>>;

    /// Unrevoked, unexpired session by id.
    async fn find_active_by_id(&self, session_id: Uuid, now: DateTime<Utc>) -> Result<Option<Session>>;

    /// Record a refresh on a session that is still unrevoked and unexpired at
    /// `at`: new access-token hash and last-used time. Returns whether the row
    /// was updated.
    async fn touch_session(
        &self,
        session_id: Uuid,
        access_token_hash: &[u8],
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Set `revoked_at` if unset. Returns whether this call revoked it.
    async fn revoke_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<bool>;

    /// Revoke every live session of a user and return their ids.
    async fn revoke_user_sessions(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<Vec<Uuid>>;
}

#[async_trait]
pub trait SecurityEventSink: Send + Sync {
    async fn append(&self, event: &SecurityEvent) -> Result<()>;
}
