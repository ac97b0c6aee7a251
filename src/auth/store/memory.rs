//! In-process store used by tests and local development.
//!
//! All tables live behind one lock, so every trait method is atomic with
//! respect to the others.

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    FailedLoginState, InsertOutcome, RoleStore, SecurityEventSink, SessionStore, UserStore,
};
use crate::auth::{
    models::{NewPermission, NewRole, NewUser, Permission, Role, SecurityEvent, Session, User},
    utils::normalize_email,
};

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<Uuid, User>,
    roles: HashMap<Uuid, Role>,
    permissions: HashMap<Uuid, Permission>,
    user_roles: BTreeSet<(Uuid, Uuid)>,
    role_permissions: BTreeSet<(Uuid, Uuid)>,
    sessions: HashMap<Uuid, Session>,
    security_events: Vec<SecurityEvent>,
}

impl Tables {
    fn live_user(&self, user_id: Uuid) -> Option<&User> {
        self.users.get(&user_id).filter(|user| !user.is_deleted())
    }

    fn identity_taken(&self, username: &str, email: &str) -> bool {
        let folded = username.to_lowercase();
        self.users.values().any(|user| {
            user.username == username
                || user.email == email
                || user.username.to_lowercase() == email
                || user.email == folded
        })
    }

    fn role_ids_of(&self, user_id: Uuid) -> Vec<Uuid> {
        if self.live_user(user_id).is_none() {
            return Vec::new();
        }
        self.user_roles
            .iter()
            .filter(|(user, _)| *user == user_id)
            .map(|(_, role)| *role)
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded security event, oldest first.
    pub async fn security_events(&self) -> Vec<SecurityEvent> {
        self.tables.lock().await.security_events.clone()
    }

    /// Any session by id, including revoked or expired ones.
    pub async fn session(&self, session_id: Uuid) -> Option<Session> {
        self.tables.lock().await.sessions.get(&session_id).cloned()
    }

    /// Any user by id, including soft-deleted ones.
    pub async fn user(&self, user_id: Uuid) -> Option<User> {
        self.tables.lock().await.users.get(&user_id).cloned()
    }

    /// Mark a user deleted without removing the row.
    pub async fn soft_delete_user(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
        user.deleted_at = Some(at);
        Ok(())
    }

    pub async fn set_active(&self, user_id: Uuid, active: bool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
        user.is_active = active;
        Ok(())
    }

    /// Enable two-factor with a base32 secret.
    pub async fn enable_two_factor(&self, user_id: Uuid, secret: &str) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("unknown user {user_id}"))?;
        user.is_two_factor_enabled = true;
        user.two_factor_secret = Some(secret.to_string());
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_login_candidate(&self, identifier: &str) -> Result<Option<User>> {
        let username = identifier.trim();
        let email = normalize_email(identifier);
        let by_email = identifier.contains('@');
        let tables = self.tables.lock().await;
        Ok(tables
            .users
            .values()
            .filter(|user| !user.is_deleted() && (user.username == username || user.email == email))
            .min_by_key(|user| {
                let preferred = if by_email {
                    user.email == email
                } else {
                    user.username == username
                };
                (!preferred, user.created_at, user.id)
            })
            .cloned())
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        Ok(self.tables.lock().await.live_user(user_id).cloned())
    }

    async fn identity_taken(&self, username: &str, email: &str) -> Result<bool> {
        let tables = self.tables.lock().await;
        Ok(tables.identity_taken(username, email))
    }

    async fn insert_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<InsertOutcome> {
        let mut tables = self.tables.lock().await;
        if tables.identity_taken(&user.username, &user.email) {
            return Ok(InsertOutcome::Conflict);
        }
        let record = User {
            id: Uuid::new_v4(),
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            first_name: user.first_name,
            last_name: user.last_name,
            is_active: true,
            is_two_factor_enabled: false,
            two_factor_secret: None,
            failed_login_count: 0,
            locked_until: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        tables.users.insert(record.id, record.clone());
        Ok(InsertOutcome::Created(record))
    }

    async fn register_failed_login(
        &self,
        user_id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> Result<FailedLoginState> {
        let mut tables = self.tables.lock().await;
        let user = tables
            .users
            .get_mut(&user_id)
            .ok_or_else(|| anyhow!("user {user_id} vanished while recording failed login"))?;
        user.failed_login_count += 1;
        if user.failed_login_count >= threshold {
            user.locked_until = Some(lock_until);
        }
        Ok(FailedLoginState {
            failed_login_count: user.failed_login_count,
            locked_until: user.locked_until,
        })
    }

    async fn record_login_success(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.failed_login_count = 0;
            user.locked_until = None;
            user.last_login_at = Some(at);
            user.last_login_ip = ip_address.map(str::to_string);
            user.updated_at = at;
        }
        Ok(())
    }

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if let Some(user) = tables.users.get_mut(&user_id) {
            user.password_hash = password_hash.to_string();
            user.updated_at = at;
        }
        Ok(())
    }
}

#[async_trait]
impl RoleStore for MemoryStore {
    async fn find_role(&self, name: &str) -> Result<Option<Role>> {
        let tables = self.tables.lock().await;
        Ok(tables.roles.values().find(|role| role.name == name).cloned())
    }

    async fn ensure_role(&self, role: NewRole) -> Result<Role> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.roles.values().find(|existing| existing.name == role.name) {
            return Ok(existing.clone());
        }
        let record = Role {
            id: Uuid::new_v4(),
            name: role.name,
            display_name: role.display_name,
            description: role.description,
            is_system: role.is_system,
        };
        tables.roles.insert(record.id, record.clone());
        Ok(record)
    }

    async fn ensure_permission(&self, permission: NewPermission) -> Result<Permission> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.permissions.values().find(|existing| {
            existing.resource == permission.resource && existing.action == permission.action
        }) {
            return Ok(existing.clone());
        }
        let record = Permission {
            id: Uuid::new_v4(),
            name: permission.name,
            display_name: permission.display_name,
            description: permission.description,
            resource: permission.resource,
            action: permission.action,
        };
        tables.permissions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn grant_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if !tables.roles.contains_key(&role_id) || !tables.permissions.contains_key(&permission_id)
        {
            return Err(anyhow!("unknown role or permission"));
        }
        tables.role_permissions.insert((role_id, permission_id));
        Ok(())
    }

    async fn assign_role(&self, user_id: Uuid, role_id: Uuid, _at: DateTime<Utc>) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(&user_id) || !tables.roles.contains_key(&role_id) {
            return Err(anyhow!("unknown user or role"));
        }
        tables.user_roles.insert((user_id, role_id));
        Ok(())
    }

    async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool> {
        Ok(self.tables.lock().await.user_roles.remove(&(user_id, role_id)))
    }

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>> {
        let tables = self.tables.lock().await;
        let mut roles: Vec<Role> = tables
            .role_ids_of(user_id)
            .iter()
            .filter_map(|role_id| tables.roles.get(role_id).cloned())
            .collect();
        roles.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(roles)
    }

    async fn permissions_for_roles(&self, role_ids: &[Uuid]) -> Result<Vec<Permission>> {
        let tables = self.tables.lock().await;
        let wanted: BTreeSet<&Uuid> = role_ids.iter().collect();
        let mut by_key = BTreeMap::new();
        for (role_id, permission_id) in &tables.role_permissions {
            if !wanted.contains(role_id) {
                continue;
            }
            if let Some(permission) = tables.permissions.get(permission_id) {
                by_key.insert(permission.key(), permission.clone());
            }
        }
        Ok(by_key.into_values().collect())
    }

    async fn user_has_grant(&self, user_id: Uuid, resource: &str, action: &str) -> Result<bool> {
        let tables = self.tables.lock().await;
        let role_ids = tables.role_ids_of(user_id);
        Ok(tables
            .role_permissions
            .iter()
            .filter(|(role_id, _)| role_ids.contains(role_id))
            .filter_map(|(_, permission_id)| tables.permissions.get(permission_id))
            .any(|permission| permission.resource == resource && permission.action == action))
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if tables.sessions.contains_key(&session.id)
            || tables
                .sessions
                .values()
                .any(|existing| existing.refresh_token_hash == session.refresh_token_hash)
        {
            return Err(anyhow!("duplicate session"));
        }
        tables.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_active_by_refresh_hash(
        &self,
        refresh_token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .values()
            .find(|session| {
                session.refresh_token_hash.as_slice() == refresh_token_hash && session.is_valid(now)
            })
            .cloned())
    }

    async fn find_active_by_id(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .sessions
            .get(&session_id)
            .filter(|session| session.is_valid(now))
            .cloned())
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        access_token_hash: &[u8],
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.sessions.get_mut(&session_id) {
            Some(session) if session.is_valid(at) => {
                session.access_token_hash = access_token_hash.to_vec();
                session.last_used_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let mut tables = self.tables.lock().await;
        match tables.sessions.get_mut(&session_id) {
            Some(session) if session.revoked_at.is_none() => {
                session.revoked_at = Some(at);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn revoke_user_sessions(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let mut tables = self.tables.lock().await;
        let mut revoked = Vec::new();
        for session in tables.sessions.values_mut() {
            if session.user_id == user_id && session.revoked_at.is_none() {
                session.revoked_at = Some(at);
                revoked.push(session.id);
            }
        }
        Ok(revoked)
    }
}

#[async_trait]
impl SecurityEventSink for MemoryStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        self.tables.lock().await.security_events.push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn new_user(username: &str, email: &str) -> NewUser {
        NewUser {
            username: username.to_string(),
            email: email.to_string(),
            password_hash: "hash".to_string(),
            first_name: String::new(),
            last_name: String::new(),
        }
    }

    async fn created(store: &MemoryStore, username: &str, email: &str) -> Result<User> {
        match store.insert_user(new_user(username, email), Utc::now()).await? {
            InsertOutcome::Created(user) => Ok(user),
            InsertOutcome::Conflict => Err(anyhow!("unexpected conflict")),
        }
    }

    #[tokio::test]
    async fn insert_user_rejects_duplicate_identity() -> Result<()> {
        let store = MemoryStore::new();
        created(&store, "alice", "alice@x.com").await?;

        let outcome = store
            .insert_user(new_user("alice", "other@x.com"), Utc::now())
            .await?;
        assert!(matches!(outcome, InsertOutcome::Conflict));
        let outcome = store
            .insert_user(new_user("other", "alice@x.com"), Utc::now())
            .await?;
        assert!(matches!(outcome, InsertOutcome::Conflict));
        Ok(())
    }

    #[tokio::test]
    async fn login_lookup_matches_username_or_email() -> Result<()> {
        let store = MemoryStore::new();
        let user = created(&store, "alice", "alice@x.com").await?;

        let by_name = store.find_login_candidate("alice").await?;
        let by_email = store.find_login_candidate(" Alice@X.com ").await?;
        assert_eq!(by_name.map(|u| u.id), Some(user.id));
        assert_eq!(by_email.map(|u| u.id), Some(user.id));
        assert!(store.find_login_candidate("bob").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn soft_deleted_users_are_hidden_but_reserved() -> Result<()> {
        let store = MemoryStore::new();
        let user = created(&store, "alice", "alice@x.com").await?;
        store.soft_delete_user(user.id, Utc::now()).await?;

        assert!(store.find_login_candidate("alice").await?.is_none());
        assert!(store.find_user(user.id).await?.is_none());
        assert!(store.identity_taken("alice", "new@x.com").await?);
        Ok(())
    }

    #[tokio::test]
    async fn failed_logins_lock_at_threshold() -> Result<()> {
        let store = MemoryStore::new();
        let user = created(&store, "alice", "alice@x.com").await?;
        let until = Utc::now() + Duration::minutes(30);

        for expected in 1..5 {
            let state = store.register_failed_login(user.id, 5, until).await?;
            assert_eq!(state.failed_login_count, expected);
            assert_eq!(state.locked_until, None);
        }
        let state = store.register_failed_login(user.id, 5, until).await?;
        assert_eq!(state.failed_login_count, 5);
        assert_eq!(state.locked_until, Some(until));

        store.record_login_success(user.id, Utc::now(), None).await?;
        let reset = store.user(user.id).await;
        assert_eq!(reset.as_ref().map(|u| u.failed_login_count), Some(0));
        assert_eq!(reset.and_then(|u| u.locked_until), None);
        Ok(())
    }

    #[tokio::test]
    async fn revoke_session_reports_first_revocation_only() -> Result<()> {
        let store = MemoryStore::new();
        let now = Utc::now();
        let session = Session {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            access_token_hash: vec![1],
            refresh_token_hash: vec![2],
            ip_address: None,
            user_agent: None,
            expires_at: now + Duration::hours(1),
            last_used_at: now,
            created_at: now,
            revoked_at: None,
        };
        store.insert_session(&session).await?;
        assert!(store.find_active_by_refresh_hash(&[2], now).await?.is_some());

        assert!(store.revoke_session(session.id, now).await?);
        assert!(!store.revoke_session(session.id, now).await?);
        assert!(store.find_active_by_id(session.id, now).await?.is_none());
        assert!(store.find_active_by_refresh_hash(&[2], now).await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn permissions_for_roles_are_distinct() -> Result<()> {
        let store = MemoryStore::new();
        let admin = store
            .ensure_role(NewRole {
                name: "ops".to_string(),
                display_name: "Ops".to_string(),
                description: String::new(),
                is_system: false,
            })
            .await?;
        let support = store
            .ensure_role(NewRole {
                name: "support".to_string(),
                display_name: "Support".to_string(),
                description: String::new(),
                is_system: false,
            })
            .await?;
        let read = store
            .ensure_permission(NewPermission::for_pair("domain", "read"))
            .await?;
        let again = store
            .ensure_permission(NewPermission::for_pair("domain", "read"))
            .await?;
        assert_eq!(read.id, again.id);

        store.grant_permission(admin.id, read.id).await?;
        store.grant_permission(support.id, read.id).await?;
        let permissions = store.permissions_for_roles(&[admin.id, support.id]).await?;
        assert_eq!(permissions.len(), 1);
        Ok(())
    }
}
