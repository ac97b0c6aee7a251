//! Records persisted by the auth core.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Account record. Password hash and two-factor secret never serialize.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub is_active: bool,
    pub is_two_factor_enabled: bool,
    #[serde(skip_serializing)]
    pub two_factor_secret: Option<String>,
    pub failed_login_count: i32,
    pub locked_until: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    /// Returns the unlock time when the account is locked at `now`.
    #[must_use]
    pub fn locked_at(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.locked_until.filter(|until| *until > now)
    }

    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields needed to insert a user.
#[derive(Clone, Debug)]
pub struct NewUser {
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
}

/// Optional profile data captured at registration.
#[derive(Clone, Debug, Default, Deserialize, ToSchema)]
pub struct Profile {
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct Role {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub is_system: bool,
}

#[derive(Clone, Debug)]
pub struct NewRole {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub is_system: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, ToSchema)]
pub struct Permission {
    pub id: Uuid,
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub resource: String,
    pub action: String,
}

impl Permission {
    #[must_use]
    pub fn key(&self) -> PermissionKey {
        PermissionKey::new(&self.resource, &self.action)
    }
}

#[derive(Clone, Debug)]
pub struct NewPermission {
    pub name: String,
    pub display_name: String,
    pub description: String,
    pub resource: String,
    pub action: String,
}

impl NewPermission {
    /// Permission named `resource.action`, e.g. `domain.create`.
    #[must_use]
    pub fn for_pair(resource: &str, action: &str) -> Self {
        Self {
            name: format!("{resource}.{action}"),
            display_name: format!("{action} {resource}"),
            description: String::new(),
            resource: resource.to_string(),
            action: action.to_string(),
        }
    }
}

/// A `(resource, action)` pair, the unit of authorization.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub struct PermissionKey {
    pub resource: String,
    pub action: String,
}

impl PermissionKey {
    #[must_use]
    pub fn new(resource: &str, action: &str) -> Self {
        Self {
            resource: resource.to_string(),
            action: action.to_string(),
        }
    }
}

/// Where a login came from.
#[derive(Clone, Debug, Default)]
pub struct Origin {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl Origin {
    #[must_use]
    pub fn new(ip_address: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            ip_address,
            user_agent,
        }
    }
}

/// One login instance. Token material is stored as SHA-256 digests only.
#[derive(Clone, Debug, Serialize, ToSchema)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,
    #[serde(skip_serializing)]
    pub access_token_hash: Vec<u8>,
    #[serde(skip_serializing)]
    pub refresh_token_hash: Vec<u8>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    /// A session is valid iff it is not revoked and `now` is before expiry.
    #[must_use]
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.revoked_at.is_none() && now < self.expires_at
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SecurityEventType {
    LoginFailed,
    AccountLocked,
}

impl SecurityEventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LoginFailed => "login_failed",
            Self::AccountLocked => "account_locked",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Append-only record of a security-relevant occurrence.
#[derive(Clone, Debug)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub user_id: Option<Uuid>,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub source: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn session(now: DateTime<Utc>) -> Session {
        Session {
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
        }
    }

    #[test]
    fn session_validity_requires_unrevoked_and_unexpired() {
        let now = Utc::now();
        let mut record = session(now);
        assert!(record.is_valid(now));
        assert!(!record.is_valid(now + Duration::hours(1)));

        record.revoked_at = Some(now);
        assert!(!record.is_valid(now));
    }

    #[test]
    fn locked_at_ignores_elapsed_lockouts() {
        let now = Utc::now();
        let mut user = User {
            id: Uuid::nil(),
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: String::new(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
            is_two_factor_enabled: false,
            two_factor_secret: None,
            failed_login_count: 5,
            locked_until: Some(now - Duration::minutes(1)),
            last_login_at: None,
            last_login_ip: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        assert_eq!(user.locked_at(now), None);

        let until = now + Duration::minutes(30);
        user.locked_until = Some(until);
        assert_eq!(user.locked_at(now), Some(until));
    }

    #[test]
    fn user_serialization_omits_secrets() {
        let now = Utc::now();
        let user = User {
            id: Uuid::nil(),
            username: "alice".to_string(),
            email: "alice@x.com".to_string(),
            password_hash: "$argon2id$secret".to_string(),
            first_name: String::new(),
            last_name: String::new(),
            is_active: true,
            is_two_factor_enabled: true,
            two_factor_secret: Some("JBSWY3DPEHPK3PXP".to_string()),
            failed_login_count: 0,
            locked_until: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let json = serde_json::to_string(&user).unwrap_or_default();
        assert!(json.contains("\"username\":\"alice\""));
        assert!(!json.contains("argon2"));
        assert!(!json.contains("JBSWY3DPEHPK3PXP"));
    }

    #[test]
    fn permission_names_follow_resource_action() {
        let permission = NewPermission::for_pair("domain", "create");
        assert_eq!(permission.name, "domain.create");
        assert_eq!(permission.resource, "domain");
        assert_eq!(permission.action, "create");
    }
}
