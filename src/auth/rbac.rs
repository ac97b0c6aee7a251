//! Role-based access control.
//!
//! Users hold roles, roles hold `(resource, action)` permissions. A user's
//! effective permissions are the union over their roles. Holders of the role
//! named [`ADMIN_ROLE`] pass every [`RbacResolver::has_permission`] check.

use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::{
    clock::Clock,
    error::{AuthError, AuthResult},
    models::{NewPermission, NewRole, Permission, PermissionKey, Role},
    store::{RoleStore, UserStore},
};

/// Super-role: bypasses every permission check.
pub const ADMIN_ROLE: &str = "admin";

/// Collapse permissions into their distinct `(resource, action)` keys.
pub fn permission_set<'a>(permissions: impl IntoIterator<Item = &'a Permission>) -> BTreeSet<PermissionKey> {
    permissions.into_iter().map(Permission::key).collect()
}

/// True when any of `roles` is the admin super-role.
pub fn holds_admin<'a>(roles: impl IntoIterator<Item = &'a str>) -> bool {
    roles.into_iter().any(|role| role == ADMIN_ROLE)
}

pub struct RbacResolver {
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    clock: Arc<dyn Clock>,
}

impl RbacResolver {
    #[must_use]
    pub fn new(users: Arc<dyn UserStore>, roles: Arc<dyn RoleStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            users,
            roles,
            clock,
        }
    }

    /// Explicitly granted permissions of `user_id`. The admin bypass is not
    /// expanded here; it only applies to [`Self::has_permission`].
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] on store failure.
    #[instrument(skip(self))]
    pub async fn permissions_of(&self, user_id: Uuid) -> AuthResult<BTreeSet<PermissionKey>> {
        let roles = self.roles_of(user_id).await?;
        let role_ids: Vec<Uuid> = roles.iter().map(|role| role.id).collect();
        let permissions = self
            .roles
            .permissions_for_roles(&role_ids)
            .await
            .map_err(AuthError::unavailable)?;
        Ok(permission_set(&permissions))
    }

    /// # Errors
    /// Returns [`AuthError::Unavailable`] on store failure.
    #[instrument(skip(self))]
    pub async fn has_permission(&self, user_id: Uuid, resource: &str, action: &str) -> AuthResult<bool> {
        let roles = self.roles_of(user_id).await?;
        if holds_admin(roles.iter().map(|role| role.name.as_str())) {
            debug!("admin role bypasses permission check");
            return Ok(true);
        }
        if roles.is_empty() {
            return Ok(false);
        }
        self.roles
            .user_has_grant(user_id, resource, action)
            .await
            .map_err(AuthError::unavailable)
    }

    /// Roles of a non-deleted user, ordered by name.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] on store failure.
    pub async fn roles_of(&self, user_id: Uuid) -> AuthResult<Vec<Role>> {
        self.roles
            .roles_for_user(user_id)
            .await
            .map_err(AuthError::unavailable)
    }

    /// Attach an existing role. Assigning a role twice is a no-op.
    ///
    /// # Errors
    /// Returns [`AuthError::UnknownRole`] or [`AuthError::UnknownUser`].
    #[instrument(skip(self))]
    pub async fn assign_role(&self, user_id: Uuid, role_name: &str) -> AuthResult<()> {
        let role = self.resolve(user_id, role_name).await?;
        self.roles
            .assign_role(user_id, role.id, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?;
        info!(role = %role.name, "role assigned");
        Ok(())
    }

    /// Detach a role, returning whether the user held it.
    ///
    /// # Errors
    /// Returns [`AuthError::UnknownRole`] or [`AuthError::UnknownUser`].
    #[instrument(skip(self))]
    pub async fn revoke_role(&self, user_id: Uuid, role_name: &str) -> AuthResult<bool> {
        let role = self.resolve(user_id, role_name).await?;
        let removed = self
            .roles
            .revoke_role(user_id, role.id)
            .await
            .map_err(AuthError::unavailable)?;
        if removed {
            info!(role = %role.name, "role revoked");
        }
        Ok(removed)
    }

    /// Create a role if it does not exist yet.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] on store failure.
    pub async fn define_role(&self, name: &str, display_name: &str, description: &str) -> AuthResult<Role> {
        self.roles
            .ensure_role(NewRole {
                name: name.to_string(),
                display_name: display_name.to_string(),
                description: description.to_string(),
                is_system: false,
            })
            .await
            .map_err(AuthError::unavailable)
    }

    /// Grant `resource.action` to a role, creating the permission if needed.
    ///
    /// # Errors
    /// Returns [`AuthError::UnknownRole`] if the role does not exist.
    #[instrument(skip(self))]
    pub async fn grant(&self, role_name: &str, resource: &str, action: &str) -> AuthResult<()> {
        let role = self.find_role(role_name).await?;
        let permission = self
            .roles
            .ensure_permission(NewPermission::for_pair(resource, action))
            .await
            .map_err(AuthError::unavailable)?;
        self.roles
            .grant_permission(role.id, permission.id)
            .await
            .map_err(AuthError::unavailable)
    }

    async fn find_role(&self, role_name: &str) -> AuthResult<Role> {
        self.roles
            .find_role(role_name)
            .await
            .map_err(AuthError::unavailable)?
            .ok_or_else(|| AuthError::UnknownRole(role_name.to_string()))
    }

    async fn resolve(&self, user_id: Uuid, role_name: &str) -> AuthResult<Role> {
        let role = self.find_role(role_name).await?;
        self.users
            .find_user(user_id)
            .await
            .map_err(AuthError::unavailable)?
            .ok_or(AuthError::UnknownUser(user_id))?;
        Ok(role)
    }
}
