//! `PostgreSQL` implementation of the store traits.
//!
//! Every statement runs inside a `db.query` span carrying the operation, so
//! slow lookups show up in traces next to the request that issued them.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Connection, PgPool, Row, postgres::PgRow};
use tracing::{Instrument, info_span};
use uuid::Uuid;

use super::{
    FailedLoginState, InsertOutcome, RoleStore, SecurityEventSink, SessionStore, UserStore,
};
use crate::auth::{
    models::{NewPermission, NewRole, NewUser, Permission, Role, SecurityEvent, Session, User},
    utils::{is_unique_violation, normalize_email},
};

const SCHEMA_SQL: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/sql/schema.sql"));

const USER_COLUMNS: &str = "id, username, email, password_hash, first_name, last_name, \
    is_active, is_two_factor_enabled, two_factor_secret, failed_login_count, locked_until, \
    last_login_at, last_login_ip, created_at, updated_at, deleted_at";

const ROLE_COLUMNS: &str = "id, name, display_name, description, is_system";

const PERMISSION_COLUMNS: &str = "id, name, display_name, description, resource, action";

const SESSION_COLUMNS: &str = "id, user_id, access_token_hash, refresh_token_hash, ip_address, \
    user_agent, expires_at, last_used_at, created_at, revoked_at";

macro_rules! db_span {
    ($operation:literal) => {
        info_span!("db.query", db.system = "postgresql", db.operation = $operation)
    };
}

/// Store backed by a shared connection pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Apply `sql/schema.sql`. Every statement is idempotent.
///
/// # Errors
/// Returns an error if any statement fails.
pub async fn apply_schema(pool: &PgPool) -> Result<()> {
    let mut connection = pool
        .acquire()
        .await
        .context("failed to acquire connection for schema setup")?;

    for (index, statement) in split_sql_statements(SCHEMA_SQL).iter().enumerate() {
        sqlx::query(statement)
            .execute(&mut *connection)
            .instrument(db_span!("MIGRATE"))
            .await
            .with_context(|| format!("failed to execute schema statement {}", index + 1))?;
    }

    Ok(())
}

fn split_sql_statements(sql: &str) -> Vec<String> {
    let mut statements = Vec::new();
    let mut current = String::new();

    for line in sql.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with("--") {
            continue;
        }
        current.push_str(line);
        current.push('\n');

        if trimmed.ends_with(';') {
            let statement = current.trim();
            if !statement.is_empty() {
                statements.push(statement.to_string());
            }
            current.clear();
        }
    }

    let leftover = current.trim();
    if !leftover.is_empty() {
        statements.push(leftover.to_string());
    }

    statements
}

fn user_from_row(row: &PgRow) -> Result<User, sqlx::Error> {
    Ok(User {
        id: row.try_get("id")?,
        username: row.try_get("username")?,
        email: row.try_get("email")?,
        password_hash: row.try_get("password_hash")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        is_active: row.try_get("is_active")?,
        is_two_factor_enabled: row.try_get("is_two_factor_enabled")?,
        two_factor_secret: row.try_get("two_factor_secret")?,
        failed_login_count: row.try_get("failed_login_count")?,
        locked_until: row.try_get("locked_until")?,
        last_login_at: row.try_get("last_login_at")?,
        last_login_ip: row.try_get("last_login_ip")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
        deleted_at: row.try_get("deleted_at")?,
    })
}

fn role_from_row(row: &PgRow) -> Result<Role, sqlx::Error> {
    Ok(Role {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        is_system: row.try_get("is_system")?,
    })
}

fn permission_from_row(row: &PgRow) -> Result<Permission, sqlx::Error> {
    Ok(Permission {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        display_name: row.try_get("display_name")?,
        description: row.try_get("description")?,
        resource: row.try_get("resource")?,
        action: row.try_get("action")?,
    })
}

fn session_from_row(row: &PgRow) -> Result<Session, sqlx::Error> {
    Ok(Session {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        access_token_hash: row.try_get("access_token_hash")?,
        refresh_token_hash: row.try_get("refresh_token_hash")?,
        ip_address: row.try_get("ip_address")?,
        user_agent: row.try_get("user_agent")?,
        expires_at: row.try_get("expires_at")?,
        last_used_at: row.try_get("last_used_at")?,
        created_at: row.try_get("created_at")?,
        revoked_at: row.try_get("revoked_at")?,
    })
}

#[async_trait]
impl UserStore for PgStore {
    async fn find_login_candidate(&self, identifier: &str) -> Result<Option<User>> {
        let query = format!(
            "SELECT {USER_COLUMNS} FROM users \
             WHERE deleted_at IS NULL AND (username = $1 OR email = $2) \
             ORDER BY CASE WHEN $3 THEN email = $2 ELSE username = $1 END DESC, created_at, id \
             LIMIT 1"
        );
        let row = sqlx::query(&query)
            .bind(identifier.trim())
            .bind(normalize_email(identifier))
            .bind(identifier.contains('@'))
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to look up login candidate")?;
        row.as_ref()
            .map(user_from_row)
            .transpose()
            .context("failed to decode user row")
    }

    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>> {
        let query =
            format!("SELECT {USER_COLUMNS} FROM users WHERE id = $1 AND deleted_at IS NULL");
        let row = sqlx::query(&query)
            .bind(user_id)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to look up user")?;
        row.as_ref()
            .map(user_from_row)
            .transpose()
            .context("failed to decode user row")
    }

    async fn identity_taken(&self, username: &str, email: &str) -> Result<bool> {
        let query = "SELECT EXISTS (SELECT 1 FROM users \
                     WHERE username = $1 OR email = $2 OR lower(username) = $2 OR email = lower($1))";
        let taken: bool = sqlx::query_scalar(query)
            .bind(username)
            .bind(email)
            .fetch_one(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to check identity uniqueness")?;
        Ok(taken)
    }

    async fn insert_user(&self, user: NewUser, now: DateTime<Utc>) -> Result<InsertOutcome> {
        let query = format!(
            "INSERT INTO users (id, username, email, password_hash, first_name, last_name, created_at, updated_at) \
             SELECT $1, $2, $3, $4, $5, $6, $7, $7 \
             WHERE NOT EXISTS (SELECT 1 FROM users WHERE lower(username) = $3 OR email = lower($2)) \
             RETURNING {USER_COLUMNS}"
        );
        let result = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(&user.first_name)
            .bind(&user.last_name)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span!("INSERT"))
            .await;

        match result {
            Ok(Some(row)) => Ok(InsertOutcome::Created(
                user_from_row(&row).context("failed to decode user row")?,
            )),
            Ok(None) => Ok(InsertOutcome::Conflict),
            Err(err) if is_unique_violation(&err) => Ok(InsertOutcome::Conflict),
            Err(err) => Err(err).context("failed to insert user"),
        }
    }

    async fn register_failed_login(
        &self,
        user_id: Uuid,
        threshold: i32,
        lock_until: DateTime<Utc>,
    ) -> Result<FailedLoginState> {
        // Single statement so concurrent failures never under-count.
        let query = r"
            UPDATE users
            SET failed_login_count = failed_login_count + 1,
                locked_until = CASE
                    WHEN failed_login_count + 1 >= $2 THEN $3
                    ELSE locked_until
                END,
                updated_at = NOW()
            WHERE id = $1
            RETURNING failed_login_count, locked_until
        ";
        let row = sqlx::query(query)
            .bind(user_id)
            .bind(threshold)
            .bind(lock_until)
            .fetch_optional(&self.pool)
            .instrument(db_span!("UPDATE"))
            .await
            .context("failed to record failed login")?
            .ok_or_else(|| anyhow!("user {user_id} vanished while recording failed login"))?;

        Ok(FailedLoginState {
            failed_login_count: row.try_get("failed_login_count")?,
            locked_until: row.try_get("locked_until")?,
        })
    }

    async fn record_login_success(
        &self,
        user_id: Uuid,
        at: DateTime<Utc>,
        ip_address: Option<&str>,
    ) -> Result<()> {
        let query = r"
            UPDATE users
            SET failed_login_count = 0,
                locked_until = NULL,
                last_login_at = $2,
                last_login_ip = $3,
                updated_at = $2
            WHERE id = $1
        ";
        sqlx::query(query)
            .bind(user_id)
            .bind(at)
            .bind(ip_address)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE"))
            .await
            .context("failed to record successful login")?;
        Ok(())
    }

    async fn update_password_hash(
        &self,
        user_id: Uuid,
        password_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<()> {
        let query = "UPDATE users SET password_hash = $2, updated_at = $3 WHERE id = $1";
        sqlx::query(query)
            .bind(user_id)
            .bind(password_hash)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE"))
            .await
            .context("failed to update password hash")?;
        Ok(())
    }
}

#[async_trait]
impl RoleStore for PgStore {
    async fn find_role(&self, name: &str) -> Result<Option<Role>> {
        let query = format!("SELECT {ROLE_COLUMNS} FROM roles WHERE name = $1");
        let row = sqlx::query(&query)
            .bind(name)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to look up role")?;
        row.as_ref()
            .map(role_from_row)
            .transpose()
            .context("failed to decode role row")
    }

    async fn ensure_role(&self, role: NewRole) -> Result<Role> {
        // The no-op update makes RETURNING yield the existing row on conflict.
        let query = format!(
            "INSERT INTO roles (id, name, display_name, description, is_system) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (name) DO UPDATE SET name = EXCLUDED.name \
             RETURNING {ROLE_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&role.name)
            .bind(&role.display_name)
            .bind(&role.description)
            .bind(role.is_system)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT"))
            .await
            .context("failed to ensure role")?;
        role_from_row(&row).context("failed to decode role row")
    }

    async fn ensure_permission(&self, permission: NewPermission) -> Result<Permission> {
        let query = format!(
            "INSERT INTO permissions (id, name, display_name, description, resource, action) \
             VALUES ($1, $2, $3, $4, $5, $6) \
             ON CONFLICT (resource, action) DO UPDATE SET resource = EXCLUDED.resource \
             RETURNING {PERMISSION_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(&permission.name)
            .bind(&permission.display_name)
            .bind(&permission.description)
            .bind(&permission.resource)
            .bind(&permission.action)
            .fetch_one(&self.pool)
            .instrument(db_span!("INSERT"))
            .await
            .context("failed to ensure permission")?;
        permission_from_row(&row).context("failed to decode permission row")
    }

    async fn grant_permission(&self, role_id: Uuid, permission_id: Uuid) -> Result<()> {
        let query = "INSERT INTO role_permissions (role_id, permission_id) VALUES ($1, $2) \
                     ON CONFLICT DO NOTHING";
        sqlx::query(query)
            .bind(role_id)
            .bind(permission_id)
            .execute(&self.pool)
            .instrument(db_span!("INSERT"))
            .await
            .context("failed to grant permission")?;
        Ok(())
    }

    async fn assign_role(&self, user_id: Uuid, role_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let query = "INSERT INTO user_roles (user_id, role_id, created_at) VALUES ($1, $2, $3) \
                     ON CONFLICT DO NOTHING";
        sqlx::query(query)
            .bind(user_id)
            .bind(role_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span!("INSERT"))
            .await
            .context("failed to assign role")?;
        Ok(())
    }

    async fn revoke_role(&self, user_id: Uuid, role_id: Uuid) -> Result<bool> {
        let query = "DELETE FROM user_roles WHERE user_id = $1 AND role_id = $2";
        let result = sqlx::query(query)
            .bind(user_id)
            .bind(role_id)
            .execute(&self.pool)
            .instrument(db_span!("DELETE"))
            .await
            .context("failed to revoke role")?;
        Ok(result.rows_affected() > 0)
    }

    async fn roles_for_user(&self, user_id: Uuid) -> Result<Vec<Role>> {
        let query = r"
            SELECT r.id, r.name, r.display_name, r.description, r.is_system
            FROM roles r
            JOIN user_roles ur ON ur.role_id = r.id
            JOIN users u ON u.id = ur.user_id
            WHERE ur.user_id = $1 AND u.deleted_at IS NULL
            ORDER BY r.name
        ";
        let rows = sqlx::query(query)
            .bind(user_id)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to load user roles")?;
        rows.iter()
            .map(role_from_row)
            .collect::<Result<_, _>>()
            .context("failed to decode role row")
    }

    async fn permissions_for_roles(&self, role_ids: &[Uuid]) -> Result<Vec<Permission>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        let query = r"
            SELECT DISTINCT p.id, p.name, p.display_name, p.description, p.resource, p.action
            FROM permissions p
            JOIN role_permissions rp ON rp.permission_id = p.id
            WHERE rp.role_id = ANY($1)
            ORDER BY p.resource, p.action
        ";
        let rows = sqlx::query(query)
            .bind(role_ids)
            .fetch_all(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to load role permissions")?;
        rows.iter()
            .map(permission_from_row)
            .collect::<Result<_, _>>()
            .context("failed to decode permission row")
    }

    async fn user_has_grant(&self, user_id: Uuid, resource: &str, action: &str) -> Result<bool> {
        let query = r"
            SELECT EXISTS (
                SELECT 1
                FROM user_roles ur
                JOIN users u ON u.id = ur.user_id AND u.deleted_at IS NULL
                JOIN role_permissions rp ON rp.role_id = ur.role_id
                JOIN permissions p ON p.id = rp.permission_id
                WHERE ur.user_id = $1 AND p.resource = $2 AND p.action = $3
            )
        ";
        let granted: bool = sqlx::query_scalar(query)
            .bind(user_id)
            .bind(resource)
            .bind(action)
            .fetch_one(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to check permission")?;
        Ok(granted)
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn ping(&self) -> Result<()> {
        let mut connection = self
            .pool
            .acquire()
            .instrument(info_span!(
                "db.acquire",
                db.system = "postgresql",
                db.operation = "ACQUIRE"
            ))
            .await
            .context("failed to acquire connection")?;
        connection
            .ping()
            .instrument(info_span!(
                "db.ping",
                db.system = "postgresql",
                db.operation = "PING"
            ))
            .await
            .context("failed to ping database")
    }

    async fn insert_session(&self, session: &Session) -> Result<()> {
        let query = r"
            INSERT INTO sessions (
                id, user_id, access_token_hash, refresh_token_hash, ip_address,
                user_agent, expires_at, last_used_at, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        sqlx::query(query)
            .bind(session.id)
            .bind(session.user_id)
            .bind(&session.access_token_hash)
            .bind(&session.refresh_token_hash)
            .bind(session.ip_address.as_deref())
            .bind(session.user_agent.as_deref())
            .bind(session.expires_at)
            .bind(session.last_used_at)
            .bind(session.created_at)
            .execute(&self.pool)
            .instrument(db_span!("INSERT"))
            .await
            .context("failed to insert session")?;
        Ok(())
    }

    async fn find_active_by_refresh_hash(
        &self,
        refresh_token_hash: &[u8],
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE refresh_token_hash = $1 AND revoked_at IS NULL AND expires_at > $2"
        );
        let row = sqlx::query(&query)
            .bind(refresh_token_hash)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to look up session by refresh token")?;
        row.as_ref()
            .map(session_from_row)
            .transpose()
            .context("failed to decode session row")
    }

    async fn find_active_by_id(
        &self,
        session_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<Session>> {
        let query = format!(
            "SELECT {SESSION_COLUMNS} FROM sessions \
             WHERE id = $1 AND revoked_at IS NULL AND expires_at > $2"
        );
        let row = sqlx::query(&query)
            .bind(session_id)
            .bind(now)
            .fetch_optional(&self.pool)
            .instrument(db_span!("SELECT"))
            .await
            .context("failed to look up session")?;
        row.as_ref()
            .map(session_from_row)
            .transpose()
            .context("failed to decode session row")
    }

    async fn touch_session(
        &self,
        session_id: Uuid,
        access_token_hash: &[u8],
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let query = "UPDATE sessions SET access_token_hash = $2, last_used_at = $3 \
                     WHERE id = $1 AND revoked_at IS NULL AND expires_at > $3";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(access_token_hash)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE"))
            .await
            .context("failed to touch session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_session(&self, session_id: Uuid, at: DateTime<Utc>) -> Result<bool> {
        let query = "UPDATE sessions SET revoked_at = $2 WHERE id = $1 AND revoked_at IS NULL";
        let result = sqlx::query(query)
            .bind(session_id)
            .bind(at)
            .execute(&self.pool)
            .instrument(db_span!("UPDATE"))
            .await
            .context("failed to revoke session")?;
        Ok(result.rows_affected() > 0)
    }

    async fn revoke_user_sessions(&self, user_id: Uuid, at: DateTime<Utc>) -> Result<Vec<Uuid>> {
        let query = "UPDATE sessions SET revoked_at = $2 \
                     WHERE user_id = $1 AND revoked_at IS NULL RETURNING id";
        let ids: Vec<Uuid> = sqlx::query_scalar(query)
            .bind(user_id)
            .bind(at)
            .fetch_all(&self.pool)
            .instrument(db_span!("UPDATE"))
            .await
            .context("failed to revoke user sessions")?;
        Ok(ids)
    }
}

#[async_trait]
impl SecurityEventSink for PgStore {
    async fn append(&self, event: &SecurityEvent) -> Result<()> {
        let query = r"
            INSERT INTO security_events (
                id, user_id, event_type, severity, source, ip_address, user_agent,
                description, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ";
        sqlx::query(query)
            .bind(event.id)
            .bind(event.user_id)
            .bind(event.event_type.as_str())
            .bind(event.severity.as_str())
            .bind(&event.source)
            .bind(event.ip_address.as_deref())
            .bind(event.user_agent.as_deref())
            .bind(&event.description)
            .bind(event.created_at)
            .execute(&self.pool)
            .instrument(db_span!("INSERT"))
            .await
            .context("failed to append security event")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_sql_statements_skips_comments_and_blank_lines() {
        let sql = "-- header\n\nCREATE TABLE a (\n    id INT\n);\n\n-- next\nCREATE INDEX b ON a (id);\n";
        let statements = split_sql_statements(sql);
        assert_eq!(
            statements,
            vec![
                "CREATE TABLE a (\n    id INT\n);".to_string(),
                "CREATE INDEX b ON a (id);".to_string(),
            ]
        );
    }

    #[test]
    fn bundled_schema_creates_every_table() {
        let statements = split_sql_statements(SCHEMA_SQL);
        for table in [
            "users",
            "roles",
            "permissions",
            "user_roles",
            "role_permissions",
            "sessions",
            "security_events",
        ] {
            let needle = format!("CREATE TABLE IF NOT EXISTS {table} (");
            assert!(
                statements.iter().any(|statement| statement.starts_with(&needle)),
                "missing table {table}"
            );
        }
    }
}
