//! Session lifecycle: create, refresh, revoke, and owner lookup.
//!
//! Write order is fixed: the durable row first, the cache mirror last. A cache
//! write that fails after a successful store write only costs a later cache
//! miss, which [`SessionManager::owner_of`] repairs by reading through. Every
//! mirror write is followed by a re-read of the row, and the entry is dropped
//! again if a revoke landed in between.

use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use super::{
    cache::SessionCache,
    clock::Clock,
    error::{AuthError, AuthResult},
    models::{Origin, Session, User},
    store::{RoleStore, SessionStore, UserStore},
    token::TokenCodec,
    utils::{generate_refresh_token, hash_token},
};

/// A freshly created session with the raw tokens handed to the client.
#[derive(Debug)]
pub struct IssuedSession {
    pub session: Session,
    pub access_token: String,
    pub refresh_token: String,
}

/// Result of a refresh: same session, new access token.
#[derive(Debug)]
pub struct RefreshedSession {
    pub session: Session,
    pub user: User,
    pub access_token: String,
}

pub struct SessionManager {
    sessions: Arc<dyn SessionStore>,
    users: Arc<dyn UserStore>,
    roles: Arc<dyn RoleStore>,
    cache: Arc<dyn SessionCache>,
    codec: Arc<TokenCodec>,
    clock: Arc<dyn Clock>,
    refresh_ttl: Duration,
}

impl SessionManager {
    #[must_use]
    pub fn new(
        sessions: Arc<dyn SessionStore>,
        users: Arc<dyn UserStore>,
        roles: Arc<dyn RoleStore>,
        cache: Arc<dyn SessionCache>,
        codec: Arc<TokenCodec>,
        clock: Arc<dyn Clock>,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            sessions,
            users,
            roles,
            cache,
            codec,
            clock,
            refresh_ttl,
        }
    }

    /// Persist a new session for `user` and mint its first access token.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] if the session row cannot be written.
    #[instrument(skip(self, user, roles, origin), fields(user_id = %user.id))]
    pub async fn create(
        &self,
        user: &User,
        roles: &[String],
        origin: &Origin,
    ) -> AuthResult<IssuedSession> {
        let now = self.clock.now();
        let session_id = Uuid::new_v4();
        let refresh_token = generate_refresh_token().map_err(AuthError::unavailable)?;
        let access_token = self
            .codec
            .issue(user, session_id, roles, now)
            .map_err(AuthError::unavailable)?;

        let session = Session {
            id: session_id,
            user_id: user.id,
            access_token_hash: hash_token(&access_token),
            refresh_token_hash: hash_token(&refresh_token),
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
            expires_at: now + self.refresh_ttl,
            last_used_at: now,
            created_at: now,
            revoked_at: None,
        };
        self.sessions
            .insert_session(&session)
            .await
            .map_err(AuthError::unavailable)?;

        if let Err(err) = self.mirror_live(session.id, session.user_id).await {
            warn!(%session_id, "failed to confirm session mirror: {err}");
        }
        debug!(%session_id, "session created");

        Ok(IssuedSession {
            session,
            access_token,
            refresh_token,
        })
    }

    /// Mint a new access token for the session owning `refresh_token`.
    /// The refresh token itself is not rotated.
    ///
    /// # Errors
    /// Returns [`AuthError::InvalidRefreshToken`] for unknown, revoked or expired
    /// sessions and for sessions whose owner is gone or disabled.
    #[instrument(skip_all)]
    pub async fn refresh(&self, refresh_token: &str) -> AuthResult<RefreshedSession> {
        let now = self.clock.now();
        let mut session = self
            .sessions
            .find_active_by_refresh_hash(&hash_token(refresh_token), now)
            .await
            .map_err(AuthError::unavailable)?
            .ok_or(AuthError::InvalidRefreshToken)?;

        let user = self
            .users
            .find_user(session.user_id)
            .await
            .map_err(AuthError::unavailable)?
            .filter(|user| user.is_active)
            .ok_or(AuthError::InvalidRefreshToken)?;

        let roles: Vec<String> = self
            .roles
            .roles_for_user(user.id)
            .await
            .map_err(AuthError::unavailable)?
            .into_iter()
            .map(|role| role.name)
            .collect();

        let access_token = self
            .codec
            .issue(&user, session.id, &roles, now)
            .map_err(AuthError::unavailable)?;
        let access_token_hash = hash_token(&access_token);
        let touched = self
            .sessions
            .touch_session(session.id, &access_token_hash, now)
            .await
            .map_err(AuthError::unavailable)?;
        if !touched {
            debug!(session_id = %session.id, "session revoked or expired during refresh");
            return Err(AuthError::InvalidRefreshToken);
        }
        session.access_token_hash = access_token_hash;
        session.last_used_at = now;

        if !self.mirror_live(session.id, session.user_id).await? {
            debug!(session_id = %session.id, "session revoked during refresh");
            return Err(AuthError::InvalidRefreshToken);
        }
        debug!(session_id = %session.id, "session refreshed");

        Ok(RefreshedSession {
            session,
            user,
            access_token,
        })
    }

    /// Revoke a session. Revoking an already revoked or unknown session is a no-op.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] if either the row or the cache mirror
    /// cannot be updated; the call is safe to retry.
    #[instrument(skip(self))]
    pub async fn revoke(&self, session_id: Uuid) -> AuthResult<()> {
        let revoked = self
            .sessions
            .revoke_session(session_id, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?;
        self.cache
            .remove(session_id)
            .await
            .map_err(AuthError::unavailable)?;
        if revoked {
            debug!("session revoked");
        }
        Ok(())
    }

    /// Revoke every live session of `user_id`, returning how many were revoked.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] on store or cache failure.
    #[instrument(skip(self))]
    pub async fn revoke_all_for_user(&self, user_id: Uuid) -> AuthResult<usize> {
        let revoked = self
            .sessions
            .revoke_user_sessions(user_id, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?;

        let mut failure = None;
        for session_id in &revoked {
            if let Err(err) = self.cache.remove(*session_id).await {
                warn!(%session_id, "failed to drop session mirror: {err:#}");
                if failure.is_none() {
                    failure = Some(err);
                }
            }
        }
        if let Some(err) = failure {
            return Err(AuthError::unavailable(err));
        }
        Ok(revoked.len())
    }

    /// Owner of a live session. Reads the cache first; on a miss the durable
    /// row is consulted and the mirror rewritten.
    ///
    /// # Errors
    /// Returns [`AuthError::Unavailable`] if the store cannot be read.
    #[instrument(skip(self))]
    pub async fn owner_of(&self, session_id: Uuid) -> AuthResult<Option<Uuid>> {
        match self.cache.get(session_id).await {
            Ok(Some(user_id)) => return Ok(Some(user_id)),
            Ok(None) => {}
            Err(err) => warn!("session cache read failed, using store: {err:#}"),
        }

        let session = self
            .sessions
            .find_active_by_id(session_id, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?;
        match session {
            Some(session) if self.mirror_live(session.id, session.user_id).await? => {
                Ok(Some(session.user_id))
            }
            _ => Ok(None),
        }
    }

    /// Mirror the session, then re-read its row. A row that is no longer live
    /// gets its mirror removed and yields `false`.
    async fn mirror_live(&self, session_id: Uuid, user_id: Uuid) -> AuthResult<bool> {
        self.mirror(session_id, user_id).await;
        let live = self
            .sessions
            .find_active_by_id(session_id, self.clock.now())
            .await
            .map_err(AuthError::unavailable)?
            .is_some();
        if !live {
            self.cache
                .remove(session_id)
                .await
                .map_err(AuthError::unavailable)?;
        }
        Ok(live)
    }

    async fn mirror(&self, session_id: Uuid, user_id: Uuid) {
        if let Err(err) = self.cache.put(session_id, user_id).await {
            warn!(%session_id, "failed to mirror session into cache: {err:#}");
        }
    }
}
