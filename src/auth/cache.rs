//! Fast `session_id -> user_id` mirror of live sessions.
//!
//! The durable session store is the source of truth. The cache is advisory:
//! a miss falls through to the store, and entries expire after the session
//! timeout.

use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;
use uuid::Uuid;

#[async_trait]
pub trait SessionCache: Send + Sync {
    async fn put(&self, session_id: Uuid, user_id: Uuid) -> Result<()>;

    async fn get(&self, session_id: Uuid) -> Result<Option<Uuid>>;

    async fn remove(&self, session_id: Uuid) -> Result<()>;
}

/// In-process cache with a bounded entry count and a per-entry TTL.
#[derive(Clone)]
pub struct MokaSessionCache {
    cache: Cache<Uuid, Uuid>,
}

impl MokaSessionCache {
    #[must_use]
    pub fn new(max_capacity: u64, time_to_live: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(time_to_live)
            .build();
        Self { cache }
    }
}

#[async_trait]
impl SessionCache for MokaSessionCache {
    async fn put(&self, session_id: Uuid, user_id: Uuid) -> Result<()> {
        self.cache.insert(session_id, user_id).await;
        Ok(())
    }

    async fn get(&self, session_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.cache.get(&session_id).await)
    }

    async fn remove(&self, session_id: Uuid) -> Result<()> {
        self.cache.invalidate(&session_id).await;
        Ok(())
    }
}
