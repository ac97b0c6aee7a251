//! Security event recording.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, warn};
use uuid::Uuid;

use super::models::{Origin, SecurityEvent, SecurityEventType, Severity};
use super::store::SecurityEventSink;

const EVENT_SOURCE: &str = "web";

/// Appends security events to the durable sink.
///
/// Recording never fails the operation that triggered it; sink errors are
/// logged and dropped.
#[derive(Clone)]
pub struct AuditRecorder {
    sink: Arc<dyn SecurityEventSink>,
}

impl AuditRecorder {
    #[must_use]
    pub fn new(sink: Arc<dyn SecurityEventSink>) -> Self {
        Self { sink }
    }

    pub async fn login_failed(&self, user_id: Uuid, origin: &Origin, now: DateTime<Utc>) {
        warn!(%user_id, "failed login attempt");
        self.record(SecurityEvent {
            id: Uuid::new_v4(),
            user_id: Some(user_id),
            event_type: SecurityEventType::LoginFailed,
            severity: Severity::Medium,
            source: EVENT_SOURCE.to_string(),
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
            description: "Failed login attempt".to_string(),
            created_at: now,
        })
        .await;
    }

    pub async fn account_locked(
        &self,
        user_id: Uuid,
        until: DateTime<Utc>,
        origin: &Origin,
        now: DateTime<Utc>,
    ) {
        warn!(%user_id, %until, "account locked after repeated failed logins");
        self.record(SecurityEvent {
            id: Uuid::new_v4(),
            user_id: Some(user_id),
            event_type: SecurityEventType::AccountLocked,
            severity: Severity::High,
            source: EVENT_SOURCE.to_string(),
            ip_address: origin.ip_address.clone(),
            user_agent: origin.user_agent.clone(),
            description: format!("Account locked until {until}"),
            created_at: now,
        })
        .await;
    }

    async fn record(&self, event: SecurityEvent) {
        if let Err(err) = self.sink.append(&event).await {
            error!(
                event_type = event.event_type.as_str(),
                "failed to record security event: {err:#}"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::store::MemoryStore;
    use anyhow::{Result, anyhow};
    use async_trait::async_trait;

    struct BrokenSink;

    #[async_trait]
    impl SecurityEventSink for BrokenSink {
        async fn append(&self, _event: &SecurityEvent) -> Result<()> {
            Err(anyhow!("sink offline"))
        }
    }

    #[tokio::test]
    async fn login_failed_records_medium_web_event() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AuditRecorder::new(store.clone());
        let user_id = Uuid::new_v4();
        let origin = Origin::new(Some("10.0.0.7".to_string()), Some("curl/8".to_string()));

        recorder.login_failed(user_id, &origin, Utc::now()).await;

        let events = store.security_events().await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.user_id, Some(user_id));
        assert_eq!(event.event_type, SecurityEventType::LoginFailed);
        assert_eq!(event.severity, Severity::Medium);
        assert_eq!(event.source, "web");
        assert_eq!(event.ip_address.as_deref(), Some("10.0.0.7"));
        assert_eq!(event.user_agent.as_deref(), Some("curl/8"));
    }

    #[tokio::test]
    async fn account_locked_is_high_severity() {
        let store = Arc::new(MemoryStore::new());
        let recorder = AuditRecorder::new(store.clone());
        let now = Utc::now();

        recorder
            .account_locked(Uuid::new_v4(), now, &Origin::default(), now)
            .await;

        let events = store.security_events().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, SecurityEventType::AccountLocked);
        assert_eq!(events[0].severity, Severity::High);
    }

    #[tokio::test]
    async fn sink_failures_are_swallowed() {
        let recorder = AuditRecorder::new(Arc::new(BrokenSink));
        recorder
            .login_failed(Uuid::new_v4(), &Origin::default(), Utc::now())
            .await;
    }
}
