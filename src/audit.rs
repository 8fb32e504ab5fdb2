use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Kinds of governance events worth an audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    ConsentRecorded,
    ConsentWithdrawn,
    ConsentExpired,
    CookieConsentRecorded,
    CookieConsentUpdated,
    CookieConsentWithdrawn,
    DsarCreated,
    DsarStatusChanged,
    DataAccessed,
    DataRectified,
    DataErased,
    DataExported,
    DataAnonymized,
    ProcessingRestricted,
    RetentionRuleChanged,
    RetentionSweep,
    LegalHoldPlaced,
    LegalHoldReleased,
    ActionRefused,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub subject_id: Option<Uuid>,
    pub actor_id: Option<Uuid>,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: HashMap<String, String>,
}

/// Fire-and-forget audit destination. The sink's durability is its own
/// problem; callers never fail because the sink did.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn log(&self, event: AuditEvent);
}

/// Sink that writes through the `log` facade.
#[derive(Debug, Default, Clone)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn log(&self, event: AuditEvent) {
        log::info!(
            "audit: {:?} subject={:?} actor={:?} resource={}/{:?} details={:?}",
            event.event_type,
            event.subject_id,
            event.actor_id,
            event.resource_type,
            event.resource_id,
            event.details
        );
    }
}

/// In-memory sink with a bounded buffer, used by tests and embedders that
/// drain events themselves.
#[derive(Clone)]
pub struct MemoryAuditSink {
    events: Arc<RwLock<Vec<AuditEvent>>>,
    max_events: usize,
}

impl MemoryAuditSink {
    pub fn new(max_events: usize) -> Self {
        Self {
            events: Arc::new(RwLock::new(Vec::new())),
            max_events,
        }
    }

    pub async fn events(&self) -> Vec<AuditEvent> {
        self.events.read().await.clone()
    }

    pub async fn events_of_type(&self, event_type: AuditEventType) -> Vec<AuditEvent> {
        self.events
            .read()
            .await
            .iter()
            .filter(|e| e.event_type == event_type)
            .cloned()
            .collect()
    }

    pub async fn clear(&self) {
        self.events.write().await.clear();
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn log(&self, event: AuditEvent) {
        let mut events = self.events.write().await;
        events.push(event);

        let len = events.len();
        if len > self.max_events {
            events.drain(..len - self.max_events);
        }
    }
}

/// Builder used by the components; keeps call sites short.
pub struct AuditEventBuilder {
    event: AuditEvent,
}

impl AuditEventBuilder {
    pub fn new(event_type: AuditEventType, resource_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            event: AuditEvent {
                id: Uuid::new_v4(),
                timestamp: now,
                event_type,
                subject_id: None,
                actor_id: None,
                resource_type: resource_type.to_string(),
                resource_id: None,
                details: HashMap::new(),
            },
        }
    }

    pub fn subject(mut self, subject_id: Uuid) -> Self {
        self.event.subject_id = Some(subject_id);
        self
    }

    pub fn actor(mut self, actor_id: Option<Uuid>) -> Self {
        self.event.actor_id = actor_id;
        self
    }

    pub fn resource_id(mut self, resource_id: impl Into<String>) -> Self {
        self.event.resource_id = Some(resource_id.into());
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<String>) -> Self {
        self.event.details.insert(key.to_string(), value.into());
        self
    }

    pub fn build(self) -> AuditEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_sink_keeps_events_in_order() {
        let sink = MemoryAuditSink::new(100);
        let now = Utc::now();

        sink.log(
            AuditEventBuilder::new(AuditEventType::ConsentRecorded, "consent", now).build(),
        )
        .await;
        sink.log(
            AuditEventBuilder::new(AuditEventType::ConsentWithdrawn, "consent", now).build(),
        )
        .await;

        let events = sink.events().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, AuditEventType::ConsentRecorded);
        assert_eq!(events[1].event_type, AuditEventType::ConsentWithdrawn);
    }

    #[tokio::test]
    async fn memory_sink_drops_oldest_beyond_capacity() {
        let sink = MemoryAuditSink::new(2);
        let now = Utc::now();

        for _ in 0..5 {
            sink.log(AuditEventBuilder::new(AuditEventType::DataAccessed, "user", now).build())
                .await;
        }

        assert_eq!(sink.events().await.len(), 2);
    }
}
