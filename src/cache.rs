use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::Row;

/// Read cache in front of the consent store. The store stays the source of
/// truth; the manager invalidates the subject's entries on every write. An
/// explicit injected seam, never a process-global map.
#[async_trait]
pub trait ConsentCache: Send + Sync {
    async fn get(&self, subject_id: Uuid, purpose: &str) -> Option<Row>;
    async fn put(&self, subject_id: Uuid, purpose: &str, row: Row);
    async fn invalidate(&self, subject_id: Uuid);
}

#[derive(Clone, Default)]
pub struct MemoryConsentCache {
    entries: Arc<RwLock<HashMap<(Uuid, String), Row>>>,
}

impl MemoryConsentCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ConsentCache for MemoryConsentCache {
    async fn get(&self, subject_id: Uuid, purpose: &str) -> Option<Row> {
        self.entries
            .read()
            .await
            .get(&(subject_id, purpose.to_string()))
            .cloned()
    }

    async fn put(&self, subject_id: Uuid, purpose: &str, row: Row) {
        self.entries
            .write()
            .await
            .insert((subject_id, purpose.to_string()), row);
    }

    async fn invalidate(&self, subject_id: Uuid) {
        self.entries
            .write()
            .await
            .retain(|(cached_subject, _), _| *cached_subject != subject_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn invalidate_clears_all_purposes_for_subject() {
        let cache = MemoryConsentCache::new();
        let subject = Uuid::new_v4();
        let other = Uuid::new_v4();
        let row: Row = [("status".to_string(), json!("granted"))].into_iter().collect();

        cache.put(subject, "marketing", row.clone()).await;
        cache.put(subject, "analytics", row.clone()).await;
        cache.put(other, "marketing", row).await;

        cache.invalidate(subject).await;

        assert!(cache.get(subject, "marketing").await.is_none());
        assert!(cache.get(subject, "analytics").await.is_none());
        assert!(cache.get(other, "marketing").await.is_some());
    }
}
