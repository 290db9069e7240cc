//! In-memory event store for development, testing, and single-process use

use super::{EventIndex, EventStore};
use crate::error::Result;
use crate::types::{AuditEvent, EventFilter};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

/// Event store backed only by the in-memory indexes
///
/// Same semantics as `FileEventStore`; contents are lost on drop.
#[derive(Default)]
pub struct MemoryEventStore {
    index: RwLock<EventIndex>,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn append_batch(&self, events: &[AuditEvent]) -> Result<usize> {
        let mut index = self.index.write().await;
        let written = events
            .iter()
            .filter(|e| index.insert((*e).clone()))
            .count();
        tracing::debug!(batch = events.len(), written, "Memory store appended batch");
        Ok(written)
    }

    async fn get(&self, id: &str) -> Result<Option<AuditEvent>> {
        Ok(self.index.read().await.get(id).cloned())
    }

    async fn query(&self, filter: &EventFilter, limit: usize) -> Result<Vec<AuditEvent>> {
        Ok(self.index.read().await.query(filter, limit))
    }

    async fn count_matching(&self, filter: &EventFilter) -> Result<u64> {
        Ok(self.index.read().await.count(filter))
    }

    async fn distinct_resources(&self, filter: &EventFilter) -> Result<u64> {
        Ok(self.index.read().await.distinct_resources(filter))
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        Ok(self.index.write().await.remove_before(cutoff))
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.index.read().await.len())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EventCategory, EventLevel, NewEvent, TimeRange};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap;

    fn login(user: &str, success: bool, minute: u32) -> AuditEvent {
        NewEvent::new(EventLevel::Info, EventCategory::Authentication, "login")
            .user(user)
            .success(success)
            .at(Utc.with_ymd_and_hms(2024, 1, 1, 8, minute, 0).unwrap())
            .into_event(HashMap::new())
    }

    #[tokio::test]
    async fn test_append_and_get() {
        let store = MemoryEventStore::new();
        let event = login("alice", true, 0);
        let id = store.append(&event).await.unwrap();
        assert_eq!(id, event.id);
        assert_eq!(store.get(&id).await.unwrap().unwrap(), event);
        assert!(store.get("evt-missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_batch_retry_does_not_duplicate() {
        let store = MemoryEventStore::new();
        let batch: Vec<_> = (0..5).map(|m| login("alice", false, m)).collect();

        assert_eq!(store.append_batch(&batch).await.unwrap(), 5);
        assert_eq!(store.append_batch(&batch).await.unwrap(), 0);
        assert_eq!(store.len().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_count_failed_logins_in_window() {
        let store = MemoryEventStore::new();
        let batch: Vec<_> = (0..10)
            .map(|m| login("alice", m % 2 == 0, m))
            .collect();
        store.append_batch(&batch).await.unwrap();

        let end = Utc.with_ymd_and_hms(2024, 1, 1, 8, 9, 0).unwrap();
        let filter = EventFilter::default()
            .category(EventCategory::Authentication)
            .user("alice")
            .success(false)
            .within(TimeRange::ending_at(end, Duration::minutes(15)));
        assert_eq!(store.count_matching(&filter).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_prune_is_explicit() {
        let store = MemoryEventStore::new();
        let batch: Vec<_> = (0..4).map(|m| login("alice", true, m)).collect();
        store.append_batch(&batch).await.unwrap();

        // Queries never prune
        store.query(&EventFilter::default(), 100).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 4);

        let cutoff = Utc.with_ymd_and_hms(2024, 1, 1, 8, 2, 0).unwrap();
        assert_eq!(store.prune_before(cutoff).await.unwrap(), 2);
        assert_eq!(store.len().await.unwrap(), 2);
        assert!(store.health().await.unwrap());
    }
}
