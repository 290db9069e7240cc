//! Event store trait: the durable, append-only home of audit events
//!
//! All backends implement `EventStore`. The ingestion pipeline is the only
//! writer; the rule engine and analytics only read, through the aggregate
//! lookups below rather than by pulling full history.

use crate::error::Result;
use crate::types::{AuditEvent, EventFilter, EventId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

mod file;
mod index;
mod memory;
mod table;

pub use file::FileEventStore;
pub use index::EventIndex;
pub use memory::MemoryEventStore;
pub use table::{Record, RecordTable};

/// Core trait for audit event backends
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Durably write a batch, returning how many events were new
    ///
    /// Events whose id is already stored are skipped, so retrying a batch
    /// after a partial failure never duplicates. An `Err` means nothing in
    /// the batch may be assumed durable.
    async fn append_batch(&self, events: &[AuditEvent]) -> Result<usize>;

    /// Durably write a single event
    async fn append(&self, event: &AuditEvent) -> Result<EventId> {
        self.append_batch(std::slice::from_ref(event)).await?;
        Ok(event.id.clone())
    }

    /// Fetch one event by id
    async fn get(&self, id: &str) -> Result<Option<AuditEvent>>;

    /// Matching events, most recent first, at most `limit`
    async fn query(&self, filter: &EventFilter, limit: usize) -> Result<Vec<AuditEvent>>;

    /// Number of matching events; the time window travels in `filter.time_range`
    async fn count_matching(&self, filter: &EventFilter) -> Result<u64>;

    /// Number of distinct `resource` values among matching events
    async fn distinct_resources(&self, filter: &EventFilter) -> Result<u64>;

    /// Delete events older than `cutoff` (administrative retention only)
    async fn prune_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Total number of stored events
    async fn len(&self) -> Result<usize>;

    /// Health check; true if the store can serve reads and writes
    async fn health(&self) -> Result<bool> {
        self.len().await.map(|_| true)
    }

    /// Backend name (e.g. "memory", "file")
    fn name(&self) -> &str;
}
