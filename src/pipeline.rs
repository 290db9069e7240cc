//! Ingestion pipeline: decouples producers from storage latency
//!
//! Producers enqueue onto a bounded `mpsc` channel and return as soon as
//! the event is queued. One background task owns the receiving end: it
//! accumulates a batch and writes it to the `EventStore` when either the
//! batch reaches `batch_size` or the oldest buffered event has waited
//! `flush_interval`. After every successful write the batch is broadcast
//! to subscribers and handed to the optional `BatchListener` (the rule
//! engine hook), so evaluation only ever sees durably stored events.
//!
//! Shutdown is two-phase: the consumer stops its timer, closes the queue,
//! drains everything still buffered, and flushes it before `shutdown()`
//! returns.

use crate::config::PipelineConfig;
use crate::error::{AuditError, Result};
use crate::store::EventStore;
use crate::types::{
    system_snapshot, AuditEvent, EventCategory, EventContext, EventId, EventLevel, NewEvent,
    Severity,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Consumer of durably written batches
///
/// Called inline by the pipeline's consumer task after each successful
/// flush. Implementations must not panic; errors are theirs to log.
#[async_trait]
pub trait BatchListener: Send + Sync {
    async fn on_flushed(&self, events: &[AuditEvent]);
}

#[derive(Default)]
struct PipelineStats {
    enqueued: AtomicU64,
    rejected: AtomicU64,
    persisted: AtomicU64,
    duplicates: AtomicU64,
    batches: AtomicU64,
    flush_failures: AtomicU64,
    held: AtomicU64,
}

/// Point-in-time pipeline counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStatsSnapshot {
    /// Events accepted onto the queue
    pub enqueued: u64,
    /// Events refused because the queue stayed full or was closed
    pub rejected: u64,
    /// Events newly written to the store
    pub persisted: u64,
    /// Events the store already had (same id)
    pub duplicates: u64,
    /// Successful batch writes
    pub batches: u64,
    /// Failed write attempts, retries included
    pub flush_failures: u64,
    /// Events currently held after exhausting retries
    pub held: u64,
}

/// Outcome of draining the pipeline on shutdown
#[derive(Debug, Clone, Default)]
pub struct DrainReport {
    /// Events newly written over the pipeline's lifetime
    pub persisted: u64,
    /// Events that could not be written even after retries
    pub unflushed: Vec<AuditEvent>,
}

impl DrainReport {
    pub fn is_complete(&self) -> bool {
        self.unflushed.is_empty()
    }

    /// Turn a partial drain into an error
    pub fn ensure_complete(&self) -> Result<u64> {
        if self.unflushed.is_empty() {
            Ok(self.persisted)
        } else {
            Err(AuditError::Drain {
                pending: self.unflushed.len(),
            })
        }
    }
}

struct Queued {
    event: AuditEvent,
    enqueued_at: Instant,
}

/// Bounded-queue, batching front door of the audit store
pub struct IngestionPipeline {
    tx: mpsc::Sender<Queued>,
    config: PipelineConfig,
    flushed_tx: broadcast::Sender<AuditEvent>,
    stats: Arc<PipelineStats>,
    shutdown_tx: watch::Sender<bool>,
    worker: Mutex<Option<JoinHandle<DrainReport>>>,
}

impl IngestionPipeline {
    /// Spawn the consumer task and return the producer handle
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        store: Arc<dyn EventStore>,
        config: PipelineConfig,
        listener: Option<Arc<dyn BatchListener>>,
    ) -> Result<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(config.queue_capacity);
        let (flushed_tx, _) = broadcast::channel(config.broadcast_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(PipelineStats::default());

        let worker = Worker {
            rx,
            store,
            listener,
            flushed_tx: flushed_tx.clone(),
            stats: stats.clone(),
            config: config.clone(),
            batch: Vec::with_capacity(config.batch_size),
            oldest: None,
            held: false,
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));

        tracing::info!(
            queue_capacity = config.queue_capacity,
            batch_size = config.batch_size,
            flush_interval_ms = config.flush_interval_ms,
            "Audit ingestion pipeline started"
        );

        Ok(Self {
            tx,
            config,
            flushed_tx,
            stats,
            shutdown_tx,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Enqueue an event and return its id without waiting for the write
    ///
    /// Blocks only while the queue is saturated, and never longer than
    /// `enqueue_timeout`; after that the caller gets `QueueFull` rather
    /// than the event being dropped silently.
    pub async fn log_event(&self, event: NewEvent) -> Result<EventId> {
        let event = event.into_event(system_snapshot(self.queue_depth()));
        let id = event.id.clone();
        let queued = Queued {
            event,
            enqueued_at: Instant::now(),
        };

        match self.tx.send_timeout(queued, self.config.enqueue_timeout()).await {
            Ok(()) => {
                self.stats.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(id)
            }
            Err(SendTimeoutError::Timeout(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    event_id = %id,
                    timeout_ms = self.config.enqueue_timeout_ms,
                    "Audit queue saturated, event rejected"
                );
                Err(AuditError::QueueFull {
                    timeout_ms: self.config.enqueue_timeout_ms,
                })
            }
            Err(SendTimeoutError::Closed(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Err(AuditError::PipelineClosed)
            }
        }
    }

    /// Record an authentication attempt; failures are logged at security level
    pub async fn log_authentication(
        &self,
        context: EventContext,
        method: &str,
        success: bool,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<EventId> {
        let level = if success {
            EventLevel::Info
        } else {
            EventLevel::Security
        };
        let event = NewEvent::new(level, EventCategory::Authentication, "login_attempt")
            .context(context)
            .success(success)
            .detail("method", serde_json::json!(method))
            .details(details);
        self.log_event(event).await
    }

    /// Record an authorization decision; denials are logged at warning level
    pub async fn log_authorization(
        &self,
        context: EventContext,
        resource: &str,
        action: &str,
        granted: bool,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<EventId> {
        let level = if granted {
            EventLevel::Info
        } else {
            EventLevel::Warning
        };
        let event = NewEvent::new(level, EventCategory::Authorization, action)
            .context(context)
            .resource(resource)
            .success(granted)
            .details(details);
        self.log_event(event).await
    }

    /// Record a read/write against a data resource
    pub async fn log_data_access(
        &self,
        context: EventContext,
        resource: &str,
        operation: &str,
        success: bool,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<EventId> {
        let level = if success {
            EventLevel::Info
        } else {
            EventLevel::Warning
        };
        let event = NewEvent::new(level, EventCategory::DataAccess, operation)
            .context(context)
            .resource(resource)
            .success(success)
            .details(details);
        self.log_event(event).await
    }

    /// Record an API call; 5xx is an error, 4xx a warning, the rest info
    pub async fn log_api_call(
        &self,
        context: EventContext,
        method: &str,
        path: &str,
        status_code: u16,
        duration_ms: u64,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<EventId> {
        let level = match status_code {
            500..=u16::MAX => EventLevel::Error,
            400..=499 => EventLevel::Warning,
            _ => EventLevel::Info,
        };
        let event = NewEvent::new(level, EventCategory::ApiCall, format!("{} {}", method, path))
            .context(context)
            .resource(path)
            .success(status_code < 400)
            .duration_ms(duration_ms)
            .detail("statusCode", serde_json::json!(status_code))
            .details(details);
        self.log_event(event).await
    }

    /// Record a security-relevant observation
    ///
    /// Critical observations are logged at critical level, everything else
    /// at security level; high and critical ones count as unsuccessful.
    pub async fn log_security_event(
        &self,
        context: EventContext,
        action: &str,
        severity: Severity,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<EventId> {
        let level = if severity >= Severity::Critical {
            EventLevel::Critical
        } else {
            EventLevel::Security
        };
        let event = NewEvent::new(level, EventCategory::SecurityEvent, action)
            .context(context)
            .success(severity < Severity::High)
            .detail("severity", serde_json::json!(severity))
            .details(details);
        self.log_event(event).await
    }

    /// Record a system operation; failures are logged at error level
    pub async fn log_system_operation(
        &self,
        operation: &str,
        success: bool,
        duration_ms: Option<u64>,
        details: HashMap<String, serde_json::Value>,
    ) -> Result<EventId> {
        let level = if success {
            EventLevel::Info
        } else {
            EventLevel::Error
        };
        let mut event = NewEvent::new(level, EventCategory::SystemOperation, operation)
            .success(success)
            .details(details);
        event.duration_ms = duration_ms;
        self.log_event(event).await
    }

    /// Subscribe to events as they become durable
    ///
    /// Subscribers that fall behind see `RecvError::Lagged`; the store
    /// remains the source of truth.
    pub fn subscribe(&self) -> broadcast::Receiver<AuditEvent> {
        self.flushed_tx.subscribe()
    }

    /// Events currently waiting in the queue
    pub fn queue_depth(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    pub fn stats(&self) -> PipelineStatsSnapshot {
        let s = &self.stats;
        PipelineStatsSnapshot {
            enqueued: s.enqueued.load(Ordering::Relaxed),
            rejected: s.rejected.load(Ordering::Relaxed),
            persisted: s.persisted.load(Ordering::Relaxed),
            duplicates: s.duplicates.load(Ordering::Relaxed),
            batches: s.batches.load(Ordering::Relaxed),
            flush_failures: s.flush_failures.load(Ordering::Relaxed),
            held: s.held.load(Ordering::Relaxed),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Stop accepting events, drain the queue, and flush what remains
    ///
    /// Returns once every buffered event has been written or, if the store
    /// keeps failing, handed back in `DrainReport::unflushed`.
    pub async fn shutdown(&self) -> Result<DrainReport> {
        let handle = self
            .worker
            .lock()
            .await
            .take()
            .ok_or(AuditError::PipelineClosed)?;

        // The consumer may already be gone if every sender dropped.
        let _ = self.shutdown_tx.send(true);

        let report = handle.await.map_err(|e| {
            AuditError::Storage(format!("Audit consumer task failed: {}", e))
        })?;

        if report.is_complete() {
            tracing::info!(persisted = report.persisted, "Audit pipeline drained");
        } else {
            tracing::error!(
                persisted = report.persisted,
                unflushed = report.unflushed.len(),
                "Audit pipeline drained with unwritten events"
            );
        }
        Ok(report)
    }
}

struct Worker {
    rx: mpsc::Receiver<Queued>,
    store: Arc<dyn EventStore>,
    listener: Option<Arc<dyn BatchListener>>,
    flushed_tx: broadcast::Sender<AuditEvent>,
    stats: Arc<PipelineStats>,
    config: PipelineConfig,
    batch: Vec<AuditEvent>,
    /// Enqueue time of the oldest buffered event, or of the last failed flush
    oldest: Option<Instant>,
    /// Last flush exhausted its retries; only the timer retries
    held: bool,
}

impl Worker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> DrainReport {
        loop {
            let deadline = self.oldest.map(|t| t + self.config.flush_interval());
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                // A full buffer stops consuming so the bounded queue pushes back
                item = self.rx.recv(), if self.batch.len() < self.config.batch_size => match item {
                    Some(queued) => {
                        self.push(queued);
                        if !self.held && self.batch.len() >= self.config.batch_size {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = wait_until(deadline) => {
                    self.flush().await;
                }
            }
        }
        self.drain().await
    }

    fn push(&mut self, queued: Queued) {
        if self.oldest.is_none() {
            self.oldest = Some(queued.enqueued_at);
        }
        self.batch.push(queued.event);
    }

    async fn drain(mut self) -> DrainReport {
        self.rx.close();
        while let Some(queued) = self.rx.recv().await {
            self.push(queued);
        }
        tracing::debug!(buffered = self.batch.len(), "Draining audit queue");
        self.flush().await;

        DrainReport {
            persisted: self.stats.persisted.load(Ordering::Relaxed),
            unflushed: std::mem::take(&mut self.batch),
        }
    }

    /// Write the current batch, retrying with backoff; returns whether it landed
    async fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            self.oldest = None;
            return true;
        }

        let attempts = self.config.max_flush_retries + 1;
        let mut backoff = self.config.retry_backoff();
        for attempt in 1..=attempts {
            match self.store.append_batch(&self.batch).await {
                Ok(written) => {
                    let batch = std::mem::take(&mut self.batch);
                    self.oldest = None;
                    self.held = false;

                    let duplicates = (batch.len() - written.min(batch.len())) as u64;
                    self.stats.persisted.fetch_add(written as u64, Ordering::Relaxed);
                    self.stats.duplicates.fetch_add(duplicates, Ordering::Relaxed);
                    self.stats.batches.fetch_add(1, Ordering::Relaxed);
                    self.stats.held.store(0, Ordering::Relaxed);
                    tracing::debug!(
                        store = self.store.name(),
                        batch = batch.len(),
                        written,
                        attempt,
                        "Audit batch flushed"
                    );

                    self.publish(batch).await;
                    return true;
                }
                Err(e) => {
                    self.stats.flush_failures.fetch_add(1, Ordering::Relaxed);
                    if attempt < attempts {
                        tracing::warn!(
                            attempt,
                            batch = self.batch.len(),
                            error = %e,
                            "Audit batch write failed, retrying"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    } else {
                        tracing::error!(
                            attempts,
                            held = self.batch.len(),
                            error = %e,
                            "Audit batch write failed, holding events for the next flush"
                        );
                    }
                }
            }
        }

        self.held = true;
        self.oldest = Some(Instant::now());
        self.stats
            .held
            .store(self.batch.len() as u64, Ordering::Relaxed);
        false
    }

    async fn publish(&self, batch: Vec<AuditEvent>) {
        for event in &batch {
            // No receivers is fine; the store already has the event.
            let _ = self.flushed_tx.send(event.clone());
        }
        if let Some(listener) = &self.listener {
            listener.on_flushed(&batch).await;
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
