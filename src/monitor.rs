//! Wiring: rule evaluation and escalation over flushed batches
//!
//! `ComplianceMonitor` is the `BatchListener` the pipeline calls after each
//! durable write. Events whose evaluation hit an unavailable store are kept
//! and evaluated again ahead of the next batch. `AuditSystem` builds every component explicitly from an
//! `AuditConfig` and hands out references; there is no global instance.

use crate::analytics::Analytics;
use crate::config::{AuditConfig, EnforcementBackend, StorageBackend};
use crate::error::Result;
use crate::incident::{EnforcementSink, IncidentManager, LogEnforcementSink, NatsEnforcementSink};
use crate::pipeline::{BatchListener, DrainReport, IngestionPipeline};
use crate::rules::{default_rules, RuleEngine};
use crate::store::{EventStore, FileEventStore, MemoryEventStore, RecordTable};
use crate::types::AuditEvent;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Upper bound on events waiting for a store to come back
const MAX_DEFERRED: usize = 10_000;

/// Evaluates rules on each flushed batch and escalates what fires
pub struct ComplianceMonitor {
    engine: Arc<RuleEngine>,
    incidents: Arc<IncidentManager>,
    deferred: Mutex<VecDeque<AuditEvent>>,
}

impl ComplianceMonitor {
    pub fn new(engine: Arc<RuleEngine>, incidents: Arc<IncidentManager>) -> Self {
        Self {
            engine,
            incidents,
            deferred: Mutex::new(VecDeque::new()),
        }
    }

    /// Number of flushed events still waiting for evaluation
    pub async fn deferred(&self) -> usize {
        self.deferred.lock().await.len()
    }

    /// Evaluate deferred events now instead of on the next flush.
    ///
    /// Returns how many are still deferred afterwards.
    pub async fn retry_deferred(&self) -> usize {
        self.evaluate_batch(&[]).await;
        self.deferred().await
    }

    async fn evaluate_batch(&self, events: &[AuditEvent]) {
        let mut deferred = self.deferred.lock().await;
        let backlog = deferred.len();
        let mut pending = std::mem::take(&mut *deferred)
            .into_iter()
            .chain(events.iter().cloned());

        let mut violation_ids = Vec::new();
        while let Some(event) = pending.next() {
            match self.engine.evaluate(&event).await {
                Ok(ids) => violation_ids.extend(ids),
                Err(e) if e.is_unavailable() => {
                    deferred.push_back(event);
                    deferred.extend(pending.by_ref());
                    let overflow = deferred.len().saturating_sub(MAX_DEFERRED);
                    if overflow > 0 {
                        let dropped: Vec<String> =
                            deferred.drain(..overflow).map(|e| e.id).collect();
                        tracing::error!(
                            dropped = ?dropped,
                            "Deferred evaluation backlog full, oldest events left unevaluated"
                        );
                    }
                    tracing::warn!(
                        deferred = deferred.len(),
                        first = deferred.front().map(|e| e.id.as_str()).unwrap_or_default(),
                        error = %e,
                        "Store unavailable, rule evaluation deferred"
                    );
                    break;
                }
                Err(e) => {
                    tracing::error!(
                        event = %event.id,
                        error = %e,
                        "Rule evaluation failed"
                    );
                }
            }
        }
        if backlog > 0 && deferred.is_empty() {
            tracing::info!(backlog, "Deferred rule evaluation caught up");
        }
        drop(deferred);

        if violation_ids.is_empty() {
            return;
        }
        match self.incidents.escalate(&self.engine, &violation_ids).await {
            Ok(opened) if !opened.is_empty() => {
                tracing::info!(
                    violations = violation_ids.len(),
                    incidents = opened.len(),
                    "Violations escalated"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(error = %e, "Escalation failed"),
        }
    }
}

#[async_trait]
impl BatchListener for ComplianceMonitor {
    async fn on_flushed(&self, events: &[AuditEvent]) {
        self.evaluate_batch(events).await;
    }
}

/// A fully wired audit engine
pub struct AuditSystem {
    config: AuditConfig,
    store: Arc<dyn EventStore>,
    engine: Arc<RuleEngine>,
    incidents: Arc<IncidentManager>,
    monitor: Arc<ComplianceMonitor>,
    analytics: Analytics,
    pipeline: IngestionPipeline,
}

impl AuditSystem {
    /// Build every component from `config` and start the pipeline
    pub async fn start(config: AuditConfig) -> Result<Self> {
        let sink: Arc<dyn EnforcementSink> = match config.enforcement.backend {
            EnforcementBackend::Log => Arc::new(LogEnforcementSink),
            EnforcementBackend::Nats => Arc::new(
                NatsEnforcementSink::connect(
                    &config.enforcement.nats_url,
                    config.enforcement.subject.clone(),
                    config.enforcement.delivery_timeout(),
                )
                .await?,
            ),
        };
        Self::start_with_sink(config, sink).await
    }

    /// Like `start`, with a caller-supplied enforcement sink
    pub async fn start_with_sink(config: AuditConfig, sink: Arc<dyn EnforcementSink>) -> Result<Self> {
        config.validate()?;

        let (store, violations, incident_rows): (Arc<dyn EventStore>, _, _) =
            match config.storage.backend {
                StorageBackend::Memory => (
                    Arc::new(MemoryEventStore::new()),
                    RecordTable::in_memory("violations"),
                    RecordTable::in_memory("incidents"),
                ),
                StorageBackend::File => {
                    let dir = &config.storage.dir;
                    (
                        Arc::new(FileEventStore::open(dir).await?),
                        RecordTable::open(dir, "violations").await?,
                        RecordTable::open(dir, "incidents").await?,
                    )
                }
            };
        Self::assemble(config, store, violations, incident_rows, sink).await
    }

    /// Wire the components around an existing store
    pub async fn with_store(
        config: AuditConfig,
        store: Arc<dyn EventStore>,
        sink: Arc<dyn EnforcementSink>,
    ) -> Result<Self> {
        config.validate()?;
        Self::assemble(
            config,
            store,
            RecordTable::in_memory("violations"),
            RecordTable::in_memory("incidents"),
            sink,
        )
        .await
    }

    async fn assemble(
        config: AuditConfig,
        store: Arc<dyn EventStore>,
        violations: RecordTable<crate::rules::ComplianceViolation>,
        incident_rows: RecordTable<crate::incident::SecurityIncident>,
        sink: Arc<dyn EnforcementSink>,
    ) -> Result<Self> {
        let engine = Arc::new(RuleEngine::new(store.clone(), violations));
        if config.default_rules {
            for rule in default_rules() {
                engine.add_rule(rule).await?;
            }
        }
        let loaded = engine.load_rules(&config.rules).await;
        if loaded < config.rules.len() {
            tracing::warn!(
                loaded,
                configured = config.rules.len(),
                "Some configured rules were skipped"
            );
        }

        let incidents = Arc::new(IncidentManager::new(
            incident_rows,
            sink.clone(),
            config.escalation.clone(),
            config.enforcement.delivery_timeout(),
        ));
        let analytics = Analytics::new(store.clone(), engine.clone(), incidents.clone());
        let monitor = Arc::new(ComplianceMonitor::new(engine.clone(), incidents.clone()));
        let pipeline = IngestionPipeline::start(
            store.clone(),
            config.pipeline.clone(),
            Some(monitor.clone() as Arc<dyn BatchListener>),
        )?;

        tracing::info!(
            store = store.name(),
            sink = sink.name(),
            rules = engine.rules().await.len(),
            "Audit system started"
        );

        Ok(Self {
            config,
            store,
            engine,
            incidents,
            monitor,
            analytics,
            pipeline,
        })
    }

    pub fn pipeline(&self) -> &IngestionPipeline {
        &self.pipeline
    }

    pub fn engine(&self) -> &Arc<RuleEngine> {
        &self.engine
    }

    pub fn incidents(&self) -> &Arc<IncidentManager> {
        &self.incidents
    }

    pub fn monitor(&self) -> &Arc<ComplianceMonitor> {
        &self.monitor
    }

    pub fn analytics(&self) -> &Analytics {
        &self.analytics
    }

    pub fn store(&self) -> &Arc<dyn EventStore> {
        &self.store
    }

    pub fn config(&self) -> &AuditConfig {
        &self.config
    }

    /// Delete events older than the retention period.
    ///
    /// Uses `storage.retentionDays` unless `retention_days` overrides it.
    pub async fn prune_events(&self, retention_days: Option<u32>) -> Result<usize> {
        let days = retention_days.unwrap_or(self.config.storage.retention_days);
        let cutoff = Utc::now()
            .checked_sub_signed(Duration::days(i64::from(days)))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let removed = self.store.prune_before(cutoff).await?;
        tracing::info!(days, removed, "Audit retention applied");
        Ok(removed)
    }

    /// Drain the pipeline; pending evaluations finish before this returns
    pub async fn shutdown(&self) -> Result<DrainReport> {
        self.pipeline.shutdown().await
    }
}
