//! In-memory integration tests
//!
//! End-to-end tests exercising the pipeline, rule engine, incidents, and
//! analytics over the in-memory store. Covers exactly-once ingestion under
//! shutdown, retries and held batches, backpressure, fail-fast on an
//! unavailable store, and escalation to mitigation directives.

use a3s_audit::{
    AuditConfig, AuditError, AuditEvent, AuditSystem, ChannelEnforcementSink, ComplianceRule,
    DirectiveKind, EventCategory, EventContext, EventFilter, EventLevel, EventStore,
    IncidentStatus, IngestionPipeline, MemoryEventStore, NewEvent, PipelineConfig, RuleEngine,
    RuleKind, Severity, ViolationFilter,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

fn fast_pipeline() -> PipelineConfig {
    PipelineConfig {
        queue_capacity: 64,
        batch_size: 16,
        flush_interval_ms: 20,
        enqueue_timeout_ms: 1_000,
        max_flush_retries: 2,
        retry_backoff_ms: 1,
        broadcast_capacity: 4_096,
    }
}

/// Store wrapper whose writes fail while `failures` is positive
struct FlakyStore {
    inner: MemoryEventStore,
    failures: AtomicUsize,
    unavailable: bool,
}

impl FlakyStore {
    fn failing(times: usize) -> Self {
        Self {
            inner: MemoryEventStore::new(),
            failures: AtomicUsize::new(times),
            unavailable: false,
        }
    }

    fn down() -> Self {
        Self {
            inner: MemoryEventStore::new(),
            failures: AtomicUsize::new(usize::MAX),
            unavailable: true,
        }
    }

    fn error(&self) -> AuditError {
        if self.unavailable {
            AuditError::StoreUnavailable("disk detached".to_string())
        } else {
            AuditError::Storage("transient write error".to_string())
        }
    }

    fn should_fail(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl EventStore for FlakyStore {
    async fn append_batch(&self, events: &[AuditEvent]) -> a3s_audit::Result<usize> {
        if self.should_fail() {
            return Err(self.error());
        }
        self.inner.append_batch(events).await
    }

    async fn get(&self, id: &str) -> a3s_audit::Result<Option<AuditEvent>> {
        self.inner.get(id).await
    }

    async fn query(&self, filter: &EventFilter, limit: usize) -> a3s_audit::Result<Vec<AuditEvent>> {
        if self.unavailable {
            return Err(self.error());
        }
        self.inner.query(filter, limit).await
    }

    async fn count_matching(&self, filter: &EventFilter) -> a3s_audit::Result<u64> {
        if self.unavailable {
            return Err(self.error());
        }
        self.inner.count_matching(filter).await
    }

    async fn distinct_resources(&self, filter: &EventFilter) -> a3s_audit::Result<u64> {
        if self.unavailable {
            return Err(self.error());
        }
        self.inner.distinct_resources(filter).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> a3s_audit::Result<usize> {
        self.inner.prune_before(cutoff).await
    }

    async fn len(&self) -> a3s_audit::Result<usize> {
        self.inner.len().await
    }

    fn name(&self) -> &str {
        "flaky"
    }
}

/// Store whose writes wait for a permit
struct GatedStore {
    inner: MemoryEventStore,
    gate: Semaphore,
}

#[async_trait]
impl EventStore for GatedStore {
    async fn append_batch(&self, events: &[AuditEvent]) -> a3s_audit::Result<usize> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| AuditError::Storage(e.to_string()))?;
        self.inner.append_batch(events).await
    }

    async fn get(&self, id: &str) -> a3s_audit::Result<Option<AuditEvent>> {
        self.inner.get(id).await
    }

    async fn query(&self, filter: &EventFilter, limit: usize) -> a3s_audit::Result<Vec<AuditEvent>> {
        self.inner.query(filter, limit).await
    }

    async fn count_matching(&self, filter: &EventFilter) -> a3s_audit::Result<u64> {
        self.inner.count_matching(filter).await
    }

    async fn distinct_resources(&self, filter: &EventFilter) -> a3s_audit::Result<u64> {
        self.inner.distinct_resources(filter).await
    }

    async fn prune_before(&self, cutoff: DateTime<Utc>) -> a3s_audit::Result<usize> {
        self.inner.prune_before(cutoff).await
    }

    async fn len(&self) -> a3s_audit::Result<usize> {
        self.inner.len().await
    }

    fn name(&self) -> &str {
        "gated"
    }
}

fn action(producer: usize, i: usize) -> NewEvent {
    NewEvent::new(
        EventLevel::Info,
        EventCategory::UserAction,
        format!("burst-{}-{}", producer, i),
    )
    .user(format!("user-{}", producer))
}

// ─── Ingestion ───────────────────────────────────────────────────

#[tokio::test]
async fn test_exactly_once_with_shutdown_mid_burst() {
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = Arc::new(IngestionPipeline::start(store.clone(), fast_pipeline(), None).unwrap());

    let mut producers = Vec::new();
    for p in 0..8 {
        let pipeline = pipeline.clone();
        producers.push(tokio::spawn(async move {
            let mut accepted = Vec::new();
            for i in 0..250 {
                match pipeline.log_event(action(p, i)).await {
                    Ok(id) => accepted.push(id),
                    Err(AuditError::PipelineClosed) => break,
                    Err(e) => panic!("unexpected enqueue error: {}", e),
                }
                if i % 50 == 0 {
                    tokio::task::yield_now().await;
                }
            }
            accepted
        }));
    }

    tokio::time::sleep(Duration::from_millis(5)).await;
    let report = pipeline.shutdown().await.unwrap();
    assert!(report.is_complete());

    let mut accepted = Vec::new();
    for producer in producers {
        accepted.extend(producer.await.unwrap());
    }

    let unique: HashSet<_> = accepted.iter().cloned().collect();
    assert_eq!(unique.len(), accepted.len());
    assert_eq!(store.len().await.unwrap(), accepted.len());
    for id in &accepted {
        assert!(store.get(id).await.unwrap().is_some(), "lost {}", id);
    }
}

#[tokio::test]
async fn test_flush_interval_writes_partial_batch() {
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = IngestionPipeline::start(
        store.clone(),
        PipelineConfig {
            batch_size: 1_000,
            ..fast_pipeline()
        },
        None,
    )
    .unwrap();

    let id = pipeline.log_event(action(0, 0)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(store.get(&id).await.unwrap().is_some());

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_transient_write_failures_are_retried() {
    let store = Arc::new(FlakyStore::failing(2));
    let pipeline = IngestionPipeline::start(store.clone(), fast_pipeline(), None).unwrap();

    for i in 0..10 {
        pipeline.log_event(action(0, i)).await.unwrap();
    }
    let report = pipeline.shutdown().await.unwrap();

    assert!(report.is_complete());
    assert_eq!(report.persisted, 10);
    assert_eq!(store.len().await.unwrap(), 10);
    assert!(pipeline.stats().flush_failures >= 2);
}

#[tokio::test]
async fn test_held_batch_survives_repeated_failures() {
    // Two flush rounds of three attempts each fail before the store recovers
    let store = Arc::new(FlakyStore::failing(6));
    let pipeline = IngestionPipeline::start(store.clone(), fast_pipeline(), None).unwrap();

    let mut ids = Vec::new();
    for i in 0..5 {
        ids.push(pipeline.log_event(action(1, i)).await.unwrap());
    }

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(store.len().await.unwrap(), 5);
    for id in &ids {
        assert!(store.get(id).await.unwrap().is_some());
    }

    let report = pipeline.shutdown().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(pipeline.stats().held, 0);
}

#[tokio::test]
async fn test_drain_hands_back_unwritable_events() {
    let store = Arc::new(FlakyStore::down());
    let pipeline = IngestionPipeline::start(store.clone(), fast_pipeline(), None).unwrap();

    for i in 0..3 {
        pipeline.log_event(action(2, i)).await.unwrap();
    }
    let report = pipeline.shutdown().await.unwrap();

    assert!(!report.is_complete());
    assert_eq!(report.unflushed.len(), 3);
    assert!(matches!(report.ensure_complete(), Err(AuditError::Drain { pending: 3 })));
}

#[tokio::test]
async fn test_store_outage_bounds_buffered_events() {
    let store = Arc::new(FlakyStore::down());
    let pipeline = IngestionPipeline::start(
        store.clone(),
        PipelineConfig {
            queue_capacity: 4,
            batch_size: 4,
            enqueue_timeout_ms: 50,
            ..fast_pipeline()
        },
        None,
    )
    .unwrap();

    let mut accepted = 0;
    let mut rejected = 0;
    for i in 0..20 {
        match pipeline.log_event(action(4, i)).await {
            Ok(_) => accepted += 1,
            Err(AuditError::QueueFull { .. }) => rejected += 1,
            Err(e) => panic!("unexpected enqueue error: {}", e),
        }
    }

    assert!(rejected > 0);
    assert!(accepted <= 8, "accepted {} with the store down", accepted);
    assert_eq!(pipeline.stats().rejected, rejected);

    let report = pipeline.shutdown().await.unwrap();
    assert_eq!(report.unflushed.len() as u64, accepted);
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_saturated_queue_applies_backpressure() {
    let store = Arc::new(GatedStore {
        inner: MemoryEventStore::new(),
        gate: Semaphore::new(0),
    });
    let pipeline = IngestionPipeline::start(
        store.clone(),
        PipelineConfig {
            queue_capacity: 1,
            batch_size: 1,
            enqueue_timeout_ms: 50,
            ..fast_pipeline()
        },
        None,
    )
    .unwrap();

    // First is taken by the blocked consumer, second fills the queue
    pipeline.log_event(action(3, 0)).await.unwrap();
    pipeline.log_event(action(3, 1)).await.unwrap();
    let err = pipeline.log_event(action(3, 2)).await.unwrap_err();
    assert!(matches!(err, AuditError::QueueFull { timeout_ms: 50 }));
    assert_eq!(pipeline.stats().rejected, 1);

    store.gate.add_permits(100);
    let report = pipeline.shutdown().await.unwrap();
    assert!(report.is_complete());
    assert_eq!(store.len().await.unwrap(), 2);
}

#[tokio::test]
async fn test_subscribers_only_see_durable_events() {
    let store = Arc::new(MemoryEventStore::new());
    let pipeline = IngestionPipeline::start(store.clone(), fast_pipeline(), None).unwrap();
    let mut rx = pipeline.subscribe();

    let id = pipeline
        .log_api_call(
            EventContext::user("svc"),
            "GET",
            "/v1/items",
            503,
            42,
            HashMap::new(),
        )
        .await
        .unwrap();

    let event = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.id, id);
    assert_eq!(event.level, EventLevel::Error);
    assert!(!event.success);
    assert!(store.get(&id).await.unwrap().is_some());
    assert!(event.system_info.contains_key("hostname"));

    pipeline.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_closed_pipeline_rejects_events() {
    let pipeline =
        IngestionPipeline::start(Arc::new(MemoryEventStore::new()), fast_pipeline(), None).unwrap();
    pipeline.shutdown().await.unwrap();

    let err = pipeline.log_event(action(4, 0)).await.unwrap_err();
    assert!(matches!(err, AuditError::PipelineClosed));
    assert!(matches!(pipeline.shutdown().await, Err(AuditError::PipelineClosed)));
}

// ─── Rules ───────────────────────────────────────────────────────

#[tokio::test]
async fn test_unavailable_store_fails_evaluation_fast() {
    let engine = RuleEngine::in_memory(Arc::new(FlakyStore::down()));
    engine
        .add_rule(ComplianceRule::new(
            "failed_login_attempts",
            "Failed logins",
            Severity::High,
            RuleKind::FailedAttempts(a3s_audit::rules::FailedAttemptsConditions {
                max_failures: 5,
                time_window_minutes: 15,
            }),
        ))
        .await
        .unwrap();

    let event = NewEvent::new(EventLevel::Security, EventCategory::Authentication, "login_attempt")
        .user("alice")
        .success(false)
        .into_event(HashMap::new());
    let err = engine.evaluate(&event).await.unwrap_err();
    assert!(err.is_unavailable());
}

// ─── End to end ──────────────────────────────────────────────────

#[tokio::test]
async fn test_privileged_action_revokes_permissions() {
    let (sink, mut rx) = ChannelEnforcementSink::new(8);
    let config = AuditConfig {
        pipeline: fast_pipeline(),
        default_rules: true,
        ..Default::default()
    };
    let system = AuditSystem::start_with_sink(config, Arc::new(sink)).await.unwrap();

    let mut details = HashMap::new();
    details.insert("role".to_string(), serde_json::json!("support"));
    system
        .pipeline()
        .log_authorization(
            EventContext::user("mallory").with_session("s-9"),
            "users/42",
            "delete_user",
            true,
            details,
        )
        .await
        .unwrap();
    system.shutdown().await.unwrap();

    let violations = system
        .engine()
        .violations(&ViolationFilter::open().rule("privileged_access"))
        .await;
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].user_id.as_deref(), Some("mallory"));

    let directive = tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(directive.directive, DirectiveKind::RevokePermissions);
    assert_eq!(directive.target, "mallory");

    let incident = system
        .incidents()
        .get_incident(&directive.incident_id)
        .await
        .unwrap();
    assert_eq!(incident.status, IncidentStatus::Investigating);
    assert_eq!(incident.incident_type, "unauthorized_access");
    assert_eq!(incident.violation_ids, vec![violations[0].id.clone()]);

    let today = Utc::now().date_naive();
    let stats = system.analytics().daily_statistics(today).await.unwrap();
    assert_eq!(stats.by_category[&EventCategory::Authorization].count, 1);
    assert_eq!(stats.incidents_by_severity[&Severity::High], 1);
}

#[tokio::test]
async fn test_disabling_rule_stops_new_violations_only() {
    let config = AuditConfig {
        pipeline: fast_pipeline(),
        default_rules: true,
        ..Default::default()
    };
    let system = AuditSystem::start(config).await.unwrap();
    let ctx = EventContext::user("bob");

    for _ in 0..6 {
        system
            .pipeline()
            .log_authentication(ctx.clone(), "password", false, HashMap::new())
            .await
            .unwrap();
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    let before = system
        .engine()
        .violations(&ViolationFilter::default().rule("failed_login_attempts"))
        .await;
    assert_eq!(before.len(), 1);

    system
        .engine()
        .set_enabled("failed_login_attempts", false)
        .await
        .unwrap();
    for _ in 0..3 {
        system
            .pipeline()
            .log_authentication(ctx.clone(), "password", false, HashMap::new())
            .await
            .unwrap();
    }
    system.shutdown().await.unwrap();

    let after = system
        .engine()
        .violations(&ViolationFilter::default().rule("failed_login_attempts"))
        .await;
    assert_eq!(after, before);
}
