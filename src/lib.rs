//! # a3s-audit
//!
//! Asynchronous audit-event ingestion and compliance-rule evaluation for the
//! A3S ecosystem.
//!
//! ## Overview
//!
//! Producers record what happened through an `IngestionPipeline`, which
//! buffers events on a bounded queue and writes them to an `EventStore` in
//! batches. Every durably written batch is evaluated against the configured
//! compliance rules; violations are recorded, and repeated violations can
//! escalate into security incidents whose mitigation directives go to an
//! external enforcement collaborator.
//!
//! ## Quick Start
//!
//! ```rust
//! use a3s_audit::{AuditConfig, AuditSystem, EventContext};
//! use std::collections::HashMap;
//!
//! # async fn example() -> a3s_audit::Result<()> {
//! let config = AuditConfig {
//!     default_rules: true,
//!     ..Default::default()
//! };
//! let system = AuditSystem::start(config).await?;
//!
//! let ctx = EventContext::user("alice").with_ip("192.0.2.10");
//! system
//!     .pipeline()
//!     .log_authentication(ctx, "password", false, HashMap::new())
//!     .await?;
//!
//! // Drain before exit so nothing queued is lost
//! let report = system.shutdown().await?;
//! println!("Persisted {} events", report.persisted);
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage
//!
//! - **memory**: indexed in-process store for tests and single-process use
//! - **file**: the same index backed by fsync'd JSON-lines journals
//!
//! ## Architecture
//!
//! - **EventStore** trait: append, query, and windowed aggregate counts
//! - **IngestionPipeline**: bounded queue, batching consumer, drain on shutdown
//! - **RuleEngine**: typed rule kinds evaluated against stored history
//! - **IncidentManager**: escalation policy and mitigation directives
//! - **Analytics**: read-only daily and per-user reports

pub mod analytics;
pub mod config;
pub mod error;
pub mod incident;
pub mod monitor;
pub mod pipeline;
pub mod rules;
pub mod store;
pub mod types;

// Re-export core types
pub use analytics::{ActivityStats, Analytics, DailyStatistics, UserActivitySummary};
pub use config::{
    AuditConfig, EnforcementBackend, EnforcementConfig, PipelineConfig, StorageBackend,
    StorageConfig,
};
pub use error::{AuditError, Result};
pub use incident::{
    ChannelEnforcementSink, DirectiveKind, EnforcementSink, EscalationPolicy, EscalationRule,
    IncidentManager, IncidentStatus, LogEnforcementSink, MitigationDirective, MitigationStatus,
    NatsEnforcementSink, NewIncident, SecurityIncident,
};
pub use monitor::{AuditSystem, ComplianceMonitor};
pub use pipeline::{BatchListener, DrainReport, IngestionPipeline, PipelineStatsSnapshot};
pub use rules::{
    default_rules, ComplianceRule, ComplianceViolation, RuleEngine, RuleKind, ViolationFilter,
    ViolationStatus,
};
pub use store::{EventStore, FileEventStore, MemoryEventStore};
pub use types::{
    AuditEvent, EventCategory, EventContext, EventFilter, EventId, EventLevel, NewEvent, Severity,
    TimeRange,
};
