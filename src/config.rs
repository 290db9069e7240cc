//! Configuration for the audit engine
//!
//! Every section is serde-driven with `#[serde(default)]`, so a config file
//! only needs to name the values it changes.

use crate::error::{AuditError, Result};
use crate::incident::EscalationPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Ingestion pipeline tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Bounded queue capacity between producers and the consumer
    pub queue_capacity: usize,
    /// Flush once this many events are buffered
    pub batch_size: usize,
    /// Flush once the oldest buffered event is this old (milliseconds)
    pub flush_interval_ms: u64,
    /// Longest a producer may wait on a saturated queue (milliseconds)
    pub enqueue_timeout_ms: u64,
    /// Extra write attempts per flush before the batch is held
    pub max_flush_retries: u32,
    /// Delay between write attempts (milliseconds, doubled per attempt)
    pub retry_backoff_ms: u64,
    /// Capacity of the flushed-event broadcast channel
    pub broadcast_capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
            batch_size: 100,
            flush_interval_ms: 5_000,
            enqueue_timeout_ms: 1_000,
            max_flush_retries: 3,
            retry_backoff_ms: 100,
            broadcast_capacity: 1_024,
        }
    }
}

impl PipelineConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn enqueue_timeout(&self) -> Duration {
        Duration::from_millis(self.enqueue_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(AuditError::Config("queueCapacity must be > 0".to_string()));
        }
        if self.batch_size == 0 {
            return Err(AuditError::Config("batchSize must be > 0".to_string()));
        }
        if self.flush_interval_ms == 0 {
            return Err(AuditError::Config("flushIntervalMs must be > 0".to_string()));
        }
        if self.broadcast_capacity == 0 {
            return Err(AuditError::Config("broadcastCapacity must be > 0".to_string()));
        }
        Ok(())
    }
}

/// Which event store backend to use
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    File,
}

/// Storage settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Directory holding the events, violations, and incidents journals
    pub dir: PathBuf,
    /// Retention applied by `AuditSystem::prune_events` when called without an override
    pub retention_days: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Memory,
            dir: PathBuf::from("audit"),
            retention_days: 90,
        }
    }
}

/// Where mitigation directives are sent
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnforcementBackend {
    /// Directives are only logged
    #[default]
    Log,
    /// Directives are published as JSON to a NATS subject
    Nats,
}

/// Enforcement collaborator settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EnforcementConfig {
    pub backend: EnforcementBackend,
    pub nats_url: String,
    pub subject: String,
    /// Upper bound on a single delivery attempt (milliseconds)
    pub delivery_timeout_ms: u64,
}

impl Default for EnforcementConfig {
    fn default() -> Self {
        Self {
            backend: EnforcementBackend::Log,
            nats_url: "nats://127.0.0.1:4222".to_string(),
            subject: "audit.mitigation".to_string(),
            delivery_timeout_ms: 5_000,
        }
    }
}

impl EnforcementConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

/// Top-level audit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AuditConfig {
    pub pipeline: PipelineConfig,
    pub storage: StorageConfig,
    pub enforcement: EnforcementConfig,
    pub escalation: EscalationPolicy,
    /// Install the built-in rule set before `rules`
    pub default_rules: bool,
    /// Raw rule definitions; each is parsed on its own so one bad rule
    /// cannot reject the rest
    pub rules: Vec<serde_json::Value>,
}

impl AuditConfig {
    /// Load configuration from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            AuditError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config: AuditConfig = serde_json::from_str(&json).map_err(|e| {
            AuditError::Config(format!(
                "Failed to parse config file {}: {}",
                path.display(),
                e
            ))
        })?;
        config.validate()?;
        tracing::debug!(path = %path.display(), rules = config.rules.len(), "Config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.pipeline.validate()?;
        self.escalation.validate()?;
        if self.enforcement.backend == EnforcementBackend::Nats && self.enforcement.subject.is_empty() {
            return Err(AuditError::Config(
                "enforcement.subject must be set for the nats backend".to_string(),
            ));
        }
        Ok(())
    }
}
