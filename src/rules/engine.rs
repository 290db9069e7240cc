//! Rule registry, evaluation, and violation records

use super::{evaluate_rule, ComplianceRule};
use crate::error::{AuditError, Result};
use crate::store::{EventStore, Record, RecordTable};
use crate::types::{AuditEvent, EventId, Severity, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Lifecycle of a violation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationStatus {
    #[default]
    Open,
    Resolved,
}

impl ViolationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationStatus::Open => "open",
            ViolationStatus::Resolved => "resolved",
        }
    }
}

/// A recorded instance of a rule firing on one event
///
/// The triggering event is referenced by id; `user_id` is kept as a
/// correlation key so escalation can group violations per actor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceViolation {
    pub id: String,
    pub rule_id: String,
    pub event_id: EventId,
    /// Rule kind that fired (e.g. "failed_attempts")
    pub violation_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    pub status: ViolationStatus,
    /// Timestamp of the triggering event, not the wall-clock evaluation time,
    /// so late or repeated evaluation records the same instant and violation
    /// windows line up with the event windows rules count over
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_notes: Option<String>,
}

impl ComplianceViolation {
    /// Violation ids are derived from the rule and event, so re-evaluating
    /// the same event never records a second violation.
    pub fn derive_id(rule_id: &str, event_id: &str) -> String {
        let name = format!("{}|{}", rule_id, event_id);
        format!(
            "vio-{}",
            uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes())
        )
    }

    fn new(rule: &ComplianceRule, event: &AuditEvent, description: String) -> Self {
        Self {
            id: Self::derive_id(&rule.id, &event.id),
            rule_id: rule.id.clone(),
            event_id: event.id.clone(),
            violation_type: rule.kind.rule_type().to_string(),
            severity: rule.severity,
            description,
            user_id: event.user_id.clone(),
            ip_address: event.ip_address.clone(),
            status: ViolationStatus::Open,
            detected_at: event.timestamp,
            resolved_at: None,
            resolution_notes: None,
        }
    }
}

impl Record for ComplianceViolation {
    fn key(&self) -> &str {
        &self.id
    }

    fn status(&self) -> &'static str {
        self.status.as_str()
    }
}

/// Filter for listing violations
#[derive(Debug, Clone, Default)]
pub struct ViolationFilter {
    pub status: Option<ViolationStatus>,
    pub rule_id: Option<String>,
    pub user_id: Option<String>,
    pub severity: Option<Severity>,
    pub time_range: Option<TimeRange>,
}

impl ViolationFilter {
    pub fn open() -> Self {
        Self {
            status: Some(ViolationStatus::Open),
            ..Default::default()
        }
    }

    pub fn rule(mut self, rule_id: impl Into<String>) -> Self {
        self.rule_id = Some(rule_id.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    pub fn matches(&self, v: &ComplianceViolation) -> bool {
        if let Some(ref rule_id) = self.rule_id {
            if v.rule_id != *rule_id {
                return false;
            }
        }
        if let Some(ref user_id) = self.user_id {
            if v.user_id.as_deref() != Some(user_id.as_str()) {
                return false;
            }
        }
        if let Some(severity) = self.severity {
            if v.severity != severity {
                return false;
            }
        }
        if let Some(ref range) = self.time_range {
            if !range.contains(&v.detected_at) {
                return false;
            }
        }
        true
    }
}

/// Evaluates every enabled rule against persisted events
pub struct RuleEngine {
    store: Arc<dyn EventStore>,
    rules: RwLock<BTreeMap<String, ComplianceRule>>,
    violations: RecordTable<ComplianceViolation>,
}

impl RuleEngine {
    pub fn new(store: Arc<dyn EventStore>, violations: RecordTable<ComplianceViolation>) -> Self {
        Self {
            store,
            rules: RwLock::new(BTreeMap::new()),
            violations,
        }
    }

    /// Engine whose violations live only in memory
    pub fn in_memory(store: Arc<dyn EventStore>) -> Self {
        Self::new(store, RecordTable::in_memory("violations"))
    }

    /// Register a rule, replacing any rule with the same id
    pub async fn add_rule(&self, rule: ComplianceRule) -> Result<()> {
        rule.validate()?;
        tracing::info!(
            rule = %rule.id,
            rule_type = rule.kind.rule_type(),
            enabled = rule.enabled,
            "Compliance rule registered"
        );
        self.rules.write().await.insert(rule.id.clone(), rule);
        Ok(())
    }

    /// Register raw rule definitions, skipping malformed ones.
    ///
    /// Returns the number of rules loaded.
    pub async fn load_rules(&self, definitions: &[serde_json::Value]) -> usize {
        let mut loaded = 0;
        for definition in definitions {
            match ComplianceRule::from_value(definition.clone()) {
                Ok(rule) => {
                    if self.add_rule(rule).await.is_ok() {
                        loaded += 1;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "Skipping malformed compliance rule"),
            }
        }
        loaded
    }

    /// Enable or disable a rule; past violations are kept either way
    pub async fn set_enabled(&self, rule_id: &str, enabled: bool) -> Result<()> {
        let mut rules = self.rules.write().await;
        let rule = rules
            .get_mut(rule_id)
            .ok_or_else(|| AuditError::NotFound(format!("rule '{}'", rule_id)))?;
        rule.enabled = enabled;
        tracing::info!(rule = rule_id, enabled, "Compliance rule toggled");
        Ok(())
    }

    pub async fn remove_rule(&self, rule_id: &str) -> Option<ComplianceRule> {
        self.rules.write().await.remove(rule_id)
    }

    pub async fn rule(&self, rule_id: &str) -> Option<ComplianceRule> {
        self.rules.read().await.get(rule_id).cloned()
    }

    pub async fn rules(&self) -> Vec<ComplianceRule> {
        self.rules.read().await.values().cloned().collect()
    }

    /// Evaluate all enabled rules against one persisted event.
    ///
    /// Returns the ids of violations recorded by this call. A rule whose
    /// evaluation errors is skipped; an unavailable store aborts the whole
    /// evaluation so no violation is silently missed.
    pub async fn evaluate(&self, event: &AuditEvent) -> Result<Vec<String>> {
        let rules: Vec<ComplianceRule> = self
            .rules
            .read()
            .await
            .values()
            .filter(|r| r.enabled)
            .cloned()
            .collect();

        let mut recorded = Vec::new();
        for rule in &rules {
            let description = match evaluate_rule(&rule.kind, event, self.store.as_ref()).await {
                Ok(Some(description)) => description,
                Ok(None) => continue,
                Err(e) if e.is_unavailable() => return Err(e),
                Err(e) => {
                    tracing::warn!(
                        rule = %rule.id,
                        event = %event.id,
                        error = %e,
                        "Rule evaluation failed, skipping rule"
                    );
                    continue;
                }
            };

            let violation = ComplianceViolation::new(rule, event, description);
            let id = violation.id.clone();
            if self.violations.insert_new(violation).await? {
                tracing::warn!(
                    rule = %rule.id,
                    event = %event.id,
                    severity = %rule.severity,
                    violation = %id,
                    "Compliance violation"
                );
                recorded.push(id);
            }
        }
        Ok(recorded)
    }

    pub async fn violation(&self, id: &str) -> Option<ComplianceViolation> {
        self.violations.get(id).await
    }

    /// Violations matching `filter`, most recent first
    pub async fn violations(&self, filter: &ViolationFilter) -> Vec<ComplianceViolation> {
        let rows = match filter.status {
            Some(status) => self.violations.with_status(status.as_str()).await,
            None => self.violations.all().await,
        };
        let mut matched: Vec<_> = rows.into_iter().filter(|v| filter.matches(v)).collect();
        matched.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(a.id.cmp(&b.id)));
        matched
    }

    /// Mark a violation resolved with reviewer notes
    pub async fn resolve_violation(&self, id: &str, notes: impl Into<String>) -> Result<ComplianceViolation> {
        let notes = notes.into();
        let resolved = self
            .violations
            .update(id, |v| {
                v.status = ViolationStatus::Resolved;
                v.resolved_at = Some(Utc::now());
                v.resolution_notes = Some(notes);
            })
            .await?;
        tracing::info!(violation = id, rule = %resolved.rule_id, "Violation resolved");
        Ok(resolved)
    }

    /// Violation counts per severity for violations detected in `range`
    pub async fn violation_counts(&self, range: &TimeRange) -> HashMap<Severity, u64> {
        let mut counts = HashMap::new();
        for v in self.violations.all().await {
            if range.contains(&v.detected_at) {
                *counts.entry(v.severity).or_insert(0) += 1;
            }
        }
        counts
    }
}
