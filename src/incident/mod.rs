//! Security incidents, escalation, and automated response
//!
//! Incidents are created by hand or by escalating accumulated violations.
//! Automated response maps a few incident types to a `MitigationDirective`
//! and hands it to an `EnforcementSink` on a spawned task, so a slow or
//! broken collaborator never stalls the audit path. The delivery outcome is
//! recorded on the incident as `mitigation_status`.

mod escalation;
mod sink;

pub use escalation::{EscalationPolicy, EscalationRule};
pub use sink::{
    ChannelEnforcementSink, DirectiveKind, EnforcementSink, LogEnforcementSink,
    MitigationDirective, NatsEnforcementSink,
};

use crate::error::{AuditError, Result};
use crate::rules::{ComplianceViolation, RuleEngine, ViolationFilter};
use crate::store::{Record, RecordTable};
use crate::types::{Severity, TimeRange};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

/// Incident lifecycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    #[default]
    Investigating,
    Resolved,
}

impl IncidentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IncidentStatus::Investigating => "investigating",
            IncidentStatus::Resolved => "resolved",
        }
    }
}

/// Outcome of handing an incident's directive to the enforcement sink
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MitigationStatus {
    /// No directive applies to this incident
    #[default]
    None,
    Pending,
    Delivered,
    /// Delivery failed or timed out; the incident is degraded
    Failed,
}

/// A higher-level case, possibly aggregating several violations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityIncident {
    pub id: String,
    pub incident_type: String,
    pub severity: Severity,
    pub description: String,
    #[serde(default)]
    pub affected_resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attack_vector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub status: IncidentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution_summary: Option<String>,
    /// Violations that escalated into this incident
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violation_ids: Vec<String>,
    #[serde(default)]
    pub mitigation_status: MitigationStatus,
}

impl Record for SecurityIncident {
    fn key(&self) -> &str {
        &self.id
    }

    fn status(&self) -> &'static str {
        self.status.as_str()
    }
}

/// Parameters for opening an incident
#[derive(Debug, Clone)]
pub struct NewIncident {
    pub incident_type: String,
    pub severity: Severity,
    pub description: String,
    pub affected_resources: Vec<String>,
    pub attack_vector: Option<String>,
    pub source_ip: Option<String>,
    pub user_id: Option<String>,
    pub violation_ids: Vec<String>,
}

impl NewIncident {
    pub fn new(
        incident_type: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            incident_type: incident_type.into(),
            severity,
            description: description.into(),
            affected_resources: Vec::new(),
            attack_vector: None,
            source_ip: None,
            user_id: None,
            violation_ids: Vec::new(),
        }
    }

    pub fn affected_resources(mut self, resources: Vec<String>) -> Self {
        self.affected_resources = resources;
        self
    }

    pub fn attack_vector(mut self, vector: impl Into<String>) -> Self {
        self.attack_vector = Some(vector.into());
        self
    }

    pub fn source_ip(mut self, ip: impl Into<String>) -> Self {
        self.source_ip = Some(ip.into());
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn violations(mut self, ids: Vec<String>) -> Self {
        self.violation_ids = ids;
        self
    }
}

/// The fixed incident-type to directive mapping.
///
/// Returns `None` when the type has no automated response or the needed
/// target (user or IP) is missing.
pub fn directive_for(
    incident_type: &str,
    user_id: Option<&str>,
    ip_address: Option<&str>,
) -> Option<(DirectiveKind, String)> {
    match incident_type {
        "failed_login_attempts" => user_id.map(|u| (DirectiveKind::LockAccount, u.to_string())),
        "brute_force" | "suspicious_ip" => {
            ip_address.map(|ip| (DirectiveKind::BlockIp, ip.to_string()))
        }
        "privilege_escalation" | "unauthorized_access" => {
            user_id.map(|u| (DirectiveKind::RevokePermissions, u.to_string()))
        }
        _ => None,
    }
}

/// Owns incidents and issues mitigation directives
pub struct IncidentManager {
    incidents: Arc<RecordTable<SecurityIncident>>,
    sink: Arc<dyn EnforcementSink>,
    policy: EscalationPolicy,
    delivery_timeout: Duration,
    /// Serializes the check-then-create step of escalation
    escalation: Mutex<()>,
}

impl IncidentManager {
    pub fn new(
        incidents: RecordTable<SecurityIncident>,
        sink: Arc<dyn EnforcementSink>,
        policy: EscalationPolicy,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            incidents: Arc::new(incidents),
            sink,
            policy,
            delivery_timeout,
            escalation: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &EscalationPolicy {
        &self.policy
    }

    /// Open a new incident in `investigating` state
    pub async fn create_incident(&self, new: NewIncident) -> Result<String> {
        let incident = SecurityIncident {
            id: format!("inc-{}", uuid::Uuid::new_v4()),
            incident_type: new.incident_type,
            severity: new.severity,
            description: new.description,
            affected_resources: new.affected_resources,
            attack_vector: new.attack_vector,
            source_ip: new.source_ip,
            user_id: new.user_id,
            status: IncidentStatus::Investigating,
            assigned_to: None,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution_summary: None,
            violation_ids: new.violation_ids,
            mitigation_status: MitigationStatus::None,
        };
        let id = incident.id.clone();

        tracing::warn!(
            incident = %id,
            incident_type = %incident.incident_type,
            severity = %incident.severity,
            user = incident.user_id.as_deref().unwrap_or("-"),
            "Security incident opened"
        );
        self.incidents.insert_new(incident).await?;
        Ok(id)
    }

    /// Issue the automated response for an incident, if its type has one.
    ///
    /// Takes the incident rather than a bare `(type, user, ip)` triple: the
    /// directive carries the incident id, and the outcome is recorded on the
    /// incident's `mitigation_status`. The type, user and source IP come from
    /// the stored incident.
    ///
    /// Delivery runs on a spawned task bounded by the delivery timeout; the
    /// returned directive is what was handed to the sink.
    pub async fn auto_respond(&self, incident_id: &str) -> Result<Option<MitigationDirective>> {
        let Some(incident) = self.incidents.get(incident_id).await else {
            return Err(AuditError::NotFound(format!("incident '{}'", incident_id)));
        };
        let Some((kind, target)) = directive_for(
            &incident.incident_type,
            incident.user_id.as_deref(),
            incident.source_ip.as_deref(),
        ) else {
            return Ok(None);
        };

        let directive = MitigationDirective {
            directive: kind,
            target,
            incident_id: incident.id.clone(),
            timestamp: Utc::now(),
        };
        self.incidents
            .update(incident_id, |i| i.mitigation_status = MitigationStatus::Pending)
            .await?;

        let incidents = self.incidents.clone();
        let sink = self.sink.clone();
        let timeout = self.delivery_timeout;
        let sent = directive.clone();
        tokio::spawn(async move {
            let outcome = match tokio::time::timeout(timeout, sink.deliver(&sent)).await {
                Ok(Ok(())) => MitigationStatus::Delivered,
                Ok(Err(e)) => {
                    tracing::warn!(
                        incident = %sent.incident_id,
                        sink = sink.name(),
                        error = %e,
                        "Mitigation delivery failed"
                    );
                    MitigationStatus::Failed
                }
                Err(_) => {
                    tracing::warn!(
                        incident = %sent.incident_id,
                        sink = sink.name(),
                        timeout_ms = timeout.as_millis() as u64,
                        "Mitigation delivery timed out"
                    );
                    MitigationStatus::Failed
                }
            };
            if let Err(e) = incidents
                .update(&sent.incident_id, |i| i.mitigation_status = outcome)
                .await
            {
                tracing::warn!(incident = %sent.incident_id, error = %e, "Failed to record mitigation status");
            }
        });

        Ok(Some(directive))
    }

    /// Apply the escalation policy to newly recorded violations.
    ///
    /// Returns the ids of incidents opened by this call. At most one
    /// incident per `(incident_type, user)` is opened within the policy's
    /// dedup window, however many violations arrive together.
    pub async fn escalate(&self, engine: &RuleEngine, violation_ids: &[String]) -> Result<Vec<String>> {
        if self.policy.rules.is_empty() || violation_ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut fresh = Vec::with_capacity(violation_ids.len());
        for id in violation_ids {
            if let Some(v) = engine.violation(id).await {
                fresh.push(v);
            }
        }

        let guard = self.escalation.lock().await;
        let mut opened = Vec::new();
        for rule in &self.policy.rules {
            // Group matching violations per user; BTreeMap keeps order stable
            let mut by_user: BTreeMap<&str, Vec<&ComplianceViolation>> = BTreeMap::new();
            for v in fresh.iter().filter(|v| rule.applies_to(v)) {
                if let Some(user) = v.user_id.as_deref() {
                    by_user.entry(user).or_default().push(v);
                }
            }

            for (user, batch) in by_user {
                let Some(latest) = batch.iter().max_by_key(|v| v.detected_at) else {
                    continue;
                };
                let window = TimeRange::ending_at(
                    latest.detected_at,
                    ChronoDuration::minutes(i64::from(rule.window_minutes)),
                );
                let history = engine
                    .violations(&ViolationFilter::default().user(user).within(window))
                    .await;
                let matching: Vec<&ComplianceViolation> =
                    history.iter().filter(|v| rule.applies_to(v)).collect();
                if matching.len() < rule.threshold {
                    continue;
                }
                if self.has_recent_incident(&rule.incident_type, user).await {
                    tracing::debug!(
                        incident_type = %rule.incident_type,
                        user = user,
                        "Escalation suppressed by open incident"
                    );
                    continue;
                }

                let mut new = NewIncident::new(
                    rule.incident_type.clone(),
                    rule.incident_severity,
                    format!(
                        "{} {} violation(s) by '{}' within {} minutes",
                        matching.len(),
                        rule.violation_type,
                        user,
                        rule.window_minutes
                    ),
                )
                .user(user)
                .attack_vector(rule.violation_type.clone())
                .violations(matching.iter().map(|v| v.id.clone()).collect());
                if let Some(ip) = matching.iter().find_map(|v| v.ip_address.clone()) {
                    new = new.source_ip(ip);
                }

                opened.push(self.create_incident(new).await?);
            }
        }
        drop(guard);

        self.respond_to(&opened).await;
        Ok(opened)
    }

    /// Auto-respond to each incident; a failure is logged and the rest proceed.
    ///
    /// Returns how many directives were issued.
    async fn respond_to(&self, incident_ids: &[String]) -> usize {
        let mut issued = 0;
        for id in incident_ids {
            match self.auto_respond(id).await {
                Ok(Some(_)) => issued += 1,
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(incident = %id, error = %e, "Automated response failed");
                }
            }
        }
        issued
    }

    async fn has_recent_incident(&self, incident_type: &str, user: &str) -> bool {
        let cutoff = Utc::now() - ChronoDuration::minutes(i64::from(self.policy.dedup_window_minutes));
        self.incidents
            .with_status(IncidentStatus::Investigating.as_str())
            .await
            .iter()
            .any(|i| {
                i.incident_type == incident_type
                    && i.user_id.as_deref() == Some(user)
                    && i.detected_at >= cutoff
            })
    }

    pub async fn assign_incident(&self, id: &str, assignee: impl Into<String>) -> Result<SecurityIncident> {
        let assignee = assignee.into();
        let incident = self
            .incidents
            .update(id, |i| i.assigned_to = Some(assignee))
            .await?;
        tracing::info!(incident = id, assignee = incident.assigned_to.as_deref().unwrap_or("-"), "Incident assigned");
        Ok(incident)
    }

    /// Close an incident with a resolution summary
    pub async fn resolve_incident(&self, id: &str, summary: impl Into<String>) -> Result<SecurityIncident> {
        let summary = summary.into();
        let incident = self
            .incidents
            .update(id, |i| {
                i.status = IncidentStatus::Resolved;
                i.resolved_at = Some(Utc::now());
                i.resolution_summary = Some(summary);
            })
            .await?;
        tracing::info!(incident = id, "Incident resolved");
        Ok(incident)
    }

    pub async fn get_incident(&self, id: &str) -> Option<SecurityIncident> {
        self.incidents.get(id).await
    }

    /// Incidents with the given status (all when `None`), newest first
    pub async fn list_incidents(&self, status: Option<IncidentStatus>) -> Vec<SecurityIncident> {
        let mut incidents = match status {
            Some(status) => self.incidents.with_status(status.as_str()).await,
            None => self.incidents.all().await,
        };
        incidents.sort_by(|a, b| b.detected_at.cmp(&a.detected_at).then(a.id.cmp(&b.id)));
        incidents
    }

    /// Incident counts per severity for incidents detected in `range`
    pub async fn incident_counts(&self, range: &TimeRange) -> HashMap<Severity, u64> {
        let mut counts = HashMap::new();
        for incident in self.incidents.all().await {
            if range.contains(&incident.detected_at) {
                *counts.entry(incident.severity).or_insert(0) += 1;
            }
        }
        counts
    }
}
