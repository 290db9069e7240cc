//! Data-driven escalation from violations to incidents

use crate::error::{AuditError, Result};
use crate::rules::ComplianceViolation;
use crate::types::Severity;
use serde::{Deserialize, Serialize};

/// When violations of one type become an incident
///
/// `threshold` violations of `violation_type` at `min_severity` or above,
/// for the same user within `window_minutes`, open an incident of
/// `incident_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationRule {
    /// Rule kind of the violations counted (e.g. "failed_attempts")
    pub violation_type: String,
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    #[serde(default = "default_threshold")]
    pub threshold: usize,
    #[serde(default = "default_window_minutes")]
    pub window_minutes: u32,
    pub incident_type: String,
    #[serde(default = "default_incident_severity")]
    pub incident_severity: Severity,
}

fn default_min_severity() -> Severity {
    Severity::Low
}

fn default_threshold() -> usize {
    1
}

fn default_window_minutes() -> u32 {
    15
}

fn default_incident_severity() -> Severity {
    Severity::High
}

impl EscalationRule {
    pub fn applies_to(&self, violation: &ComplianceViolation) -> bool {
        violation.violation_type == self.violation_type && violation.severity >= self.min_severity
    }
}

/// Escalation rules plus the duplicate-suppression window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EscalationPolicy {
    pub rules: Vec<EscalationRule>,
    /// An investigating incident of the same type for the same user
    /// opened within this many minutes suppresses a new one
    pub dedup_window_minutes: u32,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            rules: vec![
                EscalationRule {
                    violation_type: "failed_attempts".to_string(),
                    min_severity: Severity::Low,
                    threshold: 1,
                    window_minutes: 15,
                    incident_type: "failed_login_attempts".to_string(),
                    incident_severity: Severity::High,
                },
                EscalationRule {
                    violation_type: "privileged_access".to_string(),
                    min_severity: Severity::High,
                    threshold: 1,
                    window_minutes: 60,
                    incident_type: "unauthorized_access".to_string(),
                    incident_severity: Severity::High,
                },
            ],
            dedup_window_minutes: 60,
        }
    }
}

impl EscalationPolicy {
    pub fn validate(&self) -> Result<()> {
        if self.dedup_window_minutes == 0 {
            return Err(AuditError::Config(
                "escalation.dedupWindowMinutes must be > 0".to_string(),
            ));
        }
        for rule in &self.rules {
            if rule.incident_type.is_empty() || rule.violation_type.is_empty() {
                return Err(AuditError::Config(
                    "escalation rules need violationType and incidentType".to_string(),
                ));
            }
            if rule.threshold == 0 || rule.window_minutes == 0 {
                return Err(AuditError::Config(format!(
                    "escalation rule for '{}' needs threshold and windowMinutes > 0",
                    rule.violation_type
                )));
            }
        }
        Ok(())
    }
}
