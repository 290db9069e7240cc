//! Compliance rules: typed predicates over the event stream
//!
//! Each rule carries one `RuleKind` variant whose payload is the strongly
//! typed condition set for that kind. On the wire a rule is a flat object
//! with `rule_type` selecting the kind and `conditions` holding its payload:
//!
//! ```json
//! {
//!   "id": "failed_login_attempts",
//!   "name": "Failed login attempts",
//!   "severity": "high",
//!   "rule_type": "failed_attempts",
//!   "conditions": { "max_failures": 5, "time_window_minutes": 15 }
//! }
//! ```

mod engine;
mod evaluate;

pub use engine::{ComplianceViolation, RuleEngine, ViolationFilter, ViolationStatus};
pub use evaluate::evaluate_rule;

use crate::error::{AuditError, Result};
use crate::types::{EventCategory, Severity};
use serde::{Deserialize, Serialize};

/// Count-over-window limit for one category of a user's events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrequencyConditions {
    pub category: EventCategory,
    pub max_count: u64,
    pub time_window_minutes: u32,
}

/// Limit on a user's failed authentications within a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedAttemptsConditions {
    pub max_failures: u64,
    pub time_window_minutes: u32,
}

/// Actions that require one of the authorized roles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrivilegedAccessConditions {
    pub privileged_actions: Vec<String>,
    pub authorized_roles: Vec<String>,
}

/// Limit on distinct resources a user touches per hour, for sensitive data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataAccessConditions {
    /// Resource names (or prefixes) considered sensitive
    pub sensitive_resources: Vec<String>,
    pub max_resources_per_hour: u64,
}

/// Hours of the day during which activity is allowed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeBasedConditions {
    /// Allowed local hours, 0-23
    pub allowed_hours: Vec<u32>,
    /// Offset from UTC of the local clock, in minutes
    #[serde(default)]
    pub utc_offset_minutes: i32,
    /// Categories the rule applies to; empty means all
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<EventCategory>,
}

/// The five rule kinds, each with its own condition payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule_type", content = "conditions", rename_all = "snake_case")]
pub enum RuleKind {
    Frequency(FrequencyConditions),
    FailedAttempts(FailedAttemptsConditions),
    PrivilegedAccess(PrivilegedAccessConditions),
    DataAccessPattern(DataAccessConditions),
    TimeBased(TimeBasedConditions),
}

impl RuleKind {
    /// Wire name of the kind, also used as the violation type
    pub fn rule_type(&self) -> &'static str {
        match self {
            RuleKind::Frequency(_) => "frequency",
            RuleKind::FailedAttempts(_) => "failed_attempts",
            RuleKind::PrivilegedAccess(_) => "privileged_access",
            RuleKind::DataAccessPattern(_) => "data_access_pattern",
            RuleKind::TimeBased(_) => "time_based",
        }
    }

    /// Check the values the type system cannot
    pub fn validate(&self) -> std::result::Result<(), String> {
        match self {
            RuleKind::Frequency(c) if c.time_window_minutes == 0 => {
                Err("time_window_minutes must be > 0".to_string())
            }
            RuleKind::FailedAttempts(c) if c.time_window_minutes == 0 => {
                Err("time_window_minutes must be > 0".to_string())
            }
            RuleKind::PrivilegedAccess(c) if c.privileged_actions.is_empty() => {
                Err("privileged_actions must not be empty".to_string())
            }
            RuleKind::DataAccessPattern(c) if c.sensitive_resources.is_empty() => {
                Err("sensitive_resources must not be empty".to_string())
            }
            RuleKind::TimeBased(c) => {
                if c.allowed_hours.is_empty() {
                    return Err("allowed_hours must not be empty".to_string());
                }
                if let Some(h) = c.allowed_hours.iter().find(|h| **h > 23) {
                    return Err(format!("allowed hour {} is outside 0-23", h));
                }
                if c.utc_offset_minutes.unsigned_abs() > 14 * 60 {
                    return Err(format!(
                        "utc_offset_minutes {} is out of range",
                        c.utc_offset_minutes
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

/// A named, typed predicate over the event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComplianceRule {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form grouping (e.g. "security", "data_protection")
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub kind: RuleKind,
}

fn default_enabled() -> bool {
    true
}

impl ComplianceRule {
    pub fn new(id: impl Into<String>, name: impl Into<String>, severity: Severity, kind: RuleKind) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            category: String::new(),
            severity,
            enabled: true,
            kind,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            return Err(AuditError::InvalidRule {
                rule_id: String::new(),
                reason: "rule id must not be empty".to_string(),
            });
        }
        self.kind.validate().map_err(|reason| AuditError::InvalidRule {
            rule_id: self.id.clone(),
            reason,
        })
    }

    /// Parse and validate one raw rule definition
    pub fn from_value(value: serde_json::Value) -> Result<Self> {
        let rule_id = value
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or("<unnamed>")
            .to_string();
        let rule: ComplianceRule =
            serde_json::from_value(value).map_err(|e| AuditError::InvalidRule {
                rule_id,
                reason: e.to_string(),
            })?;
        rule.validate()?;
        Ok(rule)
    }
}

/// Built-in rule set covering the common misuse patterns
pub fn default_rules() -> Vec<ComplianceRule> {
    let strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    vec![
        ComplianceRule::new(
            "failed_login_attempts",
            "Failed login attempts",
            Severity::High,
            RuleKind::FailedAttempts(FailedAttemptsConditions {
                max_failures: 5,
                time_window_minutes: 15,
            }),
        )
        .with_description("More than 5 failed logins for one user within 15 minutes")
        .with_category("security"),
        ComplianceRule::new(
            "excessive_api_calls",
            "Excessive API usage",
            Severity::Medium,
            RuleKind::Frequency(FrequencyConditions {
                category: EventCategory::ApiCall,
                max_count: 1_000,
                time_window_minutes: 60,
            }),
        )
        .with_description("More than 1000 API calls by one user within an hour")
        .with_category("performance"),
        ComplianceRule::new(
            "privileged_access",
            "Unauthorized privileged operation",
            Severity::High,
            RuleKind::PrivilegedAccess(PrivilegedAccessConditions {
                privileged_actions: strings(&[
                    "delete_user",
                    "modify_permissions",
                    "system_config_change",
                    "export_data",
                ]),
                authorized_roles: strings(&["admin", "security_officer"]),
            }),
        )
        .with_description("Privileged action by an actor without an authorized role")
        .with_category("access_control"),
        ComplianceRule::new(
            "sensitive_data_access",
            "Broad sensitive data access",
            Severity::High,
            RuleKind::DataAccessPattern(DataAccessConditions {
                sensitive_resources: strings(&["user_data", "financial_data", "audit_logs"]),
                max_resources_per_hour: 10,
            }),
        )
        .with_description("More than 10 distinct resources read by one user within an hour")
        .with_category("data_protection"),
        ComplianceRule::new(
            "after_hours_access",
            "After-hours access",
            Severity::Low,
            RuleKind::TimeBased(TimeBasedConditions {
                allowed_hours: (6..=22).collect(),
                utc_offset_minutes: 0,
                categories: vec![EventCategory::Authentication, EventCategory::DataAccess],
            }),
        )
        .with_description("Authentication or data access outside 06:00-22:59")
        .with_category("access_control"),
    ]
}
