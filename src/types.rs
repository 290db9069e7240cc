//! Core audit types
//!
//! All structs use camelCase JSON serialization for wire compatibility;
//! enum values are snake_case.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;

/// Level of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLevel {
    Info,
    Warning,
    Error,
    Critical,
    Security,
}

impl EventLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventLevel::Info => "info",
            EventLevel::Warning => "warning",
            EventLevel::Error => "error",
            EventLevel::Critical => "critical",
            EventLevel::Security => "security",
        }
    }
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Category of an audit event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    Authentication,
    Authorization,
    DataAccess,
    SystemOperation,
    UserAction,
    ApiCall,
    SecurityEvent,
    Compliance,
    Performance,
    Error,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Authentication => "authentication",
            EventCategory::Authorization => "authorization",
            EventCategory::DataAccess => "data_access",
            EventCategory::SystemOperation => "system_operation",
            EventCategory::UserAction => "user_action",
            EventCategory::ApiCall => "api_call",
            EventCategory::SecurityEvent => "security_event",
            EventCategory::Compliance => "compliance",
            EventCategory::Performance => "performance",
            EventCategory::Error => "error",
        }
    }
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity shared by rules, violations, and incidents
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of a persisted audit event (`evt-<uuid>`)
pub type EventId = String;

/// An immutable fact about something that happened
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    /// Deterministic id derived from timestamp, action, and actor
    pub id: EventId,

    /// Occurrence time (UTC)
    pub timestamp: DateTime<Utc>,

    pub level: EventLevel,

    pub category: EventCategory,

    /// Free-form operation name (e.g. "login_attempt", "GET /resource")
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,

    /// Action-specific context
    #[serde(default)]
    pub details: HashMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,

    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Forensic snapshot captured at emission time
    #[serde(default)]
    pub system_info: HashMap<String, String>,
}

impl AuditEvent {
    /// Derive the stable id for an event.
    ///
    /// Two submissions with the same timestamp, action, and actor share an
    /// id, which is what lets the store detect duplicate writes.
    pub fn derive_id(timestamp: &DateTime<Utc>, action: &str, actor: Option<&str>) -> EventId {
        let name = format!(
            "{}|{}|{}",
            timestamp.timestamp_nanos_opt().unwrap_or_else(|| timestamp.timestamp_micros()),
            action,
            actor.unwrap_or("system"),
        );
        format!(
            "evt-{}",
            uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes())
        )
    }

    /// Roles carried in `details.roles` (array) or `details.role` (string)
    pub fn roles(&self) -> Vec<String> {
        let mut roles = Vec::new();
        if let Some(serde_json::Value::Array(items)) = self.details.get("roles") {
            roles.extend(items.iter().filter_map(|v| v.as_str().map(String::from)));
        }
        if let Some(role) = self.details.get("role").and_then(|v| v.as_str()) {
            roles.push(role.to_string());
        }
        roles
    }
}

/// Correlation and provenance identifiers supplied by a producer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl EventContext {
    /// Context for a known user
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_user_agent(mut self, agent: impl Into<String>) -> Self {
        self.user_agent = Some(agent.into());
        self
    }
}

/// An event as submitted by a producer, before id and snapshot are attached
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub level: EventLevel,
    pub category: EventCategory,
    pub action: String,
    pub context: EventContext,
    pub resource: Option<String>,
    pub details: HashMap<String, serde_json::Value>,
    pub success: bool,
    pub duration_ms: Option<u64>,
    /// Overrides the occurrence time; defaults to enqueue time
    pub timestamp: Option<DateTime<Utc>>,
}

impl NewEvent {
    pub fn new(level: EventLevel, category: EventCategory, action: impl Into<String>) -> Self {
        Self {
            level,
            category,
            action: action.into(),
            context: EventContext::default(),
            resource: None,
            details: HashMap::new(),
            success: true,
            duration_ms: None,
            timestamp: None,
        }
    }

    pub fn context(mut self, context: EventContext) -> Self {
        self.context = context;
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.context.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.context.session_id = Some(session_id.into());
        self
    }

    pub fn ip(mut self, ip: impl Into<String>) -> Self {
        self.context.ip_address = Some(ip.into());
        self
    }

    pub fn resource(mut self, resource: impl Into<String>) -> Self {
        self.resource = Some(resource.into());
        self
    }

    pub fn detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    pub fn details(mut self, details: HashMap<String, serde_json::Value>) -> Self {
        self.details.extend(details);
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = success;
        self
    }

    pub fn duration_ms(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Seal into an immutable `AuditEvent`
    pub fn into_event(self, system_info: HashMap<String, String>) -> AuditEvent {
        let timestamp = self.timestamp.unwrap_or_else(Utc::now);
        let id = AuditEvent::derive_id(&timestamp, &self.action, self.context.user_id.as_deref());
        AuditEvent {
            id,
            timestamp,
            level: self.level,
            category: self.category,
            action: self.action,
            user_id: self.context.user_id,
            session_id: self.context.session_id,
            resource: self.resource,
            details: self.details,
            ip_address: self.context.ip_address,
            user_agent: self.context.user_agent,
            success: self.success,
            duration_ms: self.duration_ms,
            system_info,
        }
    }
}

/// Inclusive time range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    /// The window of `length` ending at (and including) `end`
    ///
    /// A window reaching past the earliest representable instant starts there.
    pub fn ending_at(end: DateTime<Utc>, length: Duration) -> Self {
        Self {
            start: end
                .checked_sub_signed(length)
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
            end,
        }
    }

    pub fn contains(&self, t: &DateTime<Utc>) -> bool {
        *t >= self.start && *t <= self.end
    }
}

/// Filter for querying and counting stored events
///
/// Every `Some` field must match; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventFilter {
    pub category: Option<EventCategory>,
    pub level: Option<EventLevel>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub success: Option<bool>,
    pub action: Option<String>,
    pub resource: Option<String>,
    pub time_range: Option<TimeRange>,
}

impl EventFilter {
    pub fn category(mut self, category: EventCategory) -> Self {
        self.category = Some(category);
        self
    }

    pub fn level(mut self, level: EventLevel) -> Self {
        self.level = Some(level);
        self
    }

    pub fn user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.success = Some(success);
        self
    }

    pub fn within(mut self, range: TimeRange) -> Self {
        self.time_range = Some(range);
        self
    }

    /// Check if an event matches this filter
    pub fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(category) = self.category {
            if event.category != category {
                return false;
            }
        }
        if let Some(level) = self.level {
            if event.level != level {
                return false;
            }
        }
        if let Some(ref user) = self.user_id {
            if event.user_id.as_deref() != Some(user.as_str()) {
                return false;
            }
        }
        if let Some(ref session) = self.session_id {
            if event.session_id.as_deref() != Some(session.as_str()) {
                return false;
            }
        }
        if let Some(success) = self.success {
            if event.success != success {
                return false;
            }
        }
        if let Some(ref action) = self.action {
            if event.action != *action {
                return false;
            }
        }
        if let Some(ref resource) = self.resource {
            if event.resource.as_deref() != Some(resource.as_str()) {
                return false;
            }
        }
        if let Some(ref range) = self.time_range {
            if !range.contains(&event.timestamp) {
                return false;
            }
        }
        true
    }
}

/// Forensic snapshot of the emitting process
pub fn system_snapshot(queue_depth: usize) -> HashMap<String, String> {
    static HOSTNAME: OnceLock<String> = OnceLock::new();
    let host = HOSTNAME.get_or_init(|| {
        hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string())
    });

    let mut info = HashMap::with_capacity(5);
    info.insert("pid".to_string(), std::process::id().to_string());
    info.insert("hostname".to_string(), host.clone());
    info.insert("os".to_string(), std::env::consts::OS.to_string());
    info.insert("arch".to_string(), std::env::consts::ARCH.to_string());
    info.insert("queueDepth".to_string(), queue_depth.to_string());
    info
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, h, m, 0).unwrap()
    }

    #[test]
    fn test_event_id_is_deterministic() {
        let a = AuditEvent::derive_id(&ts(10, 0), "login_attempt", Some("alice"));
        let b = AuditEvent::derive_id(&ts(10, 0), "login_attempt", Some("alice"));
        let c = AuditEvent::derive_id(&ts(10, 0), "login_attempt", Some("bob"));
        let d = AuditEvent::derive_id(&ts(10, 1), "login_attempt", Some("alice"));

        assert!(a.starts_with("evt-"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
    }

    #[test]
    fn test_new_event_builder() {
        let event = NewEvent::new(EventLevel::Info, EventCategory::DataAccess, "read")
            .user("alice")
            .session("s-1")
            .resource("customers")
            .detail("rows", serde_json::json!(42))
            .duration_ms(12)
            .at(ts(9, 30))
            .into_event(HashMap::new());

        assert_eq!(event.user_id.as_deref(), Some("alice"));
        assert_eq!(event.session_id.as_deref(), Some("s-1"));
        assert_eq!(event.resource.as_deref(), Some("customers"));
        assert_eq!(event.details["rows"], 42);
        assert_eq!(event.duration_ms, Some(12));
        assert_eq!(event.timestamp, ts(9, 30));
        assert!(event.success);
        assert_eq!(
            event.id,
            AuditEvent::derive_id(&ts(9, 30), "read", Some("alice"))
        );
    }

    #[test]
    fn test_event_serialization_shape() {
        let event = NewEvent::new(EventLevel::Security, EventCategory::Authentication, "login")
            .user("alice")
            .success(false)
            .at(ts(3, 0))
            .into_event(HashMap::new());

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"userId\":\"alice\""));
        assert!(json.contains("\"level\":\"security\""));
        assert!(json.contains("\"category\":\"authentication\""));
        assert!(!json.contains("sessionId"));

        let parsed: AuditEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, event);
    }

    #[test]
    fn test_roles_from_details() {
        let event = NewEvent::new(EventLevel::Info, EventCategory::Authorization, "drop_table")
            .detail("roles", serde_json::json!(["dba", "ops"]))
            .detail("role", serde_json::json!("admin"))
            .into_event(HashMap::new());

        assert_eq!(event.roles(), vec!["dba", "ops", "admin"]);
    }

    #[test]
    fn test_filter_matches() {
        let event = NewEvent::new(EventLevel::Warning, EventCategory::ApiCall, "GET /x")
            .user("alice")
            .session("s1")
            .success(false)
            .at(ts(12, 0))
            .into_event(HashMap::new());

        assert!(EventFilter::default().matches(&event));
        assert!(EventFilter::default()
            .category(EventCategory::ApiCall)
            .user("alice")
            .success(false)
            .matches(&event));
        assert!(!EventFilter::default().user("bob").matches(&event));
        assert!(!EventFilter::default().level(EventLevel::Info).matches(&event));
        assert!(EventFilter::default()
            .within(TimeRange::ending_at(ts(12, 30), Duration::minutes(30)))
            .matches(&event));
        assert!(!EventFilter::default()
            .within(TimeRange::ending_at(ts(11, 59), Duration::minutes(30)))
            .matches(&event));
    }

    #[test]
    fn test_time_range_saturates_at_earliest_instant() {
        let range = TimeRange::ending_at(ts(12, 0), Duration::days(200_000_000));
        assert_eq!(range.start, DateTime::<Utc>::MIN_UTC);
        assert!(range.contains(&ts(0, 0)));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::default(), Severity::Medium);
    }

    #[test]
    fn test_system_snapshot_fields() {
        let info = system_snapshot(7);
        assert_eq!(info["pid"], std::process::id().to_string());
        assert_eq!(info["queueDepth"], "7");
        assert!(info.contains_key("hostname"));
        assert!(info.contains_key("os"));
    }
}
