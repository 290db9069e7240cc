//! Per-kind evaluators
//!
//! Each evaluator looks only at the triggering event plus aggregate
//! lookups on the store; windows end at the event's own timestamp, so the
//! event itself is part of the count. `Ok(Some(description))` means the
//! rule fired, `Ok(None)` that it passed or does not apply.

use super::{
    DataAccessConditions, FailedAttemptsConditions, FrequencyConditions,
    PrivilegedAccessConditions, RuleKind, TimeBasedConditions,
};
use crate::error::Result;
use crate::store::EventStore;
use crate::types::{AuditEvent, EventCategory, EventFilter, TimeRange};
use chrono::{Duration, FixedOffset, Timelike};

/// Evaluate one rule kind against one durably stored event
pub async fn evaluate_rule(
    kind: &RuleKind,
    event: &AuditEvent,
    store: &dyn EventStore,
) -> Result<Option<String>> {
    match kind {
        RuleKind::Frequency(c) => frequency(c, event, store).await,
        RuleKind::FailedAttempts(c) => failed_attempts(c, event, store).await,
        RuleKind::PrivilegedAccess(c) => Ok(privileged_access(c, event)),
        RuleKind::DataAccessPattern(c) => data_access_pattern(c, event, store).await,
        RuleKind::TimeBased(c) => Ok(time_based(c, event)),
    }
}

async fn frequency(
    c: &FrequencyConditions,
    event: &AuditEvent,
    store: &dyn EventStore,
) -> Result<Option<String>> {
    if event.category != c.category {
        return Ok(None);
    }
    let Some(user) = event.user_id.as_deref() else {
        return Ok(None);
    };

    let filter = EventFilter::default()
        .category(c.category)
        .user(user)
        .within(window(event, c.time_window_minutes));
    let count = store.count_matching(&filter).await?;

    Ok((count > c.max_count).then(|| {
        format!(
            "{} {} events by '{}' within {} minutes (limit {})",
            count, c.category, user, c.time_window_minutes, c.max_count
        )
    }))
}

async fn failed_attempts(
    c: &FailedAttemptsConditions,
    event: &AuditEvent,
    store: &dyn EventStore,
) -> Result<Option<String>> {
    if event.category != EventCategory::Authentication || event.success {
        return Ok(None);
    }
    let Some(user) = event.user_id.as_deref() else {
        return Ok(None);
    };

    let filter = EventFilter::default()
        .category(EventCategory::Authentication)
        .user(user)
        .success(false)
        .within(window(event, c.time_window_minutes));
    let failures = store.count_matching(&filter).await?;

    Ok((failures > c.max_failures).then(|| {
        format!(
            "{} failed authentications for '{}' within {} minutes (limit {})",
            failures, user, c.time_window_minutes, c.max_failures
        )
    }))
}

fn privileged_access(c: &PrivilegedAccessConditions, event: &AuditEvent) -> Option<String> {
    if !c.privileged_actions.iter().any(|a| *a == event.action) {
        return None;
    }
    let roles = event.roles();
    if roles.iter().any(|r| c.authorized_roles.contains(r)) {
        return None;
    }
    Some(format!(
        "Privileged action '{}' by '{}' without an authorized role (has: [{}])",
        event.action,
        event.user_id.as_deref().unwrap_or("unknown"),
        roles.join(", ")
    ))
}

async fn data_access_pattern(
    c: &DataAccessConditions,
    event: &AuditEvent,
    store: &dyn EventStore,
) -> Result<Option<String>> {
    if event.category != EventCategory::DataAccess {
        return Ok(None);
    }
    let Some(resource) = event.resource.as_deref() else {
        return Ok(None);
    };
    if !c.sensitive_resources.iter().any(|s| resource.starts_with(s.as_str())) {
        return Ok(None);
    }
    let Some(user) = event.user_id.as_deref() else {
        return Ok(None);
    };

    let filter = EventFilter::default()
        .category(EventCategory::DataAccess)
        .user(user)
        .within(window(event, 60));
    let distinct = store.distinct_resources(&filter).await?;

    Ok((distinct > c.max_resources_per_hour).then(|| {
        format!(
            "'{}' accessed {} distinct resources within an hour (limit {})",
            user, distinct, c.max_resources_per_hour
        )
    }))
}

fn time_based(c: &TimeBasedConditions, event: &AuditEvent) -> Option<String> {
    if !c.categories.is_empty() && !c.categories.contains(&event.category) {
        return None;
    }
    // Offsets are validated on rule load; fall back to UTC regardless.
    let hour = c
        .utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .map(|offset| event.timestamp.with_timezone(&offset).hour())
        .unwrap_or_else(|| event.timestamp.hour());
    if c.allowed_hours.contains(&hour) {
        return None;
    }
    Some(format!(
        "'{}' at local hour {:02} is outside allowed hours",
        event.action, hour
    ))
}

fn window(event: &AuditEvent, minutes: u32) -> TimeRange {
    TimeRange::ending_at(event.timestamp, Duration::minutes(i64::from(minutes)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryEventStore;
    use crate::types::{EventLevel, NewEvent};
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, h, m, 0).unwrap()
    }

    #[test]
    fn test_privileged_access_roles() {
        let c = PrivilegedAccessConditions {
            privileged_actions: vec!["delete_user".to_string()],
            authorized_roles: vec!["admin".to_string()],
        };
        let base = NewEvent::new(EventLevel::Info, EventCategory::Authorization, "delete_user")
            .user("bob");

        let no_role = base.clone().into_event(HashMap::new());
        assert!(privileged_access(&c, &no_role).is_some());

        let wrong_role = base
            .clone()
            .detail("roles", serde_json::json!(["viewer"]))
            .into_event(HashMap::new());
        assert!(privileged_access(&c, &wrong_role).is_some());

        let admin = base
            .detail("roles", serde_json::json!(["viewer", "admin"]))
            .into_event(HashMap::new());
        assert!(privileged_access(&c, &admin).is_none());

        let harmless = NewEvent::new(EventLevel::Info, EventCategory::Authorization, "read")
            .user("bob")
            .into_event(HashMap::new());
        assert!(privileged_access(&c, &harmless).is_none());
    }

    #[test]
    fn test_time_based_with_offset() {
        let c = TimeBasedConditions {
            allowed_hours: (9..=17).collect(),
            utc_offset_minutes: 120,
            categories: vec![],
        };
        // 08:00 UTC is 10:00 at +02:00
        let morning = NewEvent::new(EventLevel::Info, EventCategory::UserAction, "edit")
            .at(at(8, 0))
            .into_event(HashMap::new());
        assert!(time_based(&c, &morning).is_none());

        // 20:00 UTC is 22:00 at +02:00
        let night = NewEvent::new(EventLevel::Info, EventCategory::UserAction, "edit")
            .at(at(20, 0))
            .into_event(HashMap::new());
        assert!(time_based(&c, &night).is_some());
    }

    #[test]
    fn test_time_based_out_of_range_offset_uses_utc() {
        let c = TimeBasedConditions {
            allowed_hours: vec![3],
            utc_offset_minutes: i32::MAX,
            categories: vec![],
        };
        let event = NewEvent::new(EventLevel::Info, EventCategory::UserAction, "edit")
            .at(at(3, 0))
            .into_event(HashMap::new());
        assert!(time_based(&c, &event).is_none());
    }

    #[test]
    fn test_time_based_category_scope() {
        let c = TimeBasedConditions {
            allowed_hours: vec![12],
            utc_offset_minutes: 0,
            categories: vec![EventCategory::Authentication],
        };
        let system = NewEvent::new(EventLevel::Info, EventCategory::SystemOperation, "backup")
            .at(at(3, 0))
            .into_event(HashMap::new());
        assert!(time_based(&c, &system).is_none());
    }

    #[tokio::test]
    async fn test_data_access_counts_distinct_resources() {
        let store = MemoryEventStore::new();
        let c = DataAccessConditions {
            sensitive_resources: vec!["financial_data".to_string()],
            max_resources_per_hour: 2,
        };

        let mut events = Vec::new();
        for (i, table) in ["financial_data/a", "financial_data/b", "financial_data/a", "financial_data/c"]
            .iter()
            .enumerate()
        {
            events.push(
                NewEvent::new(EventLevel::Info, EventCategory::DataAccess, "read")
                    .user("carol")
                    .resource(*table)
                    .at(at(10, i as u32))
                    .into_event(HashMap::new()),
            );
        }

        store.append_batch(&events[..3]).await.unwrap();
        let kind = RuleKind::DataAccessPattern(c);
        assert!(evaluate_rule(&kind, &events[2], &store).await.unwrap().is_none());

        store.append_batch(&events[3..]).await.unwrap();
        assert!(evaluate_rule(&kind, &events[3], &store).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_frequency_ignores_other_users() {
        let store = MemoryEventStore::new();
        let kind = RuleKind::Frequency(FrequencyConditions {
            category: EventCategory::ApiCall,
            max_count: 2,
            time_window_minutes: 60,
        });

        let mut last = None;
        for i in 0..3 {
            for user in ["alice", "bob"] {
                let e = NewEvent::new(EventLevel::Info, EventCategory::ApiCall, "GET /x")
                    .user(user)
                    .at(at(11, i))
                    .into_event(HashMap::new());
                store.append(&e).await.unwrap();
                last = Some(e);
            }
        }
        let bob_third = last.unwrap();
        assert!(evaluate_rule(&kind, &bob_third, &store).await.unwrap().is_some());

        let anonymous = NewEvent::new(EventLevel::Info, EventCategory::ApiCall, "GET /x")
            .at(at(11, 5))
            .into_event(HashMap::new());
        assert!(evaluate_rule(&kind, &anonymous, &store).await.unwrap().is_none());
    }
}
