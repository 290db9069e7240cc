//! Read-side aggregation over events, violations, and incidents
//!
//! Nothing here mutates state. Empty history yields zeroed structures;
//! a store failure is returned as an error, never as a report that looks
//! like "no activity".

use crate::error::Result;
use crate::incident::IncidentManager;
use crate::rules::{RuleEngine, ViolationFilter};
use crate::store::EventStore;
use crate::types::{AuditEvent, EventCategory, EventFilter, EventLevel, Severity, TimeRange};
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Aggregate numbers for one slice of events
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityStats {
    pub count: u64,
    /// Mean of the events that reported a duration; 0 when none did
    pub avg_duration_ms: f64,
    /// Fraction of successful events, 0 when there are none
    pub success_rate: f64,
    pub unique_users: u64,
    pub unique_sessions: u64,
}

#[derive(Default)]
struct Accumulator<'a> {
    count: u64,
    successes: u64,
    duration_sum: u64,
    durations: u64,
    users: HashSet<&'a str>,
    sessions: HashSet<&'a str>,
}

impl<'a> Accumulator<'a> {
    fn add(&mut self, event: &'a AuditEvent) {
        self.count += 1;
        if event.success {
            self.successes += 1;
        }
        if let Some(ms) = event.duration_ms {
            self.duration_sum += ms;
            self.durations += 1;
        }
        if let Some(user) = event.user_id.as_deref() {
            self.users.insert(user);
        }
        if let Some(session) = event.session_id.as_deref() {
            self.sessions.insert(session);
        }
    }

    fn finish(self) -> ActivityStats {
        ActivityStats {
            count: self.count,
            avg_duration_ms: if self.durations == 0 {
                0.0
            } else {
                self.duration_sum as f64 / self.durations as f64
            },
            success_rate: if self.count == 0 {
                0.0
            } else {
                self.successes as f64 / self.count as f64
            },
            unique_users: self.users.len() as u64,
            unique_sessions: self.sessions.len() as u64,
        }
    }
}

/// One UTC day of activity
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyStatistics {
    pub date: NaiveDate,
    pub totals: ActivityStats,
    pub by_category: BTreeMap<EventCategory, ActivityStats>,
    pub by_level: BTreeMap<EventLevel, ActivityStats>,
    pub violations_by_severity: BTreeMap<Severity, u64>,
    pub incidents_by_severity: BTreeMap<Severity, u64>,
}

/// What one user did over the last few days
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserActivitySummary {
    pub user_id: String,
    pub days: u32,
    pub total_events: u64,
    pub activity_by_category: BTreeMap<EventCategory, u64>,
    pub recent_failures_by_action: BTreeMap<String, u64>,
    pub violations_by_severity: BTreeMap<Severity, u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Reports built on demand from the store, rule engine, and incidents
pub struct Analytics {
    store: Arc<dyn EventStore>,
    engine: Arc<RuleEngine>,
    incidents: Arc<IncidentManager>,
}

impl Analytics {
    pub fn new(
        store: Arc<dyn EventStore>,
        engine: Arc<RuleEngine>,
        incidents: Arc<IncidentManager>,
    ) -> Self {
        Self {
            store,
            engine,
            incidents,
        }
    }

    /// Statistics for the UTC day `date`
    pub async fn daily_statistics(&self, date: NaiveDate) -> Result<DailyStatistics> {
        let start = Utc.from_utc_datetime(&date.and_time(NaiveTime::default()));
        let end = start
            .checked_add_signed(Duration::days(1))
            .map_or(DateTime::<Utc>::MAX_UTC, |next| next - Duration::nanoseconds(1));
        let range = TimeRange::new(start, end);
        let filter = EventFilter::default().within(range);

        let (events, violations, incidents) = futures::join!(
            self.store.query(&filter, usize::MAX),
            self.engine.violation_counts(&range),
            self.incidents.incident_counts(&range),
        );
        let events = events?;

        let mut totals = Accumulator::default();
        let mut by_category: BTreeMap<EventCategory, Accumulator> = BTreeMap::new();
        let mut by_level: BTreeMap<EventLevel, Accumulator> = BTreeMap::new();
        for event in &events {
            totals.add(event);
            by_category.entry(event.category).or_default().add(event);
            by_level.entry(event.level).or_default().add(event);
        }

        tracing::debug!(date = %date, events = events.len(), "Daily statistics computed");
        Ok(DailyStatistics {
            date,
            totals: totals.finish(),
            by_category: by_category.into_iter().map(|(k, a)| (k, a.finish())).collect(),
            by_level: by_level.into_iter().map(|(k, a)| (k, a.finish())).collect(),
            violations_by_severity: sorted(violations),
            incidents_by_severity: sorted(incidents),
        })
    }

    /// Summary of `user_id`'s activity over the last `days` days
    pub async fn user_activity_summary(&self, user_id: &str, days: u32) -> Result<UserActivitySummary> {
        self.user_activity_summary_at(user_id, days, Utc::now()).await
    }

    /// Same as `user_activity_summary`, with the window ending at `as_of`
    pub async fn user_activity_summary_at(
        &self,
        user_id: &str,
        days: u32,
        as_of: DateTime<Utc>,
    ) -> Result<UserActivitySummary> {
        let range = TimeRange::ending_at(as_of, Duration::days(i64::from(days)));
        let events = self
            .store
            .query(&EventFilter::default().user(user_id).within(range), usize::MAX)
            .await?;

        let mut activity_by_category = BTreeMap::new();
        let mut recent_failures_by_action = BTreeMap::new();
        for event in &events {
            *activity_by_category.entry(event.category).or_insert(0) += 1;
            if !event.success {
                *recent_failures_by_action.entry(event.action.clone()).or_insert(0) += 1;
            }
        }

        let mut violations_by_severity = BTreeMap::new();
        for v in self
            .engine
            .violations(&ViolationFilter::default().user(user_id).within(range))
            .await
        {
            *violations_by_severity.entry(v.severity).or_insert(0) += 1;
        }

        Ok(UserActivitySummary {
            user_id: user_id.to_string(),
            days,
            total_events: events.len() as u64,
            activity_by_category,
            recent_failures_by_action,
            violations_by_severity,
            // query returns newest first
            first_seen: events.last().map(|e| e.timestamp),
            last_seen: events.first().map(|e| e.timestamp),
        })
    }

    /// Write matching events to `out` as JSON lines, oldest first.
    ///
    /// Returns the number of events written.
    pub async fn export_events<W>(&self, filter: &EventFilter, out: &mut W) -> Result<usize>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let events = self.store.query(filter, usize::MAX).await?;
        for event in events.iter().rev() {
            let mut line = serde_json::to_vec(event)?;
            line.push(b'\n');
            out.write_all(&line).await?;
        }
        out.flush().await?;
        tracing::info!(events = events.len(), "Audit events exported");
        Ok(events.len())
    }
}

fn sorted(counts: HashMap<Severity, u64>) -> BTreeMap<Severity, u64> {
    counts.into_iter().collect()
}
