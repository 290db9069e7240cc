//! In-memory indexes shared by the store backends
//!
//! Two orderings are kept alongside the primary map: a global time index
//! and a `(category, user_id)` index. Window counts walk only the slice of
//! the narrowest index that falls inside the requested time range.

use crate::types::{AuditEvent, EventCategory, EventFilter, EventId, TimeRange};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::ops::Bound;

type TimeKey = (DateTime<Utc>, EventId);

/// Indexed set of audit events
#[derive(Debug, Default)]
pub struct EventIndex {
    events: HashMap<EventId, AuditEvent>,
    by_time: BTreeSet<TimeKey>,
    by_category_user: HashMap<(EventCategory, Option<String>), BTreeSet<TimeKey>>,
}

impl EventIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event; returns false if its id is already present
    pub fn insert(&mut self, event: AuditEvent) -> bool {
        if self.events.contains_key(&event.id) {
            return false;
        }
        let key = (event.timestamp, event.id.clone());
        self.by_time.insert(key.clone());
        self.by_category_user
            .entry((event.category, event.user_id.clone()))
            .or_default()
            .insert(key);
        self.events.insert(event.id.clone(), event);
        true
    }

    pub fn contains(&self, id: &str) -> bool {
        self.events.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&AuditEvent> {
        self.events.get(id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Matching events, most recent first
    pub fn query(&self, filter: &EventFilter, limit: usize) -> Vec<AuditEvent> {
        self.candidates(filter).take(limit).cloned().collect()
    }

    pub fn count(&self, filter: &EventFilter) -> u64 {
        self.candidates(filter).count() as u64
    }

    pub fn distinct_resources(&self, filter: &EventFilter) -> u64 {
        self.candidates(filter)
            .filter_map(|e| e.resource.as_deref())
            .collect::<HashSet<_>>()
            .len() as u64
    }

    /// All events in chronological order
    pub fn chronological(&self) -> impl Iterator<Item = &AuditEvent> + '_ {
        self.by_time.iter().filter_map(|(_, id)| self.events.get(id))
    }

    /// Remove every event strictly older than `cutoff`
    pub fn remove_before(&mut self, cutoff: DateTime<Utc>) -> usize {
        let expired: Vec<TimeKey> = self
            .by_time
            .range(..(cutoff, EventId::new()))
            .cloned()
            .collect();

        for key in &expired {
            self.by_time.remove(key);
            if let Some(event) = self.events.remove(&key.1) {
                let index_key = (event.category, event.user_id);
                if let Some(set) = self.by_category_user.get_mut(&index_key) {
                    set.remove(key);
                    if set.is_empty() {
                        self.by_category_user.remove(&index_key);
                    }
                }
            }
        }
        expired.len()
    }

    fn candidates<'a>(
        &'a self,
        filter: &'a EventFilter,
    ) -> Box<dyn Iterator<Item = &'a AuditEvent> + 'a> {
        let ordering = match (filter.category, &filter.user_id) {
            (Some(category), Some(user)) => {
                match self.by_category_user.get(&(category, Some(user.clone()))) {
                    Some(set) => set,
                    None => return Box::new(std::iter::empty()),
                }
            }
            _ => &self.by_time,
        };

        Box::new(
            ordering
                .range(time_bounds(filter.time_range.as_ref()))
                .rev()
                .filter_map(move |(_, id)| self.events.get(id))
                .filter(move |e| filter.matches(e)),
        )
    }
}

fn time_bounds(range: Option<&TimeRange>) -> (Bound<TimeKey>, Bound<TimeKey>) {
    match range {
        Some(r) => (
            Bound::Included((r.start, EventId::new())),
            // Ids sort after the empty string, so step past `end` to keep it inclusive.
            Bound::Excluded((r.end + Duration::nanoseconds(1), EventId::new())),
        ),
        None => (Bound::Unbounded, Bound::Unbounded),
    }
}
