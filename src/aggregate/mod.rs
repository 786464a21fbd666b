//! The extract → aggregate → validate → persist cycle shared by the event,
//! todo, knowledge and activity aggregators. Each tier reproduces the same
//! nine-step loop over its own source table; this module holds the pieces
//! they all lean on: the uniform candidate shape, index normalization, span
//! resolution and cycle counters.

pub mod activities;
pub mod events;
pub mod knowledge;
pub mod scheduler;
pub mod todos;

pub use activities::ActivityAggregator;
pub use events::EventAggregator;
pub use knowledge::KnowledgeAggregator;
pub use scheduler::AggregatorRunner;
pub use todos::TodoAggregator;

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::{Action, Event};

/// Uniform view of a lower-tier record as the prompt builder and index
/// resolver see it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Action> for SourceRecord {
    fn from(action: &Action) -> Self {
        Self {
            id: action.id.clone(),
            title: action.title.clone(),
            description: action.description.clone(),
            timestamp: action.start_time,
        }
    }
}

impl From<&Event> for SourceRecord {
    fn from(event: &Event) -> Self {
        Self {
            id: event.id.clone(),
            title: event.title.clone(),
            description: event.description.clone(),
            timestamp: event.start_time,
        }
    }
}

/// What one cycle did; feeds the stats counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct CycleOutcome {
    pub created: usize,
    pub sources_consumed: usize,
}

/// Health counters per aggregator; shared with the host via snapshots.
#[derive(Default)]
pub struct AggregatorStats {
    cycles: AtomicU64,
    created: AtomicU64,
    sources_consumed: AtomicU64,
    failed_cycles: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsSnapshot {
    pub cycles: u64,
    pub created: u64,
    pub sources_consumed: u64,
    pub failed_cycles: u64,
}

impl AggregatorStats {
    pub fn record_cycle(&self, outcome: &CycleOutcome) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.created
            .fetch_add(outcome.created as u64, Ordering::Relaxed);
        self.sources_consumed
            .fetch_add(outcome.sources_consumed as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.cycles.fetch_add(1, Ordering::Relaxed);
        self.failed_cycles.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            created: self.created.load(Ordering::Relaxed),
            sources_consumed: self.sources_consumed.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
        }
    }
}

/// Normalizes an untrusted source-reference value into clean 1-based indices.
/// Accepts a single value or a list, integers or numeric strings; anything
/// outside `1..=candidate_count` is dropped; duplicates collapse; output is
/// ascending. An empty result means the item has no usable provenance.
pub fn normalize_indices(value: &Value, candidate_count: usize) -> Vec<usize> {
    let raw: Vec<&Value> = match value {
        Value::Array(items) => items.iter().collect(),
        Value::Null => Vec::new(),
        other => vec![other],
    };

    let mut indices: Vec<usize> = raw
        .into_iter()
        .filter_map(coerce_index)
        .filter(|&index| index >= 1 && index <= candidate_count)
        .collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

fn coerce_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(number) => number.as_u64().map(|n| n as usize),
        Value::String(raw) => raw.trim().parse::<usize>().ok(),
        _ => None,
    }
}

/// Maps normalized 1-based indices back to their candidate records.
pub fn resolve_group<'a>(indices: &[usize], candidates: &'a [SourceRecord]) -> Vec<&'a SourceRecord> {
    indices
        .iter()
        .filter_map(|&index| candidates.get(index - 1))
        .collect()
}

/// Min/max timestamps over a resolved group. The group should never be empty
/// after index normalization, but an empty one degrades to `now()` rather
/// than crashing.
pub fn resolve_span(group: &[&SourceRecord]) -> (DateTime<Utc>, DateTime<Utc>) {
    let mut timestamps = group.iter().map(|record| record.timestamp);
    let Some(first) = timestamps.next() else {
        let now = Utc::now();
        return (now, now);
    };

    let (mut start, mut end) = (first, first);
    for timestamp in timestamps {
        start = start.min(timestamp);
        end = end.max(timestamp);
    }
    (start, end)
}

/// 1-based numbered listing fed to the aggregation prompts.
pub fn build_indexed_list(candidates: &[SourceRecord]) -> String {
    let mut listing = String::new();
    for (position, record) in candidates.iter().enumerate() {
        listing.push_str(&format!(
            "{}. [{}] {}: {}\n",
            position + 1,
            record.timestamp.to_rfc3339(),
            record.title,
            record.description
        ));
    }
    listing
}

pub(crate) fn string_field(item: &Value, key: &str) -> Option<String> {
    item.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

pub(crate) fn string_list_field(item: &Value, key: &str) -> Vec<String> {
    item.get(key)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn candidate(id: &str, hour: u32) -> SourceRecord {
        SourceRecord {
            id: id.into(),
            title: format!("title {id}"),
            description: format!("description {id}"),
            timestamp: Utc.with_ymd_and_hms(2026, 8, 26, hour, 0, 0).unwrap(),
        }
    }

    #[test]
    fn normalization_drops_out_of_range_collapses_duplicates_coerces_strings() {
        let value = json!([0, 1, 1, 99, "2"]);
        assert_eq!(normalize_indices(&value, 3), vec![1, 2]);
    }

    #[test]
    fn normalization_accepts_a_single_scalar() {
        assert_eq!(normalize_indices(&json!(2), 3), vec![2]);
        assert_eq!(normalize_indices(&json!("3"), 3), vec![3]);
    }

    #[test]
    fn normalization_rejects_garbage() {
        assert!(normalize_indices(&json!(null), 3).is_empty());
        assert!(normalize_indices(&json!("three"), 3).is_empty());
        assert!(normalize_indices(&json!([-1, 0, 4]), 3).is_empty());
        assert!(normalize_indices(&json!({"index": 1}), 3).is_empty());
    }

    #[test]
    fn span_covers_min_and_max_of_resolved_group() {
        let candidates = vec![candidate("a", 9), candidate("b", 11), candidate("c", 14)];
        let group = resolve_group(&[1, 3], &candidates);

        let (start, end) = resolve_span(&group);
        assert_eq!(start, candidates[0].timestamp);
        assert_eq!(end, candidates[2].timestamp);
    }

    #[test]
    fn empty_group_degrades_to_now_without_panic() {
        let (start, end) = resolve_span(&[]);
        assert!(end >= start);
    }

    #[test]
    fn indexed_list_is_one_based() {
        let candidates = vec![candidate("a", 9), candidate("b", 10)];
        let listing = build_indexed_list(&candidates);
        assert!(listing.starts_with("1. "));
        assert!(listing.contains("\n2. "));
        assert!(listing.contains("title a"));
    }
}
