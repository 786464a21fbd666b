use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use log::{info, warn};
use serde_json::Value;

use crate::db::Database;
use crate::llm::{parse_json_reply, ChatMessage, ChatRequest, LlmClient};
use crate::models::Event;
use crate::notify::{ChangeNotifier, EntityKind, RecordChange};
use crate::prompts;
use crate::settings::SettingsStore;
use crate::supervise::{review_records, QualityGate};

use super::{
    build_indexed_list, normalize_indices, resolve_group, resolve_span, string_field,
    AggregatorStats, CycleOutcome, SourceRecord,
};

/// Groups not-yet-aggregated actions from the recent window into events.
pub struct EventAggregator {
    db: Database,
    llm: Arc<dyn LlmClient>,
    settings: Arc<SettingsStore>,
    gate: Arc<dyn QualityGate>,
    notifier: Arc<dyn ChangeNotifier>,
    pub stats: Arc<AggregatorStats>,
}

impl EventAggregator {
    pub fn new(
        db: Database,
        llm: Arc<dyn LlmClient>,
        settings: Arc<SettingsStore>,
        gate: Arc<dyn QualityGate>,
        notifier: Arc<dyn ChangeNotifier>,
    ) -> Self {
        Self {
            db,
            llm,
            settings,
            gate,
            notifier,
            stats: Arc::new(AggregatorStats::default()),
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleOutcome> {
        let window_secs = self.settings.snapshot().events.window_secs;
        let now = Utc::now();
        let window_start = now - Duration::seconds(window_secs as i64);

        let actions = self.db.get_actions_in_timeframe(window_start, now).await?;
        let consumed = self.db.get_event_source_ids().await?;

        let candidates: Vec<SourceRecord> = actions
            .iter()
            .filter(|action| !consumed.contains(&action.id))
            .map(SourceRecord::from)
            .collect();

        if candidates.is_empty() {
            return Ok(CycleOutcome::default());
        }

        let language = self.settings.language();
        let prompt = prompts::event_aggregation_prompt(language, &build_indexed_list(&candidates));
        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: Some(2048),
            temperature: Some(0.3),
            json_response: true,
        };

        let reply = match self.llm.chat(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("event aggregation call failed, retrying next tick: {err}");
                return Ok(CycleOutcome::default());
            }
        };

        let mut events = match parse_event_items(&reply.content, &candidates) {
            Some(events) => events,
            None => return Ok(CycleOutcome::default()),
        };
        if events.is_empty() {
            return Ok(CycleOutcome::default());
        }

        let context = grounding_context(&events, &candidates);
        review_records(self.gate.as_ref(), "event", &mut events, context.as_ref()).await;

        let mut outcome = CycleOutcome::default();
        for event in &events {
            if event.id.is_empty() || event.source_ids.is_empty() {
                warn!("skipping malformed event output (missing id or provenance)");
                continue;
            }
            self.db.upsert_event(event).await?;
            self.notifier
                .notify(RecordChange::created(EntityKind::Event, event.id.clone()));
            outcome.created += 1;
            outcome.sources_consumed += event.source_ids.len();
        }

        info!(
            "event aggregation: {} candidates, {} events created",
            candidates.len(),
            outcome.created
        );
        Ok(outcome)
    }
}

fn parse_event_items(content: &str, candidates: &[SourceRecord]) -> Option<Vec<Event>> {
    let value = match parse_json_reply(content) {
        Ok(value) => value,
        Err(err) => {
            warn!("event aggregation reply not decodable: {err}");
            return None;
        }
    };

    let Some(items) = value.get("events").and_then(Value::as_array) else {
        warn!("event aggregation reply missing \"events\" list, treating as empty");
        return None;
    };

    let mut events = Vec::new();
    for item in items {
        let indices = normalize_indices(
            item.get("action_indices").unwrap_or(&Value::Null),
            candidates.len(),
        );
        if indices.is_empty() {
            warn!("dropping event item with no usable action indices");
            continue;
        }
        let Some(title) = string_field(item, "title") else {
            warn!("dropping event item without a title");
            continue;
        };

        let group = resolve_group(&indices, candidates);
        let (start_time, end_time) = resolve_span(&group);
        let source_ids = group.iter().map(|record| record.id.clone()).collect();

        events.push(Event::new(
            title,
            string_field(item, "description").unwrap_or_default(),
            start_time,
            end_time,
            source_ids,
        ));
    }

    Some(events)
}

/// Serializes the candidate records the new events actually reference, for
/// the quality gate's semantic/temporal cross-check.
fn grounding_context(events: &[Event], candidates: &[SourceRecord]) -> Option<Value> {
    let referenced: Vec<&SourceRecord> = candidates
        .iter()
        .filter(|candidate| {
            events
                .iter()
                .any(|event| event.source_ids.contains(&candidate.id))
        })
        .collect();
    serde_json::to_value(referenced).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmError, MockLlm};
    use crate::notify::LogNotifier;
    use crate::settings::PipelineSettings;
    use crate::supervise::ValidationResult;
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use crate::models::Action;

    struct PassGate;

    #[async_trait]
    impl QualityGate for PassGate {
        async fn validate(&self, _: &Value, _: Option<&Value>) -> Result<ValidationResult> {
            Ok(ValidationResult::pass())
        }
    }

    fn aggregator(llm: Arc<MockLlm>, db: Database) -> EventAggregator {
        EventAggregator::new(
            db,
            llm,
            Arc::new(SettingsStore::ephemeral(PipelineSettings::default())),
            Arc::new(PassGate),
            Arc::new(LogNotifier),
        )
    }

    fn ts(min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 8, 26, 10, min, 0).unwrap()
    }

    async fn seed_actions(db: &Database, count: u32) -> Vec<Action> {
        let mut actions = Vec::new();
        for i in 0..count {
            // Recent timestamps so the window fetch picks them up.
            let at = Utc::now() - Duration::minutes(i64::from(count - i));
            let action = Action::new(
                format!("action {i}"),
                format!("did thing {i}"),
                at,
                at,
                vec![format!("phash-{i}")],
            );
            db.upsert_action(&action).await.unwrap();
            actions.push(action);
        }
        actions
    }

    #[tokio::test]
    async fn groups_actions_into_events_with_resolved_provenance() {
        let db = Database::in_memory().unwrap();
        let actions = seed_actions(&db, 3).await;

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"events": [
                {"title": "wrote code", "description": "editing", "action_indices": [1, 3]},
                {"title": "read docs", "description": "browsing", "action_indices": 2}
            ]}"#,
        );

        let outcome = aggregator(llm, db.clone()).run_cycle().await.unwrap();
        assert_eq!(outcome.created, 2);
        assert_eq!(outcome.sources_consumed, 3);

        let events = db
            .get_events_in_timeframe(ts(0) - Duration::days(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(events.len(), 2);

        let wrote = events.iter().find(|e| e.title == "wrote code").unwrap();
        assert_eq!(
            wrote.source_ids,
            vec![actions[0].id.clone(), actions[2].id.clone()]
        );
        assert_eq!(wrote.start_time, actions[0].start_time);
        assert_eq!(wrote.end_time, actions[2].start_time);
    }

    #[tokio::test]
    async fn second_cycle_does_not_reaggregate_consumed_actions() {
        let db = Database::in_memory().unwrap();
        seed_actions(&db, 2).await;

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"events": [{"title": "all of it", "description": "", "action_indices": [1, 2]}]}"#);
        // Scripted reply for a hypothetical second call; it must never be used.
        llm.push_reply(r#"{"events": [{"title": "again", "description": "", "action_indices": [1, 2]}]}"#);

        let aggregator = aggregator(llm.clone(), db.clone());
        let first = aggregator.run_cycle().await.unwrap();
        assert_eq!(first.created, 1);

        let second = aggregator.run_cycle().await.unwrap();
        assert_eq!(second.created, 0);
        // Empty candidate set short-circuits before any LLM call.
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn soft_deleted_event_still_consumes_its_actions() {
        let db = Database::in_memory().unwrap();
        seed_actions(&db, 2).await;

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"events": [{"title": "first pass", "description": "", "action_indices": [1, 2]}]}"#);

        let aggregator = aggregator(llm.clone(), db.clone());
        aggregator.run_cycle().await.unwrap();

        let events = db
            .get_events_in_timeframe(Utc::now() - Duration::days(1), Utc::now())
            .await
            .unwrap();
        db.soft_delete_event(&events[0].id).await.unwrap();

        let outcome = aggregator.run_cycle().await.unwrap();
        assert_eq!(outcome.created, 0);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn llm_failure_yields_empty_cycle_not_error() {
        let db = Database::in_memory().unwrap();
        seed_actions(&db, 2).await;

        let llm = Arc::new(MockLlm::new());
        llm.push_failure(LlmError::Network("timeout".into()));

        let outcome = aggregator(llm, db).run_cycle().await.unwrap();
        assert_eq!(outcome.created, 0);
    }

    #[tokio::test]
    async fn malformed_reply_yields_empty_cycle() {
        let db = Database::in_memory().unwrap();
        seed_actions(&db, 2).await;

        let llm = Arc::new(MockLlm::new());
        llm.push_reply("I grouped the actions into two events.");

        let outcome = aggregator(llm, db).run_cycle().await.unwrap();
        assert_eq!(outcome.created, 0);
    }

    #[tokio::test]
    async fn items_with_no_valid_indices_are_dropped() {
        let db = Database::in_memory().unwrap();
        seed_actions(&db, 2).await;

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"events": [
                {"title": "phantom", "description": "", "action_indices": [0, 99]},
                {"title": "real", "description": "", "action_indices": [2]}
            ]}"#,
        );

        let outcome = aggregator(llm, db).run_cycle().await.unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.sources_consumed, 1);
    }
}
