use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use log::{info, warn};
use serde_json::Value;

use crate::db::Database;
use crate::llm::{parse_json_reply, ChatMessage, ChatRequest, LlmClient};
use crate::models::Activity;
use crate::notify::{ChangeNotifier, EntityKind, RecordChange};
use crate::prompts;
use crate::settings::SettingsStore;
use crate::supervise::{review_records, QualityGate};

use super::{
    build_indexed_list, normalize_indices, resolve_group, resolve_span, string_field,
    AggregatorStats, CycleOutcome, SourceRecord,
};

/// Top of the hierarchy: merges not-yet-aggregated events into activity
/// blocks. Identical loop to the event aggregator, one tier up.
pub struct ActivityAggregator {
    db: Database,
    llm: Arc<dyn LlmClient>,
    settings: Arc<SettingsStore>,
    gate: Arc<dyn QualityGate>,
    notifier: Arc<dyn ChangeNotifier>,
    pub stats: Arc<AggregatorStats>,
}

impl ActivityAggregator {
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
        let window_secs = self.settings.snapshot().activities.window_secs;
        let now = Utc::now();
        let window_start = now - Duration::seconds(window_secs as i64);

        let events = self.db.get_events_in_timeframe(window_start, now).await?;
        let consumed = self.db.get_activity_source_ids().await?;

        let candidates: Vec<SourceRecord> = events
            .iter()
            .filter(|event| !consumed.contains(&event.id))
            .map(SourceRecord::from)
            .collect();

        if candidates.is_empty() {
            return Ok(CycleOutcome::default());
        }

        let language = self.settings.language();
        let prompt =
            prompts::activity_aggregation_prompt(language, &build_indexed_list(&candidates));
        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: Some(2048),
            temperature: Some(0.3),
            json_response: true,
        };

        let reply = match self.llm.chat(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("activity aggregation call failed, retrying next tick: {err}");
                return Ok(CycleOutcome::default());
            }
        };

        let mut activities = match parse_activity_items(&reply.content, &candidates) {
            Some(activities) => activities,
            None => return Ok(CycleOutcome::default()),
        };
        if activities.is_empty() {
            return Ok(CycleOutcome::default());
        }

        let context = serde_json::to_value(&candidates).ok();
        review_records(
            self.gate.as_ref(),
            "activity",
            &mut activities,
            context.as_ref(),
        )
        .await;

        let mut outcome = CycleOutcome::default();
        for activity in &activities {
            if activity.id.is_empty() || activity.source_ids.is_empty() {
                warn!("skipping malformed activity output (missing id or provenance)");
                continue;
            }
            self.db.upsert_activity(activity).await?;
            self.notifier.notify(RecordChange::created(
                EntityKind::Activity,
                activity.id.clone(),
            ));
            outcome.created += 1;
            outcome.sources_consumed += activity.source_ids.len();
        }

        info!(
            "activity aggregation: {} candidates, {} activities created",
            candidates.len(),
            outcome.created
        );
        Ok(outcome)
    }
}

fn parse_activity_items(content: &str, candidates: &[SourceRecord]) -> Option<Vec<Activity>> {
    let value = match parse_json_reply(content) {
        Ok(value) => value,
        Err(err) => {
            warn!("activity aggregation reply not decodable: {err}");
            return None;
        }
    };

    let Some(items) = value.get("activities").and_then(Value::as_array) else {
        warn!("activity aggregation reply missing \"activities\" list, treating as empty");
        return None;
    };

    let mut activities = Vec::new();
    for item in items {
        let indices = normalize_indices(
            item.get("event_indices").unwrap_or(&Value::Null),
            candidates.len(),
        );
        if indices.is_empty() {
            warn!("dropping activity item with no usable event indices");
            continue;
        }
        let Some(title) = string_field(item, "title") else {
            warn!("dropping activity item without a title");
            continue;
        };

        let group = resolve_group(&indices, candidates);
        let (start_time, end_time) = resolve_span(&group);
        let source_ids = group.iter().map(|record| record.id.clone()).collect();

        activities.push(Activity::new(
            title,
            string_field(item, "description").unwrap_or_default(),
            start_time,
            end_time,
            source_ids,
        ));
    }

    Some(activities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::models::Event;
    use crate::notify::LogNotifier;
    use crate::settings::PipelineSettings;
    use crate::supervise::ValidationResult;
    use async_trait::async_trait;

    struct PassGate;

    #[async_trait]
    impl QualityGate for PassGate {
        async fn validate(&self, _: &Value, _: Option<&Value>) -> Result<ValidationResult> {
            Ok(ValidationResult::pass())
        }
    }

    #[tokio::test]
    async fn merges_events_into_one_activity_block() {
        let db = Database::in_memory().unwrap();
        let base = Utc::now() - Duration::minutes(30);

        let mut event_ids = Vec::new();
        for i in 0..3 {
            let at = base + Duration::minutes(i * 10);
            let event = Event::new(
                format!("event {i}"),
                "".into(),
                at,
                at + Duration::minutes(5),
                vec![format!("action-{i}")],
            );
            db.upsert_event(&event).await.unwrap();
            event_ids.push(event.id);
        }

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"activities": [{"title": "afternoon of debugging",
                                "description": "one long session",
                                "event_indices": [1, 2, 3]}]}"#,
        );

        let aggregator = ActivityAggregator::new(
            db.clone(),
            llm,
            Arc::new(SettingsStore::ephemeral(PipelineSettings::default())),
            Arc::new(PassGate),
            Arc::new(LogNotifier),
        );

        let outcome = aggregator.run_cycle().await.unwrap();
        assert_eq!(outcome.created, 1);
        assert_eq!(outcome.sources_consumed, 3);

        let activities = db
            .get_activities_in_timeframe(Utc::now() - Duration::days(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(activities.len(), 1);
        assert_eq!(activities[0].source_ids, event_ids);

        // Consumed events leave nothing for a second pass.
        let second = aggregator.run_cycle().await.unwrap();
        assert_eq!(second.created, 0);
    }
}
