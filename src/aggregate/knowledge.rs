use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use log::{info, warn};
use serde_json::Value;

use crate::db::Database;
use crate::llm::{parse_json_reply, ChatMessage, ChatRequest, LlmClient};
use crate::models::Knowledge;
use crate::notify::{ChangeNotifier, EntityKind, RecordChange};
use crate::prompts;
use crate::settings::SettingsStore;
use crate::supervise::{review_records, QualityGate};

use super::{
    build_indexed_list, normalize_indices, resolve_group, string_field, string_list_field,
    AggregatorStats, CycleOutcome, SourceRecord,
};

/// Mines durable knowledge out of recent actions; same loop as the todo
/// aggregator with its own prompt, table and consumption set.
pub struct KnowledgeAggregator {
    db: Database,
    llm: Arc<dyn LlmClient>,
    settings: Arc<SettingsStore>,
    gate: Arc<dyn QualityGate>,
    notifier: Arc<dyn ChangeNotifier>,
    pub stats: Arc<AggregatorStats>,
}

impl KnowledgeAggregator {
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
        let window_secs = self.settings.snapshot().knowledge.window_secs;
        let now = Utc::now();
        let window_start = now - Duration::seconds(window_secs as i64);

        let actions = self.db.get_actions_in_timeframe(window_start, now).await?;
        let consumed = self.db.get_knowledge_source_ids().await?;

        let candidates: Vec<SourceRecord> = actions
            .iter()
            .filter(|action| !consumed.contains(&action.id))
            .map(SourceRecord::from)
            .collect();

        if candidates.is_empty() {
            return Ok(CycleOutcome::default());
        }

        let language = self.settings.language();
        let prompt =
            prompts::knowledge_extraction_prompt(language, &build_indexed_list(&candidates));
        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: Some(2048),
            temperature: Some(0.3),
            json_response: true,
        };

        let reply = match self.llm.chat(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("knowledge extraction call failed, retrying next tick: {err}");
                return Ok(CycleOutcome::default());
            }
        };

        let mut items = match parse_knowledge_items(&reply.content, &candidates) {
            Some(items) => items,
            None => return Ok(CycleOutcome::default()),
        };
        if items.is_empty() {
            return Ok(CycleOutcome::default());
        }

        review_records(self.gate.as_ref(), "knowledge", &mut items, None).await;

        let mut outcome = CycleOutcome::default();
        for knowledge in &items {
            if knowledge.id.is_empty() || knowledge.source_ids.is_empty() {
                warn!("skipping malformed knowledge output (missing id or provenance)");
                continue;
            }
            self.db.upsert_knowledge(knowledge).await?;
            self.notifier.notify(RecordChange::created(
                EntityKind::Knowledge,
                knowledge.id.clone(),
            ));
            outcome.created += 1;
            outcome.sources_consumed += knowledge.source_ids.len();
        }

        info!(
            "knowledge extraction: {} candidates, {} items created",
            candidates.len(),
            outcome.created
        );
        Ok(outcome)
    }
}

fn parse_knowledge_items(content: &str, candidates: &[SourceRecord]) -> Option<Vec<Knowledge>> {
    let value = match parse_json_reply(content) {
        Ok(value) => value,
        Err(err) => {
            warn!("knowledge extraction reply not decodable: {err}");
            return None;
        }
    };

    let Some(items) = value.get("knowledge").and_then(Value::as_array) else {
        warn!("knowledge extraction reply missing \"knowledge\" list, treating as empty");
        return None;
    };

    let mut knowledge = Vec::new();
    for item in items {
        let indices = normalize_indices(
            item.get("action_indices").unwrap_or(&Value::Null),
            candidates.len(),
        );
        if indices.is_empty() {
            warn!("dropping knowledge item with no usable action indices");
            continue;
        }
        let Some(title) = string_field(item, "title") else {
            warn!("dropping knowledge item without a title");
            continue;
        };

        let group = resolve_group(&indices, candidates);
        let source_ids = group.iter().map(|record| record.id.clone()).collect();

        knowledge.push(Knowledge::new(
            title,
            string_field(item, "description").unwrap_or_default(),
            string_list_field(item, "keywords"),
            source_ids,
        ));
    }

    Some(knowledge)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::models::Action;
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
    async fn knowledge_and_event_consumption_are_independent() {
        let db = Database::in_memory().unwrap();
        let at = Utc::now() - Duration::minutes(5);
        let action = Action::new(
            "read rfc".into(),
            "studying the retry semantics section".into(),
            at,
            at,
            vec!["phash-0".into()],
        );
        db.upsert_action(&action).await.unwrap();

        // The action is already consumed by an event.
        let event = crate::models::Event::new(
            "research".into(),
            "".into(),
            at,
            at,
            vec![action.id.clone()],
        );
        db.upsert_event(&event).await.unwrap();

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"knowledge": [{"title": "retry semantics",
                               "description": "retries must be idempotent",
                               "keywords": ["rfc"],
                               "action_indices": [1]}]}"#,
        );

        let aggregator = KnowledgeAggregator::new(
            db.clone(),
            llm,
            Arc::new(SettingsStore::ephemeral(PipelineSettings::default())),
            Arc::new(PassGate),
            Arc::new(LogNotifier),
        );

        // Event consumption does not block knowledge extraction.
        let outcome = aggregator.run_cycle().await.unwrap();
        assert_eq!(outcome.created, 1);

        // Knowledge consumption does block a second knowledge pass.
        let second = aggregator.run_cycle().await.unwrap();
        assert_eq!(second.created, 0);
    }
}
