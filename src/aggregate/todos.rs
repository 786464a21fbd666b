use std::sync::Arc;

use anyhow::Result;
use chrono::{Duration, Utc};
use log::{info, warn};
use serde_json::Value;

use crate::db::Database;
use crate::llm::{parse_json_reply, ChatMessage, ChatRequest, LlmClient};
use crate::models::Todo;
use crate::notify::{ChangeNotifier, EntityKind, RecordChange};
use crate::prompts;
use crate::settings::SettingsStore;
use crate::supervise::{review_records, QualityGate};

use super::{
    build_indexed_list, normalize_indices, resolve_group, string_field, string_list_field,
    AggregatorStats, CycleOutcome, SourceRecord,
};

/// Mines open tasks out of recent actions. Runs outside the event/activity
/// chain: an action consumed by an event can still seed a todo, but each
/// action feeds at most one todo.
pub struct TodoAggregator {
    db: Database,
    llm: Arc<dyn LlmClient>,
    settings: Arc<SettingsStore>,
    gate: Arc<dyn QualityGate>,
    notifier: Arc<dyn ChangeNotifier>,
    pub stats: Arc<AggregatorStats>,
}

impl TodoAggregator {
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
        let window_secs = self.settings.snapshot().todos.window_secs;
        let now = Utc::now();
        let window_start = now - Duration::seconds(window_secs as i64);

        let actions = self.db.get_actions_in_timeframe(window_start, now).await?;
        let consumed = self.db.get_todo_source_ids().await?;

        let candidates: Vec<SourceRecord> = actions
            .iter()
            .filter(|action| !consumed.contains(&action.id))
            .map(SourceRecord::from)
            .collect();

        if candidates.is_empty() {
            return Ok(CycleOutcome::default());
        }

        let language = self.settings.language();
        let prompt = prompts::todo_extraction_prompt(language, &build_indexed_list(&candidates));
        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompt)],
            max_tokens: Some(2048),
            temperature: Some(0.3),
            json_response: true,
        };

        let reply = match self.llm.chat(request).await {
            Ok(reply) => reply,
            Err(err) => {
                warn!("todo extraction call failed, retrying next tick: {err}");
                return Ok(CycleOutcome::default());
            }
        };

        let mut todos = match parse_todo_items(&reply.content, &candidates) {
            Some(todos) => todos,
            None => return Ok(CycleOutcome::default()),
        };
        if todos.is_empty() {
            return Ok(CycleOutcome::default());
        }

        review_records(self.gate.as_ref(), "todo", &mut todos, None).await;

        let mut outcome = CycleOutcome::default();
        for todo in &todos {
            if todo.id.is_empty() || todo.source_ids.is_empty() {
                warn!("skipping malformed todo output (missing id or provenance)");
                continue;
            }
            self.db.upsert_todo(todo).await?;
            self.notifier
                .notify(RecordChange::created(EntityKind::Todo, todo.id.clone()));
            outcome.created += 1;
            outcome.sources_consumed += todo.source_ids.len();
        }

        info!(
            "todo extraction: {} candidates, {} todos created",
            candidates.len(),
            outcome.created
        );
        Ok(outcome)
    }
}

fn parse_todo_items(content: &str, candidates: &[SourceRecord]) -> Option<Vec<Todo>> {
    let value = match parse_json_reply(content) {
        Ok(value) => value,
        Err(err) => {
            warn!("todo extraction reply not decodable: {err}");
            return None;
        }
    };

    let Some(items) = value.get("todos").and_then(Value::as_array) else {
        warn!("todo extraction reply missing \"todos\" list, treating as empty");
        return None;
    };

    let mut todos = Vec::new();
    for item in items {
        let indices = normalize_indices(
            item.get("action_indices").unwrap_or(&Value::Null),
            candidates.len(),
        );
        if indices.is_empty() {
            warn!("dropping todo item with no usable action indices");
            continue;
        }
        let Some(title) = string_field(item, "title") else {
            warn!("dropping todo item without a title");
            continue;
        };

        let group = resolve_group(&indices, candidates);
        let source_ids = group.iter().map(|record| record.id.clone()).collect();

        todos.push(Todo::new(
            title,
            string_field(item, "description").unwrap_or_default(),
            string_list_field(item, "keywords"),
            source_ids,
        ));
    }

    Some(todos)
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
    async fn extracts_todos_with_keywords_and_action_link() {
        let db = Database::in_memory().unwrap();
        let at = Utc::now() - Duration::minutes(5);
        let action = Action::new(
            "wrote email".into(),
            "drafting a reply about the quarterly report".into(),
            at,
            at,
            vec!["phash-0".into()],
        );
        db.upsert_action(&action).await.unwrap();

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"todos": [{"title": "send quarterly report",
                           "description": "finish and send the reply",
                           "keywords": ["report", "email"],
                           "action_indices": [1]}]}"#,
        );

        let aggregator = TodoAggregator::new(
            db.clone(),
            llm,
            Arc::new(SettingsStore::ephemeral(PipelineSettings::default())),
            Arc::new(PassGate),
            Arc::new(LogNotifier),
        );

        let outcome = aggregator.run_cycle().await.unwrap();
        assert_eq!(outcome.created, 1);

        let todos = db
            .get_todos_created_in_timeframe(Utc::now() - Duration::hours(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(todos.len(), 1);
        assert_eq!(todos[0].keywords, vec!["report", "email"]);
        assert_eq!(todos[0].action_id.as_deref(), Some(action.id.as_str()));
        assert_eq!(todos[0].source_ids, vec![action.id.clone()]);

        // A second cycle sees the action as consumed and does nothing.
        let second = aggregator.run_cycle().await.unwrap();
        assert_eq!(second.created, 0);
    }

    #[tokio::test]
    async fn empty_todo_list_is_a_valid_quiet_cycle() {
        let db = Database::in_memory().unwrap();
        let at = Utc::now() - Duration::minutes(5);
        db.upsert_action(&Action::new(
            "idle scrolling".into(),
            "reading a feed".into(),
            at,
            at,
            vec!["phash-0".into()],
        ))
        .await
        .unwrap();

        let llm = Arc::new(MockLlm::new());
        llm.push_reply(r#"{"todos": []}"#);

        let aggregator = TodoAggregator::new(
            db,
            llm,
            Arc::new(SettingsStore::ephemeral(PipelineSettings::default())),
            Arc::new(PassGate),
            Arc::new(LogNotifier),
        );

        let outcome = aggregator.run_cycle().await.unwrap();
        assert_eq!(outcome.created, 0);
    }
}
