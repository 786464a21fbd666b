//! Second-pass review of freshly aggregated records.
//!
//! The gate is advisory by contract: any failure to reach the model, decode
//! its reply, or match it against the originals leaves the pre-review content
//! untouched. Aggregation never blocks on the supervisor.

mod llm_gate;

pub use llm_gate::LlmGate;

use anyhow::Result;
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{Activity, Event, Knowledge, Todo};

/// Transient verdict returned by one gate call; consumed immediately.
#[derive(Debug, Clone, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub suggestions: Vec<String>,
    #[serde(default)]
    pub revised_content: Option<Vec<RevisedItem>>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            is_valid: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
            revised_content: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevisedItem {
    pub title: String,
    pub description: String,
}

/// One interface per entity kind; no inheritance, just this contract.
#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn validate(&self, content: &Value, context: Option<&Value>) -> Result<ValidationResult>;
}

/// A record whose title/description the gate may rewrite. Ids, timestamps and
/// provenance stay out of reach.
pub trait Reviewable {
    fn set_title(&mut self, title: String);
    fn set_description(&mut self, description: String);
}

macro_rules! impl_reviewable {
    ($ty:ty) => {
        impl Reviewable for $ty {
            fn set_title(&mut self, title: String) {
                self.title = title;
            }
            fn set_description(&mut self, description: String) {
                self.description = description;
            }
        }
    };
}

impl_reviewable!(Event);
impl_reviewable!(Activity);
impl_reviewable!(Knowledge);
impl_reviewable!(Todo);

/// Runs the gate over a freshly built record set and applies any well-shaped
/// revision in place. Every failure path leaves `records` exactly as given.
pub async fn review_records<T>(
    gate: &dyn QualityGate,
    label: &str,
    records: &mut [T],
    context: Option<&Value>,
) where
    T: Reviewable + Serialize,
{
    if records.is_empty() {
        return;
    }

    let content = match serde_json::to_value(&*records) {
        Ok(content) => content,
        Err(err) => {
            warn!("{label} review skipped, records not serializable: {err}");
            return;
        }
    };

    let result = match gate.validate(&content, context).await {
        Ok(result) => result,
        Err(err) => {
            warn!("{label} quality gate unavailable, passing content through: {err}");
            return;
        }
    };

    if !result.is_valid {
        info!(
            "{label} quality gate flagged {} issue(s): {:?}",
            result.issues.len(),
            result.issues
        );
    }

    apply_revisions(records, result, label);
}

fn apply_revisions<T: Reviewable>(records: &mut [T], result: ValidationResult, label: &str) {
    let Some(revised) = result.revised_content else {
        return;
    };

    if revised.len() != records.len() {
        warn!(
            "{label} revision count mismatch ({} revised vs {} original), keeping originals",
            revised.len(),
            records.len()
        );
        return;
    }

    for (record, revision) in records.iter_mut().zip(revised) {
        record.set_title(revision.title);
        record.set_description(revision.description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample_events() -> Vec<Event> {
        vec![
            Event::new(
                "draft title".into(),
                "draft description".into(),
                Utc::now(),
                Utc::now(),
                vec!["a1".into()],
            ),
            Event::new(
                "second title".into(),
                "second description".into(),
                Utc::now(),
                Utc::now(),
                vec!["a2".into()],
            ),
        ]
    }

    struct FailingGate;

    #[async_trait]
    impl QualityGate for FailingGate {
        async fn validate(&self, _: &Value, _: Option<&Value>) -> Result<ValidationResult> {
            anyhow::bail!("model unreachable")
        }
    }

    struct ScriptedGate(ValidationResult);

    #[async_trait]
    impl QualityGate for ScriptedGate {
        async fn validate(&self, _: &Value, _: Option<&Value>) -> Result<ValidationResult> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn gate_failure_leaves_records_untouched() {
        let mut events = sample_events();
        let before: Vec<String> = events.iter().map(|e| e.title.clone()).collect();

        review_records(&FailingGate, "event", &mut events, None).await;

        let after: Vec<String> = events.iter().map(|e| e.title.clone()).collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn mismatched_revision_count_keeps_originals() {
        let mut events = sample_events();
        let gate = ScriptedGate(ValidationResult {
            is_valid: false,
            issues: vec!["too vague".into()],
            suggestions: Vec::new(),
            revised_content: Some(vec![RevisedItem {
                title: "only one".into(),
                description: "revision".into(),
            }]),
        });

        review_records(&gate, "event", &mut events, None).await;
        assert_eq!(events[0].title, "draft title");
        assert_eq!(events[1].title, "second title");
    }

    #[tokio::test]
    async fn well_shaped_revision_replaces_only_mutable_fields() {
        let mut events = sample_events();
        let original_ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let original_sources: Vec<Vec<String>> =
            events.iter().map(|e| e.source_ids.clone()).collect();

        let gate = ScriptedGate(ValidationResult {
            is_valid: true,
            issues: Vec::new(),
            suggestions: Vec::new(),
            revised_content: Some(vec![
                RevisedItem {
                    title: "polished one".into(),
                    description: "clearer one".into(),
                },
                RevisedItem {
                    title: "polished two".into(),
                    description: "clearer two".into(),
                },
            ]),
        });

        review_records(&gate, "event", &mut events, None).await;

        assert_eq!(events[0].title, "polished one");
        assert_eq!(events[1].description, "clearer two");
        let ids: Vec<String> = events.iter().map(|e| e.id.clone()).collect();
        let sources: Vec<Vec<String>> = events.iter().map(|e| e.source_ids.clone()).collect();
        assert_eq!(ids, original_ids);
        assert_eq!(sources, original_sources);
    }

    #[tokio::test]
    async fn valid_result_without_revision_is_a_no_op() {
        let mut events = sample_events();
        review_records(&ScriptedGate(ValidationResult::pass()), "event", &mut events, None).await;
        assert_eq!(events[0].title, "draft title");
    }
}
