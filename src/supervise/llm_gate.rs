use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;

use crate::llm::{parse_json_reply, ChatMessage, ChatRequest, LlmClient};
use crate::prompts;
use crate::settings::SettingsStore;

use super::{QualityGate, ValidationResult};

/// LLM-backed gate, one instance per entity kind. The label only steers the
/// review prompt; the contract is identical across kinds.
pub struct LlmGate {
    llm: Arc<dyn LlmClient>,
    settings: Arc<SettingsStore>,
    entity_label: &'static str,
}

impl LlmGate {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        settings: Arc<SettingsStore>,
        entity_label: &'static str,
    ) -> Self {
        Self {
            llm,
            settings,
            entity_label,
        }
    }

    pub fn events(llm: Arc<dyn LlmClient>, settings: Arc<SettingsStore>) -> Self {
        Self::new(llm, settings, "event")
    }

    pub fn activities(llm: Arc<dyn LlmClient>, settings: Arc<SettingsStore>) -> Self {
        Self::new(llm, settings, "activity")
    }

    pub fn todos(llm: Arc<dyn LlmClient>, settings: Arc<SettingsStore>) -> Self {
        Self::new(llm, settings, "todo")
    }

    pub fn knowledge(llm: Arc<dyn LlmClient>, settings: Arc<SettingsStore>) -> Self {
        Self::new(llm, settings, "knowledge")
    }
}

#[async_trait]
impl QualityGate for LlmGate {
    async fn validate(&self, content: &Value, context: Option<&Value>) -> Result<ValidationResult> {
        let language = self.settings.language();
        let records_json =
            serde_json::to_string_pretty(content).context("failed to serialize review content")?;
        let sources_json = match context {
            Some(context) => Some(
                serde_json::to_string_pretty(context)
                    .context("failed to serialize review context")?,
            ),
            None => None,
        };

        let request = ChatRequest {
            messages: vec![ChatMessage::user(prompts::review_prompt(
                language,
                self.entity_label,
                &records_json,
                sources_json.as_deref(),
            ))],
            max_tokens: Some(2048),
            temperature: Some(0.0),
            json_response: true,
        };

        let reply = self
            .llm
            .chat(request)
            .await
            .with_context(|| format!("{} review call failed", self.entity_label))?;

        let value = parse_json_reply(&reply.content)
            .with_context(|| format!("{} review reply not decodable", self.entity_label))?;

        serde_json::from_value(value)
            .with_context(|| format!("{} review reply has wrong shape", self.entity_label))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLlm;
    use crate::settings::{PipelineSettings, SettingsStore};
    use serde_json::json;

    fn gate(llm: Arc<MockLlm>) -> LlmGate {
        let settings = Arc::new(SettingsStore::ephemeral(PipelineSettings::default()));
        LlmGate::events(llm, settings)
    }

    #[tokio::test]
    async fn decodes_well_shaped_verdict() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply(
            r#"{"is_valid": false, "issues": ["span overlaps"], "suggestions": [],
                "revised_content": [{"title": "t", "description": "d"}]}"#,
        );

        let result = gate(llm)
            .validate(&json!([{"title": "x"}]), None)
            .await
            .unwrap();

        assert!(!result.is_valid);
        assert_eq!(result.issues, vec!["span overlaps"]);
        assert_eq!(result.revised_content.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn malformed_reply_surfaces_as_error() {
        let llm = Arc::new(MockLlm::new());
        llm.push_reply("the records look fine to me");

        let result = gate(llm).validate(&json!([]), None).await;
        assert!(result.is_err());
    }
}
