pub mod mock;
pub mod openai;

pub use mock::MockLlm;
pub use openai::OpenAiClient;

use async_trait::async_trait;

/// Errors at the LLM boundary. `MalformedResponse` is deliberately separate
/// from `EmptyResponse`: a well-formed reply with nothing in it is a normal
/// cycle outcome, a reply we cannot decode is an upstream defect worth
/// tracking on its own.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("network error: {0}")]
    Network(String),

    #[error("api error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("empty response")]
    EmptyResponse,

    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One part of a multimodal message. Images travel as raw PNG bytes and are
/// base64-encoded by the backend at send time.
#[derive(Debug, Clone)]
pub enum ContentPart {
    Text(String),
    PngImage(Vec<u8>),
}

#[derive(Debug, Clone)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub messages: Vec<ChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// Ask the backend for a JSON-object response where supported.
    pub json_response: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct ChatReply {
    pub content: String,
    pub usage: Option<TokenUsage>,
}

/// The one remote call the pipeline makes. Treated as opaque, slow and
/// unreliable; callers never retry, a failed call is a zero-result cycle.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, LlmError>;
}

/// Decode an LLM reply as JSON, tolerating markdown code fences around the
/// payload. Failure here is a `MalformedResponse`, never a panic.
pub fn parse_json_reply(content: &str) -> Result<serde_json::Value, LlmError> {
    let trimmed = strip_code_fences(content.trim());
    serde_json::from_str(trimmed).map_err(|err| LlmError::MalformedResponse(err.to_string()))
}

fn strip_code_fences(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    // Drop an optional language tag on the fence line.
    let rest = match rest.split_once('\n') {
        Some((_, body)) => body,
        None => rest,
    };
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_json() {
        let value = parse_json_reply(r#"{"items": []}"#).unwrap();
        assert!(value["items"].as_array().unwrap().is_empty());
    }

    #[test]
    fn parses_fenced_json() {
        let value = parse_json_reply("```json\n{\"items\": [1, 2]}\n```").unwrap();
        assert_eq!(value["items"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn malformed_reply_is_its_own_error_kind() {
        let err = parse_json_reply("sorry, I cannot help with that").unwrap_err();
        assert!(matches!(err, LlmError::MalformedResponse(_)));
    }
}
