//! Scripted LLM double for tests and offline runs.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ChatReply, ChatRequest, LlmClient, LlmError};

#[derive(Default)]
pub struct MockLlm {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
    calls: Mutex<Vec<ChatRequest>>,
}

impl MockLlm {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_reply(&self, content: impl Into<String>) {
        self.replies
            .lock()
            .expect("mock replies lock")
            .push_back(Ok(content.into()));
    }

    pub fn push_failure(&self, error: LlmError) {
        self.replies
            .lock()
            .expect("mock replies lock")
            .push_back(Err(error));
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("mock calls lock").len()
    }

    pub fn calls(&self) -> Vec<ChatRequest> {
        self.calls.lock().expect("mock calls lock").clone()
    }
}

#[async_trait]
impl LlmClient for MockLlm {
    async fn chat(&self, request: ChatRequest) -> Result<ChatReply, LlmError> {
        self.calls.lock().expect("mock calls lock").push(request);

        let scripted = self
            .replies
            .lock()
            .expect("mock replies lock")
            .pop_front()
            .unwrap_or(Err(LlmError::Network("no scripted reply".into())));

        scripted.map(|content| ChatReply {
            content,
            usage: None,
        })
    }
}
