use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;

use recollect_core::{
    ChatMessage, FinishReason, LLMConfig, LLMError, LLMProvider, LLMResponse, TokenUsage,
};

/// Scripted text-generation provider for tests.
///
/// Queued outcomes are consumed one per call; once the queue is empty every
/// call returns the fallback text.
#[derive(Clone)]
pub struct MockLLMProvider {
    name: Arc<str>,
    inner: Arc<RwLock<MockInner>>,
}

struct MockInner {
    queue: VecDeque<Result<String, String>>,
    fallback: String,
    calls: Vec<MockCall>,
    latency: Duration,
}

#[derive(Debug, Clone)]
pub struct MockCall {
    pub messages: Vec<ChatMessage>,
    pub config: Option<LLMConfig>,
}

impl MockCall {
    pub fn system_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .find(|m| m.role == recollect_core::Role::System)
            .map(|m| m.content.as_str())
    }

    pub fn user_prompt(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == recollect_core::Role::User)
            .map(|m| m.content.as_str())
    }
}

impl MockLLMProvider {
    pub fn new(name: impl Into<String>) -> Self {
        let name: String = name.into();
        Self {
            name: Arc::from(name.as_str()),
            inner: Arc::new(RwLock::new(MockInner {
                queue: VecDeque::new(),
                fallback: "{}".to_string(),
                calls: Vec::new(),
                latency: Duration::ZERO,
            })),
        }
    }

    pub fn with_responses<I, S>(name: impl Into<String>, responses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mock = Self::new(name);
        for r in responses {
            mock.push_response(r);
        }
        mock
    }

    pub fn push_response(&self, content: impl Into<String>) {
        self.inner.write().queue.push_back(Ok(content.into()));
    }

    pub fn push_error(&self, message: impl Into<String>) {
        self.inner.write().queue.push_back(Err(message.into()));
    }

    pub fn set_fallback(&self, content: impl Into<String>) {
        self.inner.write().fallback = content.into();
    }

    pub fn set_latency(&self, latency: Duration) {
        self.inner.write().latency = latency;
    }

    pub fn call_count(&self) -> usize {
        self.inner.read().calls.len()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.inner.read().calls.clone()
    }

    pub fn last_call(&self) -> Option<MockCall> {
        self.inner.read().calls.last().cloned()
    }

    fn next_outcome(&self) -> Result<String, String> {
        let mut inner = self.inner.write();
        match inner.queue.pop_front() {
            Some(outcome) => outcome,
            None => Ok(inner.fallback.clone()),
        }
    }
}

fn rough_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

#[async_trait]
impl LLMProvider for MockLLMProvider {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        config: Option<&LLMConfig>,
    ) -> Result<LLMResponse, LLMError> {
        let latency = {
            let mut inner = self.inner.write();
            inner.calls.push(MockCall {
                messages: messages.to_vec(),
                config: config.cloned(),
            });
            inner.latency
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let content = self.next_outcome().map_err(LLMError::Other)?;
        let prompt_tokens: u32 = messages.iter().map(|m| rough_tokens(&m.content)).sum();
        let completion_tokens = rough_tokens(&content);
        Ok(
            LLMResponse::new(content, FinishReason::Stop).with_usage(TokenUsage {
                prompt_tokens,
                completion_tokens,
                total_tokens: prompt_tokens + completion_tokens,
            }),
        )
    }

    fn provider_name(&self) -> &str {
        &self.name
    }
}
