//! Summarizer seam and the LLM-backed implementation

use std::sync::Arc;

use async_trait::async_trait;

use recollect_core::{ChatMessage, LLMConfig, LLMProvider, RawTurn, Result};
use recollect_llm::LLMRegistry;

/// External summarization capability.
///
/// Output is text that is expected, not guaranteed, to be JSON: an object
/// for `summarize` and an array of `target_count` objects for
/// `merge_summaries`. Callers sanitize whatever comes back.
#[async_trait]
pub trait Summarizer: Send + Sync {
    /// Summarize raw turns given in ascending id order.
    async fn summarize(&self, turns: &[RawTurn]) -> Result<String>;

    /// Merge summary payloads into `target_count` denser ones.
    async fn merge_summaries(&self, summaries: &[String], target_count: usize) -> Result<String>;
}

pub struct LLMSummarizer {
    llm: Arc<dyn LLMProvider>,
    config: Option<LLMConfig>,
    summary_prompt: String,
    merge_prompt: String,
}

impl LLMSummarizer {
    pub fn new(llm: Arc<dyn LLMProvider>) -> Self {
        Self {
            llm,
            config: None,
            summary_prompt: DEFAULT_SUMMARY_PROMPT.to_string(),
            merge_prompt: DEFAULT_MERGE_PROMPT.to_string(),
        }
    }

    /// Use the provider registered under `model`, or the registry default.
    pub fn from_registry(registry: &LLMRegistry, model: &str) -> Result<Self> {
        let llm = registry.resolve(model)?;
        Ok(Self::new(llm).with_config(LLMConfig::new().with_model(model)))
    }

    pub fn with_config(mut self, config: LLMConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn with_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.summary_prompt = prompt.into();
        self
    }

    pub fn with_merge_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.merge_prompt = prompt.into();
        self
    }

    pub fn provider_name(&self) -> &str {
        self.llm.provider_name()
    }

    async fn ask(&self, system: &str, user: String) -> Result<String> {
        let messages = vec![ChatMessage::system(system), ChatMessage::user(user)];
        let response = self.llm.complete(&messages, self.config.as_ref()).await?;
        Ok(response.content.trim().to_string())
    }
}

pub fn format_turns(turns: &[RawTurn]) -> String {
    let mut out = String::new();
    for turn in turns {
        out.push('[');
        out.push_str(turn.role.as_str());
        out.push_str("] ");
        out.push_str(&turn.content);
        out.push('\n');
    }
    out
}

#[async_trait]
impl Summarizer for LLMSummarizer {
    async fn summarize(&self, turns: &[RawTurn]) -> Result<String> {
        let user = format!(
            "Conversation follows, produce the JSON:\n{}",
            format_turns(turns)
        );
        self.ask(&self.summary_prompt, user).await
    }

    async fn merge_summaries(&self, summaries: &[String], target_count: usize) -> Result<String> {
        let mut user = format!(
            "target_count={}\nSummaries follow, one JSON per block:\n",
            target_count
        );
        for summary in summaries {
            user.push_str(summary);
            user.push_str("\n---\n");
        }
        self.ask(&self.merge_prompt, user).await
    }
}

pub const DEFAULT_SUMMARY_PROMPT: &str = r#"You write conversation minutes. Compress the given conversation into structured JSON with the fields:
persona_signals[], facts[], goals[], issues[], commitments[], emotions_trend,
todo_us[], todo_user[], time_span{from,to}.
Rules:
- Output only the JSON itself: no explanation, prefix, heading or Markdown code fence.
- emotions_trend is a string; time_span.from/to are integer millisecond timestamps; omit a key when there is nothing for it.
- Do not restate the conversation verbatim and do not invent anything."#;

pub const DEFAULT_MERGE_PROMPT: &str = r#"You compact long-term memory. Merge several summary JSON objects into fewer structured JSON objects with the same fields:
persona_signals[], facts[], goals[], issues[], commitments[], emotions_trend,
todo_us[], todo_user[], time_span{from,to}.
Rules:
1) Deduplicate and merge facts, keep the time span (from/to are millisecond timestamps, use the minimum and maximum of the range).
2) Output a JSON array whose length is exactly target_count.
3) Each item should cover one continuous period or topic without being verbose."#;
