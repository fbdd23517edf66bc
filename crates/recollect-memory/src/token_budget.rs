//! Token budget for long-term memory in a prompt

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::tokens::{estimate_json_tokens, estimate_text_tokens};

/// Context window of a model and the share kept free for its output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelProfile {
    #[serde(default = "default_context_window")]
    pub context_window: u32,

    #[serde(default = "default_output_reserve")]
    pub output_reserve_tokens: u32,
}

fn default_context_window() -> u32 {
    131_072
}

fn default_output_reserve() -> u32 {
    32_768
}

impl Default for ModelProfile {
    fn default() -> Self {
        Self {
            context_window: default_context_window(),
            output_reserve_tokens: default_output_reserve(),
        }
    }
}

impl ModelProfile {
    pub fn new(context_window: u32, output_reserve_tokens: u32) -> Self {
        Self {
            context_window,
            output_reserve_tokens,
        }
    }

    /// Input tokens left once the output reservation is set aside.
    pub fn available_input(&self) -> u64 {
        (self.context_window as u64).saturating_sub(self.output_reserve_tokens as u64)
    }
}

/// Model name to profile. Unknown names resolve to the conservative
/// default profile (131072 window, 32768 reserved).
#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    profiles: HashMap<String, ModelProfile>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_profiles(profiles: HashMap<String, ModelProfile>) -> Self {
        Self { profiles }
    }

    pub fn register(&mut self, name: impl Into<String>, profile: ModelProfile) {
        self.profiles.insert(name.into(), profile);
    }

    pub fn with_profile(mut self, name: impl Into<String>, profile: ModelProfile) -> Self {
        self.register(name, profile);
        self
    }

    pub fn get(&self, model: &str) -> ModelProfile {
        self.profiles.get(model).copied().unwrap_or_else(|| {
            tracing::debug!(model, "Unknown model, using default profile");
            ModelProfile::default()
        })
    }

    pub fn contains(&self, model: &str) -> bool {
        self.profiles.contains_key(model)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// A fixed piece of the prompt. Text and JSON are estimated differently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptComponent {
    Text(String),
    Json(String),
}

impl PromptComponent {
    pub fn text(s: impl Into<String>) -> Self {
        PromptComponent::Text(s.into())
    }

    pub fn json(s: impl Into<String>) -> Self {
        PromptComponent::Json(s.into())
    }

    pub fn tokens(&self) -> u32 {
        match self {
            PromptComponent::Text(s) => estimate_text_tokens(s),
            PromptComponent::Json(s) => estimate_json_tokens(s),
        }
    }
}

/// How many summaries fit, along with the inputs that produced the answer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Budget {
    pub model: String,
    pub available: u64,
    pub used: u64,
    pub room: u64,
    pub max_summaries: usize,
    pub soft_cap: usize,
    pub retrieved_turns: usize,
    pub avg_turn_tokens: u32,
    pub target_summary_tokens: u32,
    pub soft_cap_ratio: f64,
}

#[derive(Debug, Clone, Default)]
pub struct TokenBudgetCalculator {
    models: ModelRegistry,
}

impl TokenBudgetCalculator {
    pub fn new(models: ModelRegistry) -> Self {
        Self { models }
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    /// Pure: the same inputs always give the same budget.
    pub fn compute(
        &self,
        model: &str,
        components: &[PromptComponent],
        retrieved_turns: usize,
        avg_turn_tokens: u32,
        target_summary_tokens: u32,
        soft_cap_ratio: f64,
    ) -> Budget {
        let available = self.models.get(model).available_input();

        let fixed: u64 = components.iter().map(|c| c.tokens() as u64).sum();
        let used = fixed + retrieved_turns as u64 * avg_turn_tokens.max(1) as u64;
        let room = available.saturating_sub(used);

        let max_summaries = (room / target_summary_tokens.max(1) as u64) as usize;
        let soft_cap = (max_summaries as f64 * soft_cap_ratio.max(0.0)).floor() as usize;

        Budget {
            model: model.to_string(),
            available,
            used,
            room,
            max_summaries,
            soft_cap,
            retrieved_turns,
            avg_turn_tokens,
            target_summary_tokens,
            soft_cap_ratio,
        }
    }
}
