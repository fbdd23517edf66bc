//! Decides how much long-term memory goes into the next prompt

use tracing::debug;

use recollect_core::{Result, SummaryRecord};
use recollect_memory::{
    AdaptiveSizeEstimator, Budget, PromptComponent, SummaryStore, TokenBudgetCalculator,
};

#[derive(Debug, Clone)]
pub struct PromptMemoryPlan {
    pub budget: Budget,
    /// Most recent first, at most `budget.soft_cap` of them.
    pub summaries: Vec<SummaryRecord>,
}

impl PromptMemoryPlan {
    /// Compaction threshold for the conversation, as seen by this prompt.
    pub fn soft_cap(&self) -> usize {
        self.budget.soft_cap
    }
}

#[derive(Clone)]
pub struct PromptMemoryPlanner {
    calculator: TokenBudgetCalculator,
    estimator: AdaptiveSizeEstimator,
    summaries: SummaryStore,
    fallback_turn_tokens: u32,
    target_summary_tokens: u32,
    soft_cap_ratio: f64,
}

impl PromptMemoryPlanner {
    pub fn new(
        calculator: TokenBudgetCalculator,
        estimator: AdaptiveSizeEstimator,
        summaries: SummaryStore,
        fallback_turn_tokens: u32,
        target_summary_tokens: u32,
        soft_cap_ratio: f64,
    ) -> Self {
        Self {
            calculator,
            estimator,
            summaries,
            fallback_turn_tokens,
            target_summary_tokens,
            soft_cap_ratio,
        }
    }

    /// Budget the prompt from the conversation's moving averages and pick
    /// the summaries to inject.
    pub async fn plan(
        &self,
        chat_id: &str,
        model: &str,
        components: &[PromptComponent],
        retrieved_turns: usize,
    ) -> Result<PromptMemoryPlan> {
        let avg_turn = self
            .estimator
            .avg_turn_tokens(chat_id, self.fallback_turn_tokens)
            .await;
        let avg_summary = self
            .estimator
            .avg_summary_tokens(chat_id, self.target_summary_tokens)
            .await;

        let budget = self.calculator.compute(
            model,
            components,
            retrieved_turns,
            avg_turn,
            avg_summary,
            self.soft_cap_ratio,
        );
        let summaries = self.summaries.fetch_recent(chat_id, budget.soft_cap).await?;

        debug!(
            chat_id,
            model,
            room = budget.room,
            soft_cap = budget.soft_cap,
            injected = summaries.len(),
            "Planned prompt memory"
        );
        Ok(PromptMemoryPlan { budget, summaries })
    }
}
