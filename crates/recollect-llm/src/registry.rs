use std::collections::HashMap;
use std::sync::Arc;

use recollect_core::{LLMError, LLMProvider};

/// Named text-generation providers. The summarizer resolves its provider by
/// model name, so several summarizer models can be configured side by side.
#[derive(Clone)]
pub struct LLMRegistry {
    providers: HashMap<String, Arc<dyn LLMProvider>>,
    default_alias: String,
}

impl std::fmt::Debug for LLMRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMRegistry")
            .field("providers", &self.providers.keys().collect::<Vec<_>>())
            .field("default_alias", &self.default_alias)
            .finish()
    }
}

impl LLMRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
            default_alias: "default".to_string(),
        }
    }

    pub fn register(&mut self, alias: impl Into<String>, provider: Arc<dyn LLMProvider>) {
        self.providers.insert(alias.into(), provider);
    }

    pub fn with_provider(mut self, alias: impl Into<String>, provider: Arc<dyn LLMProvider>) -> Self {
        self.register(alias, provider);
        self
    }

    pub fn set_default(&mut self, alias: impl Into<String>) {
        self.default_alias = alias.into();
    }

    pub fn get(&self, alias: &str) -> Result<Arc<dyn LLMProvider>, LLMError> {
        self.providers
            .get(alias)
            .cloned()
            .ok_or_else(|| LLMError::ModelNotFound(alias.to_string()))
    }

    pub fn default_provider(&self) -> Result<Arc<dyn LLMProvider>, LLMError> {
        self.get(&self.default_alias)
    }

    /// Provider for `alias`, or the default provider when the alias is unknown.
    pub fn resolve(&self, alias: &str) -> Result<Arc<dyn LLMProvider>, LLMError> {
        match self.providers.get(alias) {
            Some(provider) => Ok(provider.clone()),
            None => {
                tracing::warn!(alias, default = %self.default_alias, "LLM alias not registered, using default");
                self.default_provider()
            }
        }
    }

    pub fn has(&self, alias: &str) -> bool {
        self.providers.contains_key(alias)
    }

    pub fn aliases(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

impl Default for LLMRegistry {
    fn default() -> Self {
        Self::new()
    }
}
