//! Token counting and USD cost estimation.
//!
//! Costs come from per-provider rate tables (USD per 1k tokens) with
//! optional per-setting overrides taken from [`CostMap`].

pub mod chat;
pub mod rates;
pub mod tokenizer;

use std::collections::HashMap;

use tracing::debug;

use crate::store::CostMap;

pub use self::chat::{ChatCompletionRequest, ChatMessage, FunctionDef};
pub use self::rates::{Category, Family, RateTable};
pub use self::tokenizer::{ClaudeTokenizer, Encoding, TokenCounter};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EstimatorError {
    #[error("no pricing for model {model} ({category:?})")]
    ModelUnknown { model: String, category: Category },
}

// MARK: - Estimator

pub struct Estimator {
    tables: HashMap<Family, RateTable>,
    counter: TokenCounter,
}

impl Default for Estimator {
    fn default() -> Self {
        Self::new()
    }
}

impl Estimator {
    pub fn new() -> Self {
        Self::with_counter(TokenCounter::default())
    }

    pub fn with_counter(counter: TokenCounter) -> Self {
        Self {
            tables: rates::default_tables(),
            counter,
        }
    }

    /// Tokens in `text` under the encoding `model` uses.
    pub fn count_tokens(&self, model: &str, text: &str) -> i64 {
        self.counter.count(Encoding::for_model(model), text)
    }

    /// Tokens under the Anthropic encoding, regardless of model.
    pub fn count_anthropic_tokens(&self, text: &str) -> i64 {
        self.counter.count(Encoding::Anthropic, text)
    }

    /// Whether `provider` has a rate table or the setting carries its own
    /// prices. Unpriced providers cost nothing without being an error.
    pub fn is_priced(&self, provider: &str, overrides: Option<&CostMap>) -> bool {
        Family::for_provider(provider) != Family::Unpriced || overrides.is_some_and(|o| !o.is_empty())
    }

    /// Per-1k-token rate for a model, honouring non-zero overrides.
    pub fn rate(
        &self,
        provider: &str,
        model: &str,
        category: Category,
        overrides: Option<&CostMap>,
    ) -> Result<f64, EstimatorError> {
        let family = Family::for_provider(provider);
        let table = self.tables.get(&family);
        let resolved = table.and_then(|t| rates::resolve(family, t, model));

        if let Some(overrides) = overrides {
            let bucket = match category {
                Category::Prompt => &overrides.prompt,
                Category::Completion => &overrides.completion,
                Category::Embeddings => &overrides.embeddings,
            };
            let hit = bucket
                .get(model)
                .or_else(|| resolved.as_deref().and_then(|r| bucket.get(r)))
                .copied()
                .filter(|v| *v > 0.0);
            if let Some(rate) = hit {
                return Ok(rate);
            }
        }

        resolved
            .as_deref()
            .zip(table)
            .and_then(|(name, t)| t.get(category, name))
            .ok_or_else(|| EstimatorError::ModelUnknown {
                model: model.to_string(),
                category,
            })
    }

    fn cost(
        &self,
        provider: &str,
        model: &str,
        category: Category,
        tokens: i64,
        overrides: Option<&CostMap>,
    ) -> Result<f64, EstimatorError> {
        let rate = self.rate(provider, model, category, overrides)?;
        Ok(tokens as f64 * rate / 1000.0)
    }

    pub fn prompt_cost(
        &self,
        provider: &str,
        model: &str,
        tokens: i64,
        overrides: Option<&CostMap>,
    ) -> Result<f64, EstimatorError> {
        self.cost(provider, model, Category::Prompt, tokens, overrides)
    }

    pub fn completion_cost(
        &self,
        provider: &str,
        model: &str,
        tokens: i64,
        overrides: Option<&CostMap>,
    ) -> Result<f64, EstimatorError> {
        self.cost(provider, model, Category::Completion, tokens, overrides)
    }

    pub fn embeddings_cost(
        &self,
        provider: &str,
        model: &str,
        tokens: i64,
        overrides: Option<&CostMap>,
    ) -> Result<f64, EstimatorError> {
        self.cost(provider, model, Category::Embeddings, tokens, overrides)
    }

    pub fn total_cost(
        &self,
        provider: &str,
        model: &str,
        prompt_tokens: i64,
        completion_tokens: i64,
        overrides: Option<&CostMap>,
    ) -> Result<f64, EstimatorError> {
        let prompt = self.prompt_cost(provider, model, prompt_tokens, overrides)?;
        let completion = self.completion_cost(provider, model, completion_tokens, overrides)?;
        let total = prompt + completion;
        debug!(
            provider,
            model,
            prompt_tokens,
            completion_tokens,
            cost_usd = %format!("${total:.6}"),
            "Estimated request cost"
        );
        Ok(total)
    }

    /// Prompt tokens and prompt cost of a chat-completion request, with
    /// OpenAI's message framing applied.
    pub fn chat_prompt_cost(
        &self,
        provider: &str,
        req: &ChatCompletionRequest,
        overrides: Option<&CostMap>,
    ) -> (i64, Result<f64, EstimatorError>) {
        let tokens = chat::prompt_tokens(req, &self.counter);
        (tokens, self.prompt_cost(provider, &req.model, tokens, overrides))
    }
}

// MARK: - Tests
