//! Default rate tables.
//!
//! Prices are in USD per 1k tokens, split by category. Model names are
//! resolved to a table entry by exact match first, then by the longest
//! table entry the model extends at a `-` boundary.

use std::collections::HashMap;

// MARK: - Types

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Prompt,
    Completion,
    Embeddings,
}

/// Which rate table a provider draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    OpenAi,
    Anthropic,
    DeepInfra,
    /// Self-hosted or user-defined upstreams; priced only via overrides.
    Unpriced,
}

impl Family {
    pub fn for_provider(provider: &str) -> Self {
        match provider {
            "openai" | "azure" => Self::OpenAi,
            "anthropic" | "bedrock" => Self::Anthropic,
            "deepinfra" => Self::DeepInfra,
            _ => Self::Unpriced,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RateTable {
    prompt: HashMap<&'static str, f64>,
    completion: HashMap<&'static str, f64>,
    embeddings: HashMap<&'static str, f64>,
}

impl RateTable {
    fn category(&self, category: Category) -> &HashMap<&'static str, f64> {
        match category {
            Category::Prompt => &self.prompt,
            Category::Completion => &self.completion,
            Category::Embeddings => &self.embeddings,
        }
    }

    pub fn get(&self, category: Category, model: &str) -> Option<f64> {
        self.category(category).get(model).copied()
    }

    /// Every model name the table prices, across categories.
    fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.prompt
            .keys()
            .chain(self.completion.keys())
            .chain(self.embeddings.keys())
            .copied()
    }
}

// MARK: - Resolution

/// Map a request model name onto the table entry it is priced as.
pub fn resolve(family: Family, table: &RateTable, model: &str) -> Option<String> {
    let model = normalize(family, model);
    if table.names().any(|n| n == model) {
        return Some(model);
    }

    let best = table
        .names()
        .filter(|name| {
            model.len() > name.len()
                && model.starts_with(name)
                && matches!(model.as_bytes()[name.len()], b'-' | b'.' | b'@' | b':')
        })
        .max_by_key(|name| name.len());
    if let Some(name) = best {
        return Some(name.to_string());
    }

    if family == Family::Anthropic && model.starts_with("claude") {
        let collapsed = if model.starts_with("claude-instant") {
            "claude-instant"
        } else {
            "claude"
        };
        return Some(collapsed.to_string());
    }
    None
}

fn normalize(family: Family, model: &str) -> String {
    match family {
        Family::OpenAi => {
            // Fine-tuned ids look like `ft:gpt-3.5-turbo:org:suffix:id`.
            let model = match model.strip_prefix("ft:") {
                Some(rest) => rest.split(':').next().unwrap_or(rest),
                None => model,
            };
            // Azure deployment names drop the dot.
            model.replace("gpt-35", "gpt-3.5")
        }
        Family::Anthropic => model.strip_prefix("anthropic.").unwrap_or(model).to_string(),
        _ => model.to_string(),
    }
}

// MARK: - Tables

pub fn default_tables() -> HashMap<Family, RateTable> {
    let mut tables = HashMap::new();
    tables.insert(Family::OpenAi, openai());
    tables.insert(Family::Anthropic, anthropic());
    tables.insert(Family::DeepInfra, deepinfra());
    tables.insert(Family::Unpriced, RateTable::default());
    tables
}

fn openai() -> RateTable {
    let prompt = HashMap::from([
        ("gpt-4o", 0.005),
        ("gpt-4o-mini", 0.00015),
        ("gpt-4-turbo", 0.01),
        ("gpt-4-1106-preview", 0.01),
        ("gpt-4-0125-preview", 0.01),
        ("gpt-4-vision-preview", 0.01),
        ("gpt-4", 0.03),
        ("gpt-4-32k", 0.06),
        ("gpt-3.5-turbo", 0.0015),
        ("gpt-3.5-turbo-16k", 0.003),
        ("gpt-3.5-turbo-1106", 0.001),
        ("gpt-3.5-turbo-0125", 0.0005),
        ("gpt-3.5-turbo-instruct", 0.0015),
        ("davinci-002", 0.002),
        ("babbage-002", 0.0004),
    ]);
    let completion = HashMap::from([
        ("gpt-4o", 0.015),
        ("gpt-4o-mini", 0.0006),
        ("gpt-4-turbo", 0.03),
        ("gpt-4-1106-preview", 0.03),
        ("gpt-4-0125-preview", 0.03),
        ("gpt-4-vision-preview", 0.03),
        ("gpt-4", 0.06),
        ("gpt-4-32k", 0.12),
        ("gpt-3.5-turbo", 0.002),
        ("gpt-3.5-turbo-16k", 0.004),
        ("gpt-3.5-turbo-1106", 0.002),
        ("gpt-3.5-turbo-0125", 0.0015),
        ("gpt-3.5-turbo-instruct", 0.002),
        ("davinci-002", 0.002),
        ("babbage-002", 0.0004),
    ]);
    let embeddings = HashMap::from([
        ("text-embedding-ada-002", 0.0001),
        ("text-embedding-3-small", 0.00002),
        ("text-embedding-3-large", 0.00013),
    ]);
    RateTable {
        prompt,
        completion,
        embeddings,
    }
}

fn anthropic() -> RateTable {
    let prompt = HashMap::from([
        ("claude-instant", 0.00163),
        ("claude", 0.01102),
        ("claude-3-haiku", 0.00025),
        ("claude-3-sonnet", 0.003),
        ("claude-3-5-sonnet", 0.003),
        ("claude-3-opus", 0.015),
    ]);
    let completion = HashMap::from([
        ("claude-instant", 0.00551),
        ("claude", 0.03268),
        ("claude-3-haiku", 0.00125),
        ("claude-3-sonnet", 0.015),
        ("claude-3-5-sonnet", 0.015),
        ("claude-3-opus", 0.075),
    ]);
    RateTable {
        prompt,
        completion,
        embeddings: HashMap::new(),
    }
}

fn deepinfra() -> RateTable {
    let prompt = HashMap::from([
        ("meta-llama/Llama-2-70b-chat-hf", 0.0007),
        ("meta-llama/Llama-2-13b-chat-hf", 0.00022),
        ("meta-llama/Llama-2-7b-chat-hf", 0.00013),
        ("meta-llama/Meta-Llama-3-8B-Instruct", 0.00008),
        ("meta-llama/Meta-Llama-3-70B-Instruct", 0.00059),
        ("mistralai/Mistral-7B-Instruct-v0.1", 0.00013),
        ("mistralai/Mixtral-8x7B-Instruct-v0.1", 0.00027),
        ("codellama/CodeLlama-34b-Instruct-hf", 0.0006),
    ]);
    let completion = HashMap::from([
        ("meta-llama/Llama-2-70b-chat-hf", 0.0009),
        ("meta-llama/Llama-2-13b-chat-hf", 0.00022),
        ("meta-llama/Llama-2-7b-chat-hf", 0.00013),
        ("meta-llama/Meta-Llama-3-8B-Instruct", 0.00008),
        ("meta-llama/Meta-Llama-3-70B-Instruct", 0.00079),
        ("mistralai/Mistral-7B-Instruct-v0.1", 0.00013),
        ("mistralai/Mixtral-8x7B-Instruct-v0.1", 0.00027),
        ("codellama/CodeLlama-34b-Instruct-hf", 0.0006),
    ]);
    let embeddings = HashMap::from([
        ("BAAI/bge-large-en-v1.5", 0.00001),
        ("BAAI/bge-base-en-v1.5", 0.000005),
        ("sentence-transformers/all-MiniLM-L6-v2", 0.000005),
    ]);
    RateTable {
        prompt,
        completion,
        embeddings,
    }
}

// MARK: - Tests

#[cfg(test)]
mod tests {
    use super::*;

    fn resolve_openai(model: &str) -> Option<String> {
        resolve(Family::OpenAi, &openai(), model)
    }

    fn resolve_anthropic(model: &str) -> Option<String> {
        resolve(Family::Anthropic, &anthropic(), model)
    }

    #[test]
    fn test_openai_exact_and_dated() {
        assert_eq!(resolve_openai("gpt-4").as_deref(), Some("gpt-4"));
        assert_eq!(resolve_openai("gpt-4-0613").as_deref(), Some("gpt-4"));
        assert_eq!(resolve_openai("gpt-4-32k-0613").as_deref(), Some("gpt-4-32k"));
        assert_eq!(resolve_openai("gpt-4o-2024-05-13").as_deref(), Some("gpt-4o"));
        assert_eq!(resolve_openai("gpt-4o-mini").as_deref(), Some("gpt-4o-mini"));
        assert_eq!(
            resolve_openai("gpt-3.5-turbo-0613").as_deref(),
            Some("gpt-3.5-turbo")
        );
    }

    #[test]
    fn test_openai_azure_and_finetune_names() {
        assert_eq!(resolve_openai("gpt-35-turbo").as_deref(), Some("gpt-3.5-turbo"));
        assert_eq!(
            resolve_openai("ft:gpt-3.5-turbo-0613:acme::7p4lURel").as_deref(),
            Some("gpt-3.5-turbo")
        );
    }

    #[test]
    fn test_openai_unknown() {
        assert_eq!(resolve_openai("llama-2"), None);
        // No boundary: "gpt-4x" is not a gpt-4 variant.
        assert_eq!(resolve_openai("gpt-4x"), None);
    }

    #[test]
    fn test_claude_collapse() {
        assert_eq!(
            resolve_anthropic("claude-instant-1.2").as_deref(),
            Some("claude-instant")
        );
        assert_eq!(resolve_anthropic("claude-2.1").as_deref(), Some("claude"));
        assert_eq!(
            resolve_anthropic("claude-3-opus-20240229").as_deref(),
            Some("claude-3-opus")
        );
        assert_eq!(
            resolve_anthropic("anthropic.claude-3-sonnet-20240229-v1:0").as_deref(),
            Some("claude-3-sonnet")
        );
        assert_eq!(resolve_anthropic("anthropic.claude-v2").as_deref(), Some("claude"));
        assert_eq!(resolve_anthropic("gpt-4"), None);
    }

    #[test]
    fn test_family_for_provider() {
        assert_eq!(Family::for_provider("azure"), Family::OpenAi);
        assert_eq!(Family::for_provider("bedrock"), Family::Anthropic);
        assert_eq!(Family::for_provider("acme"), Family::Unpriced);
    }
}
