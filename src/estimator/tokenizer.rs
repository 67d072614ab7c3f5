//! BPE selection and token counting.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tiktoken_rs::CoreBPE;

/// Encoding families the gateway ships.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Modern OpenAI/Azure chat and embedding models.
    Cl100k,
    /// Legacy GPT-3 completions and first-generation embeddings.
    R50k,
    /// Claude models. Counted with the Claude BPE when one is loaded,
    /// cl100k otherwise.
    Anthropic,
}

const R50K_PREFIXES: &[&str] = &[
    "ada",
    "babbage",
    "curie",
    "davinci",
    "text-ada",
    "text-babbage",
    "text-curie",
    "text-davinci",
    "text-similarity",
    "text-search",
    "code-search",
];

impl Encoding {
    pub fn for_model(model: &str) -> Self {
        let model = model.strip_prefix("ft:").unwrap_or(model);
        if model.starts_with("claude") || model.starts_with("anthropic.") {
            Self::Anthropic
        } else if R50K_PREFIXES.iter().any(|p| model.starts_with(p)) {
            Self::R50k
        } else {
            Self::Cl100k
        }
    }

    fn bpe(self) -> &'static CoreBPE {
        match self {
            Self::Cl100k | Self::Anthropic => tiktoken_rs::cl100k_base_singleton(),
            Self::R50k => tiktoken_rs::r50k_base_singleton(),
        }
    }

    /// Count with the bundled tiktoken tables only.
    pub fn count(self, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        self.bpe().encode_with_special_tokens(text).len() as i64
    }
}

/// Load the BPE tables outside the request path.
pub fn preload() {
    let _ = tiktoken_rs::cl100k_base_singleton();
    let _ = tiktoken_rs::r50k_base_singleton();
}

// MARK: - Claude BPE

#[derive(Debug, thiserror::Error)]
pub enum TokenizerError {
    #[error("failed to download {file} from {repo}: {message}")]
    Download {
        repo: String,
        file: String,
        message: String,
    },
    #[error("failed to load tokenizer from {path}: {message}")]
    Load { path: PathBuf, message: String },
}

/// Anthropic's own BPE, in Hugging Face `tokenizer.json` form.
pub struct ClaudeTokenizer {
    inner: tokenizers::Tokenizer,
}

impl ClaudeTokenizer {
    /// Hub repository holding Anthropic's published Claude tokenizer.
    pub const DEFAULT_REPO: &'static str = "Xenova/claude-tokenizer";

    pub fn from_file(path: &Path) -> Result<Self, TokenizerError> {
        let inner = tokenizers::Tokenizer::from_file(path).map_err(|e| TokenizerError::Load {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self { inner })
    }

    /// Fetch `tokenizer.json` from the hub (cached on disk) and load it.
    pub async fn from_hub(repo: &str, cache_dir: Option<&Path>) -> Result<Self, TokenizerError> {
        use hf_hub::api::tokio::{Api, ApiBuilder};

        let download = |message: String| TokenizerError::Download {
            repo: repo.to_string(),
            file: "tokenizer.json".to_string(),
            message,
        };
        let api = match cache_dir {
            Some(dir) => ApiBuilder::new().with_cache_dir(dir.to_path_buf()).build(),
            None => Api::new(),
        }
        .map_err(|e| download(e.to_string()))?;

        let path = api
            .model(repo.to_string())
            .get("tokenizer.json")
            .await
            .map_err(|e| download(e.to_string()))?;
        Self::from_file(&path)
    }

    pub fn count(&self, text: &str) -> i64 {
        match self.inner.encode(text, false) {
            Ok(encoding) => encoding.get_ids().len() as i64,
            Err(e) => {
                tracing::warn!(error = %e, "Claude tokenizer failed; counting with cl100k");
                Encoding::Cl100k.count(text)
            }
        }
    }
}

/// Token counting across every encoding, including the Claude BPE when
/// one has been loaded.
#[derive(Clone, Default)]
pub struct TokenCounter {
    claude: Option<Arc<ClaudeTokenizer>>,
}

impl TokenCounter {
    pub fn with_claude(claude: ClaudeTokenizer) -> Self {
        Self {
            claude: Some(Arc::new(claude)),
        }
    }

    pub fn has_claude(&self) -> bool {
        self.claude.is_some()
    }

    pub fn count(&self, encoding: Encoding, text: &str) -> i64 {
        if text.is_empty() {
            return 0;
        }
        match (encoding, &self.claude) {
            (Encoding::Anthropic, Some(claude)) => claude.count(text),
            _ => encoding.count(text),
        }
    }
}
