// crates/manifold-server/src/embeddings/mod.rs
// Embedding provider module

mod hashed;
mod ollama;
mod openai;

pub use self::hashed::HashedEmbeddings;
pub use self::ollama::OllamaEmbeddings;
pub use self::openai::OpenAiEmbeddings;

use crate::config::EmbeddingsConfig;
use crate::error::Result;
use tracing::info;

/// Backend-specific embedding implementation
enum EmbeddingBackend {
    OpenAi(OpenAiEmbeddings),
    Ollama(OllamaEmbeddings),
    Hashed(HashedEmbeddings),
}

/// Embedding client with automatic provider selection
///
/// Priority: explicit `MANIFOLD_EMBEDDING_MODEL` override, then OpenAI
/// (highest quality), then Ollama (local), then the deterministic
/// hashed backend (offline, always available).
pub struct EmbeddingClient {
    backend: EmbeddingBackend,
}

impl EmbeddingClient {
    /// Create a client from pre-loaded configuration. Always succeeds:
    /// the hashed backend needs no key and no network.
    pub fn from_config(config: &EmbeddingsConfig) -> Self {
        if let Some(model) = config.model.as_deref() {
            match model {
                "hashed" => return Self::hashed(),
                "openai" => {
                    if let Some(key) = config.openai_key.as_ref() {
                        return Self::openai(key.clone());
                    }
                    tracing::warn!(
                        "MANIFOLD_EMBEDDING_MODEL=openai but OPENAI_API_KEY is unset; \
                         falling back to automatic selection"
                    );
                }
                other if other == "ollama" || other.starts_with("ollama:") => {
                    if let Some(host) = config.ollama_host.as_ref() {
                        let model = other.strip_prefix("ollama:").map(String::from);
                        return Self::ollama(host.clone(), model);
                    }
                    tracing::warn!(
                        "MANIFOLD_EMBEDDING_MODEL requests ollama but OLLAMA_HOST is unset; \
                         falling back to automatic selection"
                    );
                }
                _ => {}
            }
        }

        if let Some(key) = config.openai_key.as_ref() {
            return Self::openai(key.clone());
        }
        if let Some(host) = config.ollama_host.as_ref() {
            return Self::ollama(host.clone(), None);
        }
        Self::hashed()
    }

    fn openai(api_key: String) -> Self {
        info!("Using OpenAI embeddings (text-embedding-3-small)");
        Self {
            backend: EmbeddingBackend::OpenAi(OpenAiEmbeddings::new(api_key)),
        }
    }

    fn ollama(host: String, model: Option<String>) -> Self {
        let client = OllamaEmbeddings::new(host, model);
        info!(
            model = client.model_name(),
            dimensions = client.dimensions(),
            "Using Ollama embeddings"
        );
        Self {
            backend: EmbeddingBackend::Ollama(client),
        }
    }

    /// Deterministic offline backend; also the backend tests inject.
    pub fn hashed() -> Self {
        Self {
            backend: EmbeddingBackend::Hashed(HashedEmbeddings::new()),
        }
    }

    /// Model identifier recorded in the capability cache. A mismatch
    /// at load time forces a full re-embed.
    pub fn model_id(&self) -> String {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => format!("openai:{}", c.model_name()),
            EmbeddingBackend::Ollama(c) => format!("ollama:{}", c.model_name()),
            EmbeddingBackend::Hashed(c) => c.model_id().to_string(),
        }
    }

    /// Embedding dimensions of the active backend
    pub fn dimensions(&self) -> usize {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.dimensions(),
            EmbeddingBackend::Ollama(c) => c.dimensions(),
            EmbeddingBackend::Hashed(c) => c.dimensions(),
        }
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed(text).await,
            EmbeddingBackend::Ollama(c) => c.embed(text).await,
            EmbeddingBackend::Hashed(c) => Ok(c.embed(text)),
        }
    }

    /// Embed multiple texts in batch (bulk indexing path)
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        match &self.backend {
            EmbeddingBackend::OpenAi(c) => c.embed_batch(texts).await,
            EmbeddingBackend::Ollama(c) => c.embed_batch(texts).await,
            EmbeddingBackend::Hashed(c) => Ok(texts.iter().map(|t| c.embed(t)).collect()),
        }
    }
}

/// Cosine similarity with a zero-vector fallback of 0.
///
/// Degenerate embeddings (all zeros) must stay indexable and simply
/// never rank, so the denominator guard returns 0 instead of NaN.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}
