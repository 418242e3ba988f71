// crates/manifold-server/src/config/env.rs
// Environment-based configuration - single source of truth for all env vars

use tracing::{debug, warn};

/// Embeddings configuration from environment variables
#[derive(Debug, Clone, Default)]
pub struct EmbeddingsConfig {
    /// Backend/model override (MANIFOLD_EMBEDDING_MODEL). Accepts
    /// "hashed", "openai", "ollama", or "ollama:<model>".
    pub model: Option<String>,
    /// OpenAI API key (OPENAI_API_KEY)
    pub openai_key: Option<String>,
    /// Ollama host (OLLAMA_HOST)
    pub ollama_host: Option<String>,
}

impl EmbeddingsConfig {
    pub fn from_env() -> Self {
        Self {
            model: read_var("MANIFOLD_EMBEDDING_MODEL"),
            openai_key: read_var("OPENAI_API_KEY"),
            ollama_host: read_var("OLLAMA_HOST"),
        }
    }

    /// Whether a network-backed embedding provider is configured.
    pub fn has_remote_backend(&self) -> bool {
        self.openai_key.is_some() || self.ollama_host.is_some()
    }
}

/// Environment configuration - all env vars in one place
#[derive(Debug, Clone)]
pub struct EnvConfig {
    /// Verbose diagnostics (MANIFOLD_DEBUG)
    pub debug: bool,
    /// Data/cache directory override (MANIFOLD_CACHE_DIR)
    pub cache_dir: Option<String>,
    /// Embedding backend selection
    pub embeddings: EmbeddingsConfig,
}

impl EnvConfig {
    /// Load all environment configuration (call once at startup)
    pub fn load() -> Self {
        let config = Self {
            debug: parse_bool_env("MANIFOLD_DEBUG").unwrap_or(false),
            cache_dir: read_var("MANIFOLD_CACHE_DIR"),
            embeddings: EmbeddingsConfig::from_env(),
        };
        debug!(
            debug = config.debug,
            cache_dir = ?config.cache_dir,
            "Environment configuration loaded"
        );
        config
    }

    /// Validate the configuration
    pub fn validate(&self) -> ConfigValidation {
        let mut validation = ConfigValidation::new();

        if !self.embeddings.has_remote_backend() {
            validation.add_warning(
                "No embedding API configured (OPENAI_API_KEY or OLLAMA_HOST). \
                 Using the deterministic local backend; ranking quality is reduced.",
            );
        }

        if let Some(ref model) = self.embeddings.model {
            let known = model == "hashed"
                || model == "openai"
                || model == "ollama"
                || model.starts_with("ollama:");
            if !known {
                validation.add_warning(format!(
                    "Unknown MANIFOLD_EMBEDDING_MODEL '{model}'. \
                     Valid options: hashed, openai, ollama, ollama:<model>"
                ));
            }
        }

        validation
    }
}

/// Configuration validation result
#[derive(Debug, Default)]
pub struct ConfigValidation {
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ConfigValidation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_warning(&mut self, msg: impl Into<String>) {
        self.warnings.push(msg.into());
    }

    pub fn add_error(&mut self, msg: impl Into<String>) {
        self.errors.push(msg.into());
    }

    /// Format as a human-readable report
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        if !self.errors.is_empty() {
            lines.push("Errors:".to_string());
            for err in &self.errors {
                lines.push(format!("  - {}", err));
            }
        }

        if !self.warnings.is_empty() {
            lines.push("Warnings:".to_string());
            for warn in &self.warnings {
                lines.push(format!("  - {}", warn));
            }
        }

        if lines.is_empty() {
            "Configuration OK".to_string()
        } else {
            lines.join("\n")
        }
    }

    pub fn log_warnings(&self) {
        for warning in &self.warnings {
            warn!("{}", warning);
        }
    }
}

fn read_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_bool_env(name: &str) -> Option<bool> {
    let value = std::env::var(name).ok()?.to_lowercase();
    match value.as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
