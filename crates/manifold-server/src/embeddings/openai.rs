// crates/manifold-server/src/embeddings/openai.rs
// OpenAI embeddings API client

use crate::error::{ManifoldError, Result};
use serde::Deserialize;
use std::time::Duration;
use tracing::debug;

/// Embedding model used for capability descriptions
const MODEL: &str = "text-embedding-3-small";

/// Dimensions of text-embedding-3-small
const DIMENSIONS: usize = 1536;

/// Max characters to embed (truncate longer text)
const MAX_TEXT_CHARS: usize = 8000;

/// Max batch size per request
const MAX_BATCH_SIZE: usize = 256;

/// HTTP timeout
const TIMEOUT_SECS: u64 = 30;

/// Retry attempts
const RETRY_ATTEMPTS: usize = 2;

/// API endpoint
const API_URL: &str = "https://api.openai.com/v1/embeddings";

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

/// OpenAI embeddings client
pub struct OpenAiEmbeddings {
    api_key: String,
    http_client: reqwest::Client,
}

impl OpenAiEmbeddings {
    pub fn new(api_key: String) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            api_key,
            http_client,
        }
    }

    pub fn model_name(&self) -> &'static str {
        MODEL
    }

    pub fn dimensions(&self) -> usize {
        DIMENSIONS
    }

    /// Embed a single text
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut results = self.embed_with_retry(&[text.to_string()]).await?;
        results
            .pop()
            .ok_or_else(|| ManifoldError::Embedding("empty embedding response".into()))
    }

    /// Embed multiple texts in batch
    pub async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let chunks: Vec<&[String]> = texts.chunks(MAX_BATCH_SIZE).collect();
        if chunks.len() == 1 {
            return self.embed_with_retry(chunks[0]).await;
        }

        debug!(
            texts = texts.len(),
            batches = chunks.len(),
            "Embedding in parallel batches"
        );
        let futures: Vec<_> = chunks.iter().map(|c| self.embed_with_retry(c)).collect();
        let results = futures::future::join_all(futures).await;

        let mut all = Vec::with_capacity(texts.len());
        for result in results {
            all.extend(result?);
        }
        Ok(all)
    }

    async fn embed_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut last_error = None;
        for attempt in 0..=RETRY_ATTEMPTS {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            match self.embed_inner(texts).await {
                Ok(vectors) => return Ok(vectors),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| ManifoldError::Embedding("embedding request failed".into())))
    }

    async fn embed_inner(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let inputs: Vec<&str> = texts.iter().map(|t| truncate(t)).collect();
        let body = serde_json::json!({
            "model": MODEL,
            "input": inputs,
        });

        let response = self
            .http_client
            .post(API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(ManifoldError::Embedding(format!(
                "OpenAI API error {status}: {text}"
            )));
        }

        let parsed: EmbeddingResponse = response.json().await?;

        // Results carry an index field; sort to restore input order
        let mut indexed: Vec<(usize, Vec<f32>)> = parsed
            .data
            .into_iter()
            .map(|d| (d.index, d.embedding))
            .collect();
        indexed.sort_by_key(|(i, _)| *i);

        if indexed.len() != texts.len() {
            return Err(ManifoldError::Embedding(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                indexed.len()
            )));
        }

        Ok(indexed.into_iter().map(|(_, v)| v).collect())
    }
}

fn truncate(text: &str) -> &str {
    if text.len() > MAX_TEXT_CHARS {
        let mut end = MAX_TEXT_CHARS;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        &text[..end]
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncation() {
        let long_text = "a".repeat(10000);
        assert_eq!(truncate(&long_text).len(), MAX_TEXT_CHARS);
        assert_eq!(truncate("short"), "short");
    }

    #[test]
    fn test_truncation_respects_char_boundary() {
        let long_text = "é".repeat(MAX_TEXT_CHARS);
        let truncated = truncate(&long_text);
        assert!(truncated.len() <= MAX_TEXT_CHARS);
        assert!(long_text.is_char_boundary(truncated.len()));
    }
}
