//! Embedding adapter (§2, §4.1 step 2, §4.7 step 3, §6)
//!
//! Calls the configured embedding provider over HTTP; falls back to a
//! deterministic local embedding when no provider is configured or the call
//! fails, the same shape as the teacher's `OpenAIEmbedder`/`TfIdfEmbedder`
//! pair in `engram::embedding`.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CapsuleError, Result};
use crate::types::EMBEDDING_DIM;

/// `inputType` sent to the embedding provider (§6 wire format)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputType {
    Document,
    Query,
}

impl InputType {
    fn as_str(&self) -> &'static str {
        match self {
            InputType::Document => "document",
            InputType::Query => "query",
        }
    }
}

/// Embedding produced for a piece of text: the vector and the model that produced it
#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub model: String,
}

/// Embedding adapter configuration, sourced from `§6` environment variables
#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub provider_url: Option<String>,
    pub provider_key: Option<String>,
    pub model: String,
    pub dimensions: usize,
    pub timeout: Duration,
    pub allow_fallback: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider_url: None,
            provider_key: None,
            model: "capsule-embed-v1".to_string(),
            dimensions: EMBEDDING_DIM,
            timeout: Duration::from_millis(1200),
            allow_fallback: true,
        }
    }
}

#[derive(Deserialize)]
struct EmbeddingProviderResponse {
    data: Vec<EmbeddingProviderItem>,
}

#[derive(Deserialize)]
struct EmbeddingProviderItem {
    embedding: Vec<f32>,
}

/// Calls the embedding provider, degrading to a deterministic fallback (§4.1, §7)
pub struct EmbeddingAdapter {
    config: EmbeddingConfig,
    client: reqwest::Client,
    warned_fallback: std::sync::atomic::AtomicBool,
}

impl EmbeddingAdapter {
    pub fn new(config: EmbeddingConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            warned_fallback: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.config.dimensions
    }

    /// Generate an embedding for `text`, L2-normalizing the result (§4.1 step 2, §4.7 step 3)
    pub async fn embed(&self, text: &str, input_type: InputType) -> Result<EmbeddingResult> {
        if let Some(url) = self.config.provider_url.clone() {
            match self.call_provider(&url, text, input_type).await {
                Ok(vector) => {
                    return Ok(EmbeddingResult {
                        vector,
                        model: self.config.model.clone(),
                    })
                }
                Err(err) if self.config.allow_fallback => {
                    if !self.warned_fallback.swap(true, std::sync::atomic::Ordering::Relaxed) {
                        tracing::warn!(error = %err, "embedding provider call failed, using deterministic fallback");
                    }
                }
                Err(err) => return Err(err),
            }
        } else if !self.config.allow_fallback {
            return Err(CapsuleError::Upstream(
                "no embedding provider configured and fallback disabled".to_string(),
            ));
        }

        Ok(EmbeddingResult {
            vector: deterministic_embedding(text, self.config.dimensions),
            model: "deterministic-fallback-v1".to_string(),
        })
    }

    async fn call_provider(&self, url: &str, text: &str, input_type: InputType) -> Result<Vec<f32>> {
        let mut request = self.client.post(url).json(&serde_json::json!({
            "input": [text],
            "model": self.config.model,
            "inputType": input_type.as_str(),
        }));
        if let Some(key) = &self.config.provider_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(CapsuleError::Http)?;
        if !response.status().is_success() {
            return Err(CapsuleError::Upstream(format!(
                "embedding provider returned {}",
                response.status()
            )));
        }

        let body: EmbeddingProviderResponse = response.json().await.map_err(CapsuleError::Http)?;
        body.data
            .into_iter()
            .next()
            .map(|item| item.embedding)
            .ok_or_else(|| CapsuleError::Upstream("embedding provider returned no data".to_string()))
    }
}

/// Deterministic, dependency-free embedding used when no provider is
/// configured (§7 "a deterministic local embedding is used"). Uses hashed
/// bag-of-words feature hashing, the same technique as the teacher's
/// `TfIdfEmbedder`, sized to the production embedding dimension.
pub fn deterministic_embedding(text: &str, dimensions: usize) -> Vec<f32> {
    let mut embedding = vec![0.0f32; dimensions];
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|s| s.len() > 1)
        .collect();

    if tokens.is_empty() {
        return embedding;
    }

    for token in &tokens {
        let lower = token.to_lowercase();
        let idx = hash_token(&lower, dimensions);
        let sign = hash_sign(&lower);
        embedding[idx] += sign;
    }

    embedding
}

fn hash_token(token: &str, dimensions: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    token.hash(&mut hasher);
    (hasher.finish() as usize) % dimensions
}

fn hash_sign(token: &str) -> f32 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    format!("{token}_sign").hash(&mut hasher);
    if hasher.finish().is_multiple_of(2) {
        1.0
    } else {
        -1.0
    }
}

/// L2 norm of a vector
pub fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// L2-normalize a vector in place, returning its pre-normalization magnitude (§4.1 step 2)
pub fn l2_normalize(v: &mut [f32]) -> f32 {
    let norm = l2_norm(v);
    if norm > 0.0 {
        for x in v.iter_mut() {
            *x /= norm;
        }
    }
    norm
}

/// Cosine similarity between two equal-length, pre-normalized vectors (§4.7 step 5)
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Truncated dot-product compatibility shim for dimension-mismatched legacy
/// rows (§3 invariants, §4.7 "Dimension mismatch"). Divides by the shared
/// prefix length rather than re-computing a norm.
pub fn truncated_dot_product(a: &[f32], b: &[f32]) -> f32 {
    let len = a.len().min(b.len());
    if len == 0 {
        return 0.0;
    }
    let dot: f32 = a[..len].iter().zip(b[..len].iter()).map(|(x, y)| x * y).sum();
    dot / len as f32
}

/// Score a query embedding against a stored embedding, handling dimension
/// mismatch per §4.7 "Dimension mismatch".
pub fn score_against(query: &[f32], stored: &[f32]) -> f32 {
    if query.len() == stored.len() {
        cosine_similarity(query, stored)
    } else {
        truncated_dot_product(query, stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_basics() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![1.0, 0.0, 0.0];
        assert!((cosine_similarity(&a, &b) - 1.0).abs() < 1e-6);

        let c = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &c).abs() < 1e-6);
    }

    #[test]
    fn l2_normalize_unit_length() {
        let mut v = vec![3.0, 4.0];
        let norm = l2_normalize(&mut v);
        assert!((norm - 5.0).abs() < 1e-6);
        assert!((l2_norm(&v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn deterministic_embedding_is_stable() {
        let a = deterministic_embedding("hello world", 64);
        let b = deterministic_embedding("hello world", 64);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn dimension_mismatch_uses_truncated_dot_product() {
        let a = vec![1.0, 1.0, 1.0, 1.0];
        let b = vec![1.0, 1.0];
        let score = score_against(&a, &b);
        assert!((score - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn adapter_falls_back_without_provider() {
        let adapter = EmbeddingAdapter::new(EmbeddingConfig::default());
        let result = adapter.embed("hello", InputType::Document).await.unwrap();
        assert_eq!(result.vector.len(), EMBEDDING_DIM);
        assert_eq!(result.model, "deterministic-fallback-v1");
    }
}
