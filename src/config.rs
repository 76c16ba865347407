//! Runtime configuration loaded from environment variables (§6)
//!
//! Mirrors the teacher's `clap` derive + `env` attribute approach in
//! `bin/server.rs::Args`, but sourced from a single `Config::from_env()`
//! entry point rather than a CLI-args struct, since the request surface has
//! no interactive CLI beyond the listen address.

use std::time::Duration;

use crate::embedding::EmbeddingConfig;
use crate::error::{CapsuleError, Result};
use crate::types::{DEFAULT_CAPTURE_THRESHOLD, DEFAULT_MAX_MEMORIES, EMBEDDING_DIM};

/// Adaptive rewrite/rerank budgets, loaded from `CAPSULE_ADAPTIVE_CONFIG` (§6, §9)
#[derive(Debug, Clone, serde::Deserialize)]
pub struct RewriteAdaptiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_query_length")]
    pub min_query_length: usize,
    #[serde(default = "default_rewrite_budget_ms")]
    pub latency_budget_ms: u64,
}

impl Default for RewriteAdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_query_length: default_min_query_length(),
            latency_budget_ms: default_rewrite_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct RerankAdaptiveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default = "default_rerank_budget_ms")]
    pub latency_budget_ms: u64,
}

impl Default for RerankAdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_results: default_max_results(),
            latency_budget_ms: default_rerank_budget_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct AdaptiveConfig {
    #[serde(default)]
    pub rewrite: RewriteAdaptiveConfig,
    #[serde(default)]
    pub rerank: RerankAdaptiveConfig,
}

fn default_true() -> bool {
    true
}
fn default_min_query_length() -> usize {
    8
}
fn default_rewrite_budget_ms() -> u64 {
    300
}
fn default_max_results() -> usize {
    50
}
fn default_rerank_budget_ms() -> u64 {
    400
}

/// Process-wide runtime configuration (§6 "Environment")
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: String,
    pub listen_addr: String,
    pub api_keys: Vec<String>,
    pub max_memories: i64,
    pub capture_threshold: f32,
    pub hotset_size: usize,
    pub hotset_ttl: Duration,
    pub vector_store: String,
    pub rewriter_url: Option<String>,
    pub rewriter_key: Option<String>,
    pub rewriter_ttl: Duration,
    pub rewriter_cache_size: usize,
    pub reranker_url: Option<String>,
    pub reranker_key: Option<String>,
    pub meta_encryption_key: Option<String>,
    pub graph_worker_interval: Duration,
    pub adaptive: AdaptiveConfig,
    pub embedding: EmbeddingConfig,
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment (§6)
    pub fn from_env() -> Result<Self> {
        let api_keys = env_opt_string("CAPSULE_API_KEYS")
            .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
            .unwrap_or_default();

        let vector_store = env_string("CAPSULE_VECTOR_STORE", "sqlite");
        if !matches!(vector_store.as_str(), "sqlite" | "mongo" | "pgvector" | "qdrant") {
            return Err(CapsuleError::Config(format!("unknown CAPSULE_VECTOR_STORE: {vector_store}")));
        }
        if vector_store != "sqlite" {
            tracing::warn!(
                store = %vector_store,
                "CAPSULE_VECTOR_STORE names an out-of-scope backend; only sqlite is functional (§6, §9)"
            );
        }

        let adaptive = match env_opt_string("CAPSULE_ADAPTIVE_CONFIG") {
            Some(path) => {
                let raw = std::fs::read_to_string(&path)?;
                serde_json::from_str(&raw)?
            }
            None => AdaptiveConfig::default(),
        };

        let embedding = EmbeddingConfig {
            provider_url: env_opt_string("CAPSULE_EMBEDDING_URL"),
            provider_key: env_opt_string("CAPSULE_EMBEDDING_KEY"),
            model: env_string("CAPSULE_EMBEDDING_MODEL", "capsule-embed-v1"),
            dimensions: env_parse("CAPSULE_EMBEDDING_DIMENSIONS", EMBEDDING_DIM),
            timeout: Duration::from_millis(env_parse("CAPSULE_OUTBOUND_TIMEOUT_MS", 1200)),
            allow_fallback: env_parse("CAPSULE_EMBEDDING_FALLBACK", true),
        };

        Ok(Self {
            db_path: env_string("CAPSULE_DB_PATH", "capsule-memory.db"),
            listen_addr: env_string("CAPSULE_LISTEN_ADDR", "0.0.0.0:8080"),
            api_keys,
            max_memories: env_parse("CAPSULE_MAX_MEMORIES", DEFAULT_MAX_MEMORIES as i64),
            capture_threshold: env_parse("CAPSULE_CAPTURE_THRESHOLD", DEFAULT_CAPTURE_THRESHOLD),
            hotset_size: env_parse("CAPSULE_HOTSET_SIZE", 50),
            hotset_ttl: Duration::from_secs(env_parse("CAPSULE_HOTSET_TTL", 30)),
            vector_store,
            rewriter_url: env_opt_string("CAPSULE_REWRITER_URL"),
            rewriter_key: env_opt_string("CAPSULE_REWRITER_KEY"),
            rewriter_ttl: Duration::from_secs(env_parse("CAPSULE_REWRITER_TTL", 30)),
            rewriter_cache_size: env_parse("CAPSULE_REWRITER_CACHE", 50),
            reranker_url: env_opt_string("CAPSULE_RERANKER_URL"),
            reranker_key: env_opt_string("CAPSULE_RERANKER_KEY"),
            meta_encryption_key: env_opt_string("CAPSULE_META_ENCRYPTION_KEY"),
            graph_worker_interval: Duration::from_millis(env_parse("CAPSULE_GRAPH_WORKER_INTERVAL", 5000)),
            adaptive,
            embedding,
        })
    }

    /// True if `key` is accepted: an empty configured list means anonymous access is allowed (§4.10, §6)
    pub fn accepts_key(&self, key: Option<&str>) -> bool {
        if self.api_keys.is_empty() {
            return true;
        }
        match key {
            Some(k) => self.api_keys.iter().any(|configured| configured == k),
            None => false,
        }
    }

    /// An in-memory, no-network configuration for tests outside this module.
    pub fn for_tests() -> Self {
        Self {
            db_path: ":memory:".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            api_keys: vec![],
            max_memories: DEFAULT_MAX_MEMORIES as i64,
            capture_threshold: DEFAULT_CAPTURE_THRESHOLD,
            hotset_size: 50,
            hotset_ttl: Duration::from_secs(30),
            vector_store: "sqlite".to_string(),
            rewriter_url: None,
            rewriter_key: None,
            rewriter_ttl: Duration::from_secs(30),
            rewriter_cache_size: 50,
            reranker_url: None,
            reranker_key: None,
            meta_encryption_key: None,
            graph_worker_interval: Duration::from_secs(5),
            adaptive: AdaptiveConfig::default(),
            embedding: EmbeddingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_key_list_allows_anonymous() {
        let config = Config {
            api_keys: vec![],
            ..test_config()
        };
        assert!(config.accepts_key(None));
        assert!(config.accepts_key(Some("anything")));
    }

    #[test]
    fn configured_keys_reject_unknown() {
        let config = Config {
            api_keys: vec!["valid-key".to_string()],
            ..test_config()
        };
        assert!(config.accepts_key(Some("valid-key")));
        assert!(!config.accepts_key(Some("wrong-key")));
        assert!(!config.accepts_key(None));
    }

    fn test_config() -> Config {
        Config::for_tests()
    }
}
