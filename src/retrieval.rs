//! Adaptive retrieval pipeline (§4.7 "Adaptive retrieval (Search)")
//!
//! Rewrite, embed, fetch, score, expand, rerank: a staged pipeline in the
//! same shape as `write::WritePipeline`, backed by the two process-wide
//! caches in `cache::BoundedCache` and an outbound HTTP client for the
//! rewriter/reranker services, mirroring the teacher's `reqwest`-backed
//! adapters in `embedding::mod`.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cache::BoundedCache;
use crate::config::Config;
use crate::embedding::{self, EmbeddingAdapter, InputType};
use crate::error::{CapsuleError, Result};
use crate::recipe::{self, Recipe};
use crate::storage::{queries, Storage};
use crate::types::{SearchHit, SearchInput, SearchMetrics, SearchResponse, Tenancy, MAX_SEARCH_LIMIT};

pub struct RetrievalPipeline {
    storage: Storage,
    embedder: Arc<EmbeddingAdapter>,
    config: Config,
    client: reqwest::Client,
    rewrite_cache: BoundedCache<String, String>,
    hotset_cache: BoundedCache<String, Vec<crate::types::Memory>>,
}

impl RetrievalPipeline {
    pub fn new(storage: Storage, embedder: Arc<EmbeddingAdapter>, config: Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.embedding.timeout)
            .build()
            .unwrap_or_default();
        Self {
            rewrite_cache: BoundedCache::new(config.rewriter_cache_size, config.rewriter_ttl),
            hotset_cache: BoundedCache::new(config.hotset_size, config.hotset_ttl),
            storage,
            embedder,
            config,
            client,
        }
    }

    /// Run the adaptive search pipeline (§4.7 steps 1-10) using a named or default recipe
    pub async fn search(&self, tenancy: &Tenancy, input: SearchInput) -> Result<SearchResponse> {
        let recipe = recipe::resolve(input.recipe.as_deref());
        self.search_with_recipe(tenancy, input, recipe).await
    }

    /// Run the pipeline with a caller-supplied recipe, bypassing name resolution
    /// (§4.10 `POST /v1/memories/recipes/preview`)
    pub async fn search_with_recipe(&self, tenancy: &Tenancy, input: SearchInput, recipe: Recipe) -> Result<SearchResponse> {
        let start = Instant::now();
        if input.query.trim().is_empty() {
            return Err(CapsuleError::InvalidArgument("query must not be empty".to_string()));
        }
        let limit = input.limit.unwrap_or(recipe.limit).clamp(1, MAX_SEARCH_LIMIT);

        let (query, rewrite_applied, rewrite_latency_ms) =
            self.rewrite_query(&input, &start).await;

        let embedded = self.embedder.embed(&query, InputType::Query).await?;
        let mut query_vector = embedded.vector;
        embedding::l2_normalize(&mut query_vector);

        let candidates = self.fetch_candidates(tenancy, &recipe, limit)?;

        let mut results: Vec<SearchHit> = candidates
            .into_iter()
            .map(|memory| {
                let semantic = embedding::score_against(&query_vector, &memory.embedding);
                let recipe_score = recipe.score(
                    semantic,
                    memory.importance_score,
                    memory.recency_score,
                    memory.pinned,
                    memory.retention,
                );
                SearchHit {
                    memory,
                    score: semantic,
                    recipe_score,
                    graph_hit: false,
                }
            })
            .collect();

        // Stable sort: descending recipeScore, ties keep arrival order (§4.7 "Tie-breaks")
        results.sort_by(|a, b| b.recipe_score.total_cmp(&a.recipe_score));
        results.truncate(limit as usize);

        if let Some(graph_expand) = &recipe.graph_expand {
            self.expand_graph(tenancy, &mut results, graph_expand.limit)?;
        }

        let (rerank_applied, rerank_latency_ms) =
            self.rerank(&input, &query, &mut results, &start).await;

        tracing::info!(
            event = "recipe-usage",
            recipe = %recipe.name,
            candidates = results.len(),
            rewrite_applied,
            rerank_applied,
            "adaptive search recipe used"
        );
        tracing::info!(
            event = "vector-metrics",
            rewrite_latency_ms,
            rerank_latency_ms,
            total_latency_ms = start.elapsed().as_millis() as u64,
            "adaptive search vector metrics"
        );

        let explanation = format!(
            "recipe '{}' returned {} result(s){}",
            recipe.name,
            results.len(),
            if rewrite_applied { ", query rewritten" } else { "" }
        );

        Ok(SearchResponse {
            query,
            recipe: recipe.name,
            results,
            explanation,
            metrics: SearchMetrics {
                rewrite_applied,
                rewrite_latency_ms,
                rerank_applied,
                rerank_latency_ms,
            },
        })
    }

    /// §4.7 steps 1-2: rewrite decision and cache
    async fn rewrite_query(&self, input: &SearchInput, start: &Instant) -> (String, bool, u64) {
        let min_length = self.config.adaptive.rewrite.min_query_length;
        let forced = input.force_rewrite == Some(true);
        let eligible = self.config.adaptive.rewrite.enabled
            && input.force_rewrite != Some(false)
            && self.config.rewriter_url.is_some()
            && (forced || input.query.len() >= min_length)
            && (forced || start.elapsed().as_millis() as u64 <= self.config.adaptive.rewrite.latency_budget_ms);

        if !eligible {
            return (input.query.clone(), false, 0);
        }

        let cache_key = format!("{}\u{1}{}", input.prompt.as_deref().unwrap_or(""), input.query);
        let rewrite_start = Instant::now();
        let rewritten = match self.rewrite_cache.get(&cache_key) {
            Some(cached) => Some(cached),
            None => match self.call_rewriter(input.prompt.as_deref(), &input.query).await {
                Ok(Some(text)) => {
                    self.rewrite_cache.set(cache_key, text.clone());
                    Some(text)
                }
                Ok(None) => None,
                Err(err) => {
                    tracing::warn!(error = %err, "rewriter call failed, using original query");
                    None
                }
            },
        };
        let latency_ms = rewrite_start.elapsed().as_millis() as u64;

        match rewritten {
            Some(query) => (query, true, latency_ms),
            None => (input.query.clone(), false, latency_ms),
        }
    }

    /// Calls the rewriter; `Ok(None)` means the rewriter declined to rewrite
    /// (no `rewritten` field in its response), distinct from a call failure.
    async fn call_rewriter(&self, prompt: Option<&str>, query: &str) -> Result<Option<String>> {
        #[derive(Serialize)]
        struct RewriteRequest<'a> {
            prompt: Option<&'a str>,
            query: &'a str,
        }
        #[derive(Deserialize)]
        struct RewriteResponse {
            rewritten: Option<String>,
            #[allow(dead_code)]
            context: Option<String>,
        }

        let url = self
            .config
            .rewriter_url
            .as_ref()
            .ok_or_else(|| CapsuleError::Upstream("no rewriter configured".to_string()))?;
        let mut request = self.client.post(url).json(&RewriteRequest { prompt, query });
        if let Some(key) = &self.config.rewriter_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(CapsuleError::Http)?;
        if !response.status().is_success() {
            return Err(CapsuleError::Upstream(format!("rewriter returned {}", response.status())));
        }
        let body: RewriteResponse = response.json().await.map_err(CapsuleError::Http)?;
        Ok(body.rewritten)
    }

    /// §4.7 step 4: candidate fetch, hot-set cache, access gate, recipe filters
    fn fetch_candidates(&self, tenancy: &Tenancy, recipe: &Recipe, limit: i64) -> Result<Vec<crate::types::Memory>> {
        let candidate_limit = recipe.candidate_fetch_limit(limit);
        let cache_key = format!(
            "{}\u{1}{}\u{1}{}\u{1}{}",
            tenancy.org_id,
            tenancy.project_id,
            recipe.filter_signature(),
            candidate_limit
        );

        let fetched = match self.hotset_cache.get(&cache_key) {
            Some(cached) => cached,
            None => {
                let rows = self
                    .storage
                    .with_connection(|conn| queries::fetch_search_candidates(conn, tenancy, candidate_limit))?;
                self.hotset_cache.set(cache_key, rows.clone());
                rows
            }
        };

        Ok(fetched
            .into_iter()
            .filter(|m| m.accessible_to(&tenancy.subject_id))
            .filter(|m| !recipe.filters.pinned_only || m.pinned)
            .filter(|m| {
                recipe
                    .filters
                    .graph_enrich
                    .is_none_or(|want| m.storage.graph_enrich == Some(want))
            })
            .filter(|m| {
                recipe.filters.types.is_empty()
                    || m.memory_type.as_ref().is_some_and(|t| recipe.filters.types.iter().any(|want| want == t))
            })
            .collect())
    }

    /// §4.7 step 7: expand the result set into co-occurring graph entities
    fn expand_graph(&self, tenancy: &Tenancy, results: &mut Vec<SearchHit>, limit: usize) -> Result<()> {
        let base_ids: HashSet<Uuid> = results.iter().map(|h| h.memory.id).collect();
        let new_ids = crate::graph::expand(&self.storage, &tenancy.org_id, &tenancy.project_id, &base_ids, limit)?;

        for id in new_ids {
            if let Some(memory) = self.storage.with_connection(|conn| queries::get_memory(conn, id))? {
                if memory.accessible_to(&tenancy.subject_id) {
                    results.push(SearchHit {
                        memory,
                        score: 0.0,
                        recipe_score: 0.0,
                        graph_hit: true,
                    });
                }
            }
        }
        Ok(())
    }

    /// §4.7 step 8: rerank decision and call
    async fn rerank(&self, input: &SearchInput, query: &str, results: &mut [SearchHit], start: &Instant) -> (bool, u64) {
        let forced = input.force_rerank == Some(true);
        let eligible = self.config.adaptive.rerank.enabled
            && input.force_rerank != Some(false)
            && self.config.reranker_url.is_some()
            && (forced
                || (results.len() <= self.config.adaptive.rerank.max_results
                    && start.elapsed().as_millis() as u64 <= self.config.adaptive.rerank.latency_budget_ms));

        if !eligible {
            return (false, 0);
        }

        let rerank_start = Instant::now();
        match self.call_reranker(input.prompt.as_deref(), query, results).await {
            Ok(ranked) => {
                for hit in results.iter_mut() {
                    if let Some(score) = ranked.get(&hit.memory.id) {
                        hit.recipe_score = *score;
                    }
                }
                results.sort_by(|a, b| b.recipe_score.total_cmp(&a.recipe_score));
                (true, rerank_start.elapsed().as_millis() as u64)
            }
            Err(err) => {
                tracing::warn!(error = %err, "reranker call failed, keeping prior order");
                (false, rerank_start.elapsed().as_millis() as u64)
            }
        }
    }

    async fn call_reranker(
        &self,
        prompt: Option<&str>,
        query: &str,
        results: &[SearchHit],
    ) -> Result<std::collections::HashMap<Uuid, f32>> {
        #[derive(Serialize)]
        struct RerankCandidate<'a> {
            id: Uuid,
            content: &'a str,
            score: f32,
        }
        #[derive(Serialize)]
        struct RerankRequest<'a> {
            prompt: Option<&'a str>,
            query: &'a str,
            candidates: Vec<RerankCandidate<'a>>,
        }
        #[derive(Deserialize)]
        struct RankedEntry {
            id: Uuid,
            score: f32,
        }
        #[derive(Deserialize)]
        struct RerankResponse {
            ranked: Vec<RankedEntry>,
        }

        let url = self
            .config
            .reranker_url
            .as_ref()
            .ok_or_else(|| CapsuleError::Upstream("no reranker configured".to_string()))?;
        let candidates = results
            .iter()
            .map(|hit| RerankCandidate {
                id: hit.memory.id,
                content: &hit.memory.content,
                score: hit.recipe_score,
            })
            .collect();
        let mut request = self.client.post(url).json(&RerankRequest { prompt, query, candidates });
        if let Some(key) = &self.config.reranker_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(CapsuleError::Http)?;
        if !response.status().is_success() {
            return Err(CapsuleError::Upstream(format!("reranker returned {}", response.status())));
        }
        let body: RerankResponse = response.json().await.map_err(CapsuleError::Http)?;
        Ok(body.ranked.into_iter().map(|entry| (entry.id, entry.score)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::embedding::EmbeddingConfig;
    use crate::types::{Acl, CreateMemoryInput, Visibility};
    use crate::write::WritePipeline;

    fn test_config() -> Config {
        Config {
            max_memories: 100,
            capture_threshold: 0.5,
            ..Config::for_tests()
        }
    }

    async fn seeded() -> (RetrievalPipeline, Tenancy) {
        let storage = Storage::open_in_memory().unwrap();
        let embedder = Arc::new(EmbeddingAdapter::new(EmbeddingConfig::default()));
        let writer = WritePipeline::new(storage.clone(), embedder.clone(), EncryptionKey::insecure_default(), 100);
        let tenancy = Tenancy::new("org1", "proj1", "user1");

        writer
            .create(
                &tenancy,
                CreateMemoryInput {
                    content: "the user prefers dark mode in every editor".to_string(),
                    pinned: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        writer
            .create(
                &tenancy,
                CreateMemoryInput {
                    content: "weather today is sunny with light wind".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        (RetrievalPipeline::new(storage, embedder, test_config()), tenancy)
    }

    #[tokio::test]
    async fn pinned_memory_about_the_query_ranks_first() {
        let (pipeline, tenancy) = seeded().await;
        let response = pipeline
            .search(
                &tenancy,
                SearchInput {
                    query: "dark mode editor preference".to_string(),
                    limit: Some(5),
                    recipe: None,
                    prompt: None,
                    force_rewrite: Some(false),
                    force_rerank: Some(false),
                },
            )
            .await
            .unwrap();

        assert!(!response.results.is_empty());
        assert!(response.results[0].memory.content.contains("dark mode"));
        assert!(!response.metrics.rewrite_applied);
        assert!(!response.metrics.rerank_applied);
    }

    #[tokio::test]
    async fn empty_query_is_rejected() {
        let (pipeline, tenancy) = seeded().await;
        let err = pipeline
            .search(
                &tenancy,
                SearchInput {
                    query: "   ".to_string(),
                    limit: None,
                    recipe: None,
                    prompt: None,
                    force_rewrite: None,
                    force_rerank: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn search_excludes_memories_private_to_other_subjects() {
        let (pipeline, _tenancy) = seeded().await;
        let other = Tenancy::new("org1", "proj1", "someone-else");
        let response = pipeline
            .search(
                &other,
                SearchInput {
                    query: "dark mode editor preference".to_string(),
                    limit: Some(5),
                    recipe: None,
                    prompt: None,
                    force_rewrite: Some(false),
                    force_rerank: Some(false),
                },
            )
            .await
            .unwrap();
        assert!(response.results.is_empty());
    }

    #[tokio::test]
    async fn shared_memory_is_visible_to_other_subjects() {
        let storage = Storage::open_in_memory().unwrap();
        let embedder = Arc::new(EmbeddingAdapter::new(EmbeddingConfig::default()));
        let writer = WritePipeline::new(storage.clone(), embedder.clone(), EncryptionKey::insecure_default(), 100);
        let owner = Tenancy::new("org1", "proj1", "owner");
        writer
            .create(
                &owner,
                CreateMemoryInput {
                    content: "project roadmap for next quarter".to_string(),
                    acl: Some(Acl {
                        visibility: Visibility::Public,
                        subjects: vec![],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let pipeline = RetrievalPipeline::new(storage, embedder, test_config());
        let other = Tenancy::new("org1", "proj1", "someone-else");
        let response = pipeline
            .search(
                &other,
                SearchInput {
                    query: "project roadmap".to_string(),
                    limit: Some(5),
                    recipe: None,
                    prompt: None,
                    force_rewrite: Some(false),
                    force_rerank: Some(false),
                },
            )
            .await
            .unwrap();
        assert!(!response.results.is_empty());
    }
}
