//! Recipe engine (§4.7)
//!
//! Unlike the storage-policy engine (§4.5), recipes are not static rules
//! matched against write-time context: they are named, data-driven scoring
//! configurations selected by name at search time, with the caller's own
//! recipe accepted only on the preview path (§9 "Dynamic-typed configuration").
//! The effect-merging shape still follows `policy::PolicyEffect` in spirit,
//! but a recipe resolves to exactly one scoring configuration rather than an
//! aggregate of matched rules.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::Retention;

/// Filters narrowing the candidate fetch before scoring (§4.7)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RecipeFilters {
    #[serde(default)]
    pub pinned_only: bool,
    pub graph_enrich: Option<bool>,
    #[serde(default)]
    pub types: Vec<String>,
}

/// Scoring weights applied to each candidate (§4.7)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecipeScoring {
    pub semantic_weight: f32,
    #[serde(default)]
    pub importance_weight: f32,
    #[serde(default)]
    pub recency_weight: f32,
    #[serde(default)]
    pub pinned_boost: f32,
    #[serde(default)]
    pub retention_boosts: HashMap<String, f32>,
}

impl RecipeScoring {
    fn retention_boost(&self, retention: Retention) -> f32 {
        let key = match retention {
            Retention::Irreplaceable => "irreplaceable",
            Retention::Permanent => "permanent",
            Retention::Replaceable => "replaceable",
            Retention::Ephemeral => "ephemeral",
        };
        self.retention_boosts.get(key).copied().unwrap_or(0.0)
    }
}

/// Graph expansion configuration attached to a recipe (§4.7, §4.9)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphExpandConfig {
    pub limit: usize,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// A named retrieval configuration: filters, candidate window, scoring
/// weights, optional graph expansion (GLOSSARY "Recipe")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recipe {
    pub name: String,
    pub label: String,
    pub description: String,
    pub limit: i64,
    pub candidate_limit: i64,
    #[serde(default)]
    pub filters: RecipeFilters,
    pub scoring: RecipeScoring,
    pub graph_expand: Option<GraphExpandConfig>,
}

impl Recipe {
    /// Candidate-fetch window size (§4.7 step 4): `max(candidateLimit, limit * 5)`
    pub fn candidate_fetch_limit(&self, requested_limit: i64) -> i64 {
        let limit = requested_limit.min(self.limit).max(1);
        self.candidate_limit.max(limit * 5)
    }

    /// `recipeScore` formula (§4.7 step 5)
    pub fn score(&self, semantic: f32, importance: f32, recency: f32, pinned: bool, retention: Retention) -> f32 {
        let mut score = semantic * self.scoring.semantic_weight
            + importance * self.scoring.importance_weight
            + recency * self.scoring.recency_weight
            + self.scoring.retention_boost(retention);
        if pinned {
            score += self.scoring.pinned_boost;
        }
        score
    }

    /// A stable signature identifying this recipe's filter shape, used as
    /// part of the hot-set cache key (§4.7 step 4, GLOSSARY "Hot-set cache")
    pub fn filter_signature(&self) -> String {
        let mut types = self.filters.types.clone();
        types.sort();
        format!(
            "pinned_only={}|graph_enrich={:?}|types={}",
            self.filters.pinned_only,
            self.filters.graph_enrich,
            types.join(",")
        )
    }

    /// Basic shape validation for caller-supplied recipes on the preview path
    /// (§9 "the recipe preview API ... should be validated before evaluation")
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("recipe name must not be empty".to_string());
        }
        if self.limit <= 0 {
            return Err("recipe limit must be positive".to_string());
        }
        if self.candidate_limit <= 0 {
            return Err("recipe candidateLimit must be positive".to_string());
        }
        if self.scoring.semantic_weight < 0.0 {
            return Err("recipe scoring.semanticWeight must be non-negative".to_string());
        }
        if let Some(expand) = &self.graph_expand {
            if expand.limit == 0 {
                return Err("recipe graphExpand.limit must be positive".to_string());
            }
        }
        Ok(())
    }
}

/// Default recipe used when a search request names no recipe (§4.7)
fn default_recipe() -> Recipe {
    Recipe {
        name: "default".to_string(),
        label: "Default".to_string(),
        description: "Balanced semantic search with a light importance and recency boost".to_string(),
        limit: 10,
        candidate_limit: 50,
        filters: RecipeFilters::default(),
        scoring: RecipeScoring {
            semantic_weight: 1.0,
            importance_weight: 0.15,
            recency_weight: 0.1,
            pinned_boost: 0.2,
            retention_boosts: HashMap::new(),
        },
        graph_expand: None,
    }
}

/// Tuned for reconstructing facts said about the user across a conversation
/// (§8 scenario 5): leans harder on semantic similarity and pinned/irreplaceable
/// memories, and expands into the co-occurrence graph to surface related facts.
fn conversation_memory_recipe() -> Recipe {
    let mut retention_boosts = HashMap::new();
    retention_boosts.insert("irreplaceable".to_string(), 0.3);
    retention_boosts.insert("permanent".to_string(), 0.15);

    Recipe {
        name: "conversation-memory".to_string(),
        label: "Conversation memory".to_string(),
        description: "Recalls what the user has told the assistant, boosting pinned and irreplaceable facts".to_string(),
        limit: 10,
        candidate_limit: 100,
        filters: RecipeFilters::default(),
        scoring: RecipeScoring {
            semantic_weight: 1.0,
            importance_weight: 0.25,
            recency_weight: 0.05,
            pinned_boost: 0.4,
            retention_boosts,
        },
        graph_expand: Some(GraphExpandConfig { limit: 5, depth: None }),
    }
}

/// Tuned for surfacing durable knowledge ingested from connectors, never
/// ephemeral operational chatter.
fn knowledge_base_recipe() -> Recipe {
    Recipe {
        name: "knowledge-base".to_string(),
        label: "Knowledge base".to_string(),
        description: "Searches long-lived, graph-enriched knowledge, ignoring ephemeral memories".to_string(),
        limit: 10,
        candidate_limit: 80,
        filters: RecipeFilters {
            pinned_only: false,
            graph_enrich: Some(true),
            types: Vec::new(),
        },
        scoring: RecipeScoring {
            semantic_weight: 1.0,
            importance_weight: 0.1,
            recency_weight: 0.0,
            pinned_boost: 0.0,
            retention_boosts: HashMap::new(),
        },
        graph_expand: Some(GraphExpandConfig { limit: 10, depth: None }),
    }
}

/// Built-in named recipes (GLOSSARY "Recipe", §8 scenario 5)
pub fn built_in_recipes() -> Vec<Recipe> {
    vec![default_recipe(), conversation_memory_recipe(), knowledge_base_recipe()]
}

/// Resolve a recipe by name from the built-in registry, falling back to the
/// default recipe when `name` is absent or unknown (§4.7)
pub fn resolve(name: Option<&str>) -> Recipe {
    match name {
        Some(name) => built_in_recipes()
            .into_iter()
            .find(|r| r.name == name)
            .unwrap_or_else(default_recipe),
        None => default_recipe(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_recipe_resolves_when_name_absent() {
        let recipe = resolve(None);
        assert_eq!(recipe.name, "default");
    }

    #[test]
    fn unknown_name_falls_back_to_default() {
        let recipe = resolve(Some("does-not-exist"));
        assert_eq!(recipe.name, "default");
    }

    #[test]
    fn conversation_memory_boosts_pinned_and_irreplaceable() {
        let recipe = resolve(Some("conversation-memory"));
        let pinned_score = recipe.score(0.8, 1.5, 1.0, true, Retention::Irreplaceable);
        let unpinned_score = recipe.score(0.8, 1.0, 1.0, false, Retention::Replaceable);
        assert!(pinned_score > unpinned_score);
    }

    #[test]
    fn candidate_fetch_limit_uses_larger_of_candidate_limit_or_limit_times_five() {
        let recipe = default_recipe();
        assert_eq!(recipe.candidate_fetch_limit(3), 50);
        let mut wide = recipe.clone();
        wide.candidate_limit = 5;
        assert_eq!(wide.candidate_fetch_limit(20), 50);
    }

    #[test]
    fn validate_rejects_non_positive_limit() {
        let mut recipe = default_recipe();
        recipe.limit = 0;
        assert!(recipe.validate().is_err());
    }

    #[test]
    fn filter_signature_is_stable_regardless_of_type_order() {
        let mut a = default_recipe();
        a.filters.types = vec!["b".to_string(), "a".to_string()];
        let mut b = default_recipe();
        b.filters.types = vec!["a".to_string(), "b".to_string()];
        assert_eq!(a.filter_signature(), b.filter_signature());
    }
}
