//! Storage-policy engine (§4.5)
//!
//! A policy is a declarative rule: it matches on write-time context and
//! produces a partial storage effect. Effects aggregate last-writer-wins
//! across a static, ordered policy list, the same aggregation shape as the
//! teacher's `storage-policy` tables in `engram::types::StorageConfig`.

use crate::types::{Retention, Source, Store};

/// Context a policy matches against (§4.1 step 5)
pub struct PolicyContext<'a> {
    pub memory_type: Option<&'a str>,
    pub source: &'a Source,
    pub tags: &'a [String],
    pub pinned: bool,
}

/// Partial effect a policy contributes (§4.5)
#[derive(Debug, Clone, Default)]
pub struct PolicyEffect {
    pub store: Option<Store>,
    /// `None` = untouched, `Some(None)` = explicit infinite TTL, `Some(Some(n))` = TTL seconds
    pub ttl_seconds: Option<Option<i64>>,
    pub graph_enrich: Option<bool>,
    pub dedupe_threshold: Option<f32>,
    pub importance_score: Option<f32>,
}

impl PolicyEffect {
    /// Merge `other` over `self`, last-writer-wins (§4.5)
    fn merge(mut self, other: PolicyEffect) -> Self {
        if other.store.is_some() {
            self.store = other.store;
        }
        if other.ttl_seconds.is_some() {
            self.ttl_seconds = other.ttl_seconds;
        }
        if other.graph_enrich.is_some() {
            self.graph_enrich = other.graph_enrich;
        }
        if other.dedupe_threshold.is_some() {
            self.dedupe_threshold = other.dedupe_threshold;
        }
        if other.importance_score.is_some() {
            self.importance_score = other.importance_score;
        }
        self
    }
}

/// A named storage policy rule (§4.5)
pub struct StoragePolicy {
    pub name: &'static str,
    pub summary: &'static str,
    matches: fn(&PolicyContext) -> bool,
    apply: fn(&PolicyContext) -> PolicyEffect,
}

impl StoragePolicy {
    pub fn matches(&self, ctx: &PolicyContext) -> bool {
        (self.matches)(ctx)
    }

    pub fn apply(&self, ctx: &PolicyContext) -> PolicyEffect {
        (self.apply)(ctx)
    }
}

fn preferences_match(ctx: &PolicyContext) -> bool {
    ctx.memory_type == Some("preference")
}

fn preferences_apply(_ctx: &PolicyContext) -> PolicyEffect {
    PolicyEffect {
        store: Some(Store::LongTerm),
        ttl_seconds: Some(None),
        graph_enrich: None,
        dedupe_threshold: Some(0.9),
        importance_score: Some(1.5),
    }
}

fn operational_logs_match(ctx: &PolicyContext) -> bool {
    ctx.memory_type == Some("log")
}

fn operational_logs_apply(_ctx: &PolicyContext) -> PolicyEffect {
    PolicyEffect {
        store: Some(Store::ShortTerm),
        ttl_seconds: Some(Some(14 * 86_400)),
        graph_enrich: Some(false),
        dedupe_threshold: None,
        importance_score: None,
    }
}

fn knowledge_connectors_match(ctx: &PolicyContext) -> bool {
    matches!(ctx.source.connector.as_deref(), Some("notion") | Some("drive"))
}

fn knowledge_connectors_apply(_ctx: &PolicyContext) -> PolicyEffect {
    PolicyEffect {
        store: Some(Store::LongTerm),
        ttl_seconds: None,
        graph_enrich: Some(true),
        dedupe_threshold: None,
        importance_score: None,
    }
}

/// Built-in policies, evaluated in this order (§4.5)
pub fn built_in_policies() -> Vec<StoragePolicy> {
    vec![
        StoragePolicy {
            name: "preferences-long-term",
            summary: "Preferences go to long-term storage, never expire, and dedupe aggressively",
            matches: preferences_match,
            apply: preferences_apply,
        },
        StoragePolicy {
            name: "operational-logs-short-term",
            summary: "Logs go to short-term storage with a 14-day TTL and no graph enrichment",
            matches: operational_logs_match,
            apply: operational_logs_apply,
        },
        StoragePolicy {
            name: "knowledge-connectors-long-term",
            summary: "Content ingested from Notion or Drive goes to long-term storage with graph enrichment",
            matches: knowledge_connectors_match,
            apply: knowledge_connectors_apply,
        },
    ]
}

/// Resolved storage decision after evaluating every matching policy (§4.5)
#[derive(Debug, Clone)]
pub struct PolicyDecision {
    pub store: Store,
    pub ttl_seconds: Option<i64>,
    pub graph_enrich: Option<bool>,
    pub dedupe_threshold: Option<f32>,
    pub importance_score: Option<f32>,
    pub applied_policies: Vec<String>,
}

/// Evaluate the ordered policy list over `ctx`, aggregating last-writer-wins (§4.5)
pub fn evaluate(policies: &[StoragePolicy], ctx: &PolicyContext) -> PolicyDecision {
    let mut effect = PolicyEffect::default();
    let mut applied = Vec::new();

    for policy in policies {
        if policy.matches(ctx) {
            effect = effect.merge(policy.apply(ctx));
            applied.push(policy.name.to_string());
        }
    }

    PolicyDecision {
        store: effect.store.unwrap_or_default(),
        ttl_seconds: effect.ttl_seconds.flatten(),
        graph_enrich: effect.graph_enrich.or(if applied.is_empty() { Some(false) } else { None }),
        dedupe_threshold: effect.dedupe_threshold,
        importance_score: effect.importance_score,
        applied_policies: applied,
    }
}

/// Priority used only for deciding eviction order when a retention class ties (§4.6), exported
/// here so the retention module doesn't need to duplicate the `Retention` import chain.
pub fn retention_priority(r: Retention) -> u8 {
    r.priority()
}
