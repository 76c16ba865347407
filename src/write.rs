//! Write pipeline (§4.1 "Write pipeline (Create)")
//!
//! Orchestrates embedding, metadata normalization, policy evaluation,
//! retention classification, PII encryption, idempotent insert, and bounded
//! retention eviction, the same staged-pipeline shape as the teacher's
//! `tool_memory_create` in `bin/server.rs`, generalized to the tenancy model.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::crypto::{self, EncryptionKey};
use crate::embedding::{EmbeddingAdapter, InputType};
use crate::error::{CapsuleError, Result};
use crate::policy::{self, PolicyContext, StoragePolicy};
use crate::retention::{self, RetentionInputs};
use crate::storage::{queries, Storage};
use crate::types::{
    Acl, CreateMemoryInput, Memory, MutationOutcome, PiiField, ProvenanceEvent, StorageState,
    Tenancy, Visibility, MAX_TTL_SECONDS,
};

/// Outcome of a create call: distinguishes a genuinely new row from an
/// idempotency replay so the request surface can pick 201 vs 200 (§4.1 step 1, §7).
#[derive(Debug)]
pub enum CreateOutcome {
    Created(MutationOutcome),
    Replayed(MutationOutcome),
}

impl CreateOutcome {
    pub fn into_inner(self) -> MutationOutcome {
        match self {
            CreateOutcome::Created(o) | CreateOutcome::Replayed(o) => o,
        }
    }
}

/// Write pipeline dependencies (§2 "Write pipeline")
pub struct WritePipeline {
    storage: Storage,
    embedder: Arc<EmbeddingAdapter>,
    policies: Vec<StoragePolicy>,
    default_key: EncryptionKey,
    max_memories: i64,
}

impl WritePipeline {
    pub fn new(storage: Storage, embedder: Arc<EmbeddingAdapter>, default_key: EncryptionKey, max_memories: i64) -> Self {
        Self {
            storage,
            embedder,
            policies: policy::built_in_policies(),
            default_key,
            max_memories,
        }
    }

    /// Create a memory (§4.1, full numbered algorithm)
    pub async fn create(&self, tenancy: &Tenancy, input: CreateMemoryInput) -> Result<CreateOutcome> {
        if input.content.trim().is_empty() {
            return Err(CapsuleError::InvalidArgument("content must not be empty".to_string()));
        }
        if let Some(ttl) = input.ttl_seconds {
            if ttl <= 0 || ttl > MAX_TTL_SECONDS {
                return Err(CapsuleError::InvalidArgument(format!(
                    "ttlSeconds must be in (0, {MAX_TTL_SECONDS}]"
                )));
            }
        }

        // Step 1: idempotency replay
        if let Some(key) = &input.idempotency_key {
            if let Some(existing) = self.storage.with_connection(|conn| queries::find_by_idempotency_key(conn, tenancy, key))? {
                return Ok(CreateOutcome::Replayed(MutationOutcome {
                    memory: existing,
                    explanation: "replayed idempotent request.".to_string(),
                    forgotten_memory_id: None,
                }));
            }
        }

        // Step 2: embedding
        let embedding_result = self.embedder.embed(&input.content, InputType::Document).await?;
        let mut embedding = embedding_result.vector;
        let embedding_norm = crate::embedding::l2_normalize(&mut embedding);

        // Step 3: normalize metadata
        let tags = normalize_tags(input.tags.unwrap_or_default());
        let lang = resolve_lang(input.lang.as_deref(), &input.content);
        let source = input.source.unwrap_or_default();
        let acl = resolve_acl(input.acl)?;
        let pinned = input.pinned.unwrap_or(false);

        // Step 4: PII invariant
        let pii_sensitive = input.pii_flags.as_ref().map(|m| m.values().any(|v| *v)).unwrap_or(false);
        if pii_sensitive && acl.visibility != Visibility::Private {
            return Err(CapsuleError::InvalidArgument(
                "PII memories must remain private.".to_string(),
            ));
        }

        // Step 5: storage-policy evaluation + manual override
        let ctx = PolicyContext {
            memory_type: input.memory_type.as_deref(),
            source: &source,
            tags: &tags,
            pinned,
        };
        let mut decision = policy::evaluate(&self.policies, &ctx);
        if let Some(override_) = input.storage {
            if let Some(store) = override_.store {
                decision.store = store;
            }
            if let Some(ttl) = override_.ttl_seconds {
                decision.ttl_seconds = Some(ttl);
            }
            if let Some(graph_enrich) = override_.graph_enrich {
                decision.graph_enrich = Some(graph_enrich);
            }
            if let Some(dedupe) = override_.dedupe_threshold {
                decision.dedupe_threshold = Some(dedupe);
            }
            decision.applied_policies.push("manual-override".to_string());
        }

        // Step 6: retention classification
        let effective_ttl = input.ttl_seconds.or(decision.ttl_seconds);
        let retention = retention::resolve_retention(RetentionInputs {
            provided: input.retention,
            pinned,
            ttl_seconds: effective_ttl,
        });
        let ttl_seconds = retention::apply_retention_invariants(retention, effective_ttl);

        // Step 7: expiresAt
        let created_at = Utc::now();
        let expires_at = ttl_seconds.map(|ttl| created_at + chrono::Duration::seconds(ttl));

        // Step 8: importance/recency
        let importance_score = input
            .importance_score
            .or(decision.importance_score)
            .unwrap_or(if pinned { 1.5 } else { 1.0 })
            .clamp(0.0, 5.0);
        let recency_score = input.recency_score.unwrap_or(1.0).clamp(0.0, 5.0);

        // Step 9: PII encryption
        let pii = match input.pii_flags {
            Some(flags) if !flags.is_empty() => {
                let key = resolve_key(input.byok.as_deref(), &self.default_key)?;
                Some(PiiField::Encrypted(crypto::encrypt_flags(&flags, &key)?))
            }
            _ => None,
        };

        // Step 10: seed provenance
        let provenance = vec![ProvenanceEvent::new("created", Some(tenancy.subject_id.clone()))];

        let memory = Memory {
            id: Uuid::new_v4(),
            org_id: tenancy.org_id.clone(),
            project_id: tenancy.project_id.clone(),
            subject_id: tenancy.subject_id.clone(),
            content: input.content,
            embedding,
            embedding_norm,
            embedding_model: embedding_result.model,
            created_at,
            updated_at: created_at,
            pinned,
            tags,
            memory_type: input.memory_type,
            lang,
            importance_score,
            recency_score,
            acl,
            source,
            ttl_seconds,
            expires_at,
            idempotency_key: input.idempotency_key,
            provenance,
            pii,
            storage: StorageState {
                store: decision.store,
                policies: decision.applied_policies.clone(),
                graph_enrich: decision.graph_enrich,
                dedupe_threshold: decision.dedupe_threshold,
            },
            retention,
        };

        // Step 11: structured policy-decision log (content redacted)
        tracing::info!(
            memory_id = %memory.id,
            org_id = %tenancy.org_id,
            project_id = %tenancy.project_id,
            store = ?memory.storage.store,
            retention = ?memory.retention,
            applied_policies = ?memory.storage.policies,
            "policy-decision"
        );

        // Step 12: insert. A unique-constraint conflict means a concurrent
        // request with the same idempotency key won the race; replay its row
        // instead of surfacing an error (§7 `Conflict -> 200`).
        match self.storage.with_connection(|conn| queries::insert_memory(conn, &memory)) {
            Ok(()) => {}
            Err(CapsuleError::Conflict(_)) => {
                let key = memory
                    .idempotency_key
                    .as_deref()
                    .ok_or_else(|| CapsuleError::Internal("idempotency conflict without an idempotency key".to_string()))?;
                let winner = self
                    .storage
                    .with_connection(|conn| queries::find_by_idempotency_key(conn, tenancy, key))?
                    .ok_or_else(|| CapsuleError::Internal("idempotency conflict but no winning row found".to_string()))?;
                return Ok(CreateOutcome::Replayed(MutationOutcome {
                    memory: winner,
                    explanation: "replayed idempotent request.".to_string(),
                    forgotten_memory_id: None,
                }));
            }
            Err(err) => return Err(err),
        }

        // Step 13: retention enforcement
        let mut forgotten_memory_id = None;
        let mut explanation = "created.".to_string();
        match self.enforce_retention(tenancy) {
            Ok(Some(evicted_id)) => {
                forgotten_memory_id = Some(evicted_id);
                explanation = format!("created; evicted memory {evicted_id} to respect the tenancy limit.");
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(error = %err, "retention eviction failed, write still succeeds");
            }
        }

        // Step 14: graph job enqueue
        if memory.storage.graph_enrich == Some(true) {
            self.storage
                .with_connection(|conn| queries::upsert_graph_job(conn, tenancy, memory.id))?;
        }

        Ok(CreateOutcome::Created(MutationOutcome {
            memory,
            explanation,
            forgotten_memory_id,
        }))
    }

    /// Step 13: evict the lowest-priority unpinned memory if the tenancy is over its cap (§4.6).
    /// Count, scan, and delete run inside one transaction so a concurrent
    /// write can't slip in between the count and the delete.
    fn enforce_retention(&self, tenancy: &Tenancy) -> Result<Option<Uuid>> {
        self.storage.with_transaction(|conn| {
            let count = queries::count_for_tenancy(conn, tenancy)?;
            if count <= self.max_memories {
                return Ok(None);
            }

            let candidates = queries::eviction_scan_candidates(conn, tenancy, retention::EVICTION_SCAN_LIMIT as i64)?;
            let outcome = retention::pick_eviction_candidate(&candidates);

            match outcome.evicted_id {
                Some(id) => {
                    queries::delete_memory(conn, id)?;
                    Ok(Some(id))
                }
                None => {
                    tracing::warn!(org_id = %tenancy.org_id, project_id = %tenancy.project_id, "no eviction candidate found");
                    Ok(None)
                }
            }
        })
    }
}

/// Trim and deduplicate tags (§4.1 step 3)
pub fn normalize_tags(tags: Vec<String>) -> Vec<String> {
    let mut out = Vec::new();
    for tag in tags {
        let trimmed = tag.trim().to_string();
        if !trimmed.is_empty() && !out.contains(&trimmed) {
            out.push(trimmed);
        }
    }
    out
}

/// Resolve language: explicit lowercase override, else ASCII-ratio heuristic (§4.1 step 3)
pub fn resolve_lang(explicit: Option<&str>, content: &str) -> String {
    if let Some(lang) = explicit {
        return lang.to_lowercase();
    }
    if content.is_empty() {
        return "und".to_string();
    }
    let ascii_count = content.chars().filter(|c| c.is_ascii()).count();
    let ratio = ascii_count as f32 / content.chars().count() as f32;
    if ratio >= 0.75 {
        "en".to_string()
    } else {
        "und".to_string()
    }
}

/// Resolve ACL: default private; shared requires at least one subject (§4.1 step 3)
pub fn resolve_acl(acl: Option<Acl>) -> Result<Acl> {
    let acl = acl.unwrap_or_default();
    if acl.visibility == Visibility::Shared && acl.subjects.is_empty() {
        return Err(CapsuleError::InvalidArgument(
            "shared visibility requires at least one subject".to_string(),
        ));
    }
    Ok(acl)
}

/// Resolve the encryption key for a request: BYOK if supplied, else the process default (§4.1 step 9)
pub fn resolve_key(byok: Option<&str>, default_key: &EncryptionKey) -> Result<EncryptionKey> {
    match byok {
        Some(raw) => EncryptionKey::parse(raw),
        None => Ok(default_key.clone()),
    }
}

/// A caller-supplied PII flag map, keyed by flag name (§3)
pub type PiiFlags = HashMap<String, bool>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::EmbeddingConfig;

    fn pipeline() -> WritePipeline {
        WritePipeline::new(
            Storage::open_in_memory().unwrap(),
            Arc::new(EmbeddingAdapter::new(EmbeddingConfig::default())),
            EncryptionKey::insecure_default(),
            100,
        )
    }

    fn tenancy() -> Tenancy {
        Tenancy::new("org1", "proj1", "user1")
    }

    #[tokio::test]
    async fn pinned_create_is_irreplaceable_with_boosted_importance() {
        let pipeline = pipeline();
        let input = CreateMemoryInput {
            content: "Call me Lex during future conversations.".to_string(),
            pinned: Some(true),
            ..Default::default()
        };
        let outcome = pipeline.create(&tenancy(), input).await.unwrap().into_inner();
        assert_eq!(outcome.memory.retention, crate::types::Retention::Irreplaceable);
        assert_eq!(outcome.memory.importance_score, 1.5);
    }

    #[tokio::test]
    async fn idempotent_create_replays() {
        let pipeline = pipeline();
        let input = CreateMemoryInput {
            content: "Customer prefers morning meetings.".to_string(),
            idempotency_key: Some("k1".to_string()),
            ..Default::default()
        };
        let first = pipeline.create(&tenancy(), input.clone()).await.unwrap();
        let first_id = first.into_inner().memory.id;

        let second = pipeline.create(&tenancy(), input).await.unwrap();
        match second {
            CreateOutcome::Replayed(outcome) => {
                assert_eq!(outcome.memory.id, first_id);
                assert_eq!(outcome.explanation, "replayed idempotent request.");
            }
            CreateOutcome::Created(_) => panic!("expected a replay"),
        }
    }

    #[tokio::test]
    async fn pii_with_shared_visibility_is_rejected() {
        let pipeline = pipeline();
        let mut flags = HashMap::new();
        flags.insert("ssn".to_string(), true);
        let input = CreateMemoryInput {
            content: "addr".to_string(),
            pii_flags: Some(flags),
            acl: Some(Acl {
                visibility: Visibility::Shared,
                subjects: vec!["s2".to_string()],
            }),
            ..Default::default()
        };
        let err = pipeline.create(&tenancy(), input).await.unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn pii_with_private_visibility_succeeds() {
        let pipeline = pipeline();
        let mut flags = HashMap::new();
        flags.insert("ssn".to_string(), true);
        let input = CreateMemoryInput {
            content: "addr".to_string(),
            pii_flags: Some(flags),
            acl: Some(Acl {
                visibility: Visibility::Private,
                subjects: vec![],
            }),
            ..Default::default()
        };
        let outcome = pipeline.create(&tenancy(), input).await.unwrap().into_inner();
        assert!(matches!(outcome.memory.pii, Some(PiiField::Encrypted(_))));
    }

    #[tokio::test]
    async fn eviction_on_overflow_picks_lowest_priority() {
        let pipeline = WritePipeline::new(
            Storage::open_in_memory().unwrap(),
            Arc::new(EmbeddingAdapter::new(EmbeddingConfig::default())),
            EncryptionKey::insecure_default(),
            3,
        );
        let t = tenancy();
        let mut first_id = None;
        for i in 0..4 {
            let outcome = pipeline
                .create(
                    &t,
                    CreateMemoryInput {
                        content: format!("memory {i}"),
                        ..Default::default()
                    },
                )
                .await
                .unwrap()
                .into_inner();
            if i == 0 {
                first_id = Some(outcome.memory.id);
            }
            if i == 3 {
                assert_eq!(outcome.forgotten_memory_id, first_id);
            }
        }
    }
}
