//! Update pipeline (§4.2 "Update pipeline")
//!
//! Partial mutation by id within the caller's tenancy, re-checking the PII/ACL
//! invariant and recomputing retention only when a field that can affect it
//! actually changed, the same staged-pipeline shape as `write::WritePipeline`.

use chrono::Utc;
use uuid::Uuid;

use crate::crypto::{self, EncryptionKey};
use crate::error::{CapsuleError, Result};
use crate::retention::{self, RetentionInputs};
use crate::storage::{queries, Storage};
use crate::types::{MutationOutcome, PiiField, ProvenanceEvent, Tenancy, UpdateMemoryInput, Visibility};
use crate::write::{normalize_tags, resolve_acl, resolve_key};

/// True if the update turns graph enrichment on for a memory that previously
/// didn't have it (§4.2 "graph enrichment transitions false -> true").
fn enables_graph_enrich(before: Option<bool>, input: Option<bool>) -> bool {
    input == Some(true) && before != Some(true)
}

/// Update pipeline dependencies (§2 "Update pipeline")
pub struct UpdatePipeline {
    storage: Storage,
    default_key: EncryptionKey,
}

impl UpdatePipeline {
    pub fn new(storage: Storage, default_key: EncryptionKey) -> Self {
        Self { storage, default_key }
    }

    /// Partially update a memory (§4.2)
    pub async fn update(&self, tenancy: &Tenancy, id: Uuid, input: UpdateMemoryInput) -> Result<MutationOutcome> {
        let existing = self
            .storage
            .with_connection(|conn| queries::get_memory(conn, id))?
            .filter(|m| m.tenancy() == *tenancy)
            .ok_or_else(|| CapsuleError::NotFound(format!("memory {id} not found")))?;

        if is_empty(&input) {
            return Ok(MutationOutcome {
                memory: existing,
                explanation: "No changes applied.".to_string(),
                forgotten_memory_id: None,
            });
        }

        let mut memory = existing.clone();

        if let Some(content) = input.content {
            memory.content = content;
        }
        if let Some(pinned) = input.pinned {
            memory.pinned = pinned;
        }
        if let Some(tags) = input.tags {
            memory.tags = normalize_tags(tags.unwrap_or_default());
        }
        if let Some(memory_type) = input.memory_type {
            memory.memory_type = memory_type;
        }
        if let Some(importance) = input.importance_score {
            memory.importance_score = importance.clamp(0.0, 5.0);
        }
        if let Some(recency) = input.recency_score {
            memory.recency_score = recency.clamp(0.0, 5.0);
        }
        if let Some(acl) = input.acl {
            memory.acl = resolve_acl(Some(acl))?;
        }
        let graph_enrich_enabled = enables_graph_enrich(memory.storage.graph_enrich, input.graph_enrich);
        if let Some(graph_enrich) = input.graph_enrich {
            memory.storage.graph_enrich = Some(graph_enrich);
        }

        let key = resolve_key(input.byok.as_deref(), &self.default_key)?;
        if let Some(flags) = input.pii_flags {
            memory.pii = if flags.is_empty() {
                None
            } else {
                Some(PiiField::Encrypted(crypto::encrypt_flags(&flags, &key)?))
            };
        }

        // PII/ACL invariant re-check (§4.2): the *resulting* state can never pair
        // sensitive PII with a non-private visibility, regardless of which side changed.
        if pii_is_sensitive(&memory.pii, &key)? && memory.acl.visibility != Visibility::Private {
            return Err(CapsuleError::InvalidArgument(
                "PII memories must remain private.".to_string(),
            ));
        }

        let retention_affecting = input.retention.is_some() || input.pinned.is_some() || input.ttl_seconds.is_some();
        let requested_ttl = match input.ttl_seconds {
            Some(explicit) => explicit,
            None => memory.ttl_seconds,
        };

        if retention_affecting {
            memory.retention = retention::resolve_retention(RetentionInputs {
                provided: input.retention,
                pinned: memory.pinned,
                ttl_seconds: requested_ttl,
            });
        }
        memory.ttl_seconds = retention::apply_retention_invariants(memory.retention, requested_ttl);
        memory.expires_at = memory
            .ttl_seconds
            .map(|ttl| memory.created_at + chrono::Duration::seconds(ttl));

        memory.updated_at = Utc::now();
        memory.provenance.push(ProvenanceEvent::new("updated", Some(tenancy.subject_id.clone())));

        self.storage.with_connection(|conn| queries::update_memory(conn, &memory))?;

        if graph_enrich_enabled {
            self.storage
                .with_connection(|conn| queries::upsert_graph_job(conn, tenancy, memory.id))?;
        }

        Ok(MutationOutcome {
            memory,
            explanation: "updated.".to_string(),
            forgotten_memory_id: None,
        })
    }
}

fn is_empty(input: &UpdateMemoryInput) -> bool {
    input.content.is_none()
        && input.pinned.is_none()
        && input.tags.is_none()
        && input.ttl_seconds.is_none()
        && input.memory_type.is_none()
        && input.importance_score.is_none()
        && input.recency_score.is_none()
        && input.acl.is_none()
        && input.pii_flags.is_none()
        && input.retention.is_none()
        && input.graph_enrich.is_none()
}

/// True if the memory's current PII state carries any sensitive flag,
/// decrypting an encrypted envelope with `key` (§4.2, §6)
fn pii_is_sensitive(pii: &Option<PiiField>, key: &EncryptionKey) -> Result<bool> {
    match pii {
        None => Ok(false),
        Some(PiiField::Plain(map)) => Ok(map.values().any(|v| *v)),
        Some(PiiField::Encrypted(envelope)) => {
            let flags = crypto::decrypt_flags(envelope, key)?;
            Ok(flags.values().any(|v| *v))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Acl, CreateMemoryInput, Memory, Retention};
    use crate::write::WritePipeline;
    use std::sync::Arc;

    async fn seed() -> (UpdatePipeline, Storage, Memory) {
        let storage = Storage::open_in_memory().unwrap();
        let key = EncryptionKey::insecure_default();
        let writer = WritePipeline::new(
            storage.clone(),
            Arc::new(crate::embedding::EmbeddingAdapter::new(crate::embedding::EmbeddingConfig::default())),
            key.clone(),
            100,
        );
        let tenancy = Tenancy::new("org1", "proj1", "user1");
        let outcome = writer
            .create(
                &tenancy,
                CreateMemoryInput {
                    content: "original content".to_string(),
                    ..Default::default()
                },
            )
            .await
            .unwrap()
            .into_inner();
        (UpdatePipeline::new(storage.clone(), key), storage, outcome.memory)
    }

    #[tokio::test]
    async fn no_op_update_reports_no_changes() {
        let (updater, _storage, memory) = seed().await;
        let tenancy = memory.tenancy();
        let outcome = updater.update(&tenancy, memory.id, UpdateMemoryInput::default()).await.unwrap();
        assert_eq!(outcome.explanation, "No changes applied.");
    }

    #[tokio::test]
    async fn clearing_then_resetting_tags_yields_original_set() {
        let (updater, _storage, memory) = seed().await;
        let tenancy = memory.tenancy();

        let cleared = updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    tags: Some(None),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(cleared.memory.tags.is_empty());

        let reset = updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    tags: Some(Some(vec!["a".to_string(), "b".to_string()])),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(reset.memory.tags, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn visibility_change_with_sensitive_pii_is_rejected() {
        let (updater, _storage, memory) = seed().await;
        let tenancy = memory.tenancy();

        let mut flags = std::collections::HashMap::new();
        flags.insert("ssn".to_string(), true);
        updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    pii_flags: Some(flags),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let err = updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    acl: Some(Acl {
                        visibility: Visibility::Public,
                        subjects: vec![],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CapsuleError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn setting_ttl_while_protected_drops_it_silently() {
        let (updater, _storage, memory) = seed().await;
        let tenancy = memory.tenancy();

        let outcome = updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    retention: Some(Retention::Permanent),
                    ttl_seconds: Some(Some(60)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(outcome.memory.retention, Retention::Permanent);
        assert_eq!(outcome.memory.ttl_seconds, None);
    }

    #[tokio::test]
    async fn graph_enrich_false_to_true_enqueues_job() {
        let (updater, storage, memory) = seed().await;
        let tenancy = memory.tenancy();
        assert!(memory.storage.graph_enrich != Some(true));

        updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    graph_enrich: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = storage
            .with_connection(queries::claim_next_graph_job)
            .unwrap();
        assert!(job.is_some(), "expected a graph job to be enqueued on false->true transition");
        assert_eq!(job.unwrap().memory_id, memory.id);
    }

    #[tokio::test]
    async fn graph_enrich_already_true_does_not_enqueue_job() {
        let (updater, storage, memory) = seed().await;
        let tenancy = memory.tenancy();

        updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    graph_enrich: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        // drain the job enqueued by the first transition
        storage.with_connection(queries::claim_next_graph_job).unwrap();

        updater
            .update(
                &tenancy,
                memory.id,
                UpdateMemoryInput {
                    graph_enrich: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let job = storage
            .with_connection(queries::claim_next_graph_job)
            .unwrap();
        assert!(job.is_none(), "no new job should be enqueued when graph_enrich was already true");
    }
}
