//! List (§4.3) and the access gate (§4.4)

use uuid::Uuid;

use crate::error::{CapsuleError, Result};
use crate::storage::{queries, Storage};
use crate::types::{ListOptions, Memory, Tenancy, DEFAULT_LIST_LIMIT, MAX_LIST_LIMIT};

/// List memories visible to `tenancy.subject_id` within `(orgId, projectId)`,
/// sorted `(pinned desc, importanceScore desc, recencyScore desc, createdAt desc)` (§4.3)
pub fn list(storage: &Storage, tenancy: &Tenancy, opts: &ListOptions) -> Result<Vec<Memory>> {
    let limit = opts.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);

    // Fetch a wider window than `limit` since the access gate (§4.4) is applied
    // after fetch and may drop rows that another subject in the project can't see.
    let fetch_limit = (limit * 4).min(MAX_LIST_LIMIT * 4);
    let mut memories = storage.with_connection(|conn| queries::list_memories(conn, tenancy, opts, fetch_limit))?;

    memories.retain(|m| m.accessible_to(&tenancy.subject_id));
    memories.sort_by(|a, b| {
        b.pinned
            .cmp(&a.pinned)
            .then_with(|| b.importance_score.total_cmp(&a.importance_score))
            .then_with(|| b.recency_score.total_cmp(&a.recency_score))
            .then_with(|| b.created_at.cmp(&a.created_at))
    });
    memories.truncate(limit as usize);

    Ok(memories)
}

/// Delete a memory owned by the caller's tenancy (§6 `DELETE /v1/memories/{id}`).
///
/// Unlike list/search, delete is scoped to the full tenancy triple: only the
/// writing subject may delete its own memory.
pub fn delete(storage: &Storage, tenancy: &Tenancy, id: Uuid, reason: Option<&str>) -> Result<Memory> {
    let memory = storage
        .with_connection(|conn| queries::get_memory(conn, id))?
        .filter(|m| m.tenancy() == *tenancy)
        .ok_or_else(|| CapsuleError::NotFound(format!("memory {id} not found")))?;

    storage.with_connection(|conn| queries::delete_memory(conn, id))?;
    tracing::info!(memory_id = %id, reason = reason.unwrap_or(""), "memory deleted");

    Ok(memory)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Acl, CreateMemoryInput, Visibility};
    use crate::write::WritePipeline;
    use std::sync::Arc;

    async fn seeded_storage() -> Storage {
        let storage = Storage::open_in_memory().unwrap();
        let writer = WritePipeline::new(
            storage.clone(),
            Arc::new(crate::embedding::EmbeddingAdapter::new(crate::embedding::EmbeddingConfig::default())),
            crate::crypto::EncryptionKey::insecure_default(),
            100,
        );
        let owner = Tenancy::new("org1", "proj1", "owner");

        writer
            .create(
                &owner,
                CreateMemoryInput {
                    content: "Call me Lex during future conversations.".to_string(),
                    pinned: Some(true),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        writer
            .create(
                &owner,
                CreateMemoryInput {
                    content: "private note".to_string(),
                    acl: Some(Acl {
                        visibility: Visibility::Private,
                        subjects: vec![],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        writer
            .create(
                &owner,
                CreateMemoryInput {
                    content: "shared with the team".to_string(),
                    acl: Some(Acl {
                        visibility: Visibility::Public,
                        subjects: vec![],
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        storage
    }

    #[tokio::test]
    async fn pinned_memory_sorts_first() {
        let storage = seeded_storage().await;
        let tenancy = Tenancy::new("org1", "proj1", "owner");
        let results = list(&storage, &tenancy, &ListOptions::default()).unwrap();
        assert!(results[0].pinned);
    }

    #[tokio::test]
    async fn private_memory_hidden_from_other_subjects() {
        let storage = seeded_storage().await;
        let other = Tenancy::new("org1", "proj1", "someone-else");
        let results = list(&storage, &other, &ListOptions::default()).unwrap();
        assert!(results.iter().all(|m| m.content != "private note"));
    }

    #[tokio::test]
    async fn public_memory_visible_to_other_subjects_in_same_project() {
        let storage = seeded_storage().await;
        let other = Tenancy::new("org1", "proj1", "someone-else");
        let results = list(&storage, &other, &ListOptions::default()).unwrap();
        assert!(results.iter().any(|m| m.content == "shared with the team"));
    }

    #[tokio::test]
    async fn owner_can_delete_their_own_memory() {
        let storage = seeded_storage().await;
        let owner = Tenancy::new("org1", "proj1", "owner");
        let target = list(&storage, &owner, &ListOptions::default())
            .unwrap()
            .into_iter()
            .find(|m| m.content == "private note")
            .unwrap();

        let deleted = delete(&storage, &owner, target.id, Some("no longer needed")).unwrap();
        assert_eq!(deleted.id, target.id);

        let remaining = list(&storage, &owner, &ListOptions::default()).unwrap();
        assert!(remaining.iter().all(|m| m.id != target.id));
    }

    #[tokio::test]
    async fn other_subject_cannot_delete_someone_elses_memory() {
        let storage = seeded_storage().await;
        let owner = Tenancy::new("org1", "proj1", "owner");
        let other = Tenancy::new("org1", "proj1", "someone-else");
        let target = list(&storage, &owner, &ListOptions::default())
            .unwrap()
            .into_iter()
            .find(|m| m.content == "shared with the team")
            .unwrap();

        let result = delete(&storage, &other, target.id, None);
        assert!(matches!(result, Err(CapsuleError::NotFound(_))));

        let still_there = list(&storage, &owner, &ListOptions::default()).unwrap();
        assert!(still_there.iter().any(|m| m.id == target.id));
    }
}
