//! Background graph-enrichment worker (§4.9)
//!
//! Single process-wide worker: every `graph_worker_interval`, claims the
//! oldest eligible job, extracts co-occurrence entities from the associated
//! memory's content and tags, and folds them into the `graph_entities` index.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::interval;

use crate::storage::queries;
use crate::storage::Storage;
use crate::types::GraphJob;

const MAX_ENTITIES_PER_MEMORY: usize = 25;
const MAX_MEMBERS_PER_ENTITY: usize = 25;
const GRAPH_EXPANSION_SCAN_LIMIT: i64 = 50;

static CAPITALIZED_RUN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[A-Z][a-zA-Z]*(?:\s+[A-Z][a-zA-Z]*){2,})\b").unwrap());

static ALL_CAPS: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Z]+$").unwrap());

/// Extract candidate entities from memory content and tags (§4.9 step 4).
///
/// Matches runs of three or more capitalized tokens, drops all-caps
/// acronyms, adds a `#tag` entity per memory tag, deduplicates, and caps
/// the result at `MAX_ENTITIES_PER_MEMORY`.
pub fn extract_entities(content: &str, tags: &[String]) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut entities = Vec::new();

    for m in CAPITALIZED_RUN.find_iter(content) {
        let candidate = m.as_str().trim().to_string();
        if candidate.split_whitespace().all(|w| ALL_CAPS.is_match(w)) {
            continue;
        }
        if seen.insert(candidate.clone()) {
            entities.push(candidate);
        }
    }

    for tag in tags {
        let candidate = format!("#{tag}");
        if seen.insert(candidate.clone()) {
            entities.push(candidate);
        }
    }

    entities.truncate(MAX_ENTITIES_PER_MEMORY);
    entities
}

/// Process one claimed job: load its memory, extract entities, upsert the
/// index, and transition the job to success or error (§4.9 steps 3-6).
fn process_job(storage: &Storage, job: &GraphJob) {
    let outcome = storage.with_connection(|conn| {
        let memory = queries::get_memory(conn, job.memory_id)?;
        let Some(memory) = memory else {
            return Err(crate::error::CapsuleError::NotFound(format!(
                "memory {} for graph job {}",
                job.memory_id, job.id
            )));
        };

        for entity in extract_entities(&memory.content, &memory.tags) {
            queries::upsert_graph_entity(
                conn,
                &memory.org_id,
                &memory.project_id,
                &entity,
                memory.id,
                MAX_MEMBERS_PER_ENTITY,
            )?;
        }
        Ok(())
    });

    let mark_result = storage.with_connection(|conn| match &outcome {
        Ok(()) => queries::mark_graph_job_success(conn, job.id),
        Err(e) => queries::mark_graph_job_error(conn, job.id, &e.to_string()),
    });

    if let Err(e) = mark_result {
        tracing::warn!(job_id = %job.id, error = %e, "failed to record graph job outcome");
    }
    match outcome {
        Ok(()) => tracing::info!(job_id = %job.id, memory_id = %job.memory_id, "graph job completed"),
        Err(e) => tracing::warn!(job_id = %job.id, memory_id = %job.memory_id, error = %e, "graph job failed"),
    }
}

fn tick(storage: &Storage) {
    let job = match storage.with_connection(queries::claim_next_graph_job) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(error = %e, "failed to claim graph job");
            return;
        }
    };

    if let Some(job) = job {
        process_job(storage, &job);
    }
}

/// Expand a base result set with entity-linked memories (§4.7 step 7, §4.9
/// "Expansion"): fetch entities touching the base set, collect up to `limit`
/// distinct memory ids not already present, and return them for the caller
/// to materialize.
pub fn expand(
    storage: &Storage,
    org_id: &str,
    project_id: &str,
    base_ids: &std::collections::HashSet<uuid::Uuid>,
    limit: usize,
) -> crate::error::Result<Vec<uuid::Uuid>> {
    let entities = storage.with_connection(|conn| {
        queries::entities_for_memories(conn, org_id, project_id, GRAPH_EXPANSION_SCAN_LIMIT)
    })?;

    let mut seen: std::collections::HashSet<uuid::Uuid> = base_ids.clone();
    let mut expanded = Vec::new();

    'entities: for entity in &entities {
        if !entity.memory_ids.iter().any(|id| base_ids.contains(id)) {
            continue;
        }
        for &id in &entity.memory_ids {
            if seen.insert(id) {
                expanded.push(id);
                if expanded.len() >= limit {
                    break 'entities;
                }
            }
        }
    }

    Ok(expanded)
}

/// Single-start guard preventing duplicate worker timers (§5 "Graph worker
/// flag"), grounded on `sync::worker::SyncWorker::start`'s one-shot spawn.
pub struct GraphWorker {
    started: Arc<AsyncMutex<bool>>,
}

impl GraphWorker {
    pub fn new() -> Self {
        Self {
            started: Arc::new(AsyncMutex::new(false)),
        }
    }

    /// Start the background loop if it isn't already running. Safe to call
    /// more than once; only the first call spawns a task.
    pub async fn start(&self, storage: Storage, tick_interval: Duration) {
        let mut started = self.started.lock().await;
        if *started {
            return;
        }
        *started = true;
        drop(started);

        tokio::spawn(async move {
            let mut ticker = interval(tick_interval);
            loop {
                ticker.tick().await;
                tick(&storage);
            }
        });
    }
}

impl Default for GraphWorker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tenancy;

    fn tenancy() -> Tenancy {
        Tenancy {
            org_id: "org-1".to_string(),
            project_id: "proj-1".to_string(),
            subject_id: "subject-1".to_string(),
        }
    }

    #[test]
    fn extracts_capitalized_runs_and_drops_acronyms() {
        let entities = extract_entities(
            "Meeting with John Patrick Doe about the NASA JPL project",
            &[],
        );
        assert!(entities.iter().any(|e| e == "John Patrick Doe"));
        assert!(!entities.iter().any(|e| e.contains("NASA")));
    }

    #[test]
    fn includes_hash_tag_per_memory_tag() {
        let entities = extract_entities("no capitalized runs here", &["rust".to_string()]);
        assert_eq!(entities, vec!["#rust".to_string()]);
    }

    #[test]
    fn caps_entity_count_per_memory() {
        let content: String = (0..40)
            .map(|i| format!("Alpha Beta Gamma{i}"))
            .collect::<Vec<_>>()
            .join(". ");
        let entities = extract_entities(&content, &[]);
        assert!(entities.len() <= MAX_ENTITIES_PER_MEMORY);
    }

    fn sample_memory(tenancy: &Tenancy, content: &str, tags: Vec<&str>) -> crate::types::Memory {
        let now = chrono::Utc::now();
        crate::types::Memory {
            id: uuid::Uuid::new_v4(),
            org_id: tenancy.org_id.clone(),
            project_id: tenancy.project_id.clone(),
            subject_id: tenancy.subject_id.clone(),
            content: content.to_string(),
            embedding: vec![0.1, 0.2, 0.3],
            embedding_norm: 1.0,
            embedding_model: "deterministic-fallback-v1".to_string(),
            created_at: now,
            updated_at: now,
            pinned: false,
            tags: tags.into_iter().map(String::from).collect(),
            memory_type: None,
            lang: "en".to_string(),
            importance_score: 1.0,
            recency_score: 1.0,
            acl: crate::types::Acl::default(),
            source: crate::types::Source::default(),
            ttl_seconds: None,
            expires_at: None,
            idempotency_key: None,
            provenance: vec![],
            pii: None,
            storage: crate::types::StorageState::default(),
            retention: crate::types::Retention::Replaceable,
        }
    }

    #[test]
    fn worker_claims_and_completes_pending_job() {
        let storage = Storage::open_in_memory().unwrap();
        let tenancy = tenancy();
        let memory = sample_memory(&tenancy, "Meeting with John Patrick Doe", vec!["rust"]);
        let memory_id = memory.id;
        storage.with_connection(|conn| queries::insert_memory(conn, &memory)).unwrap();
        storage
            .with_connection(|conn| queries::upsert_graph_job(conn, &tenancy, memory_id))
            .unwrap();

        tick(&storage);

        let entities = storage
            .with_connection(|conn| {
                queries::entities_for_memories(conn, &tenancy.org_id, &tenancy.project_id, 10)
            })
            .unwrap();
        assert!(entities.iter().any(|e| e.entity == "#rust"));
        assert!(entities
            .iter()
            .any(|e| e.entity == "John Patrick Doe" && e.memory_ids.contains(&memory_id)));
    }

    #[test]
    fn worker_marks_missing_memory_as_error() {
        let storage = Storage::open_in_memory().unwrap();
        let tenancy = tenancy();
        storage
            .with_connection(|conn| queries::upsert_graph_job(conn, &tenancy, uuid::Uuid::new_v4()))
            .unwrap();

        tick(&storage);

        let jobs: Vec<crate::types::GraphJobStatus> = storage
            .with_connection(|conn| {
                let mut stmt = conn.prepare("SELECT status FROM graph_jobs")?;
                let statuses = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(statuses
                    .into_iter()
                    .map(|s| match s.as_str() {
                        "error" => crate::types::GraphJobStatus::Error,
                        other => panic!("unexpected status {other}"),
                    })
                    .collect())
            })
            .unwrap();
        assert_eq!(jobs, vec![crate::types::GraphJobStatus::Error]);
    }
}
