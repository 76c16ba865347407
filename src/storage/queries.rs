//! Database queries for memory operations

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use uuid::Uuid;

use crate::error::{CapsuleError, Result};
use crate::types::*;

fn parse_uuid(s: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
}

fn parse_dt(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn memory_from_row(row: &Row) -> rusqlite::Result<Memory> {
    let id_str: String = row.get("id")?;
    let embedding_json: String = row.get("embedding_json")?;
    let tags_json: String = row.get("tags_json")?;
    let acl_json: String = row.get("acl_json")?;
    let source_json: String = row.get("source_json")?;
    let provenance_json: String = row.get("provenance_json")?;
    let pii_json: Option<String> = row.get("pii_json")?;
    let policies_json: String = row.get("policies_json")?;
    let store_str: String = row.get("store")?;
    let retention_str: String = row.get("retention")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;
    let expires_at: Option<String> = row.get("expires_at")?;

    Ok(Memory {
        id: parse_uuid(&id_str)?,
        org_id: row.get("org_id")?,
        project_id: row.get("project_id")?,
        subject_id: row.get("subject_id")?,
        content: row.get("content")?,
        embedding: serde_json::from_str(&embedding_json).unwrap_or_default(),
        embedding_norm: row.get("embedding_norm")?,
        embedding_model: row.get("embedding_model")?,
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
        pinned: row.get::<_, i64>("pinned")? != 0,
        tags: serde_json::from_str(&tags_json).unwrap_or_default(),
        memory_type: row.get("memory_type")?,
        lang: row.get("lang")?,
        importance_score: row.get("importance_score")?,
        recency_score: row.get("recency_score")?,
        acl: serde_json::from_str(&acl_json).unwrap_or_default(),
        source: serde_json::from_str(&source_json).unwrap_or_default(),
        ttl_seconds: row.get("ttl_seconds")?,
        expires_at: expires_at.map(|s| parse_dt(&s)),
        idempotency_key: row.get("idempotency_key")?,
        provenance: serde_json::from_str(&provenance_json).unwrap_or_default(),
        pii: pii_json.and_then(|s| serde_json::from_str(&s).ok()),
        storage: StorageState {
            store: match store_str.as_str() {
                "short_term" => Store::ShortTerm,
                "capsule_graph" => Store::CapsuleGraph,
                _ => Store::LongTerm,
            },
            policies: serde_json::from_str(&policies_json).unwrap_or_default(),
            graph_enrich: row
                .get::<_, Option<i64>>("graph_enrich")?
                .map(|v| v != 0),
            dedupe_threshold: row.get("dedupe_threshold")?,
        },
        retention: retention_str.parse().unwrap_or(Retention::Replaceable),
    })
}

fn store_str(store: Store) -> &'static str {
    match store {
        Store::LongTerm => "long_term",
        Store::ShortTerm => "short_term",
        Store::CapsuleGraph => "capsule_graph",
    }
}

fn retention_str(retention: Retention) -> &'static str {
    match retention {
        Retention::Irreplaceable => "irreplaceable",
        Retention::Permanent => "permanent",
        Retention::Replaceable => "replaceable",
        Retention::Ephemeral => "ephemeral",
    }
}

fn visibility_str(visibility: Visibility) -> &'static str {
    match visibility {
        Visibility::Private => "private",
        Visibility::Shared => "shared",
        Visibility::Public => "public",
    }
}

/// True if `err` is a unique-constraint violation, e.g. a racing idempotent
/// create losing the `idx_memories_idempotency` index to a concurrent insert (§7).
fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Insert a newly-created memory (§4.1 step 10). A unique-constraint violation
/// on the idempotency index surfaces as `CapsuleError::Conflict` so the write
/// pipeline can fall back to replaying the winning row instead of a 500 (§7).
pub fn insert_memory(conn: &Connection, m: &Memory) -> Result<()> {
    conn.execute(
        "INSERT INTO memories (
            id, org_id, project_id, subject_id, content, embedding_json, embedding_norm,
            embedding_model, created_at, updated_at, pinned, tags_json, memory_type, lang,
            importance_score, recency_score, acl_json, source_json, ttl_seconds, expires_at,
            idempotency_key, provenance_json, pii_json, store, policies_json, graph_enrich,
            dedupe_threshold, retention, visibility
        ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18,
            ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27, ?28, ?29
        )",
        params![
            m.id.to_string(),
            m.org_id,
            m.project_id,
            m.subject_id,
            m.content,
            serde_json::to_string(&m.embedding)?,
            m.embedding_norm,
            m.embedding_model,
            m.created_at.to_rfc3339(),
            m.updated_at.to_rfc3339(),
            m.pinned as i64,
            serde_json::to_string(&m.tags)?,
            m.memory_type,
            m.lang,
            m.importance_score,
            m.recency_score,
            serde_json::to_string(&m.acl)?,
            serde_json::to_string(&m.source)?,
            m.ttl_seconds,
            m.expires_at.map(|d| d.to_rfc3339()),
            m.idempotency_key,
            serde_json::to_string(&m.provenance)?,
            m.pii.as_ref().map(serde_json::to_string).transpose()?,
            store_str(m.storage.store),
            serde_json::to_string(&m.storage.policies)?,
            m.storage.graph_enrich.map(|b| b as i64),
            m.storage.dedupe_threshold,
            retention_str(m.retention),
            visibility_str(m.acl.visibility),
        ],
    )
    .map_err(|e| {
        if is_unique_violation(&e) {
            CapsuleError::Conflict(format!("memory {} conflicts with an existing idempotency key", m.id))
        } else {
            CapsuleError::from(e)
        }
    })?;
    Ok(())
}

/// Replace a memory's mutable fields after an update (§4.2)
pub fn update_memory(conn: &Connection, m: &Memory) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memories SET
            content = ?2, updated_at = ?3, pinned = ?4, tags_json = ?5, memory_type = ?6,
            importance_score = ?7, recency_score = ?8, acl_json = ?9, ttl_seconds = ?10,
            expires_at = ?11, provenance_json = ?12, pii_json = ?13, graph_enrich = ?14,
            retention = ?15, visibility = ?16
        WHERE id = ?1",
        params![
            m.id.to_string(),
            m.content,
            m.updated_at.to_rfc3339(),
            m.pinned as i64,
            serde_json::to_string(&m.tags)?,
            m.memory_type,
            m.importance_score,
            m.recency_score,
            serde_json::to_string(&m.acl)?,
            m.ttl_seconds,
            m.expires_at.map(|d| d.to_rfc3339()),
            serde_json::to_string(&m.provenance)?,
            m.pii.as_ref().map(serde_json::to_string).transpose()?,
            m.storage.graph_enrich.map(|b| b as i64),
            retention_str(m.retention),
            visibility_str(m.acl.visibility),
        ],
    )?;
    if changed == 0 {
        return Err(CapsuleError::NotFound(format!("memory {} not found", m.id)));
    }
    Ok(())
}

/// Fetch a memory by id, regardless of tenancy (callers apply the access gate)
pub fn get_memory(conn: &Connection, id: Uuid) -> Result<Option<Memory>> {
    conn.query_row(
        "SELECT * FROM memories WHERE id = ?1",
        params![id.to_string()],
        memory_from_row,
    )
    .optional()
    .map_err(CapsuleError::from)
}

/// Delete a memory by id, returning whether a row was removed
pub fn delete_memory(conn: &Connection, id: Uuid) -> Result<bool> {
    let changed = conn.execute("DELETE FROM memories WHERE id = ?1", params![id.to_string()])?;
    Ok(changed > 0)
}

/// Find a prior memory created under the same idempotency key (§4.1 step 1)
pub fn find_by_idempotency_key(
    conn: &Connection,
    tenancy: &Tenancy,
    key: &str,
) -> Result<Option<Memory>> {
    conn.query_row(
        "SELECT * FROM memories WHERE org_id = ?1 AND project_id = ?2 AND subject_id = ?3 AND idempotency_key = ?4",
        params![tenancy.org_id, tenancy.project_id, tenancy.subject_id, key],
        memory_from_row,
    )
    .optional()
    .map_err(CapsuleError::from)
}

/// Count live memories under a tenancy (§4.6 "Retention cap enforcement")
pub fn count_for_tenancy(conn: &Connection, tenancy: &Tenancy) -> Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM memories WHERE org_id = ?1 AND project_id = ?2 AND subject_id = ?3",
        params![tenancy.org_id, tenancy.project_id, tenancy.subject_id],
        |row| row.get(0),
    )
    .map_err(CapsuleError::from)
}

/// Candidate set for eviction scan: oldest-first, capped (§4.6 "Eviction scan")
pub fn eviction_scan_candidates(
    conn: &Connection,
    tenancy: &Tenancy,
    limit: i64,
) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM memories WHERE org_id = ?1 AND project_id = ?2 AND subject_id = ?3 AND pinned = 0
         ORDER BY created_at ASC LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(
            params![tenancy.org_id, tenancy.project_id, tenancy.subject_id, limit],
            memory_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// List memories matching filters (§4.3), newest first; access gating happens after fetch (§4.4)
pub fn list_memories(conn: &Connection, tenancy: &Tenancy, opts: &ListOptions, limit: i64) -> Result<Vec<Memory>> {
    let mut clauses = Vec::new();
    if opts.subject_id.is_some() {
        clauses.push("subject_id = ?");
    }
    if opts.pinned.is_some() {
        clauses.push("pinned = ?");
    }
    if opts.memory_type.is_some() {
        clauses.push("memory_type = ?");
    }
    if opts.visibility.is_some() {
        clauses.push("visibility = ?");
    }
    if opts.store.is_some() {
        clauses.push("store = ?");
    }
    if opts.graph_enrich.is_some() {
        clauses.push("graph_enrich = ?");
    }
    if opts.retention.is_some() {
        clauses.push("retention = ?");
    }
    if opts.tag.is_some() {
        clauses.push("tags_json LIKE ?");
    }

    let mut sql = String::from(
        "SELECT * FROM memories WHERE org_id = ? AND project_id = ?",
    );
    for clause in &clauses {
        sql.push_str(" AND ");
        sql.push_str(clause);
    }
    sql.push_str(" ORDER BY created_at DESC LIMIT ?");

    let mut params_vec: Vec<Box<dyn rusqlite::types::ToSql>> = vec![
        Box::new(tenancy.org_id.clone()),
        Box::new(tenancy.project_id.clone()),
    ];
    if let Some(subject_id) = &opts.subject_id {
        params_vec.push(Box::new(subject_id.clone()));
    }
    if let Some(pinned) = opts.pinned {
        params_vec.push(Box::new(pinned as i64));
    }
    if let Some(t) = &opts.memory_type {
        params_vec.push(Box::new(t.clone()));
    }
    if let Some(v) = opts.visibility {
        params_vec.push(Box::new(visibility_str(v).to_string()));
    }
    if let Some(s) = opts.store {
        params_vec.push(Box::new(store_str(s).to_string()));
    }
    if let Some(g) = opts.graph_enrich {
        params_vec.push(Box::new(g as i64));
    }
    if let Some(r) = opts.retention {
        params_vec.push(Box::new(retention_str(r).to_string()));
    }
    if let Some(tag) = &opts.tag {
        params_vec.push(Box::new(format!("%\"{tag}\"%")));
    }
    params_vec.push(Box::new(limit));

    let mut stmt = conn.prepare(&sql)?;
    let param_refs: Vec<&dyn rusqlite::types::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();
    let rows = stmt
        .query_map(param_refs.as_slice(), memory_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Candidate fetch for adaptive search (§4.7 step 4): most recent N within
/// `(orgId, projectId)`; access gating happens after fetch (§4.4)
pub fn fetch_search_candidates(conn: &Connection, tenancy: &Tenancy, limit: i64) -> Result<Vec<Memory>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM memories WHERE org_id = ?1 AND project_id = ?2
         ORDER BY created_at DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(
            params![tenancy.org_id, tenancy.project_id, limit],
            memory_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// --- Capture candidates (§4.8) ---

fn candidate_from_row(row: &Row) -> rusqlite::Result<CaptureCandidate> {
    let id_str: String = row.get("id")?;
    let role_str: String = row.get("role")?;
    let category_str: String = row.get("category")?;
    let status_str: String = row.get("status")?;
    let reasons_json: String = row.get("reasons_json")?;
    let metadata_json: Option<String> = row.get("metadata_json")?;
    let memory_id: Option<String> = row.get("memory_id")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(CaptureCandidate {
        id: parse_uuid(&id_str)?,
        org_id: row.get("org_id")?,
        project_id: row.get("project_id")?,
        subject_id: row.get("subject_id")?,
        source_event_id: row.get("source_event_id")?,
        role: match role_str.as_str() {
            "assistant" => EventRole::Assistant,
            "system" => EventRole::System,
            _ => EventRole::User,
        },
        content: row.get("content")?,
        metadata: metadata_json.and_then(|s| serde_json::from_str(&s).ok()),
        score: row.get("score")?,
        threshold: row.get("threshold")?,
        recommended: row.get::<_, i64>("recommended")? != 0,
        category: match category_str.as_str() {
            "preference" => CaptureCategory::Preference,
            "fact" => CaptureCategory::Fact,
            "task" => CaptureCategory::Task,
            "context" => CaptureCategory::Context,
            _ => CaptureCategory::Other,
        },
        reasons: serde_json::from_str(&reasons_json).unwrap_or_default(),
        status: match status_str.as_str() {
            "approved" => CandidateStatus::Approved,
            "rejected" => CandidateStatus::Rejected,
            "ignored" => CandidateStatus::Ignored,
            _ => CandidateStatus::Pending,
        },
        auto_accepted: row.get::<_, Option<i64>>("auto_accepted")?.map(|v| v != 0),
        auto_decision_reason: row.get("auto_decision_reason")?,
        memory_id: memory_id.as_deref().and_then(|s| Uuid::parse_str(s).ok()),
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

/// Insert a newly-scored capture candidate (§4.8)
pub fn insert_candidate(conn: &Connection, c: &CaptureCandidate) -> Result<()> {
    conn.execute(
        "INSERT INTO memory_candidates (
            id, org_id, project_id, subject_id, source_event_id, role, content, metadata_json,
            score, threshold, recommended, category, reasons_json, status, auto_accepted,
            auto_decision_reason, memory_id, created_at, updated_at
        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        params![
            c.id.to_string(),
            c.org_id,
            c.project_id,
            c.subject_id,
            c.source_event_id,
            match c.role {
                EventRole::User => "user",
                EventRole::Assistant => "assistant",
                EventRole::System => "system",
            },
            c.content,
            c.metadata.as_ref().map(serde_json::to_string).transpose()?,
            c.score,
            c.threshold,
            c.recommended as i64,
            match c.category {
                CaptureCategory::Preference => "preference",
                CaptureCategory::Fact => "fact",
                CaptureCategory::Task => "task",
                CaptureCategory::Context => "context",
                CaptureCategory::Other => "other",
            },
            serde_json::to_string(&c.reasons)?,
            match c.status {
                CandidateStatus::Pending => "pending",
                CandidateStatus::Approved => "approved",
                CandidateStatus::Rejected => "rejected",
                CandidateStatus::Ignored => "ignored",
            },
            c.auto_accepted.map(|b| b as i64),
            c.auto_decision_reason,
            c.memory_id.map(|id| id.to_string()),
            c.created_at.to_rfc3339(),
            c.updated_at.to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch a capture candidate by id
pub fn get_candidate(conn: &Connection, id: Uuid) -> Result<Option<CaptureCandidate>> {
    conn.query_row(
        "SELECT * FROM memory_candidates WHERE id = ?1",
        params![id.to_string()],
        candidate_from_row,
    )
    .optional()
    .map_err(CapsuleError::from)
}

/// List capture candidates under a tenancy, optionally filtered by status (§4.8)
pub fn list_candidates(
    conn: &Connection,
    tenancy: &Tenancy,
    status: Option<CandidateStatus>,
    limit: i64,
) -> Result<Vec<CaptureCandidate>> {
    let status_str = status.map(|s| match s {
        CandidateStatus::Pending => "pending",
        CandidateStatus::Approved => "approved",
        CandidateStatus::Rejected => "rejected",
        CandidateStatus::Ignored => "ignored",
    });
    let mut stmt = if status_str.is_some() {
        conn.prepare(
            "SELECT * FROM memory_candidates WHERE org_id = ?1 AND project_id = ?2 AND subject_id = ?3
             AND status = ?4 ORDER BY created_at DESC LIMIT ?5",
        )?
    } else {
        conn.prepare(
            "SELECT * FROM memory_candidates WHERE org_id = ?1 AND project_id = ?2 AND subject_id = ?3
             ORDER BY created_at DESC LIMIT ?4",
        )?
    };
    let rows = if let Some(status_str) = status_str {
        stmt.query_map(
            params![tenancy.org_id, tenancy.project_id, tenancy.subject_id, status_str, limit],
            candidate_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?
    } else {
        stmt.query_map(
            params![tenancy.org_id, tenancy.project_id, tenancy.subject_id, limit],
            candidate_from_row,
        )?
        .collect::<std::result::Result<Vec<_>, _>>()?
    };
    Ok(rows)
}

/// Transition a candidate's lifecycle status, stamping the resulting memory id when approved (§4.8)
pub fn update_candidate_status(
    conn: &Connection,
    id: Uuid,
    status: CandidateStatus,
    memory_id: Option<Uuid>,
) -> Result<()> {
    let status_str = match status {
        CandidateStatus::Pending => "pending",
        CandidateStatus::Approved => "approved",
        CandidateStatus::Rejected => "rejected",
        CandidateStatus::Ignored => "ignored",
    };
    let changed = conn.execute(
        "UPDATE memory_candidates SET status = ?2, memory_id = ?3, updated_at = ?4 WHERE id = ?1",
        params![
            id.to_string(),
            status_str,
            memory_id.map(|id| id.to_string()),
            Utc::now().to_rfc3339(),
        ],
    )?;
    if changed == 0 {
        return Err(CapsuleError::NotFound(format!("capture candidate {} not found", id)));
    }
    Ok(())
}

/// Reject a pending candidate, recording an optional reason (§4.8 "Reject")
pub fn reject_candidate(conn: &Connection, id: Uuid, reason: Option<&str>) -> Result<()> {
    let changed = conn.execute(
        "UPDATE memory_candidates SET status = 'rejected', auto_decision_reason = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), reason, Utc::now().to_rfc3339()],
    )?;
    if changed == 0 {
        return Err(CapsuleError::NotFound(format!("capture candidate {} not found", id)));
    }
    Ok(())
}

// --- Graph jobs and entities (§4.9) ---

fn job_from_row(row: &Row) -> rusqlite::Result<GraphJob> {
    let id_str: String = row.get("id")?;
    let memory_id_str: String = row.get("memory_id")?;
    let status_str: String = row.get("status")?;
    let created_at: String = row.get("created_at")?;
    let updated_at: String = row.get("updated_at")?;

    Ok(GraphJob {
        id: parse_uuid(&id_str)?,
        org_id: row.get("org_id")?,
        project_id: row.get("project_id")?,
        memory_id: parse_uuid(&memory_id_str)?,
        status: match status_str.as_str() {
            "running" => GraphJobStatus::Running,
            "success" => GraphJobStatus::Success,
            "error" => GraphJobStatus::Error,
            _ => GraphJobStatus::Pending,
        },
        attempts: row.get("attempts")?,
        error: row.get("error")?,
        created_at: parse_dt(&created_at),
        updated_at: parse_dt(&updated_at),
    })
}

const MAX_GRAPH_JOB_ATTEMPTS: i32 = 3;

/// Enqueue (or reset) a graph-enrichment job for a memory (§4.1 step 12, §4.9)
pub fn upsert_graph_job(conn: &Connection, tenancy: &Tenancy, memory_id: Uuid) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO graph_jobs (id, org_id, project_id, memory_id, status, attempts, error, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', 0, NULL, ?5, ?5)
         ON CONFLICT(memory_id) DO UPDATE SET status = 'pending', attempts = 0, error = NULL, updated_at = ?5",
        params![
            Uuid::new_v4().to_string(),
            tenancy.org_id,
            tenancy.project_id,
            memory_id.to_string(),
            now,
        ],
    )?;
    Ok(())
}

/// Claim the oldest eligible job (pending, or errored with attempts left) and mark it running (§4.9 step 1)
pub fn claim_next_graph_job(conn: &Connection) -> Result<Option<GraphJob>> {
    let job = conn
        .query_row(
            "SELECT * FROM graph_jobs
             WHERE (status = 'pending' OR (status = 'error' AND attempts < ?1))
             ORDER BY updated_at ASC LIMIT 1",
            params![MAX_GRAPH_JOB_ATTEMPTS],
            job_from_row,
        )
        .optional()?;

    let Some(job) = job else {
        return Ok(None);
    };
    conn.execute(
        "UPDATE graph_jobs SET status = 'running', attempts = attempts + 1, updated_at = ?2 WHERE id = ?1",
        params![job.id.to_string(), Utc::now().to_rfc3339()],
    )?;
    conn.query_row("SELECT * FROM graph_jobs WHERE id = ?1", params![job.id.to_string()], job_from_row)
        .optional()
        .map_err(CapsuleError::from)
}

/// Mark a running job as successfully completed (§4.9 step 5)
pub fn mark_graph_job_success(conn: &Connection, id: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE graph_jobs SET status = 'success', error = NULL, updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Mark a running job as failed, recording the error for the next retry (§4.9 step 5)
pub fn mark_graph_job_error(conn: &Connection, id: Uuid, error: &str) -> Result<()> {
    conn.execute(
        "UPDATE graph_jobs SET status = 'error', error = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.to_string(), error, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

fn entity_from_row(row: &Row) -> rusqlite::Result<GraphEntity> {
    let memory_ids_json: String = row.get("memory_ids_json")?;
    let last_seen_at: String = row.get("last_seen_at")?;
    let memory_ids: Vec<String> = serde_json::from_str(&memory_ids_json).unwrap_or_default();

    Ok(GraphEntity {
        org_id: row.get("org_id")?,
        project_id: row.get("project_id")?,
        entity: row.get("entity")?,
        memory_ids: memory_ids.iter().filter_map(|s| Uuid::parse_str(s).ok()).collect(),
        last_seen_at: parse_dt(&last_seen_at),
    })
}

/// Record a memory's contribution to a co-occurrence entity, capping membership (§4.9 step 3)
pub fn upsert_graph_entity(
    conn: &Connection,
    org_id: &str,
    project_id: &str,
    entity: &str,
    memory_id: Uuid,
    max_members: usize,
) -> Result<()> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT memory_ids_json FROM graph_entities WHERE org_id = ?1 AND project_id = ?2 AND entity = ?3",
            params![org_id, project_id, entity],
            |row| row.get(0),
        )
        .optional()?;

    let mut ids: Vec<Uuid> = existing
        .and_then(|s| serde_json::from_str::<Vec<String>>(&s).ok())
        .unwrap_or_default()
        .iter()
        .filter_map(|s| Uuid::parse_str(s).ok())
        .collect();

    if !ids.contains(&memory_id) {
        ids.push(memory_id);
        if ids.len() > max_members {
            ids.remove(0);
        }
    }

    conn.execute(
        "INSERT INTO graph_entities (org_id, project_id, entity, memory_ids_json, last_seen_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(org_id, project_id, entity) DO UPDATE SET memory_ids_json = ?4, last_seen_at = ?5",
        params![
            org_id,
            project_id,
            entity,
            serde_json::to_string(&ids.iter().map(|id| id.to_string()).collect::<Vec<_>>())?,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fetch graph entities touching any of the given memories, for search-time graph expansion (§4.7 step 6)
pub fn entities_for_memories(
    conn: &Connection,
    org_id: &str,
    project_id: &str,
    limit: i64,
) -> Result<Vec<GraphEntity>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM graph_entities WHERE org_id = ?1 AND project_id = ?2 ORDER BY last_seen_at DESC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![org_id, project_id, limit], entity_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
