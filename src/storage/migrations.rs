//! Database schema for Capsule Memory (§6 "Persisted state")

use rusqlite::Connection;

use crate::error::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// Run all migrations
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        [],
    )?;

    let current_version: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current_version < 1 {
        migrate_v1(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Memories: structured columns for filterable fields, JSON blobs for
        -- nested structures (acl, source, provenance, pii, storage, embedding).
        CREATE TABLE IF NOT EXISTS memories (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            content TEXT NOT NULL,
            embedding_json TEXT NOT NULL,
            embedding_norm REAL NOT NULL,
            embedding_model TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            pinned INTEGER NOT NULL DEFAULT 0,
            tags_json TEXT NOT NULL DEFAULT '[]',
            memory_type TEXT,
            lang TEXT NOT NULL DEFAULT 'und',
            importance_score REAL NOT NULL DEFAULT 1.0,
            recency_score REAL NOT NULL DEFAULT 1.0,
            acl_json TEXT NOT NULL,
            source_json TEXT NOT NULL,
            ttl_seconds INTEGER,
            expires_at TEXT,
            idempotency_key TEXT,
            provenance_json TEXT NOT NULL DEFAULT '[]',
            pii_json TEXT,
            store TEXT NOT NULL DEFAULT 'long_term',
            policies_json TEXT NOT NULL DEFAULT '[]',
            graph_enrich INTEGER,
            dedupe_threshold REAL,
            retention TEXT NOT NULL,
            visibility TEXT NOT NULL DEFAULT 'private'
        );

        CREATE INDEX IF NOT EXISTS idx_memories_tenancy_created
            ON memories(org_id, project_id, subject_id, created_at);
        CREATE UNIQUE INDEX IF NOT EXISTS idx_memories_idempotency
            ON memories(org_id, project_id, subject_id, idempotency_key)
            WHERE idempotency_key IS NOT NULL;
        CREATE INDEX IF NOT EXISTS idx_memories_expires_at ON memories(expires_at);
        CREATE INDEX IF NOT EXISTS idx_memories_filters
            ON memories(org_id, project_id, memory_type, visibility, store, graph_enrich, retention, created_at);

        -- Capture candidates
        CREATE TABLE IF NOT EXISTS memory_candidates (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            source_event_id TEXT,
            role TEXT NOT NULL,
            content TEXT NOT NULL,
            metadata_json TEXT,
            score REAL NOT NULL,
            threshold REAL NOT NULL,
            recommended INTEGER NOT NULL,
            category TEXT NOT NULL,
            reasons_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            auto_accepted INTEGER,
            auto_decision_reason TEXT,
            memory_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_candidates_tenancy_status
            ON memory_candidates(org_id, project_id, subject_id, status, created_at);

        -- Graph jobs
        CREATE TABLE IF NOT EXISTS graph_jobs (
            id TEXT PRIMARY KEY,
            org_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            memory_id TEXT NOT NULL,
            status TEXT NOT NULL,
            attempts INTEGER NOT NULL DEFAULT 0,
            error TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_graph_jobs_memory ON graph_jobs(memory_id);
        CREATE INDEX IF NOT EXISTS idx_graph_jobs_status ON graph_jobs(status, updated_at);

        -- Graph entities (co-occurrence index)
        CREATE TABLE IF NOT EXISTS graph_entities (
            org_id TEXT NOT NULL,
            project_id TEXT NOT NULL,
            entity TEXT NOT NULL,
            memory_ids_json TEXT NOT NULL DEFAULT '[]',
            last_seen_at TEXT NOT NULL,
            PRIMARY KEY (org_id, project_id, entity)
        );

        CREATE INDEX IF NOT EXISTS idx_graph_entities_last_seen ON graph_entities(last_seen_at);
        "#,
    )?;

    conn.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        rusqlite::params![SCHEMA_VERSION],
    )?;

    Ok(())
}
