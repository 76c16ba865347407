//! Core data model for Capsule Memory (§3)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Dense embedding dimension (§3)
pub const EMBEDDING_DIM: usize = 1024;

/// Default per-tenancy memory cap (§3, CAPSULE_MAX_MEMORIES)
pub const DEFAULT_MAX_MEMORIES: usize = 100;

/// Default capture threshold (§4.8, CAPSULE_CAPTURE_THRESHOLD)
pub const DEFAULT_CAPTURE_THRESHOLD: f32 = 0.5;

/// Default TTL applied to ephemeral retention without an explicit TTL (§4.6)
pub const EPHEMERAL_DEFAULT_TTL_SECONDS: i64 = 7 * 86_400;

/// Maximum TTL accepted on create (§4.1)
pub const MAX_TTL_SECONDS: i64 = 365 * 86_400;

/// The tenancy triple that owns every memory and candidate (§3 "Ownership")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tenancy {
    pub org_id: String,
    pub project_id: String,
    pub subject_id: String,
}

impl Tenancy {
    pub fn new(org_id: impl Into<String>, project_id: impl Into<String>, subject_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            project_id: project_id.into(),
            subject_id: subject_id.into(),
        }
    }

    /// The `(orgId, projectId)` scope that graph entities share (§3 "Ownership")
    pub fn project_scope(&self) -> (String, String) {
        (self.org_id.clone(), self.project_id.clone())
    }
}

/// Visibility levels for a memory's ACL (§3)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    #[default]
    Private,
    Shared,
    Public,
}

/// Access control on a memory (§3)
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Acl {
    #[serde(default)]
    pub visibility: Visibility,
    #[serde(default)]
    pub subjects: Vec<String>,
}

/// Provenance of where a memory's content came from (§3); at least one field must be populated
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Source {
    pub app: Option<String>,
    pub connector: Option<String>,
    pub url: Option<String>,
    pub file_id: Option<String>,
    pub span_id: Option<String>,
}

impl Source {
    pub fn is_empty(&self) -> bool {
        self.app.is_none()
            && self.connector.is_none()
            && self.url.is_none()
            && self.file_id.is_none()
            && self.span_id.is_none()
    }
}

/// An append-only provenance event (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvenanceEvent {
    pub event: String,
    pub at: DateTime<Utc>,
    pub actor: Option<String>,
    pub description: Option<String>,
    pub reference_id: Option<String>,
}

impl ProvenanceEvent {
    pub fn new(event: impl Into<String>, actor: Option<String>) -> Self {
        Self {
            event: event.into(),
            at: Utc::now(),
            actor,
            description: None,
            reference_id: None,
        }
    }
}

/// PII representation: either a plaintext flag map or an encrypted envelope, never both (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PiiField {
    Plain(HashMap<String, bool>),
    Encrypted(PiiEnvelope),
}

impl PiiField {
    /// True if any flag in a plaintext map is set. Encrypted envelopes must be
    /// decrypted by the caller before this check is meaningful.
    pub fn has_sensitive_plain(&self) -> bool {
        match self {
            PiiField::Plain(map) => map.values().any(|v| *v),
            PiiField::Encrypted(_) => false,
        }
    }
}

/// Encrypted PII envelope persisted on the memory (§6)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PiiEnvelope {
    pub version: u8,
    pub iv: String,
    pub tag: String,
    pub data: String,
}

/// Storage destination for a memory (§3, §4.5)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Store {
    #[default]
    LongTerm,
    ShortTerm,
    CapsuleGraph,
}

/// Retention classification (§3, §4.6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Retention {
    Irreplaceable,
    Permanent,
    Replaceable,
    Ephemeral,
}

impl Retention {
    /// Eviction priority, low evicts first (§4.6)
    pub fn priority(&self) -> u8 {
        match self {
            Retention::Ephemeral => 0,
            Retention::Replaceable => 1,
            Retention::Permanent => 3,
            Retention::Irreplaceable => 4,
        }
    }

    /// Protected retention classes never carry a TTL (§3, §4.6)
    pub fn is_protected(&self) -> bool {
        matches!(self, Retention::Irreplaceable | Retention::Permanent)
    }
}

impl std::str::FromStr for Retention {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "irreplaceable" => Ok(Retention::Irreplaceable),
            "permanent" => Ok(Retention::Permanent),
            "replaceable" => Ok(Retention::Replaceable),
            "ephemeral" => Ok(Retention::Ephemeral),
            _ => Err(format!("Unknown retention class: {}", s)),
        }
    }
}

/// Storage state attached to a memory after policy evaluation (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageState {
    pub store: Store,
    #[serde(default)]
    pub policies: Vec<String>,
    pub graph_enrich: Option<bool>,
    pub dedupe_threshold: Option<f32>,
}

impl Default for StorageState {
    fn default() -> Self {
        Self {
            store: Store::LongTerm,
            policies: Vec::new(),
            graph_enrich: None,
            dedupe_threshold: None,
        }
    }
}

/// A memory entry (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: Uuid,
    pub org_id: String,
    pub project_id: String,
    pub subject_id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub embedding_norm: f32,
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub pinned: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(rename = "type")]
    pub memory_type: Option<String>,
    pub lang: String,
    pub importance_score: f32,
    pub recency_score: f32,
    pub acl: Acl,
    pub source: Source,
    pub ttl_seconds: Option<i64>,
    pub expires_at: Option<DateTime<Utc>>,
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub provenance: Vec<ProvenanceEvent>,
    pub pii: Option<PiiField>,
    pub storage: StorageState,
    pub retention: Retention,
}

impl Memory {
    pub fn tenancy(&self) -> Tenancy {
        Tenancy::new(&self.org_id, &self.project_id, &self.subject_id)
    }

    /// Access gate (§4.4): caller `subject` may read this memory iff it is theirs,
    /// public, or shared with them.
    pub fn accessible_to(&self, subject: &str) -> bool {
        if self.subject_id == subject {
            return true;
        }
        match self.acl.visibility {
            Visibility::Public => true,
            Visibility::Shared => self.acl.subjects.is_empty() || self.acl.subjects.iter().any(|s| s == subject),
            Visibility::Private => false,
        }
    }
}

/// Input for creating a memory (§4.1)
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct CreateMemoryInput {
    pub content: String,
    pub pinned: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub ttl_seconds: Option<i64>,
    pub idempotency_key: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: Option<String>,
    pub lang: Option<String>,
    pub importance_score: Option<f32>,
    pub recency_score: Option<f32>,
    pub source: Option<Source>,
    pub acl: Option<Acl>,
    pub pii_flags: Option<HashMap<String, bool>>,
    pub byok: Option<String>,
    pub storage: Option<StorageOverride>,
    pub retention: Option<Retention>,
}

/// Caller-supplied storage override merged over the policy engine's decision (§4.1 step 5)
#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageOverride {
    pub store: Option<Store>,
    pub ttl_seconds: Option<i64>,
    pub graph_enrich: Option<bool>,
    pub dedupe_threshold: Option<f32>,
}

/// Input for partially updating a memory (§4.2). `Some(None)` clears a field,
/// `None` leaves it untouched, `Some(Some(v))` sets it.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct UpdateMemoryInput {
    pub content: Option<String>,
    pub pinned: Option<bool>,
    #[serde(default)]
    pub tags: Option<Option<Vec<String>>>,
    #[serde(default)]
    pub ttl_seconds: Option<Option<i64>>,
    #[serde(default, rename = "type")]
    pub memory_type: Option<Option<String>>,
    pub importance_score: Option<f32>,
    pub recency_score: Option<f32>,
    pub acl: Option<Acl>,
    pub pii_flags: Option<HashMap<String, bool>>,
    pub byok: Option<String>,
    pub retention: Option<Retention>,
    /// Storage-policy override: only `graph_enrich` is mutable post-create (§4.2,
    /// §4.5 "manual override" is create-only for the rest of the decision).
    pub graph_enrich: Option<bool>,
}

/// Options for listing memories (§4.3)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ListOptions {
    pub limit: Option<i64>,
    /// Filter to a specific subject within the project, distinct from the
    /// `X-Capsule-Subject` header used for the access gate (§6 `GET /v1/memories`).
    pub subject_id: Option<String>,
    pub pinned: Option<bool>,
    pub tag: Option<String>,
    #[serde(rename = "type")]
    pub memory_type: Option<String>,
    pub visibility: Option<Visibility>,
    pub store: Option<Store>,
    pub graph_enrich: Option<bool>,
    pub retention: Option<Retention>,
}

pub const DEFAULT_LIST_LIMIT: i64 = 50;
pub const MAX_LIST_LIMIT: i64 = 200;

/// Default and max result count for an adaptive search request (§4.7)
pub const DEFAULT_SEARCH_LIMIT: i64 = 10;
pub const MAX_SEARCH_LIMIT: i64 = 50;

/// Result of a create/update/delete mutation (§4.1, §4.2, §6)
#[derive(Debug, Clone, Serialize)]
pub struct MutationOutcome {
    pub memory: Memory,
    pub explanation: String,
    pub forgotten_memory_id: Option<Uuid>,
}

/// Role of a captured conversation event (§3, §4.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventRole {
    User,
    Assistant,
    System,
}

/// Category a capture candidate was scored into (§3, §4.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureCategory {
    Preference,
    Fact,
    Task,
    Context,
    Other,
}

/// Lifecycle status of a capture candidate (§3, §4.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CandidateStatus {
    Pending,
    Approved,
    Rejected,
    Ignored,
}

/// A scored conversation event awaiting a capture decision (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureCandidate {
    pub id: Uuid,
    pub org_id: String,
    pub project_id: String,
    pub subject_id: String,
    pub source_event_id: Option<String>,
    pub role: EventRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    pub score: f32,
    pub threshold: f32,
    pub recommended: bool,
    pub category: CaptureCategory,
    pub reasons: Vec<String>,
    pub status: CandidateStatus,
    pub auto_accepted: Option<bool>,
    pub auto_decision_reason: Option<String>,
    pub memory_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CaptureCandidate {
    pub fn tenancy(&self) -> Tenancy {
        Tenancy::new(&self.org_id, &self.project_id, &self.subject_id)
    }
}

/// A conversation event submitted for capture scoring (§4.8)
#[derive(Debug, Clone, Deserialize)]
pub struct CaptureEvent {
    pub role: EventRole,
    pub content: String,
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub auto_accept: bool,
    pub source_event_id: Option<String>,
}

/// Status of a background entity-extraction job (§3, §4.9)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GraphJobStatus {
    Pending,
    Running,
    Success,
    Error,
}

/// Background graph-enrichment job for a memory (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphJob {
    pub id: Uuid,
    pub org_id: String,
    pub project_id: String,
    pub memory_id: Uuid,
    pub status: GraphJobStatus,
    pub attempts: i32,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A co-occurrence graph entity shared across memories within `(orgId, projectId)` (§3)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEntity {
    pub org_id: String,
    pub project_id: String,
    pub entity: String,
    pub memory_ids: Vec<Uuid>,
    pub last_seen_at: DateTime<Utc>,
}

/// A single scored search hit (§4.7)
#[derive(Debug, Clone, Serialize)]
pub struct SearchHit {
    pub memory: Memory,
    pub score: f32,
    pub recipe_score: f32,
    #[serde(default)]
    pub graph_hit: bool,
}

/// Metrics reported alongside a search response (§4.7, §6)
#[derive(Debug, Clone, Serialize, Default)]
pub struct SearchMetrics {
    pub rewrite_applied: bool,
    pub rewrite_latency_ms: u64,
    pub rerank_applied: bool,
    pub rerank_latency_ms: u64,
}

/// Response of an adaptive search (§4.7)
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub query: String,
    pub recipe: String,
    pub results: Vec<SearchHit>,
    pub explanation: String,
    pub metrics: SearchMetrics,
}

/// Input for an adaptive search request (§4.7)
#[derive(Debug, Clone, Deserialize)]
pub struct SearchInput {
    pub query: String,
    pub limit: Option<i64>,
    pub recipe: Option<String>,
    pub prompt: Option<String>,
    pub force_rewrite: Option<bool>,
    pub force_rerank: Option<bool>,
}
