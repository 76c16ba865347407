//! HTTP request surface (§4.10, §6)
//!
//! An `axum::Router` over the write/update/list/retrieval/capture pipelines,
//! the same `Router` + `axum::extract::State` shape as the teacher's
//! `realtime::server::RealtimeServer`, transplanted from a WebSocket surface
//! to a plain JSON HTTP API with `{data, status}`/`{error, status}` envelopes.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::capture::CapturePipeline;
use crate::config::Config;
use crate::crypto::EncryptionKey;
use crate::embedding::EmbeddingAdapter;
use crate::error::{CapsuleError, Result as CapsuleResult};
use crate::list;
use crate::policy;
use crate::recipe::{self, Recipe};
use crate::retrieval::RetrievalPipeline;
use crate::storage::Storage;
use crate::types::{
    CaptureEvent, CandidateStatus, CreateMemoryInput, ListOptions, SearchInput, Source, Tenancy,
    UpdateMemoryInput,
};
use crate::update::UpdatePipeline;
use crate::write::{CreateOutcome, WritePipeline};

struct Inner {
    config: Config,
    writer: WritePipeline,
    updater: UpdatePipeline,
    storage: Storage,
    retrieval: RetrievalPipeline,
    capture: CapturePipeline,
}

/// Shared process-wide state, cheaply cloned into each handler (§5 "Shared mutable state"),
/// following `RealtimeManager::clone()`'s `Arc`-wrapped-inner pattern.
#[derive(Clone)]
pub struct AppState(Arc<Inner>);

impl AppState {
    pub fn new(storage: Storage, config: Config) -> CapsuleResult<Self> {
        let default_key = match &config.meta_encryption_key {
            Some(raw) => EncryptionKey::parse(raw)?,
            None => EncryptionKey::insecure_default(),
        };
        let embedder = Arc::new(EmbeddingAdapter::new(config.embedding.clone()));

        let writer = WritePipeline::new(storage.clone(), embedder.clone(), default_key.clone(), config.max_memories);
        let updater = UpdatePipeline::new(storage.clone(), default_key);
        let retrieval = RetrievalPipeline::new(storage.clone(), embedder, config.clone());
        let capture = CapturePipeline::new(storage.clone(), WritePipeline::new(
            storage.clone(),
            Arc::new(EmbeddingAdapter::new(config.embedding.clone())),
            EncryptionKey::insecure_default(),
            config.max_memories,
        ), config.capture_threshold);

        Ok(Self(Arc::new(Inner {
            config,
            writer,
            updater,
            storage,
            retrieval,
            capture,
        })))
    }

    pub fn storage(&self) -> &Storage {
        &self.0.storage
    }
}

/// Build the router (§4.10 route table)
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/v1/memories", post(create_memory).get(list_memories))
        .route("/v1/memories/search", post(search_memories))
        .route("/v1/memories/recipes", get(list_recipes))
        .route("/v1/memories/recipes/preview", post(preview_recipe))
        .route("/v1/memories/policies", get(list_policies))
        .route("/v1/memories/policies/preview", post(preview_policy))
        .route("/v1/memories/capture", get(list_capture).post(submit_capture))
        .route("/v1/memories/capture/:id/approve", post(approve_capture))
        .route("/v1/memories/capture/:id/reject", post(reject_capture))
        .route("/v1/memories/:id", patch(update_memory).delete(delete_memory))
        .route("/health", get(health))
        .with_state(state)
}

// --- Envelopes and errors (§6, §7) ---

#[derive(Serialize)]
struct DataEnvelope<T: Serialize> {
    data: T,
    status: u16,
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: String,
    status: u16,
}

struct ApiError(CapsuleError);

impl From<CapsuleError> for ApiError {
    fn from(e: CapsuleError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.0.http_status();
        let code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (code, Json(ErrorEnvelope { error: self.0.to_string(), status })).into_response()
    }
}

fn ok<T: Serialize>(status: StatusCode, data: T) -> Response {
    (status, Json(DataEnvelope { data, status: status.as_u16() })).into_response()
}

/// Parse the tenancy triple and auth key from headers (§4.10)
fn extract_tenancy(state: &AppState, headers: &HeaderMap) -> Result<Tenancy, ApiError> {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_string);

    let org_id = header("X-Capsule-Org").ok_or_else(|| CapsuleError::InvalidArgument("missing X-Capsule-Org".to_string()))?;
    let project_id =
        header("X-Capsule-Project").ok_or_else(|| CapsuleError::InvalidArgument("missing X-Capsule-Project".to_string()))?;
    let subject_id =
        header("X-Capsule-Subject").ok_or_else(|| CapsuleError::InvalidArgument("missing X-Capsule-Subject".to_string()))?;

    let key = header("X-Capsule-Key").or_else(|| {
        header("Authorization").and_then(|v| v.strip_prefix("Bearer ").map(str::to_string))
    });
    if !state.0.config.accepts_key(key.as_deref()) {
        return Err(CapsuleError::Unauthorized("unknown or missing API key".to_string()).into());
    }

    Ok(Tenancy::new(org_id, project_id, subject_id))
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

// --- Memories (§4.1-4.4) ---

async fn create_memory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut input): Json<CreateMemoryInput>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    if let Some(key) = headers.get("Idempotency-Key").and_then(|v| v.to_str().ok()) {
        input.idempotency_key = Some(key.to_string());
    }
    if let Some(byok) = headers.get("X-Capsule-BYOK").and_then(|v| v.to_str().ok()) {
        input.byok = Some(byok.to_string());
    }

    let outcome = state.0.writer.create(&tenancy, input).await?;
    let status = match &outcome {
        CreateOutcome::Created(_) => StatusCode::CREATED,
        CreateOutcome::Replayed(_) => StatusCode::OK,
    };
    Ok(ok(status, outcome.into_inner()))
}

async fn list_memories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(opts): Query<ListOptions>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let memories = list::list(state.storage(), &tenancy, &opts)?;
    Ok(ok(StatusCode::OK, memories))
}

#[derive(Deserialize, Default)]
struct DeleteBody {
    reason: Option<String>,
}

async fn update_memory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(mut input): Json<UpdateMemoryInput>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    if let Some(byok) = headers.get("X-Capsule-BYOK").and_then(|v| v.to_str().ok()) {
        input.byok = Some(byok.to_string());
    }
    let outcome = state.0.updater.update(&tenancy, id, input).await?;
    Ok(ok(StatusCode::OK, outcome))
}

async fn delete_memory(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<DeleteBody>>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let reason = body.and_then(|Json(b)| b.reason);
    let memory = list::delete(state.storage(), &tenancy, id, reason.as_deref())?;
    Ok(ok(StatusCode::OK, memory))
}

// --- Search (§4.7) ---

fn apply_force_flag_headers(headers: &HeaderMap, input: &mut SearchInput) {
    if let Some(v) = headers.get("X-Capsule-Rewrite").and_then(|v| v.to_str().ok()) {
        input.force_rewrite = input.force_rewrite.or_else(|| v.parse().ok());
    }
    if let Some(v) = headers.get("X-Capsule-Rerank").and_then(|v| v.to_str().ok()) {
        input.force_rerank = input.force_rerank.or_else(|| v.parse().ok());
    }
}

async fn search_memories(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut input): Json<SearchInput>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    apply_force_flag_headers(&headers, &mut input);
    let response = state.0.retrieval.search(&tenancy, input).await?;
    Ok(ok(StatusCode::OK, response))
}

// --- Recipes (§4.5, §4.7, §9) ---

async fn list_recipes() -> impl IntoResponse {
    ok(StatusCode::OK, recipe::built_in_recipes())
}

#[derive(Deserialize)]
struct RecipePreviewRequest {
    recipe: Recipe,
    query: String,
    limit: Option<i64>,
    prompt: Option<String>,
    force_rewrite: Option<bool>,
    force_rerank: Option<bool>,
}

async fn preview_recipe(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RecipePreviewRequest>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let mut input = SearchInput {
        query: body.query,
        limit: body.limit,
        recipe: None,
        prompt: body.prompt,
        force_rewrite: body.force_rewrite,
        force_rerank: body.force_rerank,
    };
    apply_force_flag_headers(&headers, &mut input);
    let response = state.0.retrieval.search_with_recipe(&tenancy, input, body.recipe).await?;
    Ok(ok(StatusCode::OK, response))
}

// --- Storage policies (§4.5) ---

#[derive(Serialize)]
struct PolicySummary {
    name: &'static str,
    summary: &'static str,
}

async fn list_policies() -> impl IntoResponse {
    let summaries: Vec<PolicySummary> = policy::built_in_policies()
        .iter()
        .map(|p| PolicySummary { name: p.name, summary: p.summary })
        .collect();
    ok(StatusCode::OK, summaries)
}

#[derive(Deserialize, Default)]
struct PolicyPreviewRequest {
    #[serde(rename = "type")]
    memory_type: Option<String>,
    #[serde(default)]
    source: Source,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default)]
    pinned: bool,
}

async fn preview_policy(Json(body): Json<PolicyPreviewRequest>) -> impl IntoResponse {
    let ctx = policy::PolicyContext {
        memory_type: body.memory_type.as_deref(),
        source: &body.source,
        tags: &body.tags,
        pinned: body.pinned,
    };
    let decision = policy::evaluate(&policy::built_in_policies(), &ctx);
    ok(StatusCode::OK, decision_to_json(&decision))
}

fn decision_to_json(decision: &policy::PolicyDecision) -> serde_json::Value {
    serde_json::json!({
        "store": decision.store,
        "ttlSeconds": decision.ttl_seconds,
        "graphEnrich": decision.graph_enrich,
        "dedupeThreshold": decision.dedupe_threshold,
        "importanceScore": decision.importance_score,
        "appliedPolicies": decision.applied_policies,
    })
}

// --- Capture (§4.8) ---

#[derive(Deserialize, Default)]
struct CaptureListQuery {
    status: Option<CandidateStatus>,
    limit: Option<i64>,
}

async fn list_capture(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<CaptureListQuery>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let candidates = state.0.capture.list(&tenancy, q.status, q.limit.unwrap_or(50))?;
    Ok(ok(StatusCode::OK, candidates))
}

async fn submit_capture(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(event): Json<CaptureEvent>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let outcome = state.0.capture.submit(&tenancy, event).await?;
    Ok(ok(StatusCode::ACCEPTED, outcome))
}

async fn approve_capture(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let outcome = state.0.capture.approve(&tenancy, id).await?;
    Ok(ok(StatusCode::CREATED, outcome))
}

#[derive(Deserialize, Default)]
struct RejectBody {
    reason: Option<String>,
}

async fn reject_capture(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<RejectBody>>,
) -> Result<Response, ApiError> {
    let tenancy = extract_tenancy(&state, &headers)?;
    let reason = body.and_then(|Json(b)| b.reason);
    let candidate = state.0.capture.reject(&tenancy, id, reason)?;
    Ok(ok(StatusCode::OK, candidate))
}
