//! End-to-end HTTP scenarios over the in-memory store, exercised through the
//! same `axum::Router` the server binary serves.
//!
//! Run with: cargo test --test end_to_end

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use capsule::config::Config;
use capsule::server::{router, AppState};
use capsule::storage::Storage;

const ORG: &str = "org-1";
const PROJECT: &str = "proj-1";
const SUBJECT: &str = "subject-1";

fn test_state() -> AppState {
    let storage = Storage::open_in_memory().unwrap();
    AppState::new(storage, Config::for_tests()).unwrap()
}

fn state_with_max_memories(max_memories: i64) -> AppState {
    let storage = Storage::open_in_memory().unwrap();
    let config = Config { max_memories, ..Config::for_tests() };
    AppState::new(storage, config).unwrap()
}

fn tenancy_request(method: &str, uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("X-Capsule-Org", ORG)
        .header("X-Capsule-Project", PROJECT)
        .header("X-Capsule-Subject", SUBJECT)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

/// Scenario 1: create + list round-trip (§8).
#[tokio::test]
async fn create_and_list_round_trip() {
    let app = router(test_state());

    let create = app
        .clone()
        .oneshot(tenancy_request(
            "POST",
            "/v1/memories",
            json!({"content": "Call me Lex during future conversations.", "pinned": true}),
        ))
        .await
        .unwrap();
    assert_eq!(create.status(), StatusCode::CREATED);
    let created = body_json(create).await;
    assert_eq!(created["data"]["memory"]["retention"], "irreplaceable");
    assert_eq!(created["data"]["memory"]["importance_score"], json!(1.5));

    let list = app
        .oneshot(tenancy_request("GET", "/v1/memories", Value::Null))
        .await
        .unwrap();
    assert_eq!(list.status(), StatusCode::OK);
    let listed = body_json(list).await;
    let memories = listed["data"].as_array().unwrap();
    assert_eq!(memories.len(), 1);
    assert_eq!(memories[0]["content"], "Call me Lex during future conversations.");
}

/// Scenario 2: idempotent create (§8).
#[tokio::test]
async fn idempotent_create_replays_same_id() {
    let app = router(test_state());
    let request = |idempotency_key: &str| {
        Request::builder()
            .method("POST")
            .uri("/v1/memories")
            .header("content-type", "application/json")
            .header("X-Capsule-Org", ORG)
            .header("X-Capsule-Project", PROJECT)
            .header("X-Capsule-Subject", SUBJECT)
            .header("Idempotency-Key", idempotency_key)
            .body(Body::from(json!({"content": "Customer prefers morning meetings."}).to_string()))
            .unwrap()
    };

    let first = app.clone().oneshot(request("k1")).await.unwrap();
    assert_eq!(first.status(), StatusCode::CREATED);
    let first_id = body_json(first).await["data"]["memory"]["id"].clone();

    let second = app.oneshot(request("k1")).await.unwrap();
    assert_eq!(second.status(), StatusCode::OK);
    let second_body = body_json(second).await;
    assert_eq!(second_body["data"]["memory"]["id"], first_id);
    assert_eq!(second_body["data"]["explanation"], "replayed idempotent request.");
}

/// Scenario 3: retention eviction under a small MAX_MEMORIES budget (§8).
#[tokio::test]
async fn retention_eviction_drops_lowest_priority_memory() {
    let app = router(state_with_max_memories(3));

    let mut ids = Vec::new();
    for i in 1..=4 {
        let response = app
            .clone()
            .oneshot(tenancy_request("POST", "/v1/memories", json!({"content": format!("memory {i}")})))
            .await
            .unwrap();
        let body = body_json(response).await;
        ids.push(body["data"]["memory"]["id"].clone());
        if i == 4 {
            assert_eq!(body["data"]["forgotten_memory_id"], ids[0]);
        }
    }

    let list = app.clone().oneshot(tenancy_request("GET", "/v1/memories", Value::Null)).await.unwrap();
    let listed = body_json(list).await;
    let remaining_ids: Vec<Value> =
        listed["data"].as_array().unwrap().iter().map(|m| m["id"].clone()).collect();
    assert!(!remaining_ids.contains(&ids[0]));
    assert!(remaining_ids.contains(&ids[3]));

    // Pin m2, then push a fifth memory with permanent retention over budget.
    // m2 is now pinned-protected, so m3 (older than m4, unprotected) is evicted instead.
    let pin = app
        .clone()
        .oneshot(tenancy_request("PATCH", &format!("/v1/memories/{}", ids[1].as_str().unwrap()), json!({"pinned": true})))
        .await
        .unwrap();
    assert_eq!(pin.status(), StatusCode::OK);

    let fifth = app
        .clone()
        .oneshot(tenancy_request(
            "POST",
            "/v1/memories",
            json!({"content": "memory 5", "retention": "permanent"}),
        ))
        .await
        .unwrap();
    let fifth_body = body_json(fifth).await;
    assert_eq!(fifth_body["data"]["forgotten_memory_id"], ids[2]);

    let list2 = app.oneshot(tenancy_request("GET", "/v1/memories", Value::Null)).await.unwrap();
    let listed2 = body_json(list2).await;
    let remaining_ids2: Vec<Value> =
        listed2["data"].as_array().unwrap().iter().map(|m| m["id"].clone()).collect();
    assert!(!remaining_ids2.contains(&ids[2]), "m3 should have been evicted");
    assert!(remaining_ids2.contains(&ids[1]), "m2 is pinned and must survive");
    assert!(remaining_ids2.contains(&ids[3]), "m4 is newer than m3 and must survive");
}

/// Scenario 4: the PII invariant rejects shared visibility, but private succeeds (§8).
#[tokio::test]
async fn pii_with_shared_visibility_is_rejected_private_succeeds() {
    let app = router(test_state());

    let rejected = app
        .clone()
        .oneshot(tenancy_request(
            "POST",
            "/v1/memories",
            json!({
                "content": "addr",
                "pii_flags": {"ssn": true},
                "acl": {"visibility": "shared", "subjects": ["s2"]}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);

    let accepted = app
        .oneshot(tenancy_request(
            "POST",
            "/v1/memories",
            json!({
                "content": "addr",
                "pii_flags": {"ssn": true},
                "acl": {"visibility": "private"}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::CREATED);
}

/// Scenario 5: adaptive search surfaces the most relevant seeded memory first (§8).
#[tokio::test]
async fn adaptive_search_ranks_relevant_memory_first() {
    let app = router(test_state());

    for content in ["Lex prefers morning standups", "meeting notes q3", "random chatter"] {
        let response = app
            .clone()
            .oneshot(tenancy_request("POST", "/v1/memories", json!({"content": content})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let search = app
        .oneshot(tenancy_request(
            "POST",
            "/v1/memories/search",
            json!({"query": "when does Lex like meetings?", "recipe": "conversation-memory"}),
        ))
        .await
        .unwrap();
    assert_eq!(search.status(), StatusCode::OK);
    let body = body_json(search).await;
    let results = body["data"]["results"].as_array().unwrap();
    assert!(results.len() >= 2);
    assert_eq!(results[0]["memory"]["content"], "Lex prefers morning standups");
    assert!(results[0]["score"].as_f64().unwrap() > results[1]["score"].as_f64().unwrap());
    assert!(body["data"]["metrics"]["rewrite_applied"].is_boolean());
}

/// Scenario 6: submitting then approving a capture candidate creates a memory (§8).
#[tokio::test]
async fn capture_submit_then_approve_creates_memory() {
    let app = router(test_state());

    let submit = app
        .clone()
        .oneshot(tenancy_request(
            "POST",
            "/v1/memories/capture",
            json!({
                "role": "user",
                "content": "Remember that my flight confirmation is ABC123.",
                "metadata": {"explicitMemory": true}
            }),
        ))
        .await
        .unwrap();
    assert_eq!(submit.status(), StatusCode::ACCEPTED);
    let submitted = body_json(submit).await;
    let candidate_id = submitted["data"]["candidate"]["id"].clone();
    assert!(submitted["data"]["candidate"]["score"].as_f64().unwrap() >= 0.5);
    assert_eq!(submitted["data"]["candidate"]["status"], "pending");

    let approve = app
        .clone()
        .oneshot(tenancy_request(
            "POST",
            &format!("/v1/memories/capture/{}/approve", candidate_id.as_str().unwrap()),
            Value::Null,
        ))
        .await
        .unwrap();
    assert_eq!(approve.status(), StatusCode::CREATED);
    let approved = body_json(approve).await;
    assert_eq!(approved["data"]["candidate"]["status"], "approved");
    assert!(approved["data"]["candidate"]["memory_id"].is_string());

    let list = app.oneshot(tenancy_request("GET", "/v1/memories", Value::Null)).await.unwrap();
    let listed = body_json(list).await;
    assert!(listed["data"]
        .as_array()
        .unwrap()
        .iter()
        .any(|m| m["content"] == "Remember that my flight confirmation is ABC123."));
}
