use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use keymux_backend::state::AppState;

/// Helper: build a fresh app router with a clean in-memory AppState.
/// Uses `connect_lazy` — no real database connection required.
async fn app_with_keys(keys: &[&str]) -> axum::Router {
    let state = AppState::new_test(
        keys.iter().map(|k| k.to_string()).collect(),
        Vec::new(),
    )
    .await;
    keymux_backend::create_router(state)
}

async fn app() -> axum::Router {
    app_with_keys(&["key-alpha", "key-bravo", "key-charlie"]).await
}

/// Helper: collect a response body into a serde_json::Value.
async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&body).unwrap()))
        .unwrap()
}

fn post_empty(uri: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET /api/health
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn health_returns_200() {
    let response = app().await.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn health_has_correct_fields() {
    let response = app().await.oneshot(get("/api/health")).await.unwrap();
    let json = body_json(response).await;

    // new_test() has no reachable config store, so status is "degraded"
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["app"], "KeyMux");
    assert!(json["uptime_seconds"].is_u64());

    let pools = json["pools"].as_array().unwrap();
    assert_eq!(pools.len(), 2);
    assert_eq!(pools[0]["name"], "primary");
    assert_eq!(pools[0]["keys"], 3);
    assert_eq!(pools[1]["name"], "vertex");
    assert_eq!(pools[1]["keys"], 0);
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET /api/health/ready — GET /api/auth/mode
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn readiness_returns_503_before_ready() {
    let response = app().await.oneshot(get("/api/health/ready")).await.unwrap();
    // new_test() does not call mark_ready(), so should be 503
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn auth_mode_is_open_without_secret() {
    let response = app().await.oneshot(get("/api/auth/mode")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["auth_required"], false);
    assert_eq!(json["mode"], "open");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Auth middleware
// ═══════════════════════════════════════════════════════════════════════════

async fn protected_app() -> axum::Router {
    let mut state = AppState::new_test(vec!["key-alpha".to_string()], Vec::new()).await;
    state.auth_secret = Some("operator-secret".to_string());
    keymux_backend::create_router(state)
}

#[tokio::test]
async fn protected_route_requires_bearer_token() {
    let response = protected_app()
        .await
        .oneshot(get("/api/keys/status"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn protected_route_accepts_valid_token() {
    let request = Request::builder()
        .uri("/api/keys/status")
        .header("authorization", "Bearer operator-secret")
        .body(Body::empty())
        .unwrap();

    let response = protected_app().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn protected_route_rejects_wrong_token() {
    let request = Request::builder()
        .uri("/api/keys/status")
        .header("authorization", "Bearer wrong")
        .body(Body::empty())
        .unwrap();

    let response = protected_app().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_stays_public_with_auth_enabled() {
    let response = protected_app().await.oneshot(get("/api/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET /api/keys/status — GET /api/keys/paginated
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn keys_status_buckets_all_keys_as_valid() {
    let response = app().await.oneshot(get("/api/keys/status")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["valid_keys"].as_object().unwrap().len(), 3);
    assert!(json["data"]["invalid_keys"].as_object().unwrap().is_empty());
    assert!(json["data"]["frozen_keys"].as_object().unwrap().is_empty());
}

#[tokio::test]
async fn paginated_listing_returns_sorted_page() {
    let response = app()
        .await
        .oneshot(get("/api/keys/paginated?key_type=valid&page=1&page_size=2"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["total_count"], 3);
    assert_eq!(json["total_pages"], 2);
    assert_eq!(json["has_next"], true);
    assert_eq!(json["data"].as_object().unwrap().len(), 2);
    // BTreeMap ordering: alpha sorts first
    assert!(json["data"].as_object().unwrap().contains_key("key-alpha"));
}

#[tokio::test]
async fn paginated_rejects_invalid_key_type() {
    let response = app()
        .await
        .oneshot(get("/api/keys/paginated?key_type=bogus"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn paginated_falls_back_on_oversized_page_size() {
    let response = app()
        .await
        .oneshot(get("/api/keys/paginated?page_size=1001"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // out-of-range sizes silently fall back to the default page size
    let json = body_json(response).await;
    assert_eq!(json["page_size"], 10);
    assert_eq!(json["total_count"], 3);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Enable / disable / freeze / unfreeze
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn disable_then_enable_round_trips() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(post_empty("/api/keys/key-alpha/disable"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(get("/api/keys/paginated?key_type=frozen"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["total_count"], 1);

    let response = app
        .clone()
        .oneshot(post_empty("/api/keys/key-alpha/enable"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .oneshot(get("/api/keys/paginated?key_type=frozen"))
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["total_count"], 0);
}

#[tokio::test]
async fn disable_unknown_key_returns_400() {
    let response = app()
        .await
        .oneshot(post_empty("/api/keys/ghost/disable"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn freeze_then_unfreeze_round_trips() {
    let app = app().await;

    let response = app
        .clone()
        .oneshot(post_json(
            "/api/keys/freeze",
            json!({ "key": "key-bravo", "duration_seconds": 3600 }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(post_json("/api/keys/unfreeze", json!({ "key": "key-bravo" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // a second unfreeze has nothing to clear
    let response = app
        .oneshot(post_json("/api/keys/unfreeze", json!({ "key": "key-bravo" })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn batch_operation_disables_and_reports_counts() {
    let response = app()
        .await
        .oneshot(post_json(
            "/api/keys/batch-operation",
            json!({ "keys": ["key-alpha", "ghost"], "operation": "disable" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success_count"], 1);
    assert_eq!(json["total_count"], 2);
    assert_eq!(json["results"]["key-alpha"], true);
    assert_eq!(json["results"]["ghost"], false);
}

#[tokio::test]
async fn batch_operation_rejects_unknown_operation() {
    let response = app()
        .await
        .oneshot(post_json(
            "/api/keys/batch-operation",
            json!({ "keys": ["key-alpha"], "operation": "explode" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Failure-count resets
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn reset_fail_count_of_unknown_key_returns_404() {
    let response = app()
        .await
        .oneshot(post_empty("/api/keys/reset-fail-count/ghost"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn reset_all_fail_counts_succeeds() {
    let response = app()
        .await
        .oneshot(post_empty("/api/keys/reset-all-fail-counts"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
}

#[tokio::test]
async fn reset_selected_requires_keys() {
    let response = app()
        .await
        .oneshot(post_json(
            "/api/keys/reset-selected-fail-counts",
            json!({ "keys": [] }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  POST /api/keys/batch-search
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn batch_search_finds_and_reports_missing_keys() {
    let response = app()
        .await
        .oneshot(post_json(
            "/api/keys/batch-search",
            json!({ "keys_input": "key-alpha;key-bravo;ghost" }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["found_count"], 2);
    assert_eq!(json["search_count"], 3);
    assert_eq!(json["found_keys"]["key-alpha"]["status"], "valid");
    assert_eq!(json["not_found_keys"], json!(["ghost"]));
}

#[tokio::test]
async fn batch_search_rejects_empty_input() {
    let response = app()
        .await
        .oneshot(post_json("/api/keys/batch-search", json!({ "keys_input": "  " })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Verification (probe target is unroutable in tests — keys come back invalid)
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn verify_key_reports_invalid_when_upstream_unreachable() {
    let response = app()
        .await
        .oneshot(post_empty("/api/keys/verify/key-alpha"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "invalid");
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn verify_selected_requires_keys() {
    let response = app()
        .await
        .oneshot(post_json("/api/keys/verify-selected", json!({ "keys": [] })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Precheck config + manual trigger
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn precheck_config_reports_defaults() {
    let response = app().await.oneshot(get("/api/precheck/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["data"]["enabled"], false);
    assert_eq!(json["data"]["count"], 50);
    assert_eq!(json["data"]["current_keys_count"], 3);
    assert_eq!(json["data"]["current_batch_name"], "A");
}

#[tokio::test]
async fn precheck_config_rejects_out_of_range_count() {
    let response = app()
        .await
        .oneshot(post_json("/api/precheck/config", json!({ "count": 5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert!(json["message"].as_str().unwrap().contains("count"));
}

#[tokio::test]
async fn precheck_config_rejects_out_of_range_ratio() {
    let response = app()
        .await
        .oneshot(post_json("/api/precheck/config", json!({ "trigger_ratio": 1.5 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn precheck_config_accepts_valid_update() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(post_json("/api/precheck/config", json!({ "count": 20 })))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/precheck/config")).await.unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["count"], 20);
}

#[tokio::test]
async fn manual_trigger_refused_while_disabled() {
    let response = app()
        .await
        .oneshot(post_empty("/api/precheck/trigger"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let json = body_json(response).await;
    assert!(json["message"].as_str().unwrap().contains("disabled"));
}

// ═══════════════════════════════════════════════════════════════════════════
//  GET/PUT /api/config
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn get_config_returns_known_subset() {
    let response = app().await.oneshot(get("/api/config")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["MAX_FAILURES"], 3);
    assert_eq!(json["MAX_RETRIES"], 3);
    assert_eq!(json["API_KEYS"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn put_config_updates_settings() {
    let request = Request::builder()
        .method("PUT")
        .uri("/api/config")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({ "MAX_RETRIES": 5 })).unwrap(),
        ))
        .unwrap();

    let response = app().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["MAX_RETRIES"], 5);
}

#[tokio::test]
async fn put_config_with_new_key_list_rebuilds_the_pool() {
    let app = app().await;
    let request = Request::builder()
        .method("PUT")
        .uri("/api/config")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({ "API_KEYS": ["fresh-one", "fresh-two"] })).unwrap(),
        ))
        .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app.oneshot(get("/api/keys/status")).await.unwrap();
    let json = body_json(response).await;
    let valid = json["data"]["valid_keys"].as_object().unwrap();
    assert_eq!(valid.len(), 2);
    assert!(valid.contains_key("fresh-one"));
}

#[tokio::test]
async fn put_config_rejects_non_object_body() {
    let request = Request::builder()
        .method("PUT")
        .uri("/api/config")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&json!([1, 2, 3])).unwrap()))
        .unwrap();

    let response = app().await.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ═══════════════════════════════════════════════════════════════════════════
//  404 for unknown routes
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn unknown_route_returns_404() {
    let response = app().await.oneshot(get("/api/nonexistent")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn responses_carry_request_id_header() {
    let response = app().await.oneshot(get("/api/health")).await.unwrap();
    assert!(response.headers().contains_key("x-request-id"));
}
