//! Key management endpoints: listings, failure-count resets, verification,
//! enable/disable, freeze/unfreeze, and batch search.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::audit::AuditAction;
use crate::helpers::redact_key;
use crate::keypool::classifier::{self, StatusFilter};
use crate::keypool::manager::PoolKind;
use crate::models::*;
use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "message": message })),
    )
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/keys/status
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/keys/status", tag = "keys",
    responses((status = 200, description = "Three-way key status snapshot")))]
pub async fn keys_status(State(state): State<AppState>) -> Json<Value> {
    let manager = state.manager().await;
    let snapshot = classifier::status_snapshot(manager.pool(PoolKind::Primary)).await;
    Json(json!({ "success": true, "data": snapshot }))
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/keys/paginated
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/keys/paginated", tag = "keys",
    responses(
        (status = 200, description = "Filtered, paginated key listing"),
        (status = 400, description = "Invalid key type")
    ))]
pub async fn keys_paginated(
    State(state): State<AppState>,
    Query(query): Query<KeysPageQuery>,
) -> Result<Json<Value>, ApiError> {
    let filter: StatusFilter = query
        .key_type
        .as_deref()
        .unwrap_or("valid")
        .parse()
        .map_err(|e: String| bad_request(&e))?;

    // out-of-range page/page_size values fall back inside `paginated`
    let manager = state.manager().await;
    let result = classifier::paginated(
        manager.pool(PoolKind::Primary),
        filter,
        query.page.unwrap_or(1),
        query.page_size.unwrap_or(10),
        query.search.as_deref(),
        query.fail_count_threshold.unwrap_or(0),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "data": result.keys,
        "total_count": result.total_count,
        "page": result.page,
        "page_size": result.page_size,
        "total_pages": result.total_pages,
        "has_next": result.has_next,
        "has_prev": result.has_prev,
    })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/reset-all-fail-counts
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/reset-all-fail-counts", tag = "keys",
    responses((status = 200, description = "Failure counts reset")))]
pub async fn reset_all_fail_counts(
    State(state): State<AppState>,
    Query(query): Query<ResetAllQuery>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    let pool = manager.pool(PoolKind::Primary);

    let Some(kind) = query.key_type else {
        pool.reset_all_failures().await;
        return Ok(Json(json!({
            "success": true,
            "message": "failure counts reset for all keys",
        })));
    };

    let filter: StatusFilter = kind.parse().map_err(|e: String| bad_request(&e))?;
    let snapshot = classifier::status_snapshot(pool).await;
    let keys_to_reset: Vec<String> = match filter {
        StatusFilter::Valid => snapshot.valid_keys.into_keys().collect(),
        StatusFilter::Invalid => snapshot.invalid_keys.into_keys().collect(),
        StatusFilter::Frozen => snapshot.frozen_keys.into_keys().collect(),
    };

    for key in &keys_to_reset {
        pool.reset_failure(key).await;
    }

    Ok(Json(json!({
        "success": true,
        "message": format!("failure counts reset for {} keys", filter.as_str()),
        "reset_count": keys_to_reset.len(),
    })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/reset-fail-count/{key}
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/reset-fail-count/{key}", tag = "keys",
    responses(
        (status = 200, description = "Failure count reset"),
        (status = 404, description = "Unknown key")
    ))]
pub async fn reset_fail_count(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    if manager.pool(PoolKind::Primary).reset_failure(&key).await {
        Ok(Json(json!({ "success": true, "message": "failure count reset" })))
    } else {
        Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "success": false, "message": "key not found" })),
        ))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/reset-selected-fail-counts
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/reset-selected-fail-counts", tag = "keys",
    request_body = ResetSelectedRequest,
    responses((status = 200, description = "Selected failure counts reset")))]
pub async fn reset_selected_fail_counts(
    State(state): State<AppState>,
    Json(body): Json<ResetSelectedRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.keys.is_empty() {
        return Err(bad_request("no keys provided"));
    }

    let manager = state.manager().await;
    let pool = manager.pool(PoolKind::from_param(body.key_type.as_deref()));

    let mut reset_count = 0usize;
    for key in &body.keys {
        if pool.reset_failure(key).await {
            reset_count += 1;
        }
    }

    Ok(Json(json!({
        "success": true,
        "message": format!("failure counts reset for {reset_count} selected keys"),
        "reset_count": reset_count,
    })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/verify/{key}
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/verify/{key}", tag = "keys",
    responses((status = 200, description = "Verification outcome")))]
pub async fn verify_key(State(state): State<AppState>, Path(key): Path<String>) -> Json<Value> {
    let manager = state.manager().await;
    match manager.verify_key(&key).await {
        Ok(()) => Json(json!({ "status": "valid" })),
        Err(error) => {
            tracing::warn!("keys: verification failed for {}: {}", redact_key(&key), error);
            Json(json!({ "status": "invalid", "error": error }))
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/verify-selected
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/verify-selected", tag = "keys",
    request_body = BatchKeysRequest,
    responses((status = 200, description = "Bulk verification outcome")))]
pub async fn verify_selected(
    State(state): State<AppState>,
    Json(body): Json<BatchKeysRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.keys.is_empty() {
        return Err(bad_request("no keys provided"));
    }

    let manager = state.manager().await;
    let (successful_keys, failed_keys) = manager.verify_selected(&body.keys).await;
    tracing::info!(
        "keys: bulk verification finished — valid: {}, invalid: {}",
        successful_keys.len(),
        failed_keys.len()
    );

    Ok(Json(json!({
        "success": true,
        "valid_count": successful_keys.len(),
        "invalid_count": failed_keys.len(),
        "successful_keys": successful_keys,
        "failed_keys": failed_keys,
    })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/{key}/enable — POST /api/keys/{key}/disable
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/{key}/enable", tag = "keys",
    responses((status = 200, description = "Key enabled"), (status = 400, description = "Unknown key")))]
pub async fn enable_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    if !manager.enable_key(&key, PoolKind::Primary).await {
        return Err(bad_request("key not found"));
    }
    crate::audit::record_key_action(&state.db, AuditAction::EnableKey, "primary", &key).await;
    Ok(Json(json!({ "success": true, "message": "key enabled" })))
}

#[utoipa::path(post, path = "/api/keys/{key}/disable", tag = "keys",
    responses((status = 200, description = "Key disabled"), (status = 400, description = "Unknown key")))]
pub async fn disable_key(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    if !manager.disable_key(&key, PoolKind::Primary).await {
        return Err(bad_request("key not found"));
    }
    crate::audit::record_key_action(&state.db, AuditAction::DisableKey, "primary", &key).await;
    Ok(Json(json!({ "success": true, "message": "key disabled" })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/batch-operation
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/batch-operation", tag = "keys",
    request_body = BatchOperationRequest,
    responses((status = 200, description = "Batch enable/disable outcome")))]
pub async fn batch_operation(
    State(state): State<AppState>,
    Json(body): Json<BatchOperationRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.keys.is_empty() {
        return Err(bad_request("no keys provided"));
    }

    let manager = state.manager().await;
    let kind = PoolKind::from_param(body.key_type.as_deref());
    let results = match body.operation.as_str() {
        "enable" => manager.batch_enable(&body.keys, kind).await,
        "disable" => manager.batch_disable(&body.keys, kind).await,
        other => return Err(bad_request(&format!("invalid operation: {other}"))),
    };

    let success_count = results.values().filter(|ok| **ok).count();
    crate::audit::record(
        &state.db,
        AuditAction::BatchOperation,
        json!({
            "operation": body.operation,
            "pool": manager.pool(kind).name(),
            "total": body.keys.len(),
            "succeeded": success_count,
        }),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "message": format!(
            "batch {} complete: {}/{} keys processed",
            body.operation, success_count, body.keys.len()
        ),
        "results": results,
        "success_count": success_count,
        "total_count": body.keys.len(),
    })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/freeze — POST /api/keys/unfreeze
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/freeze", tag = "keys",
    request_body = KeyFreezeRequest,
    responses((status = 200, description = "Key frozen"), (status = 400, description = "Unknown key")))]
pub async fn freeze_key(
    State(state): State<AppState>,
    Json(body): Json<KeyFreezeRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    let pool = manager.pool(PoolKind::from_param(body.key_type.as_deref()));
    if !pool.contains(&body.key) {
        return Err(bad_request("key not found"));
    }

    pool.freeze(&body.key, body.duration_seconds).await;
    crate::audit::record(
        &state.db,
        AuditAction::FreezeKey,
        json!({
            "pool": pool.name(),
            "key": redact_key(&body.key),
            "duration_seconds": body.duration_seconds,
        }),
    )
    .await;
    Ok(Json(json!({ "success": true, "message": "key frozen" })))
}

#[utoipa::path(post, path = "/api/keys/unfreeze", tag = "keys",
    request_body = KeyUnfreezeRequest,
    responses((status = 200, description = "Key unfrozen"), (status = 400, description = "Key was not frozen")))]
pub async fn unfreeze_key(
    State(state): State<AppState>,
    Json(body): Json<KeyUnfreezeRequest>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    let pool = manager.pool(PoolKind::from_param(body.key_type.as_deref()));

    if pool.unfreeze(&body.key).await {
        crate::audit::record_key_action(&state.db, AuditAction::UnfreezeKey, pool.name(), &body.key)
            .await;
        Ok(Json(json!({ "success": true, "message": "key unfrozen" })))
    } else {
        Err(bad_request("key is not frozen"))
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/keys/batch-search
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/keys/batch-search", tag = "keys",
    request_body = BatchSearchRequest,
    responses((status = 200, description = "Search outcome"), (status = 400, description = "Empty input")))]
pub async fn batch_search(
    State(state): State<AppState>,
    Json(body): Json<BatchSearchRequest>,
) -> Result<Json<Value>, ApiError> {
    if body.keys_input.trim().is_empty() {
        return Err(bad_request("no keys to search for"));
    }

    let manager = state.manager().await;
    let outcome = manager.batch_search(&body.keys_input).await;
    let searched = outcome.found_keys.len() + outcome.not_found_keys.len();

    Ok(Json(json!({
        "success": true,
        "message": format!("search complete, {} keys found", outcome.found_keys.len()),
        "found_keys": outcome.found_keys,
        "not_found_keys": outcome.not_found_keys,
        "search_count": searched,
        "found_count": outcome.found_keys.len(),
    })))
}
