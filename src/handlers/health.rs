//! Health, readiness, auth mode, and system stats endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::keypool::manager::PoolKind;
use crate::models::*;
use crate::state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/health
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/health", tag = "health",
    responses((status = 200, description = "Service healthy", body = HealthResponse)))]
pub async fn health_check(State(state): State<AppState>) -> Json<Value> {
    let uptime = state.start_time.elapsed().as_secs();
    let manager = state.manager().await;
    let store_ok = tokio::time::timeout(
        std::time::Duration::from_secs(2),
        state.config_store.ping(),
    )
    .await
    .unwrap_or(false);

    let resp = HealthResponse {
        status: if store_ok { "healthy" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        app: "KeyMux".to_string(),
        uptime_seconds: uptime,
        pools: vec![
            PoolInfo {
                name: "primary".to_string(),
                keys: manager.pool(PoolKind::Primary).len(),
            },
            PoolInfo {
                name: "vertex".to_string(),
                keys: manager.pool(PoolKind::Vertex).len(),
            },
        ],
    };

    Json(serde_json::to_value(resp).unwrap_or_else(|_| json!({"error": "serialization failed"})))
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/health/ready
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/health/ready", tag = "health",
    responses(
        (status = 200, description = "Service is ready"),
        (status = 503, description = "Service not yet ready")
    ))]
pub async fn readiness(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    if state.is_ready() {
        Ok(Json(json!({ "ready": true })))
    } else {
        Err(StatusCode::SERVICE_UNAVAILABLE)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/auth/mode
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/auth/mode", tag = "auth",
    responses((status = 200, description = "Authentication mode")))]
pub async fn auth_mode(State(state): State<AppState>) -> Json<Value> {
    let auth_required = state.auth_secret.is_some();
    Json(json!({
        "mode": if auth_required { "protected" } else { "open" },
        "auth_required": auth_required,
    }))
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/system/stats
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/system/stats", tag = "system",
    responses((status = 200, description = "System statistics", body = SystemStats)))]
pub async fn system_stats(State(state): State<AppState>) -> Json<Value> {
    let stats = SystemStats {
        uptime_seconds: state.start_time.elapsed().as_secs(),
        calls_last_minute: state.stats.calls_in_last_minutes(1).await,
    };
    Json(serde_json::to_value(stats).unwrap_or_else(|_| json!({"error": "serialization failed"})))
}
