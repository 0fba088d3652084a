//! Runtime configuration endpoints.
//!
//! Updating `API_KEYS` / `VERTEX_API_KEYS` rebuilds the key manager through
//! the preserved-state path: failure counts carry over for surviving keys
//! and the rotation resumes where the old instance left off.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Map, Value, json};

use crate::keypool::manager::KeyManager;
use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/config
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/config", tag = "config",
    responses((status = 200, description = "Current runtime configuration")))]
pub async fn get_config(State(state): State<AppState>) -> Json<Value> {
    let map = state.settings.read().await.as_config_map();
    Json(Value::Object(map))
}

// ═══════════════════════════════════════════════════════════════════════
//  PUT /api/config
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(put, path = "/api/config", tag = "config",
    responses(
        (status = 200, description = "Updated configuration"),
        (status = 400, description = "Body is not a JSON object")
    ))]
pub async fn update_config(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<Json<Value>, ApiError> {
    let Some(overrides) = body.as_object() else {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "message": "expected a JSON object" })),
        ));
    };

    let (old_primary, old_vertex) = {
        let s = state.settings.read().await;
        (s.api_keys.clone(), s.vertex_api_keys.clone())
    };

    {
        let mut settings = state.settings.write().await;
        settings.apply_overrides(overrides);
    }

    // persist only the known subset of what was provided
    let current = state.settings.read().await.as_config_map();
    let to_persist: Map<String, Value> = current
        .into_iter()
        .filter(|(key, _)| overrides.contains_key(key))
        .collect();
    if !to_persist.is_empty() {
        state.config_store.update_config(&to_persist).await;
    }

    let (new_primary, new_vertex) = {
        let s = state.settings.read().await;
        (s.api_keys.clone(), s.vertex_api_keys.clone())
    };

    if old_primary != new_primary || old_vertex != new_vertex {
        tracing::info!(
            "config: key lists changed ({} → {} primary, {} → {} vertex), rebuilding key manager",
            old_primary.len(),
            new_primary.len(),
            old_vertex.len(),
            new_vertex.len()
        );
        let old_manager = state.manager().await;
        let preserved = old_manager.preserve_state().await;
        let rebuilt = KeyManager::with_preserved(
            state.settings.clone(),
            state.http_client.clone(),
            state.stats.clone(),
            Some(preserved),
        )
        .await;
        rebuilt.spawn_initial_precheck().await;
        *state.key_manager.write().await = rebuilt;
    }

    crate::audit::record(
        &state.db,
        crate::audit::AuditAction::UpdateConfig,
        json!({ "updated_keys": overrides.keys().collect::<Vec<_>>() }),
    )
    .await;

    let map = state.settings.read().await.as_config_map();
    Ok(Json(Value::Object(map)))
}
