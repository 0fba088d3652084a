//! Precheck configuration and manual-trigger endpoints.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use serde_json::{Value, json};

use crate::error::PoolError;
use crate::keypool::manager::PoolKind;
use crate::models::PrecheckConfigRequest;
use crate::state::AppState;

type ApiError = (StatusCode, Json<Value>);

fn bad_request(message: String) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "message": message })),
    )
}

async fn config_view(state: &AppState) -> Value {
    let manager = state.manager().await;
    let status = manager.precheck().status().await;
    let (enabled, count, trigger_ratio) = {
        let s = state.settings.read().await;
        (
            s.key_precheck_enabled,
            s.key_precheck_count,
            s.key_precheck_trigger_ratio,
        )
    };

    json!({
        "enabled": enabled,
        "count": count,
        "trigger_ratio": trigger_ratio,
        "current_keys_count": manager.pool(PoolKind::Primary).len(),
        "last_minute_calls": state.stats.calls_in_last_minutes(1).await,
        "current_batch_name": status.current_batch_name,
        "current_batch_valid_count": status.current_batch_count,
        "valid_keys_passed_count": status.used_count,
        "valid_keys_trigger_threshold": status.trigger_threshold,
        "current_batch_ready": status.current_ready,
        "next_batch_ready": status.next_ready,
        "next_batch_valid_count": status.next_batch_count,
        "current_key_position": status.current_key_position,
    })
}

// ═══════════════════════════════════════════════════════════════════════
//  GET /api/precheck/config
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(get, path = "/api/precheck/config", tag = "precheck",
    responses((status = 200, description = "Precheck configuration and buffer status")))]
pub async fn get_precheck_config(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "success": true, "data": config_view(&state).await }))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/precheck/config
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/precheck/config", tag = "precheck",
    request_body = PrecheckConfigRequest,
    responses(
        (status = 200, description = "Configuration updated"),
        (status = 400, description = "Parameter out of range")
    ))]
pub async fn update_precheck_config(
    State(state): State<AppState>,
    Json(body): Json<PrecheckConfigRequest>,
) -> Result<Json<Value>, ApiError> {
    if let Some(count) = body.count
        && !(10..=1000).contains(&count)
    {
        let err = PoolError::InvalidConfig("count must be between 10 and 1000".into());
        return Err(bad_request(err.to_string()));
    }
    if let Some(ratio) = body.trigger_ratio
        && !(0.1..=1.0).contains(&ratio)
    {
        let err = PoolError::InvalidConfig("trigger_ratio must be between 0.1 and 1.0".into());
        return Err(bad_request(err.to_string()));
    }

    let manager = state.manager().await;
    let changed = manager
        .precheck()
        .apply_config(body.enabled, body.count, body.trigger_ratio)
        .await;

    if !changed.is_empty() {
        state.config_store.update_config(&changed).await;
        crate::audit::record(
            &state.db,
            crate::audit::AuditAction::UpdatePrecheckConfig,
            Value::Object(changed),
        )
        .await;
    }

    Ok(Json(json!({
        "success": true,
        "message": "precheck configuration updated",
        "data": config_view(&state).await,
    })))
}

// ═══════════════════════════════════════════════════════════════════════
//  POST /api/precheck/trigger
// ═══════════════════════════════════════════════════════════════════════

#[utoipa::path(post, path = "/api/precheck/trigger", tag = "precheck",
    responses(
        (status = 200, description = "Manual precheck report"),
        (status = 400, description = "Precheck busy or disabled")
    ))]
pub async fn manual_trigger_precheck(
    State(state): State<AppState>,
) -> Result<Json<Value>, ApiError> {
    let manager = state.manager().await;
    match manager.precheck().manual_trigger().await {
        Ok(report) => Ok(Json(json!({
            "success": true,
            "message": "precheck pass complete",
            "data": report,
        }))),
        Err(err @ (PoolError::PrecheckBusy | PoolError::PrecheckDisabled)) => {
            tracing::warn!("precheck: manual trigger refused: {}", err);
            Err(bad_request(err.to_string()))
        }
        Err(err) => Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "success": false, "message": err.to_string() })),
        )),
    }
}
