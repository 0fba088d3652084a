pub mod audit;
pub mod auth;
pub mod config;
pub mod error;
pub mod handlers;
pub mod helpers;
pub mod keypool;
pub mod models;
pub mod state;
pub mod stats;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use state::AppState;

// ═══════════════════════════════════════════════════════════════════════
//  Request correlation ID middleware
// ═══════════════════════════════════════════════════════════════════════

/// Middleware that generates a UUID v4 correlation ID for each request.
///
/// - Adds it to the current tracing span as `request_id`
/// - Returns it in the `X-Request-Id` response header
/// - Accepts an incoming `X-Request-Id` header to propagate from upstream
async fn request_id_middleware(
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> axum::response::Response {
    // Use the incoming X-Request-Id if present, otherwise generate one
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // Add to current tracing span
    tracing::Span::current().record("request_id", request_id.as_str());
    tracing::debug!(request_id = %request_id, "request correlation ID assigned");

    let mut response = next.run(req).await;

    // Add X-Request-Id to response headers
    if let Ok(header_value) = axum::http::HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", header_value);
    }

    response
}

// ── OpenAPI documentation ────────────────────────────────────────────────────

#[derive(OpenApi)]
#[openapi(
    info(
        title = "KeyMux API",
        version = "1.2.0",
        description = "API-key pool manager for generative-AI reverse proxies",
        license(name = "MIT")
    ),
    paths(
        // Health
        handlers::health_check,
        handlers::readiness,
        handlers::auth_mode,
        handlers::system_stats,
        // Keys
        handlers::keys_status,
        handlers::keys_paginated,
        handlers::reset_all_fail_counts,
        handlers::reset_fail_count,
        handlers::reset_selected_fail_counts,
        handlers::verify_key,
        handlers::verify_selected,
        handlers::enable_key,
        handlers::disable_key,
        handlers::batch_operation,
        handlers::freeze_key,
        handlers::unfreeze_key,
        handlers::batch_search,
        // Precheck
        handlers::get_precheck_config,
        handlers::update_precheck_config,
        handlers::manual_trigger_precheck,
        // Config
        handlers::get_config,
        handlers::update_config,
    ),
    components(schemas(
        models::HealthResponse,
        models::PoolInfo,
        models::SystemStats,
        models::KeysPageQuery,
        models::ResetAllQuery,
        models::BatchKeysRequest,
        models::ResetSelectedRequest,
        models::BatchOperationRequest,
        models::KeyFreezeRequest,
        models::KeyUnfreezeRequest,
        models::BatchSearchRequest,
        models::PrecheckConfigRequest,
        keypool::KeyInfo,
        keypool::StatusSnapshot,
        keypool::PaginatedKeys,
        keypool::PrecheckStatus,
        keypool::ManualPrecheckReport,
    )),
    tags(
        (name = "health", description = "Health & readiness endpoints"),
        (name = "auth", description = "Authentication mode"),
        (name = "keys", description = "Key lifecycle management"),
        (name = "precheck", description = "Double-buffered key prechecking"),
        (name = "config", description = "Runtime configuration"),
        (name = "system", description = "System statistics"),
    )
)]
pub struct ApiDoc;

/// Build the application router with the given shared state.
/// Extracted from `main()` so integration tests can construct the app
/// without binding to a network port.
pub fn create_router(state: AppState) -> Router {
    // ── Public routes (no auth) ──────────────────────────────────────
    let public = Router::new()
        .route("/api/health", get(handlers::health_check))
        .route("/api/health/ready", get(handlers::readiness))
        .route("/api/auth/mode", get(handlers::auth_mode));

    // ── Protected routes ─────────────────────────────────────────────
    let protected = Router::new()
        .route("/api/system/stats", get(handlers::system_stats))
        .route("/api/keys/status", get(handlers::keys_status))
        .route("/api/keys/paginated", get(handlers::keys_paginated))
        .route(
            "/api/keys/reset-all-fail-counts",
            post(handlers::reset_all_fail_counts),
        )
        .route(
            "/api/keys/reset-fail-count/{key}",
            post(handlers::reset_fail_count),
        )
        .route(
            "/api/keys/reset-selected-fail-counts",
            post(handlers::reset_selected_fail_counts),
        )
        .route("/api/keys/verify/{key}", post(handlers::verify_key))
        .route("/api/keys/verify-selected", post(handlers::verify_selected))
        .route("/api/keys/{key}/enable", post(handlers::enable_key))
        .route("/api/keys/{key}/disable", post(handlers::disable_key))
        .route("/api/keys/batch-operation", post(handlers::batch_operation))
        .route("/api/keys/freeze", post(handlers::freeze_key))
        .route("/api/keys/unfreeze", post(handlers::unfreeze_key))
        .route("/api/keys/batch-search", post(handlers::batch_search))
        .route(
            "/api/precheck/config",
            get(handlers::get_precheck_config).post(handlers::update_precheck_config),
        )
        .route(
            "/api/precheck/trigger",
            post(handlers::manual_trigger_precheck),
        )
        .route(
            "/api/config",
            get(handlers::get_config).put(handlers::update_config),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    public
        .merge(protected)
        // Swagger UI — no auth required
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // 2 MB body limit — must be before .with_state() for Json extractor
        .layer(DefaultBodyLimit::max(2 * 1024 * 1024))
        // Request correlation ID — adds X-Request-Id header to every response
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}
