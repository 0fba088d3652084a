use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

// ── Health ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub app: String,
    pub uptime_seconds: u64,
    pub pools: Vec<PoolInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct PoolInfo {
    pub name: String,
    pub keys: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct SystemStats {
    pub uptime_seconds: u64,
    pub calls_last_minute: usize,
}

// ── Key listings ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct KeysPageQuery {
    pub key_type: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub search: Option<String>,
    pub fail_count_threshold: Option<u32>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ResetAllQuery {
    pub key_type: Option<String>,
}

// ── Key operations ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BatchKeysRequest {
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct ResetSelectedRequest {
    pub keys: Vec<String>,
    pub key_type: Option<String>,
}

/// Batch enable/disable across either pool.
#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BatchOperationRequest {
    pub keys: Vec<String>,
    /// "enable" or "disable"
    pub operation: String,
    pub key_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct KeyFreezeRequest {
    pub key: String,
    pub duration_seconds: Option<u64>,
    pub key_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct KeyUnfreezeRequest {
    pub key: String,
    pub key_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct BatchSearchRequest {
    /// Pasted blob of keys, split on `;` / `,` / newline.
    pub keys_input: String,
}

// ── Precheck ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, ToSchema)]
pub struct PrecheckConfigRequest {
    pub enabled: Option<bool>,
    pub count: Option<usize>,
    pub trigger_ratio: Option<f64>,
}
