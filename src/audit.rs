// KeyMux — operator audit trail.
//
// Every mutating operator action lands in `km_audit_log` as a typed action
// plus a JSON detail blob. Key material is redacted here, at the audit
// boundary, so no caller can accidentally persist a full credential.
// Writes are fire-and-forget: a broken audit store must never fail the
// operator request it records.

use serde_json::{Value, json};
use sqlx::PgPool;

use crate::helpers::redact_key;

/// Operator actions that leave an audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    EnableKey,
    DisableKey,
    FreezeKey,
    UnfreezeKey,
    BatchOperation,
    UpdatePrecheckConfig,
    UpdateConfig,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::EnableKey => "enable_key",
            AuditAction::DisableKey => "disable_key",
            AuditAction::FreezeKey => "freeze_key",
            AuditAction::UnfreezeKey => "unfreeze_key",
            AuditAction::BatchOperation => "batch_operation",
            AuditAction::UpdatePrecheckConfig => "update_precheck_config",
            AuditAction::UpdateConfig => "update_config",
        }
    }
}

/// Record an action against a single key in a named pool. The key is
/// redacted before it leaves the process.
pub async fn record_key_action(db: &PgPool, action: AuditAction, pool_name: &str, key: &str) {
    record(
        db,
        action,
        json!({ "pool": pool_name, "key": redact_key(key) }),
    )
    .await;
}

/// Record an action with caller-supplied details. Callers must redact any
/// key material in `details` themselves (prefer `record_key_action`).
pub async fn record(db: &PgPool, action: AuditAction, details: Value) {
    if let Err(e) = sqlx::query("INSERT INTO km_audit_log (action, details) VALUES ($1, $2)")
        .bind(action.as_str())
        .bind(&details)
        .execute(db)
        .await
    {
        tracing::warn!("audit: failed to record {}: {}", action.as_str(), e);
    }
}
