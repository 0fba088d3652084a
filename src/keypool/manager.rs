// KeyMux — key manager: selection, failure handling, lifecycle.
//
// One manager owns two pools ("primary" and "vertex") with identical
// semantics and disjoint state, plus the precheck engine attached to the
// primary pool. The hot path is `get_next_working_key`: serve from the
// precheck batch when available, otherwise rotate and validate in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use futures_util::future::join_all;
use once_cell::sync::Lazy;
use serde::Serialize;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::config::SharedSettings;
use crate::error::PoolError;
use crate::helpers::redact_key;
use crate::keypool::classifier;
use crate::keypool::pool::Pool;
use crate::keypool::precheck::PrecheckEngine;
use crate::keypool::validator::{KeyValidator, apply_probe_outcome};
use crate::stats::CallStats;

// ── Pool addressing ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoolKind {
    #[default]
    Primary,
    Vertex,
}

impl PoolKind {
    /// Operator requests address the vertex pool as `"vertex"`; anything
    /// else (including the legacy `"gemini"`) means the primary pool.
    pub fn from_param(param: Option<&str>) -> Self {
        match param {
            Some("vertex") => PoolKind::Vertex,
            _ => PoolKind::Primary,
        }
    }
}

// ── Preserved state ─────────────────────────────────────────────────────────

/// State bag carried across a manager rebuild: failure counts survive for
/// keys that persist, and the rotation resumes at the key the old instance
/// would have served next.
#[derive(Debug, Clone, Default)]
pub struct PreservedState {
    pub failure_counts: HashMap<String, u32>,
    pub vertex_failure_counts: HashMap<String, u32>,
    pub old_keys: Vec<String>,
    pub vertex_old_keys: Vec<String>,
    pub next_key: Option<String>,
    pub vertex_next_key: Option<String>,
}

// ── Batch search ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct FoundKey {
    pub status: String,
    pub fail_count: u32,
    pub disabled: bool,
    pub frozen: bool,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct BatchSearchOutcome {
    pub found_keys: BTreeMap<String, FoundKey>,
    pub not_found_keys: Vec<String>,
}

/// Split operator search input into key tokens. Semicolons take precedence
/// over commas, which take precedence over newlines.
pub fn split_search_tokens(input: &str) -> Vec<String> {
    let trimmed = input.trim();
    let sep = if trimmed.contains(';') {
        ';'
    } else if trimmed.contains(',') {
        ','
    } else {
        '\n'
    };
    trimmed
        .split(sep)
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

// ── Manager ─────────────────────────────────────────────────────────────────

pub struct KeyManager {
    settings: SharedSettings,
    primary: Arc<Pool>,
    vertex: Arc<Pool>,
    precheck: Arc<PrecheckEngine>,
    validator: KeyValidator,
    stats: Arc<CallStats>,
}

impl KeyManager {
    /// Build a manager from the key lists currently in settings,
    /// optionally restoring state preserved from a previous instance.
    pub async fn with_preserved(
        settings: SharedSettings,
        client: reqwest::Client,
        stats: Arc<CallStats>,
        preserved: Option<PreservedState>,
    ) -> Arc<Self> {
        let (primary_keys, vertex_keys) = {
            let s = settings.read().await;
            (s.api_keys.clone(), s.vertex_api_keys.clone())
        };
        if primary_keys.is_empty() {
            tracing::warn!("keypool: initialising with an empty primary key list");
        }

        let primary = Arc::new(Pool::new("primary", primary_keys, settings.clone()));
        let vertex = Arc::new(Pool::new("vertex", vertex_keys, settings.clone()));
        let validator = KeyValidator::new(client, settings.clone());
        let precheck = PrecheckEngine::new(primary.clone(), validator.clone(), settings.clone());

        let manager = Arc::new(Self {
            settings,
            primary,
            vertex,
            precheck,
            validator,
            stats,
        });

        if let Some(p) = preserved {
            manager
                .primary
                .restore_failure_counts(&p.failure_counts)
                .await;
            manager
                .vertex
                .restore_failure_counts(&p.vertex_failure_counts)
                .await;
            restore_cursor(&manager.primary, &p.old_keys, p.next_key.as_deref()).await;
            restore_cursor(
                &manager.vertex,
                &p.vertex_old_keys,
                p.vertex_next_key.as_deref(),
            )
            .await;
        }

        tracing::info!(
            "keypool: manager ready with {} primary and {} vertex keys",
            manager.primary.len(),
            manager.vertex.len()
        );
        manager
    }

    /// Kick off the startup precheck pass (no-op when disabled).
    pub async fn spawn_initial_precheck(&self) {
        if self.precheck.enabled().await {
            let (count, ratio) = {
                let s = self.settings.read().await;
                (s.key_precheck_count, s.key_precheck_trigger_ratio)
            };
            tracing::info!(
                "precheck: enabled (count={}, trigger_ratio={}), running initial pass",
                count,
                ratio
            );
            self.precheck.spawn_fill("startup");
        } else {
            tracing::info!("precheck: disabled or no keys loaded");
        }
    }

    pub fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<CallStats> {
        &self.stats
    }

    pub fn precheck(&self) -> &Arc<PrecheckEngine> {
        &self.precheck
    }

    pub fn pool(&self, kind: PoolKind) -> &Arc<Pool> {
        match kind {
            PoolKind::Primary => &self.primary,
            PoolKind::Vertex => &self.vertex,
        }
    }

    // ── Rotation ────────────────────────────────────────────────────────────

    pub async fn get_next_key(&self) -> Result<String, PoolError> {
        self.primary.next_raw().await
    }

    pub async fn get_next_vertex_key(&self) -> Result<String, PoolError> {
        self.vertex.next_raw().await
    }

    // ── Selection ───────────────────────────────────────────────────────────

    /// Next working primary key. Prefers the precheck batch; falls back to
    /// rotation + in-place validation when prechecking is off or dry.
    pub async fn get_next_working_key(&self) -> Result<String, PoolError> {
        self.stats.record().await;

        if !self.precheck.enabled().await {
            return self.next_working_from(&self.primary).await;
        }

        if let Some(key) = self.precheck.next_from_current().await {
            return Ok(key);
        }

        tracing::info!("keypool: current batch empty or not ready, running immediate precheck");
        if !self.precheck.run_once().await {
            // another pass holds the flag; wait for it instead
            if let Err(e) = self.precheck.wait_for_completion().await {
                tracing::warn!("keypool: {}", e);
            }
        }
        if let Some(key) = self.precheck.next_from_current().await {
            return Ok(key);
        }

        tracing::warn!("keypool: no valid keys after precheck, falling back to rotation");
        self.next_working_from(&self.primary).await
    }

    /// Next working vertex key (always the rotation path).
    pub async fn get_next_working_vertex_key(&self) -> Result<String, PoolError> {
        self.stats.record().await;
        self.next_working_from(&self.vertex).await
    }

    /// Bounded legacy loop: rotate until a valid key appears or the cycle
    /// closes, in which case the revisited key is returned regardless —
    /// degraded mode, but the selector never blocks on an unhealthy pool.
    async fn next_working_from(&self, pool: &Pool) -> Result<String, PoolError> {
        let initial = pool.next_raw().await?;
        let mut current = initial.clone();
        loop {
            if pool.is_valid(&current).await {
                return Ok(current);
            }
            current = pool.next_raw().await?;
            if current == initial {
                tracing::error!(
                    "keypool[{}]: rotation exhausted without a valid key, returning {} in degraded mode",
                    pool.name(),
                    redact_key(&current)
                );
                return Ok(current);
            }
        }
    }

    // ── Failure handling ────────────────────────────────────────────────────

    /// Record a non-rate-limit failure. Returns the next working key while
    /// retries remain, `None` once the caller should give up.
    pub async fn handle_api_failure(
        &self,
        key: &str,
        retries: u32,
    ) -> Result<Option<String>, PoolError> {
        let max_retries = self.settings.read().await.max_retries;
        self.primary.increment_failure(key).await;
        if retries < max_retries {
            Ok(Some(self.get_next_working_key().await?))
        } else {
            Ok(None)
        }
    }

    pub async fn handle_vertex_api_failure(
        &self,
        key: &str,
        retries: u32,
    ) -> Result<Option<String>, PoolError> {
        let max_retries = self.settings.read().await.max_retries;
        self.vertex.increment_failure(key).await;
        if retries < max_retries {
            Ok(Some(self.get_next_working_vertex_key().await?))
        } else {
            Ok(None)
        }
    }

    /// Rate-limit handling: freeze instead of counting. Returns whether the
    /// key was frozen (false when freeze-on-429 is disabled).
    pub async fn handle_429(&self, key: &str, kind: PoolKind) -> bool {
        let freeze_enabled = self.settings.read().await.enable_key_freeze_on_429;
        if !freeze_enabled {
            tracing::warn!(
                "keypool: freeze-on-429 is disabled, not freezing key {}",
                redact_key(key)
            );
            return false;
        }
        let pool = self.pool(kind);
        pool.freeze(key, None).await;
        tracing::warn!(
            "keypool[{}]: key {} frozen due to rate limit",
            pool.name(),
            redact_key(key)
        );
        true
    }

    /// First key below the failure threshold, or the head of the list when
    /// every key is exhausted.
    pub async fn get_first_valid_key(&self) -> Result<String, PoolError> {
        let max_failures = self.settings.read().await.max_failures;
        let counts = self.primary.failure_counts_snapshot().await;
        for key in self.primary.keys() {
            if counts.get(key).copied().unwrap_or(0) < max_failures {
                return Ok(key.clone());
            }
        }
        self.primary
            .keys()
            .first()
            .cloned()
            .ok_or(PoolError::PoolEmpty("primary"))
    }

    // ── Administrative operations ───────────────────────────────────────────

    /// Disable = manual freeze (legacy operator naming).
    pub async fn disable_key(&self, key: &str, kind: PoolKind) -> bool {
        let pool = self.pool(kind);
        if !pool.contains(key) {
            tracing::warn!(
                "keypool[{}]: cannot disable unknown key {}",
                pool.name(),
                redact_key(key)
            );
            return false;
        }
        pool.manually_freeze(key).await;
        true
    }

    /// Enable = unfreeze (clears both auto and manual freezes).
    pub async fn enable_key(&self, key: &str, kind: PoolKind) -> bool {
        let pool = self.pool(kind);
        if !pool.contains(key) {
            tracing::warn!(
                "keypool[{}]: cannot enable unknown key {}",
                pool.name(),
                redact_key(key)
            );
            return false;
        }
        pool.unfreeze(key).await;
        true
    }

    pub async fn batch_disable(&self, keys: &[String], kind: PoolKind) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for key in keys {
            results.insert(key.clone(), self.disable_key(key, kind).await);
        }
        results
    }

    pub async fn batch_enable(&self, keys: &[String], kind: PoolKind) -> BTreeMap<String, bool> {
        let mut results = BTreeMap::new();
        for key in keys {
            results.insert(key.clone(), self.enable_key(key, kind).await);
        }
        results
    }

    // ── Verification ────────────────────────────────────────────────────────

    /// Probe one key against the upstream and fold the outcome into the
    /// primary pool's state. `Err` carries the upstream error text.
    pub async fn verify_key(&self, key: &str) -> Result<(), String> {
        let outcome = self.validator.probe(key).await;
        if apply_probe_outcome(&self.primary, key, &outcome).await {
            Ok(())
        } else {
            Err(outcome
                .error_message()
                .unwrap_or("validation failed")
                .to_string())
        }
    }

    /// Concurrent bulk verification; one probe task per key.
    pub async fn verify_selected(
        &self,
        keys: &[String],
    ) -> (Vec<String>, BTreeMap<String, String>) {
        let checks = keys.iter().map(|key| async move {
            let result = self.verify_key(key).await;
            (key.clone(), result)
        });

        let mut successful = Vec::new();
        let mut failed = BTreeMap::new();
        for (key, result) in join_all(checks).await {
            match result {
                Ok(()) => successful.push(key),
                Err(message) => {
                    failed.insert(key, message);
                }
            }
        }
        (successful, failed)
    }

    // ── Batch search ────────────────────────────────────────────────────────

    /// Look up a pasted blob of keys against the primary pool.
    pub async fn batch_search(&self, input: &str) -> BatchSearchOutcome {
        let tokens = split_search_tokens(input);
        let max_failures = self.settings.read().await.max_failures;
        let snapshot = classifier::status_snapshot(&self.primary).await;

        let mut all: BTreeMap<&String, &classifier::KeyInfo> = BTreeMap::new();
        for bucket in [
            &snapshot.valid_keys,
            &snapshot.invalid_keys,
            &snapshot.frozen_keys,
        ] {
            for (key, info) in bucket {
                all.insert(key, info);
            }
        }

        let mut found_keys = BTreeMap::new();
        let mut not_found_keys = Vec::new();
        for token in tokens {
            match all.get(&token) {
                Some(info) => {
                    let status = if info.fail_count < max_failures && !info.manually_frozen {
                        "valid"
                    } else {
                        "invalid"
                    };
                    found_keys.insert(
                        token,
                        FoundKey {
                            status: status.to_string(),
                            fail_count: info.fail_count,
                            disabled: info.manually_frozen,
                            frozen: info.frozen,
                        },
                    );
                }
                None => not_found_keys.push(token),
            }
        }

        BatchSearchOutcome {
            found_keys,
            not_found_keys,
        }
    }

    // ── Lifecycle ───────────────────────────────────────────────────────────

    /// Capture everything the next instance needs to continue seamlessly.
    /// Advances each rotator once to learn the key it would serve next.
    pub async fn preserve_state(&self) -> PreservedState {
        let next_key = self.primary.next_raw().await.ok();
        let vertex_next_key = self.vertex.next_raw().await.ok();
        PreservedState {
            failure_counts: self.primary.failure_counts_snapshot().await,
            vertex_failure_counts: self.vertex.failure_counts_snapshot().await,
            old_keys: self.primary.keys().to_vec(),
            vertex_old_keys: self.vertex.keys().to_vec(),
            next_key,
            vertex_next_key,
        }
    }
}

/// Re-seat a rebuilt pool's cursor on the preserved next key, or on its
/// first successor (in old-list order) that survives in the new list.
async fn restore_cursor(pool: &Pool, old_keys: &[String], hint: Option<&str>) {
    let Some(hint) = hint else {
        tracing::info!(
            "keypool[{}]: no preserved cycle position, starting from the beginning",
            pool.name()
        );
        return;
    };
    if pool.is_empty() {
        return;
    }
    let Some(start) = old_keys.iter().position(|k| k == hint) else {
        tracing::warn!(
            "keypool[{}]: preserved next key {} not found in the old key list, starting from the beginning",
            pool.name(),
            redact_key(hint)
        );
        return;
    };

    for i in 0..old_keys.len() {
        let candidate = &old_keys[(start + i) % old_keys.len()];
        if let Some(idx) = pool.keys().iter().position(|k| k == candidate) {
            pool.seat_cursor(idx).await;
            tracing::info!(
                "keypool[{}]: cycle restored, next key will be {}",
                pool.name(),
                redact_key(candidate)
            );
            return;
        }
    }
    tracing::warn!(
        "keypool[{}]: none of the preserved keys survive in the new list, starting from the beginning",
        pool.name()
    );
}

// ── Process-wide singleton ──────────────────────────────────────────────────

pub struct ManagerDeps {
    pub settings: SharedSettings,
    pub client: reqwest::Client,
    pub stats: Arc<CallStats>,
}

struct SingletonCell {
    instance: Option<Arc<KeyManager>>,
    preserved: Option<PreservedState>,
}

static SINGLETON: Lazy<Mutex<SingletonCell>> = Lazy::new(|| {
    Mutex::new(SingletonCell {
        instance: None,
        preserved: None,
    })
});

/// Get the process-wide manager. The first call constructs it from `deps`
/// (consuming any state preserved by a prior reset); later calls return the
/// existing instance and ignore `deps` entirely.
pub async fn get_key_manager_instance(
    deps: Option<ManagerDeps>,
) -> Result<Arc<KeyManager>, PoolError> {
    let mut cell = SINGLETON.lock().await;
    if let Some(instance) = &cell.instance {
        return Ok(instance.clone());
    }
    let Some(deps) = deps else {
        return Err(PoolError::NotInitialized);
    };
    let preserved = cell.preserved.take();
    let manager = KeyManager::with_preserved(deps.settings, deps.client, deps.stats, preserved).await;
    cell.instance = Some(manager.clone());
    Ok(manager)
}

/// Drop the current instance, preserving failure counts and cycle position
/// for the next construction.
pub async fn reset_key_manager_instance() {
    let mut cell = SINGLETON.lock().await;
    match cell.instance.take() {
        Some(instance) => {
            cell.preserved = Some(instance.preserve_state().await);
            tracing::info!(
                "keypool: manager reset, state preserved for the next instantiation"
            );
        }
        None => {
            tracing::info!("keypool: manager was not initialised, nothing to reset");
        }
    }
}
