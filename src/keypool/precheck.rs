// KeyMux — double-buffered key precheck.
//
// Maintains two batches of recently-validated keys (A and B). The selector
// consumes the current batch; once consumption crosses the trigger
// threshold a background pass validates a fresh batch into the other slot,
// so a swap is ready before the current batch runs dry.
//
// Buffer slot lifecycle:
//
//   EMPTY ──fill──▶ FILLING ──some valid──▶ READY ──swap──▶ ACTIVE ──drained──▶ EMPTY
//                          └──all invalid──▶ EMPTY
//
// At most one validation pass runs at a time (`in_progress`); batch state
// lives behind a single mutex so the selector sees swaps atomically, never
// a torn view. No key-state lock is ever held across a validation call.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use utoipa::ToSchema;

use crate::config::SharedSettings;
use crate::error::PoolError;
use crate::helpers::redact_key;
use crate::keypool::pool::Pool;
use crate::keypool::validator::{KeyValidator, apply_probe_outcome};

/// How long a caller will wait for an in-flight pass to finish.
pub const PRECHECK_WAIT_BUDGET: Duration = Duration::from_secs(30);
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// When every key has hit the failure ceiling, a manual trigger resets this
/// many so the pass has candidates to probe.
const EXHAUSTED_RESET_COUNT: usize = 5;

// ── Buffer state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum BatchName {
    #[default]
    A,
    B,
}

impl BatchName {
    fn other(self) -> Self {
        match self {
            BatchName::A => BatchName::B,
            BatchName::B => BatchName::A,
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            BatchName::A => "A",
            BatchName::B => "B",
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum FillDisposition {
    /// Result became the current batch (startup or current was drained-empty).
    Established,
    /// Result parked as the next batch, ready for the upcoming swap.
    Queued,
    /// Next batch was already ready; result dropped.
    Discarded,
    /// Pass produced no valid keys; buffers untouched.
    Empty,
}

#[derive(Debug, Default)]
struct BufferState {
    batch_a: Vec<String>,
    batch_b: Vec<String>,
    current: BatchName,
    /// Consumption pointer into the current batch.
    index: usize,
    a_ready: bool,
    b_ready: bool,
    /// Keys drawn from the current batch since it became active.
    used_count: u64,
    /// `used_count` at which the next-buffer refill must begin.
    trigger_threshold: u64,
}

impl BufferState {
    fn current_batch(&self) -> &Vec<String> {
        match self.current {
            BatchName::A => &self.batch_a,
            BatchName::B => &self.batch_b,
        }
    }

    fn next_batch(&self) -> &Vec<String> {
        match self.current {
            BatchName::A => &self.batch_b,
            BatchName::B => &self.batch_a,
        }
    }

    fn current_ready(&self) -> bool {
        match self.current {
            BatchName::A => self.a_ready,
            BatchName::B => self.b_ready,
        }
    }

    fn next_ready(&self) -> bool {
        match self.current {
            BatchName::A => self.b_ready,
            BatchName::B => self.a_ready,
        }
    }

    fn set_batch(&mut self, name: BatchName, keys: Vec<String>, ready: bool) {
        match name {
            BatchName::A => {
                self.batch_a = keys;
                self.a_ready = ready;
            }
            BatchName::B => {
                self.batch_b = keys;
                self.b_ready = ready;
            }
        }
    }

    fn recompute_trigger(&mut self, ratio: f64) {
        let len = self.current_batch().len();
        self.trigger_threshold = if len == 0 {
            0
        } else {
            ((len as f64 * ratio).floor() as u64).max(1)
        };
    }

    /// Make the ready next batch current; drain and reset the old slot.
    fn swap_to_next(&mut self, ratio: f64) {
        let old = self.current;
        self.current = old.other();
        self.index = 0;
        self.used_count = 0;
        self.set_batch(old, Vec::new(), false);
        self.recompute_trigger(ratio);
    }

    /// Route a completed fill into the right slot.
    fn route_fill_result(&mut self, valid: Vec<String>, ratio: f64) -> FillDisposition {
        if valid.is_empty() {
            return FillDisposition::Empty;
        }
        if self.current_batch().is_empty() || !self.current_ready() {
            self.set_batch(self.current, valid, true);
            self.index = 0;
            self.used_count = 0;
            self.recompute_trigger(ratio);
            FillDisposition::Established
        } else if self.next_ready() {
            FillDisposition::Discarded
        } else {
            self.set_batch(self.current.other(), valid, true);
            FillDisposition::Queued
        }
    }
}

// ── Status reporting ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct PrecheckStatus {
    pub current_batch_name: String,
    pub current_batch_count: usize,
    pub used_count: u64,
    pub trigger_threshold: u64,
    pub current_ready: bool,
    pub next_ready: bool,
    pub next_batch_count: usize,
    pub current_key_position: usize,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ManualPrecheckReport {
    pub before: PrecheckStatus,
    pub after: PrecheckStatus,
    pub execution_time_seconds: f64,
}

// ── Engine ──────────────────────────────────────────────────────────────────

/// Releases the `in_progress` flag even if a fill pass panics or is
/// cancelled mid-await.
struct InProgressGuard<'a>(&'a AtomicBool);

impl Drop for InProgressGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct PrecheckEngine {
    pool: Arc<Pool>,
    validator: KeyValidator,
    settings: SharedSettings,
    buffers: Mutex<BufferState>,
    in_progress: AtomicBool,
    /// Self-handle for spawning background fills from `&self` methods.
    weak: Weak<PrecheckEngine>,
}

impl PrecheckEngine {
    pub fn new(pool: Arc<Pool>, validator: KeyValidator, settings: SharedSettings) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            pool,
            validator,
            settings,
            buffers: Mutex::new(BufferState::default()),
            in_progress: AtomicBool::new(false),
            weak: weak.clone(),
        })
    }

    /// Prechecking runs only when enabled in config and keys exist.
    pub async fn enabled(&self) -> bool {
        self.settings.read().await.key_precheck_enabled && !self.pool.is_empty()
    }

    pub fn in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    fn try_begin(&self) -> Option<InProgressGuard<'_>> {
        self.in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
            .then_some(InProgressGuard(&self.in_progress))
    }

    /// Fire a fill pass on a background task.
    pub fn spawn_fill(&self, reason: &'static str) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            tracing::debug!("precheck: background fill starting ({})", reason);
            engine.run_once().await;
        });
    }

    /// Run one validation pass inline. Returns `false` when another pass
    /// already holds the in-progress flag (this call did nothing).
    pub async fn run_once(&self) -> bool {
        let Some(_guard) = self.try_begin() else {
            tracing::debug!("precheck: pass already in progress, skipping");
            return false;
        };
        self.fill().await;
        true
    }

    async fn fill(&self) {
        let (enabled, count, ratio, max_failures) = {
            let s = self.settings.read().await;
            (
                s.key_precheck_enabled,
                s.key_precheck_count,
                s.key_precheck_trigger_ratio,
                s.max_failures,
            )
        };
        if !enabled || self.pool.is_empty() {
            return;
        }

        let start = self.pool.next_position().await;
        let candidates = self.select_candidates(start, count, max_failures).await;
        if candidates.is_empty() {
            tracing::warn!("precheck: no candidates to check (all keys frozen?)");
            return;
        }

        tracing::info!(
            "precheck: checking {} keys starting at position {}",
            candidates.len(),
            start
        );

        let probes = candidates.iter().map(|key| self.probe_candidate(key));
        let results = join_all(probes).await;

        let valid: Vec<String> = candidates
            .iter()
            .zip(&results)
            .filter(|(_, ok)| **ok)
            .map(|(key, _)| key.clone())
            .collect();
        let invalid = candidates.len() - valid.len();
        tracing::info!(
            "precheck: pass complete — {} valid, {} invalid",
            valid.len(),
            invalid
        );

        let mut buf = self.buffers.lock().await;
        match buf.route_fill_result(valid, ratio) {
            FillDisposition::Established => {
                tracing::info!(
                    "precheck: established batch {} with {} keys, trigger threshold {}",
                    buf.current.as_str(),
                    buf.current_batch().len(),
                    buf.trigger_threshold
                );
            }
            FillDisposition::Queued => {
                tracing::info!(
                    "precheck: queued next batch with {} keys, ready for swap",
                    buf.next_batch().len()
                );
            }
            FillDisposition::Discarded => {
                tracing::info!("precheck: next batch already ready, result discarded");
            }
            FillDisposition::Empty => {
                if buf.current_batch().is_empty() || !buf.current_ready() {
                    tracing::error!(
                        "precheck: no valid keys found and no current batch available"
                    );
                } else {
                    tracing::warn!("precheck: pass found no valid keys");
                }
            }
        }
    }

    /// Probe one candidate and fold the outcome into pool state.
    /// Keys frozen since selection are reported invalid without a call.
    async fn probe_candidate(&self, key: &str) -> bool {
        if self.pool.is_frozen(key).await {
            tracing::debug!(
                "precheck: key {} is frozen, skipping probe",
                redact_key(key)
            );
            return false;
        }
        let outcome = self.validator.probe(key).await;
        apply_probe_outcome(&self.pool, key, &outcome).await
    }

    /// Pick up to `count` candidates, starting at the rotator position.
    /// Keys below the failure ceiling are preferred; when they cannot fill
    /// the batch, all keys are considered, cheapest failure counts first.
    /// Frozen keys are skipped at selection time.
    async fn select_candidates(
        &self,
        start: usize,
        count: usize,
        max_failures: u32,
    ) -> Vec<String> {
        if count == 0 {
            return Vec::new();
        }
        let counts = self.pool.failure_counts_snapshot().await;
        let fail_count = |k: &String| counts.get(k).copied().unwrap_or(0);

        let healthy: Vec<String> = self
            .pool
            .keys()
            .iter()
            .filter(|k| fail_count(k) < max_failures)
            .cloned()
            .collect();

        let ordered: Vec<String> = if healthy.len() >= count {
            healthy
        } else {
            let mut all = self.pool.keys().to_vec();
            all.sort_by_key(|k| fail_count(k));
            all
        };
        if ordered.is_empty() {
            return Vec::new();
        }

        let mut out = Vec::with_capacity(count.min(ordered.len()));
        for i in 0..ordered.len() {
            if out.len() >= count {
                break;
            }
            let key = &ordered[(start + i) % ordered.len()];
            if self.pool.is_frozen(key).await {
                continue;
            }
            out.push(key.clone());
        }
        out
    }

    /// Block until no pass is running, up to the wait budget.
    pub async fn wait_for_completion(&self) -> Result<(), PoolError> {
        let deadline = Instant::now() + PRECHECK_WAIT_BUDGET;
        while self.in_progress() {
            if Instant::now() >= deadline {
                return Err(PoolError::PrecheckTimeout(PRECHECK_WAIT_BUDGET));
            }
            tokio::time::sleep(WAIT_POLL_INTERVAL).await;
        }
        Ok(())
    }

    // ── Selector integration ────────────────────────────────────────────────

    /// Hand out the next key from the current batch, driving the trigger,
    /// swap, and emergency-refill rules. `None` when the current batch is
    /// empty or not ready (caller falls back to an immediate pass).
    pub async fn next_from_current(&self) -> Option<String> {
        let ratio = self.settings.read().await.key_precheck_trigger_ratio;
        let mut buf = self.buffers.lock().await;

        if buf.current_batch().is_empty() || !buf.current_ready() {
            return None;
        }

        let key = buf.current_batch()[buf.index].clone();
        buf.index += 1;
        buf.used_count += 1;
        tracing::debug!(
            "precheck: serving key {}/{} from batch {} (used {}/{})",
            buf.index,
            buf.current_batch().len(),
            buf.current.as_str(),
            buf.used_count,
            buf.trigger_threshold
        );

        if buf.used_count >= buf.trigger_threshold && !self.in_progress() && !buf.next_ready() {
            tracing::info!(
                "precheck: trigger threshold reached ({}/{}), refilling next batch",
                buf.used_count,
                buf.trigger_threshold
            );
            self.spawn_fill("trigger threshold");
        }

        if buf.index >= buf.current_batch().len() {
            if buf.next_ready() {
                buf.swap_to_next(ratio);
                tracing::info!(
                    "precheck: switched to batch {} ({} keys, trigger threshold {})",
                    buf.current.as_str(),
                    buf.current_batch().len(),
                    buf.trigger_threshold
                );
            } else {
                // Degraded: re-offer the same batch while an emergency pass runs.
                tracing::warn!(
                    "precheck: batch {} exhausted with no replacement ready, re-offering it",
                    buf.current.as_str()
                );
                buf.index = 0;
                self.spawn_fill("emergency refill");
            }
        }

        Some(key)
    }

    // ── Operator surface ────────────────────────────────────────────────────

    pub async fn status(&self) -> PrecheckStatus {
        let position = self.pool.current_position().await;
        let buf = self.buffers.lock().await;
        PrecheckStatus {
            current_batch_name: buf.current.as_str().to_string(),
            current_batch_count: buf.current_batch().len(),
            used_count: buf.used_count,
            trigger_threshold: buf.trigger_threshold,
            current_ready: buf.current_ready(),
            next_ready: buf.next_ready(),
            next_batch_count: buf.next_batch().len(),
            current_key_position: position,
        }
    }

    /// Operator-forced pass with before/after snapshots. Refuses while a
    /// pass is running or when prechecking is disabled.
    pub async fn manual_trigger(&self) -> Result<ManualPrecheckReport, PoolError> {
        if !self.settings.read().await.key_precheck_enabled {
            return Err(PoolError::PrecheckDisabled);
        }
        if self.in_progress() {
            return Err(PoolError::PrecheckBusy);
        }

        let started = Instant::now();
        let before = self.status().await;

        // When every key has hit the ceiling, give the pass something to
        // probe again.
        let max_failures = self.settings.read().await.max_failures;
        let counts = self.pool.failure_counts_snapshot().await;
        let available = self
            .pool
            .keys()
            .iter()
            .filter(|k| counts.get(*k).copied().unwrap_or(0) < max_failures)
            .count();
        if available == 0 && !self.pool.is_empty() {
            tracing::warn!(
                "precheck: every key has reached the failure ceiling, resetting the first {}",
                EXHAUSTED_RESET_COUNT
            );
            for key in self.pool.keys().iter().take(EXHAUSTED_RESET_COUNT) {
                self.pool.reset_failure(key).await;
            }
        }

        if !self.run_once().await {
            return Err(PoolError::PrecheckBusy);
        }

        let after = self.status().await;
        let execution_time_seconds =
            (started.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        tracing::info!(
            "precheck: manual pass finished in {:.2}s — batch {} now holds {} keys",
            execution_time_seconds,
            after.current_batch_name,
            after.current_batch_count
        );

        Ok(ManualPrecheckReport {
            before,
            after,
            execution_time_seconds,
        })
    }

    /// Apply an operator config update. Values are clamped to their legal
    /// ranges; the changed subset is returned for persistence. A newly
    /// enabled (or re-tuned) engine fires a fresh pass immediately.
    pub async fn apply_config(
        &self,
        enabled: Option<bool>,
        count: Option<usize>,
        trigger_ratio: Option<f64>,
    ) -> serde_json::Map<String, serde_json::Value> {
        let mut changed = serde_json::Map::new();
        {
            let mut s = self.settings.write().await;
            if let Some(e) = enabled
                && e != s.key_precheck_enabled
            {
                s.key_precheck_enabled = e;
                changed.insert("KEY_PRECHECK_ENABLED".into(), e.into());
            }
            if let Some(c) = count {
                let c = c.clamp(10, 1000);
                if c != s.key_precheck_count {
                    s.key_precheck_count = c;
                    changed.insert("KEY_PRECHECK_COUNT".into(), (c as u64).into());
                }
            }
            if let Some(r) = trigger_ratio {
                let r = r.clamp(0.1, 1.0);
                if (r - s.key_precheck_trigger_ratio).abs() > f64::EPSILON {
                    s.key_precheck_trigger_ratio = r;
                    changed.insert("KEY_PRECHECK_TRIGGER_RATIO".into(), r.into());
                }
            }
        }

        if !changed.is_empty() {
            let ratio = self.settings.read().await.key_precheck_trigger_ratio;
            {
                let mut buf = self.buffers.lock().await;
                buf.recompute_trigger(ratio);
            }
            tracing::info!("precheck: config updated: {:?}", changed);
            if self.enabled().await && !self.in_progress() {
                self.spawn_fill("config update");
            }
        }

        changed
    }

    // ── Test support ────────────────────────────────────────────────────────

    #[cfg(any(test, feature = "test-helpers"))]
    pub async fn seed_current_batch(&self, keys: Vec<String>) {
        let ratio = self.settings.read().await.key_precheck_trigger_ratio;
        let mut buf = self.buffers.lock().await;
        let slot = buf.current;
        buf.set_batch(slot, keys, true);
        buf.index = 0;
        buf.used_count = 0;
        buf.recompute_trigger(ratio);
    }

    #[cfg(any(test, feature = "test-helpers"))]
    pub async fn seed_next_batch(&self, keys: Vec<String>) {
        let mut buf = self.buffers.lock().await;
        let slot = buf.current.other();
        buf.set_batch(slot, keys, true);
    }
}
