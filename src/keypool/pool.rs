// KeyMux — per-pool key state store.
//
// Owns the ordered key list plus the three mutable structures: failure
// counts, auto-freeze deadlines, and the manual-freeze set. Two pools exist
// ("primary" and "vertex") with identical semantics and disjoint state.
//
// Locking: `cycle`, `failure_counts`, and `freeze` are independent mutexes.
// No method holds more than one of them at a time, and none is held across
// network I/O. Where a caller needs both freeze state and failure counts it
// takes them sequentially (freeze first).

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;

use crate::config::SharedSettings;
use crate::error::PoolError;
use crate::helpers::redact_key;
use crate::keypool::rotator::Rotator;

#[derive(Default)]
struct FreezeTable {
    /// Auto-freeze deadlines; entries expire lazily on read.
    frozen_until: HashMap<String, DateTime<Utc>>,
    /// Manual freezes are never auto-cleared.
    manually_frozen: HashSet<String>,
}

pub struct Pool {
    name: &'static str,
    keys: Vec<String>,
    settings: SharedSettings,
    cycle: Mutex<Rotator>,
    failure_counts: Mutex<HashMap<String, u32>>,
    freeze: Mutex<FreezeTable>,
}

impl Pool {
    pub fn new(name: &'static str, keys: Vec<String>, settings: SharedSettings) -> Self {
        let counts = keys.iter().map(|k| (k.clone(), 0)).collect();
        let cycle = Mutex::new(Rotator::new(keys.len()));
        Self {
            name,
            keys,
            settings,
            cycle,
            failure_counts: Mutex::new(counts),
            freeze: Mutex::new(FreezeTable::default()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn settings(&self) -> &SharedSettings {
        &self.settings
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.keys.iter().any(|k| k == key)
    }

    // ── Rotation ────────────────────────────────────────────────────────────

    /// Advance the round-robin cursor and return the key at the new
    /// position. Returns *some* key even if every key is invalid —
    /// validity is the caller's concern.
    pub async fn next_raw(&self) -> Result<String, PoolError> {
        let mut cycle = self.cycle.lock().await;
        match cycle.advance() {
            Some(idx) => Ok(self.keys[idx].clone()),
            None => Err(PoolError::PoolEmpty(self.name)),
        }
    }

    /// Index the next `next_raw()` call will serve.
    pub async fn next_position(&self) -> usize {
        self.cycle.lock().await.next_position()
    }

    /// Index of the most recently served key.
    pub async fn current_position(&self) -> usize {
        self.cycle.lock().await.current_position()
    }

    pub async fn usage_counter(&self) -> u64 {
        self.cycle.lock().await.usage_counter()
    }

    /// Re-seat the cursor so the next `next_raw()` yields `keys[idx]`.
    /// Only used when rebuilding a pool from preserved state.
    pub async fn seat_cursor(&self, idx: usize) {
        let mut cycle = self.cycle.lock().await;
        *cycle = Rotator::with_start(self.keys.len(), idx);
    }

    // ── Failure accounting ──────────────────────────────────────────────────

    pub async fn fail_count(&self, key: &str) -> u32 {
        self.failure_counts
            .lock()
            .await
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    pub async fn failure_counts_snapshot(&self) -> HashMap<String, u32> {
        self.failure_counts.lock().await.clone()
    }

    /// Increment and return the new count. Emits a warning the moment the
    /// key crosses the invalidity threshold.
    pub async fn increment_failure(&self, key: &str) -> u32 {
        let max_failures = self.settings.read().await.max_failures;
        let mut counts = self.failure_counts.lock().await;
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        let count = *count;
        drop(counts);

        if count >= max_failures {
            tracing::warn!(
                "keypool[{}]: key {} has failed {} times and is now invalid",
                self.name,
                redact_key(key),
                count
            );
        }
        count
    }

    /// Reset one key's failure count. `false` when the key is unknown.
    pub async fn reset_failure(&self, key: &str) -> bool {
        let mut counts = self.failure_counts.lock().await;
        if let Some(count) = counts.get_mut(key) {
            *count = 0;
            drop(counts);
            tracing::info!(
                "keypool[{}]: reset failure count for key {}",
                self.name,
                redact_key(key)
            );
            true
        } else {
            tracing::warn!(
                "keypool[{}]: attempt to reset failure count for unknown key {}",
                self.name,
                redact_key(key)
            );
            false
        }
    }

    pub async fn reset_all_failures(&self) {
        let mut counts = self.failure_counts.lock().await;
        for count in counts.values_mut() {
            *count = 0;
        }
    }

    /// Carry failure counts over from a previous instance, for keys that
    /// still exist in this pool. New keys stay at zero.
    pub async fn restore_failure_counts(&self, preserved: &HashMap<String, u32>) {
        let mut counts = self.failure_counts.lock().await;
        for (key, count) in preserved {
            if let Some(slot) = counts.get_mut(key) {
                *slot = *count;
            }
        }
        drop(counts);
        tracing::info!(
            "keypool[{}]: inherited failure counts for applicable keys",
            self.name
        );
    }

    // ── Freeze lifecycle ────────────────────────────────────────────────────

    /// Auto-freeze for `duration_seconds` (config default when `None`).
    pub async fn freeze(&self, key: &str, duration_seconds: Option<u64>) {
        let duration = match duration_seconds {
            Some(d) => d,
            None => self.settings.read().await.key_freeze_duration_seconds,
        };
        let until = Utc::now() + ChronoDuration::seconds(duration as i64);

        let mut freeze = self.freeze.lock().await;
        freeze.frozen_until.insert(key.to_string(), until);
        let frozen_total = freeze.frozen_until.len();
        drop(freeze);

        tracing::info!(
            "keypool[{}]: key {} frozen until {} ({}s), {} keys currently frozen",
            self.name,
            redact_key(key),
            until,
            duration,
            frozen_total
        );
    }

    /// Clear both auto- and manual freezes. `false` when neither was set.
    pub async fn unfreeze(&self, key: &str) -> bool {
        let mut freeze = self.freeze.lock().await;
        let had_auto = freeze.frozen_until.remove(key).is_some();
        let had_manual = freeze.manually_frozen.remove(key);
        drop(freeze);

        if had_auto || had_manual {
            tracing::info!("keypool[{}]: key {} unfrozen", self.name, redact_key(key));
            true
        } else {
            false
        }
    }

    /// Administrative freeze with no deadline; cleared only by `unfreeze`.
    pub async fn manually_freeze(&self, key: &str) {
        let mut freeze = self.freeze.lock().await;
        freeze.manually_frozen.insert(key.to_string());
        drop(freeze);
        tracing::info!(
            "keypool[{}]: key {} manually frozen",
            self.name,
            redact_key(key)
        );
    }

    pub async fn is_manually_frozen(&self, key: &str) -> bool {
        self.freeze.lock().await.manually_frozen.contains(key)
    }

    /// Frozen = manually frozen, or auto-frozen with the deadline still in
    /// the future. Expired deadlines are removed as a side effect.
    pub async fn is_frozen(&self, key: &str) -> bool {
        let mut freeze = self.freeze.lock().await;
        if freeze.manually_frozen.contains(key) {
            return true;
        }
        let Some(until) = freeze.frozen_until.get(key).copied() else {
            return false;
        };
        if Utc::now() >= until {
            freeze.frozen_until.remove(key);
            drop(freeze);
            tracing::info!(
                "keypool[{}]: key {} auto-unfrozen (freeze period expired)",
                self.name,
                redact_key(key)
            );
            return false;
        }
        true
    }

    /// Auto-freeze deadline, if one is currently set (may be expired).
    pub async fn freeze_deadline(&self, key: &str) -> Option<DateTime<Utc>> {
        self.freeze.lock().await.frozen_until.get(key).copied()
    }

    /// Snapshot of the freeze table, expiring stale deadlines on the way.
    /// Returns (active auto-freeze deadlines, manual-freeze set).
    pub async fn freeze_snapshot(&self) -> (HashMap<String, DateTime<Utc>>, HashSet<String>) {
        let now = Utc::now();
        let mut freeze = self.freeze.lock().await;
        let expired: Vec<String> = freeze
            .frozen_until
            .iter()
            .filter(|(_, until)| now >= **until)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            freeze.frozen_until.remove(key);
            tracing::info!(
                "keypool[{}]: key {} auto-unfrozen (freeze period expired)",
                self.name,
                redact_key(key)
            );
        }
        (freeze.frozen_until.clone(), freeze.manually_frozen.clone())
    }

    // ── Derived status ──────────────────────────────────────────────────────

    /// Valid = not frozen and below the failure threshold.
    pub async fn is_valid(&self, key: &str) -> bool {
        if self.is_frozen(key).await {
            return false;
        }
        let max_failures = self.settings.read().await.max_failures;
        self.fail_count(key).await < max_failures
    }
}
