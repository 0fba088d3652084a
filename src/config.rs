// KeyMux — typed runtime configuration.
//
// Settings are loaded from the environment at startup, overlaid with the
// values persisted in the config store, and shared as an RwLock handle so
// operator updates take effect without a restart. The persister serializes
// a known subset of SCREAMING_SNAKE keys; nothing here passes loose maps
// into the pool itself.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tokio::sync::RwLock;

pub type SharedSettings = Arc<RwLock<Settings>>;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_TEST_MODEL: &str = "gemini-2.0-flash";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub api_keys: Vec<String>,
    pub vertex_api_keys: Vec<String>,
    pub max_failures: u32,
    pub max_retries: u32,
    pub key_freeze_duration_seconds: u64,
    pub enable_key_freeze_on_429: bool,
    pub key_precheck_enabled: bool,
    pub key_precheck_count: usize,
    pub key_precheck_trigger_ratio: f64,
    pub base_url: String,
    pub test_model: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_keys: Vec::new(),
            vertex_api_keys: Vec::new(),
            max_failures: 3,
            max_retries: 3,
            key_freeze_duration_seconds: 300,
            enable_key_freeze_on_429: true,
            key_precheck_enabled: false,
            key_precheck_count: 50,
            key_precheck_trigger_ratio: 0.5,
            base_url: DEFAULT_BASE_URL.to_string(),
            test_model: DEFAULT_TEST_MODEL.to_string(),
        }
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_key_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .map(str::to_string)
        .collect()
}

impl Settings {
    /// Load settings from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(raw) = env_var("API_KEYS") {
            settings.api_keys = parse_key_list(&raw);
        }
        if let Some(raw) = env_var("VERTEX_API_KEYS") {
            settings.vertex_api_keys = parse_key_list(&raw);
        }
        if let Some(v) = env_var("MAX_FAILURES").and_then(|v| v.parse().ok()) {
            settings.max_failures = v;
        }
        if let Some(v) = env_var("MAX_RETRIES").and_then(|v| v.parse().ok()) {
            settings.max_retries = v;
        }
        if let Some(v) = env_var("KEY_FREEZE_DURATION_SECONDS").and_then(|v| v.parse().ok()) {
            settings.key_freeze_duration_seconds = v;
        }
        if let Some(v) = env_var("ENABLE_KEY_FREEZE_ON_429").and_then(|v| v.parse().ok()) {
            settings.enable_key_freeze_on_429 = v;
        }
        if let Some(v) = env_var("KEY_PRECHECK_ENABLED").and_then(|v| v.parse().ok()) {
            settings.key_precheck_enabled = v;
        }
        if let Some(v) = env_var("KEY_PRECHECK_COUNT").and_then(|v| v.parse().ok()) {
            settings.key_precheck_count = v;
        }
        if let Some(v) = env_var("KEY_PRECHECK_TRIGGER_RATIO").and_then(|v| v.parse().ok()) {
            settings.key_precheck_trigger_ratio = v;
        }
        if let Some(v) = env_var("BASE_URL") {
            settings.base_url = v;
        }
        if let Some(v) = env_var("TEST_MODEL") {
            settings.test_model = v;
        }

        settings
    }

    pub fn shared(self) -> SharedSettings {
        Arc::new(RwLock::new(self))
    }

    /// Apply a map of SCREAMING_SNAKE overrides (from the config store or the
    /// operator API). Unknown keys are ignored with a warning; malformed
    /// values leave the current setting untouched.
    pub fn apply_overrides(&mut self, overrides: &Map<String, Value>) {
        for (key, value) in overrides {
            match key.as_str() {
                "API_KEYS" => {
                    if let Some(keys) = value_as_key_list(value) {
                        self.api_keys = keys;
                    }
                }
                "VERTEX_API_KEYS" => {
                    if let Some(keys) = value_as_key_list(value) {
                        self.vertex_api_keys = keys;
                    }
                }
                "MAX_FAILURES" => {
                    if let Some(v) = value.as_u64() {
                        self.max_failures = v as u32;
                    }
                }
                "MAX_RETRIES" => {
                    if let Some(v) = value.as_u64() {
                        self.max_retries = v as u32;
                    }
                }
                "KEY_FREEZE_DURATION_SECONDS" => {
                    if let Some(v) = value.as_u64() {
                        self.key_freeze_duration_seconds = v;
                    }
                }
                "ENABLE_KEY_FREEZE_ON_429" => {
                    if let Some(v) = value.as_bool() {
                        self.enable_key_freeze_on_429 = v;
                    }
                }
                "KEY_PRECHECK_ENABLED" => {
                    if let Some(v) = value.as_bool() {
                        self.key_precheck_enabled = v;
                    }
                }
                "KEY_PRECHECK_COUNT" => {
                    if let Some(v) = value.as_u64() {
                        self.key_precheck_count = v as usize;
                    }
                }
                "KEY_PRECHECK_TRIGGER_RATIO" => {
                    if let Some(v) = value.as_f64() {
                        self.key_precheck_trigger_ratio = v;
                    }
                }
                "BASE_URL" => {
                    if let Some(v) = value.as_str() {
                        match url::Url::parse(v) {
                            Ok(_) => self.base_url = v.to_string(),
                            Err(e) => {
                                tracing::warn!("config: rejecting invalid BASE_URL {}: {}", v, e);
                            }
                        }
                    }
                }
                "TEST_MODEL" => {
                    if let Some(v) = value.as_str() {
                        self.test_model = v.to_string();
                    }
                }
                other => {
                    tracing::warn!("config: ignoring unknown setting {}", other);
                }
            }
        }
    }

    /// The persisted/exposed subset as a SCREAMING_SNAKE map.
    pub fn as_config_map(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("API_KEYS".into(), Value::from(self.api_keys.clone()));
        map.insert(
            "VERTEX_API_KEYS".into(),
            Value::from(self.vertex_api_keys.clone()),
        );
        map.insert("MAX_FAILURES".into(), Value::from(self.max_failures));
        map.insert("MAX_RETRIES".into(), Value::from(self.max_retries));
        map.insert(
            "KEY_FREEZE_DURATION_SECONDS".into(),
            Value::from(self.key_freeze_duration_seconds),
        );
        map.insert(
            "ENABLE_KEY_FREEZE_ON_429".into(),
            Value::from(self.enable_key_freeze_on_429),
        );
        map.insert(
            "KEY_PRECHECK_ENABLED".into(),
            Value::from(self.key_precheck_enabled),
        );
        map.insert(
            "KEY_PRECHECK_COUNT".into(),
            Value::from(self.key_precheck_count as u64),
        );
        map.insert(
            "KEY_PRECHECK_TRIGGER_RATIO".into(),
            Value::from(self.key_precheck_trigger_ratio),
        );
        map.insert("BASE_URL".into(), Value::from(self.base_url.clone()));
        map.insert("TEST_MODEL".into(), Value::from(self.test_model.clone()));
        map
    }
}

fn value_as_key_list(value: &Value) -> Option<Vec<String>> {
    match value {
        Value::Array(items) => Some(
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Value::String(raw) => Some(parse_key_list(raw)),
        _ => None,
    }
}

// ── Config store (Postgres-backed persister) ────────────────────────────────

/// Persists the runtime-tunable subset of settings. Failures are logged and
/// never propagated: the in-memory settings remain the source of truth.
#[derive(Clone)]
pub struct ConfigStore {
    pool: PgPool,
}

impl ConfigStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await.is_ok()
    }

    /// Load persisted overrides. Returns an empty map when the store is
    /// unreachable so startup can proceed on env/default settings.
    pub async fn load_overrides(&self) -> Map<String, Value> {
        let rows: Vec<(String, Value)> =
            match sqlx::query_as("SELECT key, value FROM km_config")
                .fetch_all(&self.pool)
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!("config: failed to load overrides from store: {}", e);
                    return Map::new();
                }
            };

        rows.into_iter().collect()
    }

    /// Upsert each entry. Per-entry failures are logged and skipped.
    pub async fn update_config(&self, entries: &Map<String, Value>) {
        for (key, value) in entries {
            if let Err(e) = sqlx::query(
                "INSERT INTO km_config (key, value, updated_at) VALUES ($1, $2, NOW()) \
                 ON CONFLICT (key) DO UPDATE SET value = $2, updated_at = NOW()",
            )
            .bind(key)
            .bind(value)
            .execute(&self.pool)
            .await
            {
                tracing::warn!("config: failed to persist {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.max_failures, 3);
        assert_eq!(s.key_precheck_count, 50);
        assert!((s.key_precheck_trigger_ratio - 0.5).abs() < f64::EPSILON);
        assert!(s.enable_key_freeze_on_429);
        assert!(!s.key_precheck_enabled);
    }

    #[test]
    fn overrides_apply_typed_values() {
        let mut s = Settings::default();
        let map = json!({
            "MAX_FAILURES": 7,
            "KEY_PRECHECK_ENABLED": true,
            "KEY_PRECHECK_TRIGGER_RATIO": 0.8,
            "API_KEYS": ["k1", " k2 ", ""],
            "BASE_URL": "https://example.test/v1beta"
        });
        s.apply_overrides(map.as_object().unwrap());

        assert_eq!(s.max_failures, 7);
        assert!(s.key_precheck_enabled);
        assert!((s.key_precheck_trigger_ratio - 0.8).abs() < f64::EPSILON);
        assert_eq!(s.api_keys, vec!["k1".to_string(), "k2".to_string()]);
        assert_eq!(s.base_url, "https://example.test/v1beta");
    }

    #[test]
    fn overrides_ignore_malformed_values() {
        let mut s = Settings::default();
        let map = json!({ "MAX_FAILURES": "not-a-number", "UNKNOWN_KEY": 1 });
        s.apply_overrides(map.as_object().unwrap());
        assert_eq!(s.max_failures, 3);
    }

    #[test]
    fn invalid_base_url_is_rejected() {
        let mut s = Settings::default();
        let map = json!({ "BASE_URL": "not a url" });
        s.apply_overrides(map.as_object().unwrap());
        assert_eq!(s.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn key_list_accepts_comma_separated_string() {
        let mut s = Settings::default();
        let map = json!({ "API_KEYS": "a,b, c ,," });
        s.apply_overrides(map.as_object().unwrap());
        assert_eq!(s.api_keys, vec!["a", "b", "c"]);
    }

    #[test]
    fn config_map_round_trips_through_overrides() {
        let mut original = Settings::default();
        original.api_keys = vec!["key-one".into()];
        original.max_retries = 5;

        let mut restored = Settings::default();
        restored.apply_overrides(&original.as_config_map());

        assert_eq!(restored.api_keys, original.api_keys);
        assert_eq!(restored.max_retries, 5);
    }
}
