// KeyMux — application state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use sqlx::PgPool;
use tokio::sync::RwLock;

use crate::config::{ConfigStore, Settings, SharedSettings};
use crate::keypool::manager::{KeyManager, ManagerDeps, get_key_manager_instance};
use crate::stats::CallStats;

/// Central application state. Clone-friendly — everything inside is Arc or
/// already cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub settings: SharedSettings,
    pub config_store: ConfigStore,
    /// Swapped wholesale when the key lists are reloaded; handlers take a
    /// read-clone per request so they never observe a half-built manager.
    pub key_manager: Arc<RwLock<Arc<KeyManager>>>,
    pub stats: Arc<CallStats>,
    pub http_client: reqwest::Client,
    pub start_time: Instant,
    /// `true` once startup (config overlay + initial precheck spawn) completes.
    pub ready: Arc<AtomicBool>,
    /// Optional auth secret from AUTH_SECRET env. None = dev mode (no auth).
    pub auth_secret: Option<String>,
}

fn build_http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(10)
        .timeout(std::time::Duration::from_secs(30))
        .connect_timeout(std::time::Duration::from_secs(5))
        .build()
        .expect("Failed to build HTTP client")
}

impl AppState {
    /// Production constructor: registers the process-wide key manager
    /// (restoring preserved state when this follows a reset).
    pub async fn new(db: PgPool, settings: Settings) -> Self {
        let auth_secret = std::env::var("AUTH_SECRET").ok().filter(|s| !s.is_empty());
        if auth_secret.is_some() {
            tracing::info!("AUTH_SECRET configured — authentication enabled");
        } else {
            tracing::info!("AUTH_SECRET not set — authentication disabled (dev mode)");
        }

        let settings = settings.shared();
        let http_client = build_http_client();
        let stats = Arc::new(CallStats::new());

        let manager = get_key_manager_instance(Some(ManagerDeps {
            settings: settings.clone(),
            client: http_client.clone(),
            stats: stats.clone(),
        }))
        .await
        .expect("manager deps provided");

        Self {
            config_store: ConfigStore::new(db.clone()),
            db,
            settings,
            key_manager: Arc::new(RwLock::new(manager)),
            stats,
            http_client,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            auth_secret,
        }
    }

    /// Test-only constructor — uses `connect_lazy` so no real database is
    /// needed, and builds its own manager instead of the process singleton.
    #[doc(hidden)]
    pub async fn new_test(primary_keys: Vec<String>, vertex_keys: Vec<String>) -> Self {
        let settings = Settings {
            api_keys: primary_keys,
            vertex_api_keys: vertex_keys,
            // probes from tests must fail fast instead of reaching out
            base_url: "http://127.0.0.1:9".to_string(),
            ..Settings::default()
        }
        .shared();

        let http_client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("Failed to build HTTP client");
        let stats = Arc::new(CallStats::new());

        let manager = KeyManager::with_preserved(
            settings.clone(),
            http_client.clone(),
            stats.clone(),
            None,
        )
        .await;

        let db = sqlx::postgres::PgPoolOptions::new()
            .acquire_timeout(std::time::Duration::from_secs(1))
            .connect_lazy("postgres://test@localhost:19999/test")
            .expect("lazy pool");

        Self {
            config_store: ConfigStore::new(db.clone()),
            db,
            settings,
            key_manager: Arc::new(RwLock::new(manager)),
            stats,
            http_client,
            start_time: Instant::now(),
            ready: Arc::new(AtomicBool::new(false)),
            auth_secret: None,
        }
    }

    pub async fn manager(&self) -> Arc<KeyManager> {
        self.key_manager.read().await.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::Relaxed);
        tracing::info!("Backend marked as READY");
    }
}
