//! End-to-end key manager scenarios, exercised without a live upstream.

use std::sync::Arc;

use keymux_backend::config::Settings;
use keymux_backend::error::PoolError;
use keymux_backend::keypool::classifier;
use keymux_backend::keypool::manager::{KeyManager, PoolKind};
use keymux_backend::keypool::retry::with_key_rotation;
use keymux_backend::stats::CallStats;

fn key_list(names: &[&str]) -> Vec<String> {
    names.iter().map(|k| k.to_string()).collect()
}

async fn manager(keys: &[&str]) -> Arc<KeyManager> {
    manager_with_settings(keys, Settings::default()).await
}

async fn manager_with_settings(keys: &[&str], mut settings: Settings) -> Arc<KeyManager> {
    settings.api_keys = key_list(keys);
    // probes must fail fast instead of reaching out
    settings.base_url = "http://127.0.0.1:9".to_string();
    KeyManager::with_preserved(
        settings.shared(),
        reqwest::Client::new(),
        Arc::new(CallStats::new()),
        None,
    )
    .await
}

// ── Scenario: repeated upstream failures invalidate a key ───────────────────

#[tokio::test]
async fn failing_key_crosses_threshold_and_requests_move_on() {
    let m = manager(&["k1", "k2", "k3"]).await;
    let pool = m.pool(PoolKind::Primary);

    // k1 already carries MAX_FAILURES - 1 strikes
    pool.increment_failure("k1").await;
    pool.increment_failure("k1").await;

    // request path: k1 is handed out, upstream rejects it with a 403
    let first = m.get_next_working_key().await.unwrap();
    assert_eq!(first, "k1");

    let result: Result<String, String> = with_key_rotation(&m, first, |key| async move {
        if key == "k1" {
            Err("HTTP 403: Forbidden".to_string())
        } else {
            Ok(key)
        }
    })
    .await;

    // the retry layer rotated to a different key and succeeded
    let served = result.unwrap();
    assert_ne!(served, "k1");

    // k1 crossed the threshold and now reports invalid
    assert_eq!(pool.fail_count("k1").await, 3);
    let snapshot = classifier::status_snapshot(pool).await;
    assert!(snapshot.invalid_keys.contains_key("k1"));

    // subsequent selections skip it entirely
    for _ in 0..6 {
        assert_ne!(m.get_next_working_key().await.unwrap(), "k1");
    }
}

// ── Scenario: rate limit freezes, then the freeze expires ───────────────────

#[tokio::test]
async fn rate_limited_key_freezes_and_thaws() {
    let m = manager(&["k1", "k2"]).await;
    let pool = m.pool(PoolKind::Primary);

    assert!(m.handle_429("k1", PoolKind::Primary).await);

    let snapshot = classifier::status_snapshot(pool).await;
    assert!(snapshot.frozen_keys.contains_key("k1"));
    assert!(snapshot.frozen_keys["k1"].freeze_until.is_some());
    assert_eq!(snapshot.frozen_keys["k1"].fail_count, 0);

    // selections avoid the frozen key
    for _ in 0..4 {
        assert_eq!(m.get_next_working_key().await.unwrap(), "k2");
    }

    // an expired deadline clears on the next read
    pool.freeze("k1", Some(0)).await;
    assert!(!pool.is_frozen("k1").await);
    let snapshot = classifier::status_snapshot(pool).await;
    assert!(snapshot.valid_keys.contains_key("k1"));
}

// ── Scenario: every key rejected — degraded service, never a hang ───────────

#[tokio::test]
async fn exhausted_pool_still_serves_in_degraded_mode() {
    let m = manager(&["k1"]).await;
    let pool = m.pool(PoolKind::Primary);
    for _ in 0..3 {
        pool.increment_failure("k1").await;
    }

    // the cycle closes on the single invalid key and returns it anyway
    assert_eq!(m.get_next_working_key().await.unwrap(), "k1");
}

#[tokio::test]
async fn empty_pool_is_a_hard_error() {
    let m = manager(&[]).await;
    assert!(matches!(
        m.get_next_working_key().await,
        Err(PoolError::PoolEmpty("primary"))
    ));
}

// ── Scenario: reload with a changed key list ────────────────────────────────

#[tokio::test]
async fn reload_resumes_rotation_and_keeps_failure_history() {
    let m = manager(&["a", "b", "c", "d"]).await;
    let pool = m.pool(PoolKind::Primary);

    pool.increment_failure("d").await;
    // consume a and b; the next key would be c
    m.get_next_key().await.unwrap();
    m.get_next_key().await.unwrap();

    let preserved = m.preserve_state().await;

    // c survives the reload: rotation resumes exactly there
    let settings = Settings {
        api_keys: key_list(&["b", "c", "d", "e"]),
        ..Settings::default()
    };
    let rebuilt = KeyManager::with_preserved(
        settings.shared(),
        reqwest::Client::new(),
        Arc::new(CallStats::new()),
        Some(preserved.clone()),
    )
    .await;
    assert_eq!(rebuilt.get_next_key().await.unwrap(), "c");
    assert_eq!(rebuilt.pool(PoolKind::Primary).fail_count("d").await, 1);
    assert_eq!(rebuilt.pool(PoolKind::Primary).fail_count("e").await, 0);

    // c dropped from the list: its first surviving successor takes over
    let settings = Settings {
        api_keys: key_list(&["a", "d", "e"]),
        ..Settings::default()
    };
    let rebuilt = KeyManager::with_preserved(
        settings.shared(),
        reqwest::Client::new(),
        Arc::new(CallStats::new()),
        Some(preserved),
    )
    .await;
    assert_eq!(rebuilt.get_next_key().await.unwrap(), "d");
}

// ── Round-trip properties ───────────────────────────────────────────────────

#[tokio::test]
async fn freeze_unfreeze_restores_prior_status() {
    let m = manager(&["k1"]).await;
    let pool = m.pool(PoolKind::Primary);

    assert!(!pool.is_frozen("k1").await);
    pool.freeze("k1", Some(3600)).await;
    pool.unfreeze("k1").await;
    assert!(!pool.is_frozen("k1").await);
}

#[tokio::test]
async fn double_reset_all_produces_identical_state() {
    let m = manager(&["k1", "k2"]).await;
    let pool = m.pool(PoolKind::Primary);
    pool.increment_failure("k1").await;

    pool.reset_all_failures().await;
    let first = pool.failure_counts_snapshot().await;
    pool.reset_all_failures().await;
    let second = pool.failure_counts_snapshot().await;
    assert_eq!(first, second);
}

// ── Selector statistics feed the call oracle ────────────────────────────────

#[tokio::test]
async fn selector_calls_are_counted() {
    let m = manager(&["k1", "k2"]).await;
    for _ in 0..4 {
        m.get_next_working_key().await.unwrap();
    }
    assert_eq!(m.stats().calls_in_last_minutes(1).await, 4);
}
