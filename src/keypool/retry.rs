// KeyMux — retry wrapper for upstream calls.
//
// Higher-order form of the proxy's retry layer: the wrapped closure
// receives the key for each attempt, so swapping keys between attempts is
// just calling it again with a different argument. Rate-limit errors
// freeze the key and rotate; anything else goes through the failure
// handler. The last error is surfaced only once retries are exhausted.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;

use crate::helpers::redact_key;
use crate::keypool::manager::{KeyManager, PoolKind};
use crate::keypool::validator::is_rate_limit_error;

pub async fn with_key_rotation<T, E, F, Fut>(
    manager: &Arc<KeyManager>,
    initial_key: String,
    mut call: F,
) -> Result<T, E>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let max_retries = manager.settings().read().await.max_retries.max(1);
    let mut key = initial_key;
    let mut last_err: Option<E> = None;

    for attempt in 1..=max_retries {
        match call(key.clone()).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::warn!(
                    "retry: attempt {}/{} with key {} failed: {}",
                    attempt,
                    max_retries,
                    redact_key(&key),
                    err
                );

                let freeze_on_429 = manager.settings().read().await.enable_key_freeze_on_429;
                let next = if is_rate_limit_error(&err.to_string()) && freeze_on_429 {
                    manager.handle_429(&key, PoolKind::Primary).await;
                    manager.get_next_working_key().await.ok()
                } else {
                    match manager.handle_api_failure(&key, attempt).await {
                        Ok(next) => next,
                        Err(pool_err) => {
                            tracing::error!("retry: cannot rotate: {}", pool_err);
                            None
                        }
                    }
                };
                last_err = Some(err);

                match next {
                    Some(next_key) => {
                        tracing::info!("retry: switched to key {}", redact_key(&next_key));
                        key = next_key;
                    }
                    None => {
                        tracing::error!("retry: no working key available after {} attempts", attempt);
                        break;
                    }
                }
            }
        }
    }

    tracing::error!("retry: all attempts failed, surfacing the final error");
    Err(last_err.expect("loop ran at least once"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::keypool::pool::Pool;
    use crate::stats::CallStats;
    use std::sync::Mutex;

    async fn manager(keys: &[&str]) -> Arc<KeyManager> {
        let settings = Settings {
            api_keys: keys.iter().map(|k| k.to_string()).collect(),
            ..Settings::default()
        };
        KeyManager::with_preserved(
            settings.shared(),
            reqwest::Client::new(),
            Arc::new(CallStats::new()),
            None,
        )
        .await
    }

    fn pool(m: &KeyManager) -> &Arc<Pool> {
        m.pool(PoolKind::Primary)
    }

    #[tokio::test]
    async fn success_passes_straight_through() {
        let m = manager(&["a", "b"]).await;
        let seen = Mutex::new(Vec::new());

        let result: Result<&str, String> = with_key_rotation(&m, "a".into(), |key| {
            seen.lock().unwrap().push(key);
            async { Ok("response") }
        })
        .await;

        assert_eq!(result.unwrap(), "response");
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
        assert_eq!(pool(&m).fail_count("a").await, 0);
    }

    #[tokio::test]
    async fn rotates_to_a_fresh_key_after_a_failure() {
        let m = manager(&["a", "b", "c"]).await;
        // request path consumed "a" before failing
        assert_eq!(m.get_next_working_key().await.unwrap(), "a");
        let seen = Mutex::new(Vec::new());

        let result: Result<&str, String> = with_key_rotation(&m, "a".into(), |key| {
            seen.lock().unwrap().push(key.clone());
            async move {
                if key == "a" {
                    Err("HTTP 500: upstream broke".to_string())
                } else {
                    Ok("response")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "response");
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(pool(&m).fail_count("a").await, 1);
    }

    #[tokio::test]
    async fn surfaces_last_error_after_exhausting_retries() {
        let m = manager(&["a", "b"]).await;
        let attempts = Mutex::new(0u32);

        let result: Result<(), String> = with_key_rotation(&m, "a".into(), |_key| {
            *attempts.lock().unwrap() += 1;
            let n = *attempts.lock().unwrap();
            async move { Err(format!("failure #{n}")) }
        })
        .await;

        assert_eq!(result.unwrap_err(), "failure #3");
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test]
    async fn rate_limit_errors_freeze_instead_of_counting() {
        let m = manager(&["a", "b"]).await;
        assert_eq!(m.get_next_working_key().await.unwrap(), "a");

        let result: Result<&str, String> = with_key_rotation(&m, "a".into(), |key| async move {
            if key == "a" {
                Err("429 Too Many Requests".to_string())
            } else {
                Ok("response")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "response");
        assert!(pool(&m).is_frozen("a").await);
        assert_eq!(pool(&m).fail_count("a").await, 0);
    }

    #[tokio::test]
    async fn empty_pool_surfaces_the_original_error() {
        let m = manager(&[]).await;
        let result: Result<(), String> =
            with_key_rotation(&m, "ghost".into(), |_key| async move {
                Err("boom".to_string())
            })
            .await;
        assert_eq!(result.unwrap_err(), "boom");
    }
}
