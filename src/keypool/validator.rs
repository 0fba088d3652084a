// KeyMux — upstream key validation.
//
// A probe is a low-cost upstream call whose only job is to distinguish
// 200 from 429 from everything else. With a test model configured it
// issues a minimal generateContent request; otherwise it lists models.
// The probe itself never touches pool state — callers feed the outcome
// through `apply_probe_outcome`.

use std::time::Duration;

use serde_json::json;

use crate::config::SharedSettings;
use crate::helpers::redact_key;
use crate::keypool::pool::Pool;

/// Hard timeout for a single validation call.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const KEY_HEADER: &str = "x-goog-api-key";
const BODY_SNIPPET_LEN: usize = 200;

#[derive(Debug, Clone)]
pub enum ProbeOutcome {
    Valid,
    RateLimited(String),
    Failed(String),
}

impl ProbeOutcome {
    pub fn is_valid(&self) -> bool {
        matches!(self, ProbeOutcome::Valid)
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            ProbeOutcome::Valid => None,
            ProbeOutcome::RateLimited(msg) | ProbeOutcome::Failed(msg) => Some(msg),
        }
    }
}

/// An error string counts as a rate limit iff it mentions 429,
/// "Too Many Requests", or "quota" (case-insensitive).
pub fn is_rate_limit_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    message.contains("429") || lower.contains("too many requests") || lower.contains("quota")
}

fn truncate_body(body: &str) -> &str {
    let mut end = body.len().min(BODY_SNIPPET_LEN);
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    &body[..end]
}

#[derive(Clone)]
pub struct KeyValidator {
    client: reqwest::Client,
    settings: SharedSettings,
}

impl KeyValidator {
    pub fn new(client: reqwest::Client, settings: SharedSettings) -> Self {
        Self { client, settings }
    }

    /// Issue one validation call bearing `key` and classify the response.
    pub async fn probe(&self, key: &str) -> ProbeOutcome {
        let (base_url, test_model) = {
            let s = self.settings.read().await;
            (s.base_url.clone(), s.test_model.clone())
        };
        let base = base_url.trim_end_matches('/');

        let request = if test_model.is_empty() {
            self.client
                .get(format!("{base}/models"))
                .header(KEY_HEADER, key)
        } else {
            self.client
                .post(format!("{base}/models/{test_model}:generateContent"))
                .header(KEY_HEADER, key)
                .json(&json!({
                    "contents": [{ "role": "user", "parts": [{ "text": "hi" }] }],
                    "generationConfig": {
                        "temperature": 0.7,
                        "topP": 1.0,
                        "maxOutputTokens": 10
                    }
                }))
        };

        let response = match request.timeout(PROBE_TIMEOUT).send().await {
            Ok(resp) => resp,
            Err(e) => {
                let message = e.to_string();
                return if is_rate_limit_error(&message) {
                    ProbeOutcome::RateLimited(message)
                } else {
                    ProbeOutcome::Failed(message)
                };
            }
        };

        let status = response.status();
        if status.is_success() {
            tracing::debug!("validator: key {} is valid", redact_key(key));
            return ProbeOutcome::Valid;
        }

        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status.as_u16(), truncate_body(&body));
        tracing::debug!(
            "validator: key {} validation failed: {}",
            redact_key(key),
            message
        );

        if status.as_u16() == 429 || is_rate_limit_error(&message) {
            ProbeOutcome::RateLimited(message)
        } else {
            ProbeOutcome::Failed(message)
        }
    }
}

/// Fold a probe outcome into pool state:
/// success resets the failure count, a rate limit freezes the key (when
/// freeze-on-429 is enabled, without touching the count), anything else
/// increments the count. Returns whether the key counts as valid.
pub async fn apply_probe_outcome(pool: &Pool, key: &str, outcome: &ProbeOutcome) -> bool {
    match outcome {
        ProbeOutcome::Valid => {
            pool.reset_failure(key).await;
            true
        }
        ProbeOutcome::RateLimited(msg) => {
            let freeze_enabled = pool.settings().read().await.enable_key_freeze_on_429;
            if freeze_enabled {
                pool.freeze(key, None).await;
                tracing::warn!(
                    "validator: key {} frozen due to rate limit: {}",
                    redact_key(key),
                    msg
                );
            } else {
                tracing::warn!(
                    "validator: rate limit on key {} but freeze-on-429 is disabled",
                    redact_key(key)
                );
                pool.increment_failure(key).await;
            }
            false
        }
        ProbeOutcome::Failed(_) => {
            pool.increment_failure(key).await;
            false
        }
    }
}
