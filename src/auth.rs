// KeyMux — operator authentication.
//
// The operator API is gated by a single shared token (AUTH_SECRET). When
// the variable is unset the gate stays open, which is how local
// development runs. Token comparison is constant-time so the secret
// cannot be probed byte by byte.

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::Next;
use axum::response::Response;
use subtle::ConstantTimeEq;

use crate::state::AppState;

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn token_matches(token: &str, secret: &str) -> bool {
    bool::from(token.as_bytes().ct_eq(secret.as_bytes()))
}

/// Gate for the protected route group. Health, readiness, and the auth
/// mode probe stay outside it.
pub async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.auth_secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let authorized = match bearer_token(request.headers()) {
        Some(token) if token_matches(token, secret) => true,
        Some(_) => {
            tracing::warn!("auth: rejected request with a wrong operator token");
            false
        }
        None => {
            tracing::warn!("auth: rejected request without a usable Authorization header");
            false
        }
    };

    if authorized {
        Ok(next.run(request).await)
    } else {
        Err(StatusCode::UNAUTHORIZED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(value: Option<&str>) -> HeaderMap {
        let mut map = HeaderMap::new();
        if let Some(v) = value {
            map.insert(header::AUTHORIZATION, HeaderValue::from_str(v).unwrap());
        }
        map
    }

    #[test]
    fn extracts_bearer_tokens_only() {
        assert_eq!(bearer_token(&headers(Some("Bearer tok-1"))), Some("tok-1"));
        assert_eq!(bearer_token(&headers(Some("Basic dXNlcjpwdw=="))), None);
        assert_eq!(bearer_token(&headers(Some("bearer tok-1"))), None);
        assert_eq!(bearer_token(&headers(None)), None);
    }

    #[test]
    fn token_comparison_requires_exact_match() {
        assert!(token_matches("operator-secret", "operator-secret"));
        assert!(!token_matches("operator-secret", "operator-secre"));
        assert!(!token_matches("", "operator-secret"));
        assert!(!token_matches("operator-secret2", "operator-secret"));
    }
}
