// KeyMux — small shared helpers.

/// Redact a credential for logging: fixed-length prefix…suffix.
///
/// Every log line that mentions a key MUST go through this. Short or
/// non-ASCII inputs are fully masked rather than partially exposed.
pub fn redact_key(key: &str) -> String {
    if key.len() <= 8 || !key.is_ascii() {
        return "***".to_string();
    }
    format!("{}...{}", &key[..4], &key[key.len() - 4..])
}
