use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;

use super::payload;

pub(crate) const SETUP_TOKEN_HEADER: &str = "x-setup-token";

/// When a setup token is configured, the caller must present it in the
/// `x-setup-token` header, the `setup_token` query parameter, or the body.
pub(crate) fn setup_token_accepted(
    expected: Option<&str>,
    headers: &HeaderMap,
    query: &HashMap<String, String>,
    body: &Value,
) -> bool {
    let Some(expected) = expected else {
        return true;
    };
    let provided = headers
        .get(SETUP_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| query.get("setup_token").cloned())
        .or_else(|| payload::lookup(body, &["setup_token"]));
    provided.as_deref() == Some(expected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn no_configured_token_allows_everyone() {
        assert!(setup_token_accepted(None, &HeaderMap::new(), &HashMap::new(), &json!({})));
    }

    #[test]
    fn token_is_accepted_from_any_source() {
        let mut headers = HeaderMap::new();
        headers.insert(SETUP_TOKEN_HEADER, HeaderValue::from_static("s3t"));
        assert!(setup_token_accepted(Some("s3t"), &headers, &HashMap::new(), &json!({})));

        let query = HashMap::from([("setup_token".to_string(), "s3t".to_string())]);
        assert!(setup_token_accepted(Some("s3t"), &HeaderMap::new(), &query, &json!({})));

        let body = json!({ "setup_token": "s3t" });
        assert!(setup_token_accepted(Some("s3t"), &HeaderMap::new(), &HashMap::new(), &body));
    }

    #[test]
    fn wrong_or_missing_token_is_rejected() {
        let body = json!({ "setup_token": "nope" });
        assert!(!setup_token_accepted(Some("s3t"), &HeaderMap::new(), &HashMap::new(), &body));
        assert!(!setup_token_accepted(Some("s3t"), &HeaderMap::new(), &HashMap::new(), &json!({})));
    }
}
