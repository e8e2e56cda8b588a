//! Request bodies from the portal arrive as JSON or as form data with
//! bracketed keys (`auth[access_token]=...`). Both are normalised into a
//! `serde_json::Value` tree and looked up case-insensitively.

use axum::http::{HeaderMap, header};
use serde_json::{Map, Value};

pub(crate) fn parse_body(headers: &HeaderMap, body: &[u8]) -> Value {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let looks_like_json = body
        .iter()
        .find(|b| !b.is_ascii_whitespace())
        .is_some_and(|b| *b == b'{');

    if content_type.contains("json") || looks_like_json {
        return match serde_json::from_slice::<Value>(body) {
            Ok(value @ Value::Object(_)) => value,
            _ => Value::Object(Map::new()),
        };
    }
    parse_form(body)
}

/// `a[b][c]=v` becomes `{"a": {"b": {"c": "v"}}}`. Later duplicates win.
pub(crate) fn parse_form(body: &[u8]) -> Value {
    let mut root = Map::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        let mut segments = key
            .split('[')
            .map(|s| s.trim_end_matches(']'))
            .filter(|s| !s.is_empty());
        let Some(first) = segments.next() else {
            continue;
        };
        let rest: Vec<&str> = segments.collect();
        insert_path(&mut root, first, &rest, Value::String(value.into_owned()));
    }
    Value::Object(root)
}

fn insert_path(map: &mut Map<String, Value>, key: &str, rest: &[&str], value: Value) {
    match rest.split_first() {
        None => {
            map.insert(key.to_string(), value);
        }
        Some((next, tail)) => {
            let entry = map
                .entry(key.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, next, tail, value);
            }
        }
    }
}

/// Walk `path` with case-insensitive keys. Strings and numbers are returned
/// as text; empty strings count as absent.
pub(crate) fn lookup(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for segment in path {
        let map = current.as_object()?;
        current = map
            .get(*segment)
            .or_else(|| {
                map.iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(segment))
                    .map(|(_, v)| v)
            })?;
    }
    match current {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// First candidate path that yields a value.
pub(crate) fn first_of(value: &Value, candidates: &[&[&str]]) -> Option<String> {
    candidates.iter().find_map(|path| lookup(value, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn bracketed_form_keys_become_nested_objects() {
        let parsed = parse_form(b"auth%5Baccess_token%5D=abc&auth[domain]=p.example.com&DOMAIN=x");
        assert_eq!(parsed["auth"]["access_token"], "abc");
        assert_eq!(parsed["auth"]["domain"], "p.example.com");
        assert_eq!(parsed["DOMAIN"], "x");
    }

    #[test]
    fn json_is_detected_by_header_or_shape() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        assert_eq!(parse_body(&headers, br#"{"a":1}"#)["a"], 1);
        assert_eq!(parse_body(&HeaderMap::new(), b"  {\"a\":2}")["a"], 2);
        assert_eq!(parse_body(&headers, b"not json"), json!({}));
    }

    #[test]
    fn lookup_ignores_case_and_accepts_numbers() {
        let value = json!({ "AUTH": { "Expires_In": 3600, "access_token": "" } });
        assert_eq!(lookup(&value, &["auth", "expires_in"]).as_deref(), Some("3600"));
        assert_eq!(lookup(&value, &["auth", "access_token"]), None);
        assert_eq!(
            first_of(&value, &[&["missing"], &["auth", "expires_in"]]).as_deref(),
            Some("3600")
        );
    }
}
