use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
};
use serde_json::Value;
use std::collections::HashMap;
use tracing::{error, info};

use crate::core::credentials::{Clock, CredentialRecord, CredentialStore, parse_expires_in};
use crate::interfaces::web::AppState;
use crate::interfaces::web::payload::{self, first_of};

const ACCESS_TOKEN_KEYS: &[&[&str]] = &[&["auth", "access_token"], &["access_token"], &["AUTH_ID"]];
const REFRESH_TOKEN_KEYS: &[&[&str]] = &[
    &["auth", "refresh_token"],
    &["refresh_token"],
    &["auth", "refresh_token_key"],
    &["REFRESH_ID"],
];
const EXPIRES_KEYS: &[&[&str]] = &[
    &["auth", "expires_in"],
    &["expires_in"],
    &["auth", "expires"],
    &["AUTH_EXPIRES"],
];
const DOMAIN_KEYS: &[&[&str]] = &[&["domain"], &["auth", "domain"]];

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum InstallError {
    MissingAccessToken,
    MissingDomain,
    InvalidExpiry,
}

impl InstallError {
    fn message(&self) -> &'static str {
        match self {
            InstallError::MissingAccessToken => "Install payload missing auth.access_token",
            InstallError::MissingDomain => "Install payload missing domain",
            InstallError::InvalidExpiry => "Install payload expires_in must be a positive number of seconds",
        }
    }
}

/// Pull the credential record out of an install callback. `now_ms` becomes
/// the issue time.
pub(crate) fn credentials_from_install(
    body: &Value,
    query: &HashMap<String, String>,
    now_ms: i64,
) -> Result<CredentialRecord, InstallError> {
    let access_token = first_of(body, ACCESS_TOKEN_KEYS).ok_or(InstallError::MissingAccessToken)?;
    let host = first_of(body, DOMAIN_KEYS)
        .or_else(|| {
            query
                .iter()
                .find(|(k, v)| k.eq_ignore_ascii_case("domain") && !v.trim().is_empty())
                .map(|(_, v)| v.trim().to_string())
        })
        .ok_or(InstallError::MissingDomain)?;
    let expires_in_seconds = match first_of(body, EXPIRES_KEYS) {
        Some(raw) => Some(parse_expires_in(&raw).ok_or(InstallError::InvalidExpiry)?),
        None => None,
    };

    Ok(CredentialRecord {
        host,
        access_token,
        refresh_token: first_of(body, REFRESH_TOKEN_KEYS),
        expires_in_seconds,
        issued_at_ms: Some(now_ms),
    })
}

pub async fn install(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = payload::parse_body(&headers, &body);
    let record = match credentials_from_install(&payload, &query, state.clock.now_ms()) {
        Ok(record) => record,
        Err(e) => return (StatusCode::BAD_REQUEST, e.message()).into_response(),
    };

    let host = record.host.clone();
    match CredentialStore::with_record(&state.tokens_file, record)
        .persist()
        .await
    {
        Ok(()) => {
            info!("App installed for {}", host);
            Html("<h2>Application installed. Credentials saved.</h2>").into_response()
        }
        Err(e) => {
            error!("Error in /install: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Install error").into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn nested_auth_object_is_read() {
        let body = json!({
            "auth": {
                "access_token": "acc",
                "refresh_token": "ref",
                "expires_in": "3600",
                "domain": "portal.example.com"
            }
        });
        let record = credentials_from_install(&body, &HashMap::new(), 1_000).unwrap();
        assert_eq!(record.host, "portal.example.com");
        assert_eq!(record.access_token, "acc");
        assert_eq!(record.refresh_token.as_deref(), Some("ref"));
        assert_eq!(record.expires_in_seconds, Some(3600));
        assert_eq!(record.issued_at_ms, Some(1_000));
    }

    #[test]
    fn flat_placement_keys_and_query_domain() {
        let body = json!({ "AUTH_ID": "acc", "REFRESH_ID": "ref", "AUTH_EXPIRES": 1800 });
        let query = HashMap::from([("DOMAIN".to_string(), "q.example.com".to_string())]);
        let record = credentials_from_install(&body, &query, 5).unwrap();
        assert_eq!(record.host, "q.example.com");
        assert_eq!(record.access_token, "acc");
        assert_eq!(record.refresh_token.as_deref(), Some("ref"));
        assert_eq!(record.expires_in_seconds, Some(1800));
    }

    #[test]
    fn refresh_token_key_and_expires_are_fallbacks() {
        let body = json!({
            "DOMAIN": "p.example.com",
            "auth": { "access_token": "a", "refresh_token_key": "rk", "expires": 900 }
        });
        let record = credentials_from_install(&body, &HashMap::new(), 0).unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("rk"));
        assert_eq!(record.expires_in_seconds, Some(900));
    }

    #[test]
    fn out_of_range_or_non_positive_expiry_is_rejected() {
        for expires_in in [json!("9223372036854775808"), json!(0), json!("-60"), json!("soon")] {
            let body = json!({
                "auth": { "access_token": "abc", "expires_in": expires_in, "domain": "p.example.com" }
            });
            assert_eq!(
                credentials_from_install(&body, &HashMap::new(), 0),
                Err(InstallError::InvalidExpiry),
                "expires_in {}",
                expires_in
            );
        }
    }

    #[test]
    fn largest_expiry_is_stored_and_never_overflows() {
        let body = json!({
            "auth": { "access_token": "abc", "expires_in": "9223372036854775807", "domain": "p.example.com" }
        });
        let record = credentials_from_install(&body, &HashMap::new(), 1_700_000_000_000).unwrap();
        assert_eq!(record.expires_in_seconds, Some(i64::MAX));
        assert!(!record.is_expired_at(1_700_000_000_000));
    }

    #[test]
    fn missing_access_token_or_domain_is_rejected() {
        assert_eq!(
            credentials_from_install(&json!({ "domain": "p" }), &HashMap::new(), 0),
            Err(InstallError::MissingAccessToken)
        );
        assert_eq!(
            credentials_from_install(&json!({ "access_token": "a" }), &HashMap::new(), 0),
            Err(InstallError::MissingDomain)
        );
    }
}
