use axum::{
    Json,
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use tracing::{error, info, warn};

use crate::core::credentials::{Clock, CredentialRecord, CredentialStore, parse_expires_in};
use crate::interfaces::web::AppState;
use crate::interfaces::web::auth::setup_token_accepted;
use crate::interfaces::web::payload::{self, first_of};

/// Raw credential file. Only served in debug mode.
pub async fn get_tokens(State(state): State<AppState>) -> Response {
    if !state.debug {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }
    match tokio::fs::read_to_string(&state.tokens_file).await {
        Ok(content) => ([(header::CONTENT_TYPE, "application/json")], content).into_response(),
        Err(_) => Json(serde_json::json!({ "present": false })).into_response(),
    }
}

pub async fn set_tokens(
    State(state): State<AppState>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let payload = payload::parse_body(&headers, &body);
    if !setup_token_accepted(state.setup_token.as_deref(), &headers, &query, &payload) {
        warn!("Rejected /set-tokens call with an invalid setup token");
        return (StatusCode::FORBIDDEN, "Forbidden: invalid setup token").into_response();
    }

    let domain = first_of(&payload, &[&["domain"]]);
    let access_token = first_of(&payload, &[&["access_token"], &["auth", "access_token"]]);
    let (Some(host), Some(access_token)) = (domain, access_token) else {
        return (StatusCode::BAD_REQUEST, "domain and access_token required").into_response();
    };
    let expires_in_seconds = match first_of(&payload, &[&["expires_in"]]) {
        Some(raw) => match parse_expires_in(&raw) {
            Some(secs) => Some(secs),
            None => {
                return (
                    StatusCode::BAD_REQUEST,
                    "expires_in must be a positive number of seconds",
                )
                    .into_response();
            }
        },
        None => None,
    };

    let record = CredentialRecord {
        host,
        access_token,
        refresh_token: first_of(&payload, &[&["refresh_token"], &["auth", "refresh_token"]]),
        expires_in_seconds,
        issued_at_ms: Some(state.clock.now_ms()),
    };
    let host = record.host.clone();
    match CredentialStore::with_record(&state.tokens_file, record)
        .persist()
        .await
    {
        Ok(()) => {
            info!("Credentials for {} set manually", host);
            Json(serde_json::json!({ "ok": true })).into_response()
        }
        Err(e) => {
            error!("Error in /set-tokens: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "ok": false, "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
