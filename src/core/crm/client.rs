use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{CrmApi, RemoteResponse};
use crate::core::config::{AppConfig, OAuthClient};
use crate::core::credentials::{Clock, CredentialRecord, CredentialStore, SystemClock};
use crate::core::error::{BatcherError, Result};
use crate::core::oauth;

/// REST client for one portal. Injects the access token into every call and
/// refreshes it first when it is about to expire.
pub struct CrmClient {
    http: reqwest::Client,
    store: Mutex<CredentialStore>,
    oauth_client: Option<OAuthClient>,
    token_url: Option<String>,
    auto_refresh: bool,
    clock: Arc<dyn Clock>,
}

impl CrmClient {
    pub fn new(
        store: CredentialStore,
        oauth_client: Option<OAuthClient>,
        token_url: Option<String>,
        auto_refresh: bool,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            store: Mutex::new(store),
            oauth_client,
            token_url,
            auto_refresh,
            clock: Arc::new(SystemClock),
        }
    }

    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let store = CredentialStore::load(&config.tokens_file, config.bootstrap.as_ref()).await?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let mut client = Self::new(
            store,
            config.oauth_client.clone(),
            config.token_url.clone(),
            config.auto_refresh,
        );
        client.http = http;
        Ok(client)
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn is_configured(&self) -> bool {
        self.store.lock().await.is_configured()
    }

    /// Refresh the access token when it is inside the expiry window.
    /// Returns whether a refresh exchange took place.
    pub async fn refresh_if_needed(&self) -> Result<bool> {
        let mut store = self.store.lock().await;
        let current = store.require()?.clone();
        let now = self.clock.now_ms();

        if !self.auto_refresh || !current.is_expired_at(now) {
            return Ok(false);
        }

        let refresh_token = current.refresh_token.clone().ok_or_else(|| {
            BatcherError::Auth(
                "Access token expired and no refresh_token is stored. Reinstall the app."
                    .to_string(),
            )
        })?;
        let oauth_client = self.oauth_client.as_ref().ok_or_else(|| {
            BatcherError::Configuration(
                "Access token expired but BITRIX_CLIENT_ID / BITRIX_CLIENT_SECRET are not set"
                    .to_string(),
            )
        })?;
        let token_url = self
            .token_url
            .clone()
            .unwrap_or_else(|| oauth::default_token_url(&current.host));

        info!("Access token for {} expired, refreshing", current.host);
        let grant =
            oauth::refresh_access_token(&self.http, &token_url, oauth_client, &refresh_token)
                .await?;

        let refreshed = CredentialRecord {
            host: current.host,
            access_token: grant.access_token,
            refresh_token: grant.refresh_token.or(Some(refresh_token)),
            expires_in_seconds: grant.expires_in.or(current.expires_in_seconds),
            issued_at_ms: Some(self.clock.now_ms()),
        };
        store.replace(refreshed).await?;
        Ok(true)
    }

    async fn authorized_record(&self) -> Result<CredentialRecord> {
        self.refresh_if_needed().await?;
        Ok(self.store.lock().await.require()?.clone())
    }
}

#[async_trait]
impl CrmApi for CrmClient {
    async fn invoke(&self, method: &str, params: Value) -> Result<RemoteResponse> {
        let record = self.authorized_record().await?;
        let url = format!("{}/rest/{}", oauth::portal_base_url(&record.host), method);

        let mut body = match params {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(BatcherError::Validation(format!(
                    "Parameters for {} must be an object, got {}",
                    method, other
                )));
            }
        };
        body.insert("auth".to_string(), Value::String(record.access_token));

        debug!("POST {}", url);
        let response = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| BatcherError::Remote(format!("{} request failed: {}", method, e)))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| BatcherError::Remote(format!("{}: failed to read body: {}", method, e)))?;

        if text.trim().is_empty() {
            return Err(BatcherError::Remote(format!(
                "{}: empty response (HTTP {})",
                method, status
            )));
        }

        let payload: Value = serde_json::from_str(&text).map_err(|e| {
            BatcherError::Remote(format!("{}: invalid JSON (HTTP {}): {}", method, status, e))
        })?;

        if let Some(code) = payload.get("error") {
            let code = code.as_str().map(str::to_string).unwrap_or_else(|| code.to_string());
            let description = payload
                .get("error_description")
                .and_then(Value::as_str)
                .unwrap_or_default();
            warn!("{} failed: {}: {}", method, code, description);
            return Err(BatcherError::Remote(format!("{}: {}", code, description)));
        }

        if !status.is_success() {
            return Err(BatcherError::Remote(format!(
                "{}: HTTP {}: {}",
                method, status, text
            )));
        }

        let Some(result) = payload.get("result").cloned() else {
            return Err(BatcherError::Remote(format!(
                "{}: response has no result field",
                method
            )));
        };

        Ok(RemoteResponse {
            result,
            next: payload.get("next").and_then(Value::as_u64),
            total: payload.get("total").and_then(Value::as_u64),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        Json, Router,
        extract::{Path, State},
        routing::post,
    };
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    struct FixedClock(AtomicI64);

    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Default)]
    struct PortalState {
        refreshes: Arc<AtomicUsize>,
        seen: Arc<StdMutex<Vec<(String, Value)>>>,
    }

    async fn rest_handler(
        State(state): State<PortalState>,
        Path(method): Path<String>,
        Json(body): Json<Value>,
    ) -> (axum::http::StatusCode, String) {
        state.seen.lock().unwrap().push((method.clone(), body.clone()));
        let ok = axum::http::StatusCode::OK;
        match method.as_str() {
            "crm.dealcategory.list" => (ok, json!({ "result": [{ "ID": "3" }], "next": 50, "total": 51 }).to_string()),
            "crm.deal.fail" => (
                axum::http::StatusCode::BAD_REQUEST,
                json!({ "error": "ERROR_CORE", "error_description": "Something broke" }).to_string(),
            ),
            "crm.deal.empty" => (ok, String::new()),
            "batch" => (
                ok,
                json!({
                    "result": {
                        "result": { "deal_1": true, "deal_2": false },
                        "result_error": []
                    }
                })
                .to_string(),
            ),
            _ => (ok, json!({ "result": true }).to_string()),
        }
    }

    async fn spawn_portal() -> (String, PortalState) {
        let state = PortalState::default();
        let refreshes = state.refreshes.clone();
        let app = Router::new()
            .route("/rest/{method}", post(rest_handler))
            .route(
                "/oauth/token/",
                post(move || {
                    let refreshes = refreshes.clone();
                    async move {
                        let n = refreshes.fetch_add(1, Ordering::SeqCst) + 1;
                        Json(json!({
                            "access_token": format!("access-{}", n + 1),
                            "expires_in": 3600
                        }))
                    }
                }),
            )
            .with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://127.0.0.1:{}", port), state)
    }

    fn oauth_client() -> Option<OAuthClient> {
        Some(OAuthClient {
            client_id: "app.1".into(),
            client_secret: "secret".into(),
        })
    }

    fn record(host: &str, issued_at_ms: i64) -> CredentialRecord {
        CredentialRecord {
            host: host.to_string(),
            access_token: "access-1".into(),
            refresh_token: Some("refresh-1".into()),
            expires_in_seconds: Some(3600),
            issued_at_ms: Some(issued_at_ms),
        }
    }

    const T: i64 = 1_700_000_000_000;

    fn client_at(
        host: &str,
        dir: &tempfile::TempDir,
        now_ms: i64,
    ) -> (CrmClient, std::path::PathBuf) {
        let path = dir.path().join("tokens.json");
        let store = CredentialStore::with_record(&path, record(host, T));
        let client = CrmClient::new(store, oauth_client(), None, true)
            .with_clock(Arc::new(FixedClock(AtomicI64::new(now_ms))));
        (client, path)
    }

    #[tokio::test]
    async fn invoke_injects_auth_and_returns_cursor() {
        let (base, state) = spawn_portal().await;
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client_at(&base, &dir, T);

        let response = client
            .invoke("crm.dealcategory.list", json!({ "order": { "SORT": "ASC" } }))
            .await
            .unwrap();
        assert_eq!(response.result, json!([{ "ID": "3" }]));
        assert_eq!(response.next, Some(50));
        assert_eq!(response.total, Some(51));

        let seen = state.seen.lock().unwrap();
        assert_eq!(seen[0].0, "crm.dealcategory.list");
        assert_eq!(seen[0].1["auth"], "access-1");
        assert_eq!(seen[0].1["order"]["SORT"], "ASC");
    }

    #[tokio::test]
    async fn provider_error_includes_code_and_description() {
        let (base, _) = spawn_portal().await;
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client_at(&base, &dir, T);

        let err = client.invoke("crm.deal.fail", json!({})).await.unwrap_err();
        match err {
            BatcherError::Remote(msg) => assert_eq!(msg, "ERROR_CORE: Something broke"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn empty_body_is_remote_error() {
        let (base, _) = spawn_portal().await;
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client_at(&base, &dir, T);

        let err = client.invoke("crm.deal.empty", Value::Null).await.unwrap_err();
        assert!(matches!(err, BatcherError::Remote(msg) if msg.contains("empty response")));
    }

    #[tokio::test]
    async fn unreachable_host_is_remote_error() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client_at("http://127.0.0.1:1", &dir, T);
        let err = client.invoke("crm.deal.list", json!({})).await.unwrap_err();
        assert!(matches!(err, BatcherError::Remote(_)));
    }

    #[tokio::test]
    async fn no_refresh_just_outside_the_safety_window() {
        let (base, state) = spawn_portal().await;
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client_at(&base, &dir, T + 3600 * 1000 - 61_000);

        client.invoke("crm.deal.update", json!({})).await.unwrap();
        assert_eq!(state.refreshes.load(Ordering::SeqCst), 0);
        assert_eq!(state.seen.lock().unwrap()[0].1["auth"], "access-1");
    }

    #[tokio::test]
    async fn refresh_once_inside_the_window_and_persist() {
        let (base, state) = spawn_portal().await;
        let dir = tempfile::tempdir().unwrap();
        let now = T + 3600 * 1000 - 59_000;
        let (client, path) = client_at(&base, &dir, now);

        client.invoke("crm.deal.update", json!({})).await.unwrap();
        client.invoke("crm.deal.update", json!({})).await.unwrap();

        assert_eq!(state.refreshes.load(Ordering::SeqCst), 1);
        let seen = state.seen.lock().unwrap();
        assert_eq!(seen[0].1["auth"], "access-2");
        assert_eq!(seen[1].1["auth"], "access-2");

        let persisted: CredentialRecord =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(persisted.access_token, "access-2");
        // The token endpoint did not rotate the refresh token.
        assert_eq!(persisted.refresh_token.as_deref(), Some("refresh-1"));
        assert_eq!(persisted.issued_at_ms, Some(now));
        assert_eq!(persisted.expires_in_seconds, Some(3600));
    }

    #[tokio::test]
    async fn expired_without_refresh_token_is_auth_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let mut rec = record("portal.example.com", T);
        rec.refresh_token = None;
        let client = CrmClient::new(CredentialStore::with_record(&path, rec), oauth_client(), None, true)
            .with_clock(Arc::new(FixedClock(AtomicI64::new(T + 3600 * 1000))));

        assert!(matches!(
            client.refresh_if_needed().await,
            Err(BatcherError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn expired_without_client_credentials_is_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let client = CrmClient::new(
            CredentialStore::with_record(&path, record("portal.example.com", T)),
            None,
            None,
            true,
        )
        .with_clock(Arc::new(FixedClock(AtomicI64::new(T + 3600 * 1000))));

        assert!(matches!(
            client.refresh_if_needed().await,
            Err(BatcherError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn disabled_auto_refresh_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tokens.json");
        let client = CrmClient::new(
            CredentialStore::with_record(&path, record("portal.example.com", T)),
            None,
            None,
            false,
        )
        .with_clock(Arc::new(FixedClock(AtomicI64::new(T + 10 * 3600 * 1000))));

        assert!(!client.refresh_if_needed().await.unwrap());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn unconfigured_client_fails_with_configuration_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::load(&dir.path().join("tokens.json"), None)
            .await
            .unwrap();
        let client = CrmClient::new(store, None, None, true);
        let err = client.invoke("crm.deal.list", json!({})).await.unwrap_err();
        assert!(matches!(err, BatcherError::Configuration(_)));
    }

    #[tokio::test]
    async fn invoke_batch_maps_sub_results() {
        let (base, state) = spawn_portal().await;
        let dir = tempfile::tempdir().unwrap();
        let (client, _) = client_at(&base, &dir, T);

        let mut commands = BTreeMap::new();
        commands.insert("deal_1".to_string(), "crm.deal.update?id=1&FIELDS[X]=a".to_string());
        commands.insert("deal_2".to_string(), "crm.deal.update?id=2&FIELDS[X]=a".to_string());

        let results = client.invoke_batch(&commands).await.unwrap();
        assert!(results["deal_1"].is_success());
        assert!(!results["deal_2"].is_success());

        let seen = state.seen.lock().unwrap();
        assert_eq!(seen[0].0, "batch");
        assert_eq!(seen[0].1["halt"], 0);
        assert_eq!(seen[0].1["cmd"]["deal_1"], "crm.deal.update?id=1&FIELDS[X]=a");
    }
}
