use serde::Deserialize;
use tracing::info;

use crate::core::config::OAuthClient;
use crate::core::error::{BatcherError, Result};

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// Fields returned by a successful refresh exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub access_token: String,
    /// Rotation is not guaranteed; `None` means keep the previous refresh token.
    pub refresh_token: Option<String>,
    pub expires_in: Option<i64>,
}

/// REST base for a portal host. Hosts carrying a scheme are used verbatim.
pub fn portal_base_url(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("https://{}", host)
    }
}

pub fn default_token_url(host: &str) -> String {
    format!("{}/oauth/token/", portal_base_url(host))
}

/// Exchange a refresh token for a new access token (`grant_type=refresh_token`).
pub async fn refresh_access_token(
    http: &reqwest::Client,
    token_url: &str,
    client: &OAuthClient,
    refresh_token: &str,
) -> Result<TokenGrant> {
    let params = [
        ("grant_type", "refresh_token"),
        ("client_id", client.client_id.as_str()),
        ("client_secret", client.client_secret.as_str()),
        ("refresh_token", refresh_token),
    ];

    let response = http
        .post(token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| BatcherError::Remote(format!("Token refresh request failed: {}", e)))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| BatcherError::Remote(format!("Failed to read token response: {}", e)))?;

    let token: Option<TokenResponse> = serde_json::from_str(&body).ok();

    if let Some(TokenResponse {
        error: Some(error),
        error_description,
        ..
    }) = &token
    {
        return Err(BatcherError::Auth(format!(
            "Token refresh rejected: {}: {}",
            error,
            error_description.as_deref().unwrap_or_default()
        )));
    }

    if !status.is_success() {
        return Err(BatcherError::Remote(format!(
            "Token refresh failed (HTTP {}): {}",
            status, body
        )));
    }

    let token = token.ok_or_else(|| {
        BatcherError::Remote(format!("Failed to parse token response: {}", body))
    })?;

    let access_token = token
        .access_token
        .filter(|t| !t.is_empty())
        .ok_or_else(|| BatcherError::Auth("No access_token in refresh response".to_string()))?;

    info!("Access token refreshed via {}", token_url);
    Ok(TokenGrant {
        access_token,
        refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
        expires_in: token.expires_in,
    })
}
