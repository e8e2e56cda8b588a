use serde::{Deserialize, Deserializer, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::core::config::BootstrapCredentials;
use crate::core::error::{BatcherError, Result};
use crate::platform::{NativePlatform, Platform};

/// Tokens are treated as expired this long before the provider says so.
pub const EXPIRY_SAFETY_MARGIN_MS: i64 = 60_000;

pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Persisted portal credentials (`tokens.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRecord {
    #[serde(rename = "domain")]
    pub host: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default, rename = "expires_in", deserialize_with = "number_or_numeric_string")]
    pub expires_in_seconds: Option<i64>,
    #[serde(default, rename = "received_at", deserialize_with = "number_or_numeric_string")]
    pub issued_at_ms: Option<i64>,
}

/// Older installers stored form-posted numbers as strings (`"3600"`).
fn number_or_numeric_string<'de, D>(deserializer: D) -> std::result::Result<Option<i64>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(i64),
        Text(String),
    }

    match Option::<Raw>::deserialize(deserializer)? {
        None => Ok(None),
        Some(Raw::Number(n)) => Ok(Some(n)),
        Some(Raw::Text(text)) if text.trim().is_empty() => Ok(None),
        Some(Raw::Text(text)) => text
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| serde::de::Error::custom(format!("expected a number, got '{}'", text))),
    }
}

/// Token lifetime from an external payload. Only positive whole seconds are accepted.
pub fn parse_expires_in(raw: &str) -> Option<i64> {
    raw.trim().parse::<i64>().ok().filter(|secs| *secs > 0)
}

impl CredentialRecord {
    pub fn is_configured(&self) -> bool {
        !self.host.trim().is_empty() && !self.access_token.trim().is_empty()
    }

    /// `None` for static tokens that carry no expiry metadata.
    pub fn expires_at_ms(&self) -> Option<i64> {
        match (self.issued_at_ms, self.expires_in_seconds) {
            (Some(issued), Some(expires_in)) => {
                Some(issued.saturating_add(expires_in.saturating_mul(1000)))
            }
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        match self.expires_at_ms() {
            Some(expires_at) => now_ms >= expires_at.saturating_sub(EXPIRY_SAFETY_MARGIN_MS),
            None => false,
        }
    }

    /// Token value safe to print: first four characters only.
    pub fn masked_access_token(&self) -> String {
        let prefix: String = self.access_token.chars().take(4).collect();
        format!("{}***", prefix)
    }
}

/// File-backed holder of the single credential record.
#[derive(Debug)]
pub struct CredentialStore {
    path: PathBuf,
    record: Option<CredentialRecord>,
}

impl CredentialStore {
    /// Reads the persisted record; falls back to `bootstrap` when no file exists.
    /// A missing record is not an error until a call needs it.
    pub async fn load(path: &Path, bootstrap: Option<&BootstrapCredentials>) -> Result<Self> {
        let record = if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let record: CredentialRecord = serde_json::from_str(&content)?;
            debug!("Loaded credentials for {} from {}", record.host, path.display());
            Some(record)
        } else if let Some(seed) = bootstrap {
            info!(
                "No credential file at {}, using bootstrap credentials for {}",
                path.display(),
                seed.domain
            );
            Some(CredentialRecord {
                host: seed.domain.clone(),
                access_token: seed.access_token.clone(),
                refresh_token: None,
                expires_in_seconds: None,
                issued_at_ms: None,
            })
        } else {
            None
        };

        Ok(Self {
            path: path.to_path_buf(),
            record,
        })
    }

    pub fn with_record(path: &Path, record: CredentialRecord) -> Self {
        Self {
            path: path.to_path_buf(),
            record: Some(record),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn record(&self) -> Option<&CredentialRecord> {
        self.record.as_ref()
    }

    pub fn is_configured(&self) -> bool {
        self.record.as_ref().is_some_and(CredentialRecord::is_configured)
    }

    /// The record, or `Configuration` if none can be used for a call.
    pub fn require(&self) -> Result<&CredentialRecord> {
        match &self.record {
            Some(record) if record.is_configured() => Ok(record),
            _ => Err(BatcherError::Configuration(format!(
                "No portal credentials found at {}. Install the app (POST /install) or run `deal-batcher set-tokens`.",
                self.path.display()
            ))),
        }
    }

    /// Replace the record and persist it.
    pub async fn replace(&mut self, record: CredentialRecord) -> Result<()> {
        self.record = Some(record);
        self.persist().await
    }

    /// Write the full record through a temp file and rename, so the file is
    /// never merged with or left holding stale fields.
    pub async fn persist(&self) -> Result<()> {
        let record = self.record.as_ref().ok_or_else(|| {
            BatcherError::Configuration("Nothing to persist: no credential record".to_string())
        })?;

        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }

        let body = serde_json::to_string_pretty(record)?;
        let tmp_path = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, body).await?;
        NativePlatform::restrict_file_permissions(&tmp_path);
        tokio::fs::rename(&tmp_path, &self.path).await?;

        info!("Credentials saved to {}", self.path.display());
        Ok(())
    }
}
