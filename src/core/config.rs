use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::core::error::{BatcherError, Result};

pub const DEFAULT_CHUNK_SIZE: usize = 150;
const DEFAULT_SERVER_PORT: u16 = 3000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Shape of `<data_dir>/config.toml`. Every key is optional.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct FileConfig {
    #[serde(default)]
    pub debug: bool,

    #[serde(default)]
    pub portal: PortalSection,

    #[serde(default)]
    pub server: ServerSection,

    #[serde(default)]
    pub telegram: TelegramSection,

    #[serde(default)]
    pub job: JobSection,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PortalSection {
    pub domain: Option<String>,
    pub access_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub token_url: Option<String>,
    pub auto_refresh: Option<bool>,
    pub request_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ServerSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub setup_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct TelegramSection {
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct JobSection {
    pub chunk_size: Option<usize>,
}

/// Out-of-band host + token used when no credential file exists yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapCredentials {
    pub domain: String,
    pub access_token: String,
}

/// Client id/secret used for the refresh-token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClient {
    pub client_id: String,
    pub client_secret: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub tokens_file: PathBuf,
    pub bootstrap: Option<BootstrapCredentials>,
    pub oauth_client: Option<OAuthClient>,
    pub token_url: Option<String>,
    pub auto_refresh: bool,
    pub request_timeout_secs: u64,
    pub server_host: String,
    pub server_port: u16,
    pub setup_token: Option<String>,
    pub telegram_token: Option<String>,
    pub chunk_size: usize,
    pub debug: bool,
}

impl AppConfig {
    /// Reads `config.toml` from the data dir (if any) and applies process env overrides.
    pub async fn load(data_dir: &Path) -> Result<Self> {
        let config_path = data_dir.join("config.toml");
        let file = if config_path.exists() {
            let content = tokio::fs::read_to_string(&config_path).await?;
            toml::from_str::<FileConfig>(&content).map_err(|e| {
                BatcherError::Configuration(format!("{}: {}", config_path.display(), e))
            })?
        } else {
            FileConfig::default()
        };

        let config = Self::resolve(data_dir, file, |key| std::env::var(key).ok())?;
        info!(
            "Loaded config: tokens_file={}, auto_refresh={}, bot={}",
            config.tokens_file.display(),
            config.auto_refresh,
            config.telegram_token.is_some()
        );
        Ok(config)
    }

    /// Merge defaults, file values and env lookups (highest precedence).
    pub fn resolve<F>(data_dir: &Path, file: FileConfig, env: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_str = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let domain = env_str("BITRIX_DOMAIN").or(file.portal.domain);
        let access_token = env_str("BITRIX_ACCESS_TOKEN").or(file.portal.access_token);
        let bootstrap = match (domain, access_token) {
            (Some(domain), Some(access_token)) => Some(BootstrapCredentials {
                domain,
                access_token,
            }),
            _ => None,
        };

        let client_id = env_str("BITRIX_CLIENT_ID").or(file.portal.client_id);
        let client_secret = env_str("BITRIX_CLIENT_SECRET").or(file.portal.client_secret);
        let oauth_client = match (client_id, client_secret) {
            (Some(client_id), Some(client_secret)) => Some(OAuthClient {
                client_id,
                client_secret,
            }),
            _ => None,
        };

        let auto_refresh = match env_str("BITRIX_AUTO_REFRESH") {
            Some(v) => parse_flag("BITRIX_AUTO_REFRESH", &v)?,
            None => file.portal.auto_refresh.unwrap_or(true),
        };

        let debug = match env_str("DEBUG") {
            Some(v) => parse_flag("DEBUG", &v)?,
            None => file.debug,
        };

        let server_port = match env_str("PORT") {
            Some(v) => v
                .parse::<u16>()
                .map_err(|_| BatcherError::Configuration(format!("PORT is not a port: {}", v)))?,
            None => file.server.port.unwrap_or(DEFAULT_SERVER_PORT),
        };

        let chunk_size = file.job.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE);
        if chunk_size == 0 {
            return Err(BatcherError::Configuration(
                "job.chunk_size must be greater than zero".to_string(),
            ));
        }

        let tokens_file = env_str("TOKENS_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("tokens.json"));

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            tokens_file,
            bootstrap,
            oauth_client,
            token_url: env_str("BITRIX_TOKEN_URL").or(file.portal.token_url),
            auto_refresh,
            request_timeout_secs: file
                .portal
                .request_timeout_secs
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT_SECS),
            server_host: env_str("HOST")
                .or(file.server.host)
                .unwrap_or_else(|| "0.0.0.0".to_string()),
            server_port,
            setup_token: env_str("SETUP_TOKEN").or(file.server.setup_token),
            telegram_token: env_str("TG_BOT_TOKEN")
                .or_else(|| env_str("TELEGRAM_BOT_TOKEN"))
                .or(file.telegram.bot_token),
            chunk_size,
            debug,
        })
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(BatcherError::Configuration(format!(
            "{} must be a boolean flag, got '{}'",
            key, value
        ))),
    }
}
