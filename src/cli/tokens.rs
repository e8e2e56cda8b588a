use anyhow::Result;
use console::style;

use super::SetTokensArgs;
use crate::core::config::AppConfig;
use crate::core::credentials::{Clock, CredentialRecord, CredentialStore, SystemClock};
use crate::core::terminal::{GuideSection, print_success, print_warn};

pub async fn run_set_tokens(config: &AppConfig, args: SetTokensArgs) -> Result<()> {
    let record = CredentialRecord {
        host: args.domain.trim().to_string(),
        access_token: args.access_token.trim().to_string(),
        refresh_token: args.refresh_token,
        expires_in_seconds: args.expires_in,
        issued_at_ms: Some(SystemClock.now_ms()),
    };
    save_record(config, record).await
}

pub(crate) async fn save_record(config: &AppConfig, record: CredentialRecord) -> Result<()> {
    let host = record.host.clone();
    CredentialStore::with_record(&config.tokens_file, record)
        .persist()
        .await?;
    print_success(&format!(
        "Credentials for {} saved to {}",
        host,
        config.tokens_file.display()
    ));
    Ok(())
}

/// Prompt for host and tokens. Used by the wizard when nothing is stored yet.
pub(crate) async fn prompt_and_save(config: &AppConfig) -> Result<()> {
    let domain = inquire::Text::new("Portal domain:")
        .with_help_message("e.g. mycompany.bitrix24.ru")
        .prompt()?;
    let access_token = inquire::Password::new("Access token:")
        .without_confirmation()
        .prompt()?;
    let refresh_token = inquire::Password::new("Refresh token (Enter to skip):")
        .without_confirmation()
        .prompt()?;

    let record = CredentialRecord {
        host: domain.trim().to_string(),
        access_token: access_token.trim().to_string(),
        refresh_token: Some(refresh_token.trim().to_string()).filter(|t| !t.is_empty()),
        expires_in_seconds: None,
        issued_at_ms: Some(SystemClock.now_ms()),
    };
    if !record.is_configured() {
        print_warn("Domain and access token are both required. Nothing was saved.");
        return Ok(());
    }
    save_record(config, record).await
}

pub async fn run_status(config: &AppConfig) -> Result<()> {
    let store = CredentialStore::load(&config.tokens_file, config.bootstrap.as_ref()).await?;
    let now = SystemClock.now_ms();

    let mut section = GuideSection::new("deal-batcher status")
        .status("Data directory", &config.data_dir.display().to_string())
        .status("Credentials file", &config.tokens_file.display().to_string());

    section = match store.record().filter(|r| r.is_configured()) {
        Some(record) => {
            let expiry = match record.expires_at_ms() {
                Some(at) => {
                    let when = chrono::DateTime::from_timestamp_millis(at)
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| at.to_string());
                    if record.is_expired_at(now) {
                        format!("{} {}", when, style("(expired)").red())
                    } else {
                        when
                    }
                }
                None => "unknown (static token)".to_string(),
            };
            section
                .status("Configured", &style("yes").green().to_string())
                .status("Host", &record.host)
                .status("Access token", &record.masked_access_token())
                .status(
                    "Refresh token",
                    if record.refresh_token.is_some() { "stored" } else { "none" },
                )
                .status("Expires", &expiry)
        }
        None => section
            .status("Configured", &style("no").red().to_string())
            .text("Install the app (POST /install) or run `deal-batcher set-tokens`."),
    };

    section
        .blank()
        .status("Auto refresh", &config.auto_refresh.to_string())
        .status(
            "OAuth client",
            if config.oauth_client.is_some() { "configured" } else { "not set" },
        )
        .status(
            "Chat bot",
            if config.telegram_token.is_some() { "configured" } else { "not set" },
        )
        .status("Chunk size", &config.chunk_size.to_string())
        .print();
    println!();
    Ok(())
}
