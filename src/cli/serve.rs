use anyhow::{Result, bail};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::core::config::AppConfig;
use crate::core::terminal::{print_info, print_link, print_success, print_warn};
use crate::interfaces::{telegram, web};

/// HTTP installer in the foreground, chat bot alongside when a token is set.
pub async fn run_serve(config: AppConfig, host: String, port: u16) -> Result<()> {
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, shutting down");
                shutdown.cancel();
            }
        });
    }

    let bot = match config.telegram_token.clone() {
        Some(token) => {
            let bot_config = config.clone();
            print_success("Chat bot enabled");
            Some(tokio::spawn(async move {
                if let Err(e) = telegram::run_bot(bot_config, &token).await {
                    error!("Chat bot exited: {:#}", e);
                }
            }))
        }
        None => {
            print_warn("TG_BOT_TOKEN is not set, running without the chat bot");
            None
        }
    };

    let display_host = if host == "0.0.0.0" { "localhost" } else { host.as_str() };
    print_link("Installer", &format!("http://{}:{}/install", display_host, port));
    print_link("Health", &format!("http://{}:{}/health", display_host, port));
    print_info("Press Ctrl-C to stop.");

    let served = web::serve(&config, &host, port, shutdown).await;
    if let Some(bot) = bot {
        bot.abort();
    }
    served
}

pub async fn run_bot(config: AppConfig) -> Result<()> {
    let Some(token) = config.telegram_token.clone() else {
        bail!("TG_BOT_TOKEN is not set");
    };
    print_success("Chat bot running. Press Ctrl-C to stop.");
    telegram::run_bot(config, &token).await
}
