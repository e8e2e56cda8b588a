pub(crate) mod auth;
mod handlers;
mod payload;
mod router;

use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::core::config::AppConfig;
use crate::core::credentials::{Clock, SystemClock};

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) tokens_file: PathBuf,
    pub(crate) setup_token: Option<String>,
    pub(crate) debug: bool,
    pub(crate) clock: Arc<dyn Clock>,
}

impl AppState {
    pub(crate) fn from_config(config: &AppConfig) -> Self {
        Self {
            tokens_file: config.tokens_file.clone(),
            setup_token: config.setup_token.clone(),
            debug: config.debug,
            clock: Arc::new(SystemClock),
        }
    }
}

/// Serve the installer endpoints until `shutdown` fires.
pub async fn serve(
    config: &AppConfig,
    host: &str,
    port: u16,
    shutdown: CancellationToken,
) -> Result<()> {
    let app = router::build_router(AppState::from_config(config));
    let addr = format!("{}:{}", host, port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("HTTP installer listening on http://{}", addr);
    info!("Install endpoint: POST /install");
    if config.setup_token.is_some() {
        info!("Manual tokens endpoint: POST /set-tokens (setup token required)");
    } else {
        info!("Manual tokens endpoint: POST /set-tokens (unprotected, set SETUP_TOKEN)");
    }

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP installer stopped");
    Ok(())
}
