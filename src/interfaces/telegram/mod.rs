pub mod session;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use teloxide::prelude::*;
use teloxide::types::{BotCommand, InlineKeyboardButton, InlineKeyboardMarkup};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::core::config::AppConfig;
use crate::core::credentials::{Clock, CredentialRecord, CredentialStore, SystemClock};
use crate::core::crm::CrmClient;
use crate::core::deals::{DealService, JobParams, JobSummary, ProgressEvent};
use session::{
    Action, CATEGORY_PREFIX, Command, PROGRESS_INTERVAL, ProgressThrottle, STAGE_PREFIX,
    WizardStep,
};
use tokio_util::sync::CancellationToken;

/// Shared by every handler invocation.
pub struct BotState {
    config: AppConfig,
    sessions: Mutex<HashMap<ChatId, WizardStep>>,
}

impl BotState {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    async fn take_step(&self, chat: ChatId) -> WizardStep {
        self.sessions.lock().await.remove(&chat).unwrap_or_default()
    }

    async fn set_step(&self, chat: ChatId, step: WizardStep) {
        self.sessions.lock().await.insert(chat, step);
    }

    async fn service(&self) -> crate::core::error::Result<DealService<CrmClient>> {
        Ok(DealService::new(CrmClient::from_config(&self.config).await?))
    }
}

/// Run the bot until Ctrl-C.
pub async fn run_bot(config: AppConfig, token: &str) -> Result<()> {
    let bot = Bot::new(token);

    let commands = vec![
        BotCommand::new("start", "Reset and show the menu"),
        BotCommand::new("run", "Tag deals in a stage"),
        BotCommand::new("status", "Show credential status"),
        BotCommand::new("set_tokens", "Store portal credentials manually"),
        BotCommand::new("cancel", "Cancel the current wizard or job"),
    ];
    if let Err(e) = bot.set_my_commands(commands).await {
        error!("Failed to set telegram bot commands: {}", e);
    }

    let state = Arc::new(BotState::new(config));
    let handler = dptree::entry()
        .branch(Update::filter_message().endpoint(on_message))
        .branch(Update::filter_callback_query().endpoint(on_callback));

    info!("Chat bot started");
    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    info!("Chat bot stopped");
    Ok(())
}

async fn on_message(bot: Bot, msg: Message, state: Arc<BotState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat = msg.chat.id;
    let step = state.take_step(chat).await;

    let transition = match Command::parse(text) {
        Some(command) => step.on_command(command),
        None => step.on_text(text, state.config.chunk_size),
    };
    state.set_step(chat, transition.next).await;
    perform(&bot, &state, chat, transition.action).await
}

async fn on_callback(bot: Bot, q: CallbackQuery, state: Arc<BotState>) -> ResponseResult<()> {
    bot.answer_callback_query(q.id.clone()).await?;
    let Some(data) = q.data.as_deref() else {
        return Ok(());
    };
    let chat = ChatId::from(q.from.id);
    let step = state.take_step(chat).await;
    let transition = step.on_callback(data);
    state.set_step(chat, transition.next).await;
    perform(&bot, &state, chat, transition.action).await
}

async fn perform(bot: &Bot, state: &Arc<BotState>, chat: ChatId, action: Action) -> ResponseResult<()> {
    match action {
        Action::Nothing | Action::Say(_) | Action::SayAll(_) => say(bot, chat, action).await?,
        Action::ShowMenu => {
            bot.send_message(
                chat,
                "Hi! I tag deals in bulk, one group of deals at a time.\n\n\
                 /run - tag deals in a stage\n\
                 /set_tokens - store portal credentials\n\
                 /status - show credential status\n\
                 /cancel - cancel the current step or job",
            )
            .await?;
        }
        Action::ShowStatus => {
            bot.send_message(chat, status_text(&state.config).await).await?;
        }
        Action::SaveCredentials {
            domain,
            access_token,
            refresh_token,
        } => {
            let record = CredentialRecord {
                host: domain,
                access_token,
                refresh_token,
                expires_in_seconds: None,
                issued_at_ms: Some(SystemClock.now_ms()),
            };
            let reply = match CredentialStore::with_record(&state.config.tokens_file, record)
                .persist()
                .await
            {
                Ok(()) => "Credentials saved.".to_string(),
                Err(e) => {
                    error!("Failed to save credentials from chat {}: {}", chat, e);
                    format!("Could not save credentials: {}", e)
                }
            };
            bot.send_message(chat, reply).await?;
        }
        Action::ListCategories => {
            let categories = match state.service().await {
                Ok(service) => service.get_categories().await,
                Err(e) => Err(e),
            };
            match categories {
                Ok(categories) => {
                    let buttons = categories
                        .iter()
                        .map(|c| {
                            InlineKeyboardButton::callback(
                                c.name.clone(),
                                format!("{}{}", CATEGORY_PREFIX, c.id),
                            )
                        })
                        .collect();
                    bot.send_message(chat, "Choose a category:")
                        .reply_markup(keyboard(buttons))
                        .await?;
                }
                Err(e) => fail(bot, state, chat, "Could not load categories", e).await?,
            }
        }
        Action::ListStages { category_id } => {
            let stages = match state.service().await {
                Ok(service) => service.get_stages(&category_id).await,
                Err(e) => Err(e),
            };
            match stages {
                Ok(stages) if stages.is_empty() => {
                    state.set_step(chat, WizardStep::Idle).await;
                    bot.send_message(chat, "This category has no stages.").await?;
                }
                Ok(stages) => {
                    let buttons = stages
                        .iter()
                        .map(|s| {
                            InlineKeyboardButton::callback(
                                s.name.clone(),
                                format!("{}{}", STAGE_PREFIX, s.status_id),
                            )
                        })
                        .collect();
                    bot.send_message(chat, "Choose a stage:")
                        .reply_markup(keyboard(buttons))
                        .await?;
                }
                Err(e) => fail(bot, state, chat, "Could not load stages", e).await?,
            }
        }
        Action::LoadFields {
            category_id,
            stage_id,
        } => {
            let fields = match state.service().await {
                Ok(service) => service.get_deal_user_fields().await,
                Err(e) => Err(e),
            };
            match fields {
                Ok(fields) => {
                    let transition = WizardStep::fields_loaded(category_id, stage_id, fields);
                    state.set_step(chat, transition.next).await;
                    say(bot, chat, transition.action).await?;
                }
                Err(e) => fail(bot, state, chat, "Could not load fields", e).await?,
            }
        }
        Action::StartJob { params, cancel } => {
            bot.send_message(chat, "Loading deals, this can take a while...")
                .await?;
            tokio::spawn(run_job(bot.clone(), state.clone(), chat, params, cancel));
        }
    }
    Ok(())
}

/// Sends plain replies. Other actions are ignored here.
async fn say(bot: &Bot, chat: ChatId, action: Action) -> ResponseResult<()> {
    match action {
        Action::Say(text) => {
            bot.send_message(chat, text).await?;
        }
        Action::SayAll(messages) => {
            for text in messages {
                bot.send_message(chat, text).await?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Report a portal error and drop back to idle.
async fn fail(
    bot: &Bot,
    state: &BotState,
    chat: ChatId,
    what: &str,
    err: crate::core::error::BatcherError,
) -> ResponseResult<()> {
    warn!("{} for chat {}: {}", what, chat, err);
    state.set_step(chat, WizardStep::Idle).await;
    bot.send_message(chat, format!("{}: {}", what, err)).await?;
    Ok(())
}

/// Two buttons per row.
fn keyboard(buttons: Vec<InlineKeyboardButton>) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = buttons.chunks(2).map(|row| row.to_vec()).collect();
    InlineKeyboardMarkup::new(rows)
}

async fn run_job(
    bot: Bot,
    state: Arc<BotState>,
    chat: ChatId,
    params: JobParams,
    cancel: CancellationToken,
) {
    let (progress_tx, mut progress_rx) = tokio::sync::mpsc::unbounded_channel::<ProgressEvent>();
    let forwarder = {
        let bot = bot.clone();
        tokio::spawn(async move {
            let mut throttle = ProgressThrottle::new(PROGRESS_INTERVAL);
            while let Some(event) = progress_rx.recv().await {
                if throttle.should_emit(Instant::now()) {
                    let text = format!(
                        "Processed group {}/{}: {} deals",
                        event.group_index, event.total_groups, event.processed
                    );
                    if let Err(e) = bot.send_message(chat, text).await {
                        warn!("Failed to send progress to chat {}: {}", chat, e);
                    }
                }
            }
        })
    };

    let sink = move |event: &ProgressEvent| {
        let _ = progress_tx.send(*event);
    };
    let result = match state.service().await {
        Ok(service) => service.run_job(&params, &sink, &cancel).await,
        Err(e) => Err(e),
    };
    drop(sink);
    let _ = forwarder.await;

    {
        let mut sessions = state.sessions.lock().await;
        if sessions.get(&chat).is_some_and(WizardStep::is_running) {
            sessions.insert(chat, WizardStep::Idle);
        }
    }

    let reply = match result {
        Ok(summary) => summary_text(&summary),
        Err(e) => {
            error!("Job for chat {} failed: {}", chat, e);
            format!("Job failed: {}", e)
        }
    };
    if let Err(e) = bot.send_message(chat, reply).await {
        error!("Failed to send job summary to chat {}: {}", chat, e);
    }
}

fn summary_text(summary: &JobSummary) -> String {
    let mut lines = vec![
        if summary.cancelled {
            "Job cancelled.".to_string()
        } else {
            "Job finished.".to_string()
        },
        summary.to_string(),
    ];
    for failure in summary.failures.iter().take(10) {
        lines.push(format!(
            "deal {} (group {}): {}",
            failure.id, failure.group, failure.reason
        ));
    }
    if summary.failures.len() > 10 {
        lines.push(format!("... and {} more failures", summary.failures.len() - 10));
    }
    lines.join("\n")
}

async fn status_text(config: &AppConfig) -> String {
    match CredentialStore::load(&config.tokens_file, config.bootstrap.as_ref()).await {
        Ok(store) => match store.record().filter(|r| r.is_configured()) {
            Some(record) => format!(
                "Credentials: present\nHost: {}\nAccess token: {}\nRefresh token: {}",
                record.host,
                record.masked_access_token(),
                if record.refresh_token.is_some() { "stored" } else { "none" }
            ),
            None => "Credentials: missing. Use /set_tokens or install the app.".to_string(),
        },
        Err(e) => format!("Credentials file is unreadable: {}", e),
    }
}
