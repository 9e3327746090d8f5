use std::sync::Arc;

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use chancopy_core::messaging::throttled::{ThrottleConfig, ThrottledMessenger};
use chancopy_core::{
    archive::JsonArchiveStore,
    config::Config,
    domain::ChatId,
    formatting::escape_html,
    jobs::{JobManager, PipelineDeps},
    messaging::port::MessagingPort,
};

use crate::handlers;
use crate::{ChannelIndex, TelegramMessenger, TelegramPlatform};

#[derive(Clone)]
pub struct AppState {
    pub cfg: Arc<Config>,
    pub messenger: Arc<dyn MessagingPort>,
    pub jobs: JobManager,
    pub index: Arc<ChannelIndex>,
}

pub async fn run_polling(cfg: Arc<Config>) -> anyhow::Result<()> {
    let bot = Bot::new(cfg.telegram_bot_token.clone());

    match bot.get_me().await {
        Ok(me) => tracing::info!(bot = %me.username(), "chancopy started"),
        Err(e) => tracing::warn!("get_me failed: {e}"),
    }
    tracing::info!(
        operators = cfg.operator_chat_ids.len(),
        temp_dir = %cfg.temp_dir.display(),
        archive_dir = %cfg.archive_dir.display(),
        "configuration loaded"
    );

    // Progress edits from many jobs share one operator chat; space them out.
    // A single RetryAfter retry still happens inside the Telegram adapter.
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(
        bot.clone(),
        cfg.telegram_message_limit,
    ));
    let messenger: Arc<dyn MessagingPort> = Arc::new(ThrottledMessenger::new(
        raw_messenger,
        ThrottleConfig::default(),
    ));

    let index = Arc::new(ChannelIndex::default());
    let jobs = JobManager::new(PipelineDeps {
        platform: Arc::new(TelegramPlatform::new(bot.clone(), index.clone())),
        messenger: messenger.clone(),
        archives: Arc::new(JsonArchiveStore::new(cfg.archive_dir.clone())),
        cfg: cfg.pipeline.clone(),
    });

    send_startup_notification(&cfg, messenger.as_ref()).await;

    let state = Arc::new(AppState {
        cfg: cfg.clone(),
        messenger,
        jobs: jobs.clone(),
        index,
    });

    let handler = dptree::entry()
        .branch(Update::filter_channel_post().endpoint(handlers::handle_channel_post))
        .branch(Update::filter_edited_channel_post().endpoint(handlers::handle_channel_post))
        .branch(Update::filter_message().endpoint(handlers::handle_message));

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![state])
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    tracing::info!("dispatcher stopped; cancelling running jobs");
    jobs.shutdown().await;
    Ok(())
}

async fn send_startup_notification(cfg: &Config, messenger: &dyn MessagingPort) {
    let html = format!(
        "🟢 Channel copier online. Send <code>{}help</code> for commands.",
        escape_html(&cfg.command_prefix)
    );
    for &chat in &cfg.operator_chat_ids {
        if let Err(e) = messenger.send_html(ChatId(chat), &html).await {
            tracing::warn!(chat_id = chat, "startup notification failed: {e}");
        }
    }
}
