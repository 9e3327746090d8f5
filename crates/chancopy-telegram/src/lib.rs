//! Telegram adapter (teloxide).
//!
//! Implements the `chancopy-core` messaging and platform ports over the Bot API
//! and hosts the operator command router.

use async_trait::async_trait;

use teloxide::{prelude::*, types::ParseMode, ApiError, RequestError};

use tokio::time::sleep;

pub mod handlers;
pub mod platform;
pub mod router;

use chancopy_core::{
    domain::{ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    Result,
};

pub use platform::{ChannelIndex, TelegramPlatform};

pub(crate) fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

pub(crate) fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

/// Map a Bot API failure onto the pipeline's error taxonomy.
pub(crate) fn map_request_error(e: RequestError) -> Error {
    match e {
        RequestError::RetryAfter(wait) => Error::RateLimited {
            wait,
            cause: "FLOOD_WAIT".to_string(),
        },
        RequestError::Api(api) => map_api_error(api),
        RequestError::Io(e) => Error::TransientIo(e.to_string()),
        other => Error::External(format!("telegram error: {other}")),
    }
}

fn map_api_error(api: ApiError) -> Error {
    match api {
        ApiError::ChatNotFound => Error::ChannelNotFound("chat not found".to_string()),
        ApiError::BotKicked | ApiError::NotEnoughRightsToPostMessages => {
            Error::PermissionDenied(api.to_string())
        }
        ApiError::MessageToForwardNotFound | ApiError::WrongFileId => {
            Error::StaleReference(api.to_string())
        }
        ApiError::Unknown(text) => classify_unknown(text),
        other => Error::External(format!("telegram error: {other}")),
    }
}

fn classify_unknown(text: String) -> Error {
    let lower = text.to_lowercase();
    if lower.contains("file reference") || lower.contains("file_reference") {
        Error::StaleReference(text)
    } else if lower.contains("forbidden") || lower.contains("not enough rights") {
        Error::PermissionDenied(text)
    } else if lower.contains("chat not found") || lower.contains("username_not_occupied") {
        Error::ChannelNotFound(text)
    } else {
        Error::External(format!("telegram error: {text}"))
    }
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bot: Bot,
    max_message_len: usize,
}

impl TelegramMessenger {
    pub fn new(bot: Bot, max_message_len: usize) -> Self {
        Self {
            bot,
            max_message_len,
        }
    }

    /// Operator messages get one in-place retry on RetryAfter; a second signal
    /// is surfaced as `RateLimited`.
    async fn with_retry<T, Fut>(&self, mut op: impl FnMut() -> Fut) -> Result<T>
    where
        Fut: std::future::IntoFuture<Output = std::result::Result<T, RequestError>>,
        Fut::IntoFuture: Send,
    {
        const MAX_RETRIES: usize = 1;
        let mut attempts = 0usize;
        loop {
            match op().await {
                Ok(v) => return Ok(v),
                Err(RequestError::RetryAfter(d)) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    sleep(d).await;
                }
                Err(other) => return Err(map_request_error(other)),
            }
        }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            max_message_len: self.max_message_len,
        }
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let msg = self
            .with_retry(|| {
                self.bot
                    .send_message(tg_chat(chat_id), html.to_string())
                    .parse_mode(ParseMode::Html)
                    .disable_web_page_preview(true)
            })
            .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        self.with_retry(|| {
            self.bot
                .edit_message_text(
                    tg_chat(msg.chat_id),
                    tg_msg_id(msg.message_id),
                    html.to_string(),
                )
                .parse_mode(ParseMode::Html)
                .disable_web_page_preview(true)
        })
        .await?;
        Ok(())
    }
}
