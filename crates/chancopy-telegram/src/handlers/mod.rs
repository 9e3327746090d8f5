//! Telegram update handlers.
//!
//! Operator messages are authorized by chat id and parsed as prefixed commands;
//! channel posts feed the platform's post index.

use std::sync::Arc;

use teloxide::{prelude::*, types::Message};

use crate::router::AppState;

mod channel_post;
pub mod commands;

pub fn is_operator(chat_id: i64, operators: &[i64]) -> bool {
    operators.contains(&chat_id)
}

pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    channel_post::handle_channel_post(msg, state).await
}

pub async fn handle_message(bot: Bot, msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let chat_id = msg.chat.id.0;

    if !is_operator(chat_id, &state.cfg.operator_chat_ids) {
        tracing::warn!(chat_id, "message from non-operator chat ignored");
        let _ = bot
            .send_message(msg.chat.id, "Unauthorized. Contact the bot owner for access.")
            .await;
        return Ok(());
    }

    let is_command = msg
        .text()
        .is_some_and(|t| t.starts_with(state.cfg.command_prefix.as_str()) || t.starts_with('/'));
    if is_command {
        return commands::handle_command(msg, state).await;
    }

    Ok(())
}
