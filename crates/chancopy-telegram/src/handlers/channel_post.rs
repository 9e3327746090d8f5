use std::sync::Arc;

use teloxide::prelude::*;

use chancopy_core::domain::ChatId;

use crate::router::AppState;

/// New and edited channel posts both land here.
pub async fn handle_channel_post(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    state.index.record_message(&msg);
    tracing::debug!(
        channel = msg.chat.id.0,
        message_id = msg.id.0,
        posts = state.index.post_count(ChatId(msg.chat.id.0)),
        "indexed channel post"
    );
    Ok(())
}
