//! `ChannelPlatform` over the Bot API.
//!
//! Bots cannot read channel history, join through invite links, or create
//! channels. Enumeration therefore reads from [`ChannelIndex`], which the router
//! feeds with every channel post the bot sees as an administrator.

use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use teloxide::{
    net::Download,
    prelude::*,
    types::{ChatKind, InputFile, Recipient},
};

use chancopy_core::{
    domain::{ChannelHandle, ChannelRef, ChatId, MediaKind, MediaMessage, MessageId},
    platform::{ChannelPlatform, VideoUpload},
    Error, Result,
};

use crate::{map_request_error, tg_chat, tg_msg_id};

#[derive(Clone, Debug)]
struct IndexedChannel {
    title: String,
    posts: BTreeMap<i32, MediaMessage>,
}

/// Media posts seen per channel, keyed by message id (chronological).
#[derive(Default)]
pub struct ChannelIndex {
    channels: Mutex<HashMap<i64, IndexedChannel>>,
}

impl ChannelIndex {
    fn channels(&self) -> MutexGuard<'_, HashMap<i64, IndexedChannel>> {
        self.channels.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Record (or replace, for edits) one post.
    pub fn record(&self, title: &str, media: MediaMessage) {
        let mut channels = self.channels();
        let entry = channels
            .entry(media.chat_id.0)
            .or_insert_with(|| IndexedChannel {
                title: title.to_string(),
                posts: BTreeMap::new(),
            });
        entry.title = title.to_string();
        entry.posts.insert(media.id.0, media);
    }

    pub fn record_message(&self, msg: &Message) {
        let title = msg.chat.title().unwrap_or_default();
        self.record(title, media_from_message(msg));
    }

    pub fn newest_first(&self, chat_id: ChatId) -> Vec<MediaMessage> {
        self.channels()
            .get(&chat_id.0)
            .map(|c| c.posts.values().rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, chat_id: ChatId, message_id: MessageId) -> Option<MediaMessage> {
        self.channels()
            .get(&chat_id.0)
            .and_then(|c| c.posts.get(&message_id.0).cloned())
    }

    /// Destination lookup. Update chats carry no protection flag, so the handle
    /// is unprotected; sources go through `get_chat` instead.
    pub fn find_by_title(&self, title: &str) -> Option<ChannelHandle> {
        self.channels()
            .iter()
            .find(|(_, c)| c.title == title)
            .map(|(id, c)| ChannelHandle {
                id: ChatId(*id),
                title: c.title.clone(),
                content_protected: false,
                preview: false,
                invite_link: None,
            })
    }

    pub fn post_count(&self, chat_id: ChatId) -> usize {
        self.channels()
            .get(&chat_id.0)
            .map(|c| c.posts.len())
            .unwrap_or(0)
    }
}

fn is_protected(chat: &teloxide::types::Chat) -> bool {
    match &chat.kind {
        ChatKind::Public(p) => p.has_protected_content.is_some(),
        ChatKind::Private(_) => false,
    }
}

fn invite_link(chat: &teloxide::types::Chat) -> Option<String> {
    match &chat.kind {
        ChatKind::Public(p) => p.invite_link.clone(),
        ChatKind::Private(_) => None,
    }
}

/// Convert a channel post into the pipeline's media shape.
pub fn media_from_message(msg: &Message) -> MediaMessage {
    let mut media = MediaMessage {
        chat_id: ChatId(msg.chat.id.0),
        id: MessageId(msg.id.0),
        kind: MediaKind::Other,
        media_ref: String::new(),
        caption: msg.caption().map(str::to_string),
        duration_secs: None,
        thumbnail_ref: None,
        size_bytes: None,
    };

    if let Some(v) = msg.video() {
        media.kind = MediaKind::Video;
        media.media_ref = v.file.id.clone();
        media.duration_secs = Some(v.duration);
        media.thumbnail_ref = v.thumb.as_ref().map(|t| t.file.id.clone());
        media.size_bytes = Some(u64::from(v.file.size));
    } else if let Some(sizes) = msg.photo() {
        // Photos arrive as several renditions; keep the largest.
        if let Some(p) = sizes.iter().max_by_key(|p| p.width * p.height) {
            media.kind = MediaKind::Photo;
            media.media_ref = p.file.id.clone();
            media.size_bytes = Some(u64::from(p.file.size));
        }
    } else if let Some(d) = msg.document() {
        media.kind = MediaKind::Document;
        media.media_ref = d.file.id.clone();
        media.size_bytes = Some(u64::from(d.file.size));
    }
    media
}

/// Map an operator reference to a Bot API recipient.
pub fn recipient_for(channel: &ChannelRef) -> Result<Recipient> {
    let raw = channel.as_str();
    if channel.is_invite() {
        return Err(Error::PermissionDenied(format!(
            "{raw}: bots cannot join through invite links; add the bot as a channel admin and use the numeric id"
        )));
    }
    if let Ok(id) = raw.parse::<i64>() {
        return Ok(Recipient::Id(teloxide::types::ChatId(id)));
    }
    let name = raw
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_start_matches("t.me/")
        .trim_start_matches("telegram.me/")
        .trim_start_matches('@')
        .trim_end_matches('/');
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(Error::ChannelNotFound(format!("{raw}: not a channel reference")));
    }
    Ok(Recipient::ChannelUsername(format!("@{name}")))
}

pub struct TelegramPlatform {
    bot: Bot,
    index: Arc<ChannelIndex>,
}

impl TelegramPlatform {
    pub fn new(bot: Bot, index: Arc<ChannelIndex>) -> Self {
        Self { bot, index }
    }
}

fn with_ref(e: Error, channel: &ChannelRef) -> Error {
    match e {
        Error::ChannelNotFound(_) => Error::ChannelNotFound(channel.to_string()),
        other => other,
    }
}

fn file_name_for(media_ref: &str, remote_path: &str) -> String {
    let ext = Path::new(remote_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("bin");
    let stem: String = media_ref
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(32)
        .collect();
    format!("{stem}.{ext}")
}

#[async_trait]
impl ChannelPlatform for TelegramPlatform {
    async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelHandle> {
        let recipient = recipient_for(channel)?;
        let chat = self
            .bot
            .get_chat(recipient)
            .await
            .map_err(|e| with_ref(map_request_error(e), channel))?;
        if !chat.is_channel() {
            return Err(Error::ChannelNotFound(format!("{channel} is not a channel")));
        }
        Ok(ChannelHandle {
            id: ChatId(chat.id.0),
            title: chat.title().unwrap_or_default().to_string(),
            content_protected: is_protected(&chat),
            preview: false,
            invite_link: invite_link(&chat),
        })
    }

    async fn join_channel(&self, channel: &ChannelRef) -> Result<()> {
        Err(Error::PermissionDenied(format!(
            "{channel}: bots cannot join channels; add the bot as an admin"
        )))
    }

    async fn list_channel_content(&self, channel_id: ChatId) -> Result<Vec<MediaMessage>> {
        let items = self.index.newest_first(channel_id);
        tracing::debug!(channel = channel_id.0, posts = items.len(), "listing indexed posts");
        Ok(items)
    }

    async fn fetch_message(
        &self,
        channel_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<MediaMessage>> {
        Ok(self.index.get(channel_id, message_id))
    }

    async fn download_media(&self, media_ref: &str, dir: &Path) -> Result<Option<PathBuf>> {
        let file = self
            .bot
            .get_file(media_ref.to_string())
            .await
            .map_err(map_request_error)?;
        let path = dir.join(file_name_for(media_ref, &file.path));

        let mut dst = tokio::fs::File::create(&path).await?;
        match self.bot.download_file(&file.path, &mut dst).await {
            Ok(()) => Ok(Some(path)),
            Err(e) => {
                tracing::warn!(media_ref, "download failed: {e}");
                Ok(None)
            }
        }
    }

    async fn upload_video(
        &self,
        dest: ChatId,
        path: &Path,
        params: VideoUpload<'_>,
    ) -> Result<()> {
        let mut req = self
            .bot
            .send_video(tg_chat(dest), InputFile::file(path.to_path_buf()))
            .supports_streaming(params.supports_streaming);
        if !params.caption.is_empty() {
            req = req.caption(params.caption.to_string());
        }
        if let Some(d) = params.duration_secs {
            req = req.duration(d);
        }
        if let Some(thumb) = params.thumbnail {
            req = req.thumb(InputFile::file(thumb.to_path_buf()));
        }
        req.await.map_err(map_request_error)?;
        Ok(())
    }

    async fn upload_photo(&self, dest: ChatId, path: &Path, caption: &str) -> Result<()> {
        let mut req = self
            .bot
            .send_photo(tg_chat(dest), InputFile::file(path.to_path_buf()));
        if !caption.is_empty() {
            req = req.caption(caption.to_string());
        }
        req.await.map_err(map_request_error)?;
        Ok(())
    }

    async fn forward_item(&self, dest: ChatId, source: ChatId, item: MessageId) -> Result<()> {
        self.bot
            .forward_message(tg_chat(dest), tg_chat(source), tg_msg_id(item))
            .await
            .map_err(map_request_error)?;
        Ok(())
    }

    async fn create_channel(&self, title: &str) -> Result<ChannelHandle> {
        Err(Error::PermissionDenied(format!(
            "bots cannot create channels; create \"{title}\", add the bot as admin and pass it as destination"
        )))
    }

    async fn find_owned_channel(&self, title: &str) -> Result<Option<ChannelHandle>> {
        Ok(self.index.find_by_title(title))
    }
}
