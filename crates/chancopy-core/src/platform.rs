//! Port for the messaging platform the copier moves content on.
//!
//! Every method may fail with `Error::RateLimited` or `Error::StaleReference`;
//! callers route those through the backoff loop.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{
    domain::{ChannelHandle, ChannelRef, ChatId, MediaMessage, MessageId},
    Result,
};

/// Parameters for a video re-upload.
#[derive(Clone, Debug, Default)]
pub struct VideoUpload<'a> {
    pub caption: &'a str,
    pub duration_secs: Option<u32>,
    pub thumbnail: Option<&'a Path>,
    pub supports_streaming: bool,
}

#[async_trait]
pub trait ChannelPlatform: Send + Sync {
    /// Resolve a reference. Fails with `ChannelNotFound` / `PermissionDenied`.
    async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelHandle>;

    async fn join_channel(&self, channel: &ChannelRef) -> Result<()>;

    /// All messages in the channel, newest first. Non-media messages may be included
    /// with `MediaKind::Other`; the enumerator filters them.
    async fn list_channel_content(&self, channel_id: ChatId) -> Result<Vec<MediaMessage>>;

    /// Fetch a single message by id. `None` when it no longer exists.
    async fn fetch_message(
        &self,
        channel_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<MediaMessage>>;

    /// Download media into `dir`. `None` signals a transient download failure.
    async fn download_media(&self, media_ref: &str, dir: &Path) -> Result<Option<PathBuf>>;

    async fn upload_video(
        &self,
        dest: ChatId,
        path: &Path,
        params: VideoUpload<'_>,
    ) -> Result<()>;

    async fn upload_photo(&self, dest: ChatId, path: &Path, caption: &str) -> Result<()>;

    async fn forward_item(&self, dest: ChatId, source: ChatId, item: MessageId) -> Result<()>;

    async fn create_channel(&self, title: &str) -> Result<ChannelHandle>;

    /// A channel the operator already owns with exactly this title, if any.
    async fn find_owned_channel(&self, title: &str) -> Result<Option<ChannelHandle>>;
}
