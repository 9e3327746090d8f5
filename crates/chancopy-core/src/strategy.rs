//! Transfer strategies: move an item by reference, or download and re-upload it.
//!
//! Both implement [`TransferStrategy`] so the engine never knows which one it drives.

use std::{
    future::Future,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{retry_rate_limited, BackoffPolicy, RetryError, WaitObserver},
    domain::{ChannelHandle, ChatId, MediaKind, MediaMessage, TransferItem},
    formatting::truncate_chars,
    platform::{ChannelPlatform, VideoUpload},
    Error, Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StrategyKind {
    Forward,
    DownloadReupload,
}

impl StrategyKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::DownloadReupload => "download + re-upload",
        }
    }
}

/// Protected sources forbid reference forwarding; everything else is forwarded.
pub fn select_strategy(source: &ChannelHandle) -> StrategyKind {
    if source.content_protected {
        StrategyKind::DownloadReupload
    } else {
        StrategyKind::Forward
    }
}

/// Everything one item attempt needs besides the item itself.
pub struct ItemContext<'a> {
    pub source: &'a ChannelHandle,
    pub dest: ChatId,
    pub backoff: &'a BackoffPolicy,
    pub cancel: &'a CancellationToken,
    pub observer: &'a dyn WaitObserver,
}

impl ItemContext<'_> {
    /// Run one platform call through the rate-limit loop.
    pub async fn call<T, F, Fut>(&self, op: F) -> std::result::Result<T, RetryError>
    where
        F: FnMut() -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        retry_rate_limited(self.backoff, self.cancel, self.observer, op).await
    }
}

#[async_trait]
pub trait TransferStrategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    /// Move one item into `ctx.dest`. Rate limits are retried inside; any other
    /// error is returned for the engine to classify.
    async fn transfer(
        &self,
        ctx: &ItemContext<'_>,
        item: &TransferItem,
    ) -> std::result::Result<(), RetryError>;
}

pub fn build_strategy(
    kind: StrategyKind,
    platform: Arc<dyn ChannelPlatform>,
    temp_dir: PathBuf,
    caption_limit: usize,
) -> Arc<dyn TransferStrategy> {
    match kind {
        StrategyKind::Forward => Arc::new(ForwardStrategy { platform }),
        StrategyKind::DownloadReupload => Arc::new(ReuploadStrategy {
            platform,
            temp_dir,
            caption_limit,
        }),
    }
}

// ============== Forward ==============

pub struct ForwardStrategy {
    platform: Arc<dyn ChannelPlatform>,
}

#[async_trait]
impl TransferStrategy for ForwardStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Forward
    }

    async fn transfer(
        &self,
        ctx: &ItemContext<'_>,
        item: &TransferItem,
    ) -> std::result::Result<(), RetryError> {
        let id = item.item_id();
        ctx.call(|| self.platform.forward_item(ctx.dest, id.chat_id, id.message_id))
            .await
    }
}

// ============== Download + re-upload ==============

pub struct ReuploadStrategy {
    platform: Arc<dyn ChannelPlatform>,
    temp_dir: PathBuf,
    caption_limit: usize,
}

static SCRATCH_COUNTER: AtomicUsize = AtomicUsize::new(1);

/// Per-item scratch directory, removed on drop so every exit path cleans up.
struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    fn create(root: &Path, item: &MediaMessage) -> Result<Self> {
        let n = SCRATCH_COUNTER.fetch_add(1, Ordering::SeqCst);
        let path = root.join(format!(
            "item_{}_{}_{n}",
            item.chat_id.0.unsigned_abs(),
            item.id.0
        ));
        std::fs::create_dir_all(&path).map_err(|e| {
            Error::TransientIo(format!("create {}: {e}", path.display()))
        })?;
        Ok(Self { path })
    }
}

impl Drop for ScratchDir {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(path = %self.path.display(), "scratch cleanup failed: {e}");
            }
        }
    }
}

impl ReuploadStrategy {
    async fn rehydrate(
        &self,
        ctx: &ItemContext<'_>,
        item: &TransferItem,
    ) -> std::result::Result<MediaMessage, RetryError> {
        match item {
            TransferItem::Full(m) => Ok(m.clone()),
            TransferItem::Id(id) => {
                let found = ctx
                    .call(|| self.platform.fetch_message(id.chat_id, id.message_id))
                    .await?;
                found.ok_or_else(|| {
                    RetryError::Failed(Error::StaleReference(format!(
                        "message {} no longer available",
                        id.message_id.0
                    )))
                })
            }
        }
    }

    async fn download(
        &self,
        ctx: &ItemContext<'_>,
        media_ref: &str,
        dir: &Path,
    ) -> std::result::Result<Option<PathBuf>, RetryError> {
        ctx.call(|| self.platform.download_media(media_ref, dir)).await
    }

    fn caption_for(&self, msg: &MediaMessage) -> String {
        let caption = msg.caption.as_deref().unwrap_or("");
        truncate_chars(caption, self.caption_limit)
    }

    async fn reupload_video(
        &self,
        ctx: &ItemContext<'_>,
        msg: &MediaMessage,
        primary: &Path,
        scratch: &ScratchDir,
    ) -> std::result::Result<(), RetryError> {
        let thumbnail = match msg.thumbnail_ref.as_deref() {
            Some(r) => match self.download(ctx, r, &scratch.path).await {
                Ok(Some(p)) => Some(p),
                Ok(None) => {
                    tracing::debug!(item = msg.id.0, "thumbnail download failed; uploading without");
                    None
                }
                Err(RetryError::Cancelled) => return Err(RetryError::Cancelled),
                Err(RetryError::Failed(e)) => {
                    tracing::debug!(item = msg.id.0, "thumbnail unavailable: {e}");
                    None
                }
            },
            None => None,
        };

        let caption = self.caption_for(msg);
        ctx.call(|| {
            self.platform.upload_video(
                ctx.dest,
                primary,
                VideoUpload {
                    caption: &caption,
                    duration_secs: msg.duration_secs,
                    thumbnail: thumbnail.as_deref(),
                    supports_streaming: true,
                },
            )
        })
        .await
    }

    async fn reupload_photo(
        &self,
        ctx: &ItemContext<'_>,
        msg: &MediaMessage,
        primary: &Path,
    ) -> std::result::Result<(), RetryError> {
        let caption = self.caption_for(msg);
        ctx.call(|| self.platform.upload_photo(ctx.dest, primary, &caption))
            .await
    }
}

#[async_trait]
impl TransferStrategy for ReuploadStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::DownloadReupload
    }

    async fn transfer(
        &self,
        ctx: &ItemContext<'_>,
        item: &TransferItem,
    ) -> std::result::Result<(), RetryError> {
        let msg = self.rehydrate(ctx, item).await?;
        if !msg.kind.is_transferable() {
            return Err(RetryError::Failed(Error::UnsupportedItemShape(format!(
                "message {} is a {}, not a video or photo",
                msg.id.0,
                msg.kind.label()
            ))));
        }

        let scratch = ScratchDir::create(&self.temp_dir, &msg)?;
        let primary = self
            .download(ctx, &msg.media_ref, &scratch.path)
            .await?
            .ok_or_else(|| {
                RetryError::Failed(Error::TransientIo(format!(
                    "download of message {} failed",
                    msg.id.0
                )))
            })?;

        match msg.kind {
            MediaKind::Video => self.reupload_video(ctx, &msg, &primary, &scratch).await,
            MediaKind::Photo => self.reupload_photo(ctx, &msg, &primary).await,
            MediaKind::Document | MediaKind::Other => Err(RetryError::Failed(
                Error::UnsupportedItemShape(msg.kind.label().to_string()),
            )),
        }
    }
}
