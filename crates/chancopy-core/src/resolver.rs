//! Channel resolution: operator reference -> accessible channel handle.

use std::sync::Arc;

use crate::{
    backoff::{retry_until_done, BackoffPolicy},
    domain::{ChannelHandle, ChannelRef},
    platform::ChannelPlatform,
    Result,
};

#[derive(Clone)]
pub struct ChannelResolver {
    platform: Arc<dyn ChannelPlatform>,
    backoff: BackoffPolicy,
}

impl ChannelResolver {
    pub fn new(platform: Arc<dyn ChannelPlatform>, backoff: BackoffPolicy) -> Self {
        Self { platform, backoff }
    }

    /// Resolve `channel`, joining it first when it is only reachable as a preview.
    ///
    /// Errors other than rate limiting propagate unchanged.
    pub async fn resolve(&self, channel: &ChannelRef) -> Result<ChannelHandle> {
        let handle = self.resolve_once(channel).await?;
        if !handle.preview {
            return Ok(handle);
        }

        tracing::info!(channel = %channel, "joining channel preview");
        retry_until_done(&self.backoff, || self.platform.join_channel(channel)).await?;
        self.resolve_once(channel).await
    }

    async fn resolve_once(&self, channel: &ChannelRef) -> Result<ChannelHandle> {
        retry_until_done(&self.backoff, || self.platform.resolve_channel(channel)).await
    }
}
