//! Content enumeration and windowing.
//!
//! The platform delivers newest-first; operators count from the oldest item, so
//! the list is reversed to chronological order before a window is applied.

use std::sync::Arc;

use crate::{
    backoff::{retry_until_done, BackoffPolicy},
    domain::{ChannelHandle, MediaMessage, MemoryMode, TransferItem, Window},
    platform::ChannelPlatform,
    Error, Result,
};

/// A window checked against a concrete item count. Bounds are 1-based, inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub start: usize,
    pub end: usize,
}

impl ResolvedWindow {
    pub fn item_count(&self) -> usize {
        self.end + 1 - self.start
    }
}

impl Window {
    /// Check the window against `count` items.
    ///
    /// `Ok(None)` means there is nothing to do (empty source with an open window).
    pub fn resolve(&self, count: usize) -> Result<Option<ResolvedWindow>> {
        if let Some(s) = self.start {
            if s == 0 {
                return Err(Error::InvalidWindow("start must be at least 1".to_string()));
            }
            if s > count {
                return Err(Error::InvalidWindow(format!(
                    "start {s} is beyond the {count} available items"
                )));
            }
        }
        if let Some(e) = self.end {
            if e == 0 || e > count {
                return Err(Error::InvalidWindow(format!(
                    "end {e} is beyond the {count} available items"
                )));
            }
        }
        if count == 0 {
            return Ok(None);
        }

        let start = self.start.unwrap_or(1);
        let end = self.end.unwrap_or(count);
        if start > end {
            return Err(Error::InvalidWindow(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Some(ResolvedWindow { start, end }))
    }
}

/// The work list of one run: items in chronological order plus their absolute positions.
#[derive(Clone, Debug)]
pub struct WorkList {
    pub items: Vec<TransferItem>,
    /// 1-based chronological position of `items[0]` in the whole channel.
    pub first_position: usize,
    /// Number of transferable items in the whole channel.
    pub channel_count: usize,
}

impl WorkList {
    pub fn empty() -> Self {
        Self {
            items: Vec::new(),
            first_position: 1,
            channel_count: 0,
        }
    }

    pub fn position_of(&self, offset: usize) -> usize {
        self.first_position + offset
    }
}

/// Reverse to chronological order, apply the window, and pick the representation.
pub fn build_work_list(
    newest_first: Vec<MediaMessage>,
    window: Window,
    mode: MemoryMode,
) -> Result<WorkList> {
    let mut chronological: Vec<MediaMessage> = newest_first
        .into_iter()
        .filter(|m| m.kind.is_transferable())
        .collect();
    chronological.reverse();

    let count = chronological.len();
    let Some(resolved) = window.resolve(count)? else {
        return Ok(WorkList::empty());
    };

    let items = chronological
        .into_iter()
        .skip(resolved.start - 1)
        .take(resolved.item_count())
        .map(|m| match mode {
            MemoryMode::Full => TransferItem::Full(m),
            MemoryMode::Safe => TransferItem::Id(m.item_id()),
        })
        .collect();

    Ok(WorkList {
        items,
        first_position: resolved.start,
        channel_count: count,
    })
}

#[derive(Clone)]
pub struct ContentEnumerator {
    platform: Arc<dyn ChannelPlatform>,
    backoff: BackoffPolicy,
}

impl ContentEnumerator {
    pub fn new(platform: Arc<dyn ChannelPlatform>, backoff: BackoffPolicy) -> Self {
        Self { platform, backoff }
    }

    /// Full fresh scan of the source. Every call starts over.
    pub async fn enumerate(
        &self,
        source: &ChannelHandle,
        window: Window,
        mode: MemoryMode,
    ) -> Result<WorkList> {
        let messages = retry_until_done(&self.backoff, || {
            self.platform.list_channel_content(source.id)
        })
        .await?;
        tracing::debug!(channel = source.id.0, messages = messages.len(), "enumerated");
        build_work_list(messages, window, mode)
    }

    /// Full messages in chronological order, no window (used by export).
    pub async fn enumerate_all(&self, source: &ChannelHandle) -> Result<Vec<MediaMessage>> {
        let list = self.enumerate(source, Window::ALL, MemoryMode::Full).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|i| match i {
                TransferItem::Full(m) => Some(m),
                TransferItem::Id(_) => None,
            })
            .collect())
    }
}
