//! In-memory fakes shared by unit tests.

use std::{
    collections::{HashMap, VecDeque},
    path::{Path, PathBuf},
    sync::Mutex,
    time::Duration,
};

use async_trait::async_trait;

use crate::{
    backoff::BackoffPolicy,
    domain::{ChannelHandle, ChannelRef, ChatId, MediaKind, MediaMessage, MessageId, MessageRef},
    messaging::{port::MessagingPort, types::MessagingCapabilities},
    platform::{ChannelPlatform, VideoUpload},
    Error, Result,
};

pub const TEST_BACKOFF: BackoffPolicy = BackoffPolicy {
    short_wait_threshold: Duration::ZERO,
    short_wait_multiplier: 1,
};

pub fn sample_message(chat_id: ChatId, id: i32, kind: MediaKind) -> MediaMessage {
    MediaMessage {
        chat_id,
        id: MessageId(id),
        kind,
        media_ref: format!("media-{id}"),
        caption: Some(format!("item {id}")),
        duration_secs: (kind == MediaKind::Video).then_some(30),
        thumbnail_ref: (kind == MediaKind::Video).then(|| format!("thumb-{id}")),
        size_bytes: Some(1024),
    }
}

/// Videos with ids `n..=1`, newest first (the order the platform delivers).
pub fn sample_messages(chat_id: ChatId, n: usize) -> Vec<MediaMessage> {
    (1..=n as i32)
        .rev()
        .map(|id| sample_message(chat_id, id, MediaKind::Video))
        .collect()
}

// ============== Platform ==============

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PlatformCall {
    Resolve(String),
    Join(String),
    List(i64),
    Fetch(i32),
    Download(String),
    UploadVideo {
        dest: i64,
        caption: String,
        thumbnail: bool,
    },
    UploadPhoto {
        dest: i64,
        caption: String,
    },
    Forward {
        dest: i64,
        message_id: i32,
    },
    CreateChannel(String),
    FindOwned(String),
}

struct FakeChannel {
    handle: ChannelHandle,
    /// Chronological.
    messages: Vec<MediaMessage>,
}

#[derive(Default)]
struct FakeState {
    channels: HashMap<i64, FakeChannel>,
    refs: HashMap<String, i64>,
    owned: Vec<i64>,
    next_created: i64,
    preview: bool,
    unreachable: bool,
    resolves_left: Option<usize>,
    fail_downloads: bool,
    /// Errors returned, in order, by the next transfer attempts of a message id.
    scripted: HashMap<i32, VecDeque<Error>>,
    forward_delay: Duration,
    calls: Vec<PlatformCall>,
    join_calls: usize,
    resolve_calls: usize,
}

pub struct FakePlatform {
    state: Mutex<FakeState>,
}

impl FakePlatform {
    /// One source channel reachable as `@src`, `https://t.me/+abc` or its id,
    /// holding `n` videos with ids `1..=n`.
    pub fn with_channel(id: ChatId, title: &str, protected: bool, n: usize) -> Self {
        let platform = Self {
            state: Mutex::new(FakeState {
                next_created: -5000,
                ..FakeState::default()
            }),
        };
        platform.add_channel(id, title, protected, n, &["@src", "https://t.me/+abc"]);
        platform
    }

    pub fn add_channel(&self, id: ChatId, title: &str, protected: bool, n: usize, refs: &[&str]) {
        let mut messages = sample_messages(id, n);
        messages.reverse();
        let mut st = self.state.lock().unwrap();
        st.channels.insert(
            id.0,
            FakeChannel {
                handle: ChannelHandle {
                    id,
                    title: title.to_string(),
                    content_protected: protected,
                    preview: false,
                    invite_link: Some(format!("https://t.me/+{}", id.0.unsigned_abs())),
                },
                messages,
            },
        );
        for r in refs {
            st.refs.insert(r.to_string(), id.0);
        }
    }

    /// Mark a channel as already owned by the operator (found by title).
    pub fn add_owned(&self, id: ChatId, title: &str) {
        self.add_channel(id, title, false, 0, &[]);
        self.state.lock().unwrap().owned.push(id.0);
    }

    pub fn set_messages(&self, id: ChatId, chronological: Vec<MediaMessage>) {
        if let Some(ch) = self.state.lock().unwrap().channels.get_mut(&id.0) {
            ch.messages = chronological;
        }
    }

    pub fn set_preview(&self, preview: bool) {
        self.state.lock().unwrap().preview = preview;
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Allow `n` more successful resolutions, then report the channel as gone.
    pub fn resolvable_times(&self, n: usize) {
        self.state.lock().unwrap().resolves_left = Some(n);
    }

    pub fn fail_downloads(&self, fail: bool) {
        self.state.lock().unwrap().fail_downloads = fail;
    }

    pub fn set_forward_delay(&self, delay: Duration) {
        self.state.lock().unwrap().forward_delay = delay;
    }

    pub fn script_errors(&self, message_id: i32, errors: Vec<Error>) {
        self.state
            .lock()
            .unwrap()
            .scripted
            .entry(message_id)
            .or_default()
            .extend(errors);
    }

    pub fn calls(&self) -> Vec<PlatformCall> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Message ids forwarded or re-uploaded, in order.
    pub fn transferred(&self) -> Vec<i32> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                PlatformCall::Forward { message_id, .. } => Some(message_id),
                PlatformCall::UploadVideo { caption, .. }
                | PlatformCall::UploadPhoto { caption, .. } => caption
                    .strip_prefix("item ")
                    .and_then(|s| s.parse().ok()),
                _ => None,
            })
            .collect()
    }

    pub fn join_calls(&self) -> usize {
        self.state.lock().unwrap().join_calls
    }

    pub fn resolve_calls(&self) -> usize {
        self.state.lock().unwrap().resolve_calls
    }

    fn next_scripted(&self, message_id: i32) -> Option<Error> {
        self.state
            .lock()
            .unwrap()
            .scripted
            .get_mut(&message_id)
            .and_then(|q| q.pop_front())
    }

    fn record(&self, call: PlatformCall) {
        self.state.lock().unwrap().calls.push(call);
    }
}

fn media_id(media_ref: &str) -> Option<i32> {
    media_ref.strip_prefix("media-").and_then(|s| s.parse().ok())
}

#[async_trait]
impl ChannelPlatform for FakePlatform {
    async fn resolve_channel(&self, channel: &ChannelRef) -> Result<ChannelHandle> {
        let mut st = self.state.lock().unwrap();
        st.resolve_calls += 1;
        st.calls.push(PlatformCall::Resolve(channel.to_string()));
        if st.unreachable {
            return Err(Error::ChannelNotFound(channel.to_string()));
        }
        if let Some(left) = st.resolves_left.as_mut() {
            if *left == 0 {
                return Err(Error::ChannelNotFound(channel.to_string()));
            }
            *left -= 1;
        }
        let id = st
            .refs
            .get(channel.as_str())
            .copied()
            .or_else(|| channel.as_str().parse::<i64>().ok())
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))?;
        let preview = st.preview;
        let ch = st
            .channels
            .get(&id)
            .ok_or_else(|| Error::ChannelNotFound(channel.to_string()))?;
        let mut handle = ch.handle.clone();
        handle.preview = preview;
        Ok(handle)
    }

    async fn join_channel(&self, channel: &ChannelRef) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.join_calls += 1;
        st.preview = false;
        st.calls.push(PlatformCall::Join(channel.to_string()));
        Ok(())
    }

    async fn list_channel_content(&self, channel_id: ChatId) -> Result<Vec<MediaMessage>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(PlatformCall::List(channel_id.0));
        let ch = st
            .channels
            .get(&channel_id.0)
            .ok_or_else(|| Error::ChannelNotFound(channel_id.0.to_string()))?;
        Ok(ch.messages.iter().rev().cloned().collect())
    }

    async fn fetch_message(
        &self,
        channel_id: ChatId,
        message_id: MessageId,
    ) -> Result<Option<MediaMessage>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(PlatformCall::Fetch(message_id.0));
        Ok(st
            .channels
            .get(&channel_id.0)
            .and_then(|ch| ch.messages.iter().find(|m| m.id == message_id).cloned()))
    }

    async fn download_media(&self, media_ref: &str, dir: &Path) -> Result<Option<PathBuf>> {
        self.record(PlatformCall::Download(media_ref.to_string()));
        if let Some(e) = media_id(media_ref).and_then(|id| self.next_scripted(id)) {
            return Err(e);
        }
        let is_primary = media_id(media_ref).is_some();
        if is_primary && self.state.lock().unwrap().fail_downloads {
            return Ok(None);
        }
        let path = dir.join(format!("{media_ref}.bin"));
        tokio::fs::write(&path, b"fake media").await?;
        Ok(Some(path))
    }

    async fn upload_video(
        &self,
        dest: ChatId,
        path: &Path,
        params: VideoUpload<'_>,
    ) -> Result<()> {
        if !path.exists() {
            return Err(Error::TransientIo(format!("{} missing", path.display())));
        }
        self.record(PlatformCall::UploadVideo {
            dest: dest.0,
            caption: params.caption.to_string(),
            thumbnail: params.thumbnail.is_some_and(|p| p.exists()),
        });
        Ok(())
    }

    async fn upload_photo(&self, dest: ChatId, path: &Path, caption: &str) -> Result<()> {
        if !path.exists() {
            return Err(Error::TransientIo(format!("{} missing", path.display())));
        }
        self.record(PlatformCall::UploadPhoto {
            dest: dest.0,
            caption: caption.to_string(),
        });
        Ok(())
    }

    async fn forward_item(&self, dest: ChatId, _source: ChatId, item: MessageId) -> Result<()> {
        let delay = self.state.lock().unwrap().forward_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(e) = self.next_scripted(item.0) {
            return Err(e);
        }
        self.record(PlatformCall::Forward {
            dest: dest.0,
            message_id: item.0,
        });
        Ok(())
    }

    async fn create_channel(&self, title: &str) -> Result<ChannelHandle> {
        let id = {
            let mut st = self.state.lock().unwrap();
            st.calls.push(PlatformCall::CreateChannel(title.to_string()));
            st.next_created -= 1;
            st.next_created
        };
        self.add_channel(ChatId(id), title, false, 0, &[]);
        self.state.lock().unwrap().owned.push(id);
        Ok(ChannelHandle {
            id: ChatId(id),
            title: title.to_string(),
            content_protected: false,
            preview: false,
            invite_link: Some(format!("https://t.me/+{}", id.unsigned_abs())),
        })
    }

    async fn find_owned_channel(&self, title: &str) -> Result<Option<ChannelHandle>> {
        let mut st = self.state.lock().unwrap();
        st.calls.push(PlatformCall::FindOwned(title.to_string()));
        Ok(st
            .owned
            .iter()
            .filter_map(|id| st.channels.get(id))
            .find(|ch| ch.handle.title == title)
            .map(|ch| ch.handle.clone()))
    }
}

// ============== Messenger ==============

#[derive(Default)]
struct MessengerState {
    next_id: i32,
    sent: Vec<(ChatId, String)>,
    edits: Vec<(MessageRef, String)>,
    attempted_edits: Vec<String>,
    fail_edits: bool,
}

#[derive(Default)]
pub struct FakeMessenger {
    state: Mutex<MessengerState>,
}

impl FakeMessenger {
    pub fn sent_texts(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .map(|(_, t)| t.clone())
            .collect()
    }

    pub fn edit_count(&self) -> usize {
        self.state.lock().unwrap().edits.len()
    }

    pub fn last_edit(&self) -> Option<String> {
        self.state.lock().unwrap().edits.last().map(|(_, t)| t.clone())
    }

    pub fn attempted_edits(&self) -> Vec<String> {
        self.state.lock().unwrap().attempted_edits.clone()
    }

    pub fn fail_edits(&self, fail: bool) {
        self.state.lock().unwrap().fail_edits = fail;
    }

    /// Every text the operator could have seen, sends and edits alike.
    pub fn all_texts(&self) -> Vec<String> {
        let st = self.state.lock().unwrap();
        st.sent
            .iter()
            .map(|(_, t)| t.clone())
            .chain(st.edits.iter().map(|(_, t)| t.clone()))
            .collect()
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities::default()
    }

    async fn send_html(&self, chat_id: ChatId, html: &str) -> Result<MessageRef> {
        let mut st = self.state.lock().unwrap();
        st.next_id += 1;
        st.sent.push((chat_id, html.to_string()));
        Ok(MessageRef {
            chat_id,
            message_id: MessageId(st.next_id),
        })
    }

    async fn edit_html(&self, msg: MessageRef, html: &str) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        st.attempted_edits.push(html.to_string());
        if st.fail_edits {
            return Err(Error::External("message to edit not found".to_string()));
        }
        st.edits.push((msg, html.to_string()));
        Ok(())
    }
}
