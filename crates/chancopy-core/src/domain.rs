use std::fmt;

use serde::{Deserialize, Serialize};

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// A stable reference to a Telegram message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// Operator-supplied reference to a channel: `@username`, numeric id, or a `t.me` link.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelRef(pub String);

impl ChannelRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Private invite links (`t.me/+hash`, `t.me/joinchat/hash`) must be joined before use.
    pub fn is_invite(&self) -> bool {
        invite_hash(&self.0).is_some()
    }
}

impl From<ChatId> for ChannelRef {
    fn from(id: ChatId) -> Self {
        Self(id.0.to_string())
    }
}

impl fmt::Display for ChannelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Extract the invite hash from a private invite link.
pub fn invite_hash(raw: &str) -> Option<&str> {
    static RE: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(
            r"^(?:https?://)?(?:www\.)?t(?:elegram)?\.(?:org|me|dog)/(?:joinchat/|\+)([\w-]+)/?$",
        )
        .expect("static regex")
    });
    re.captures(raw.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
}

/// A resolved, accessible channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelHandle {
    pub id: ChatId,
    pub title: String,
    /// Source forbids forwarding / saving; items must be downloaded and re-uploaded.
    pub content_protected: bool,
    /// Set when the platform reports the channel as a not-yet-joined preview.
    #[serde(default)]
    pub preview: bool,
    #[serde(default)]
    pub invite_link: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Photo,
    Document,
    Other,
}

impl MediaKind {
    pub fn is_transferable(self) -> bool {
        matches!(self, Self::Video | Self::Photo)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Video => "video",
            Self::Photo => "photo",
            Self::Document => "document",
            Self::Other => "other",
        }
    }
}

/// A media message as delivered by the platform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaMessage {
    pub chat_id: ChatId,
    pub id: MessageId,
    pub kind: MediaKind,
    /// Opaque handle the platform uses to download the primary media.
    pub media_ref: String,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub duration_secs: Option<u32>,
    #[serde(default)]
    pub thumbnail_ref: Option<String>,
    #[serde(default)]
    pub size_bytes: Option<u64>,
}

impl MediaMessage {
    pub fn item_id(&self) -> ItemId {
        ItemId {
            chat_id: self.chat_id,
            message_id: self.id,
        }
    }
}

/// Lightweight pointer to an item, used when the job runs in safe mode.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransferItem {
    Full(MediaMessage),
    Id(ItemId),
}

impl TransferItem {
    pub fn item_id(&self) -> ItemId {
        match self {
            Self::Full(m) => m.item_id(),
            Self::Id(id) => *id,
        }
    }
}

/// How enumerated items are held in memory for the lifetime of a job.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Keep full message objects (no re-fetch before re-upload).
    #[default]
    Full,
    /// Keep only ids; re-fetch each message right before it is transferred.
    Safe,
}

impl MemoryMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "full" => Some(Self::Full),
            "safe" => Some(Self::Safe),
            _ => None,
        }
    }
}

/// 1-based inclusive bounds over the chronologically ordered item list.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Window {
    pub start: Option<usize>,
    pub end: Option<usize>,
}

impl Window {
    pub const ALL: Window = Window {
        start: None,
        end: None,
    };

    pub fn new(start: Option<usize>, end: Option<usize>) -> Self {
        Self { start, end }
    }

    /// Parse `start-end`, `start-`, `-end`, `N` or an empty string.
    pub fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Some(Self::ALL);
        }
        let parse_bound = |s: &str| -> Option<Option<usize>> {
            let s = s.trim();
            if s.is_empty() {
                return Some(None);
            }
            s.parse::<usize>().ok().map(Some)
        };
        match raw.split_once('-') {
            Some((a, b)) => Some(Self::new(parse_bound(a)?, parse_bound(b)?)),
            None => {
                let n = raw.parse::<usize>().ok()?;
                Some(Self::new(Some(n), Some(n)))
            }
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.start, self.end) {
            (None, None) => f.write_str("all"),
            (Some(s), None) => write!(f, "{s}-"),
            (None, Some(e)) => write!(f, "-{e}"),
            (Some(s), Some(e)) => write!(f, "{s}-{e}"),
        }
    }
}

/// Job identifier. Assigned from a process-wide counter, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    Copy,
    Export,
    Import,
}

impl JobKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Copy => "copy",
            Self::Export => "export",
            Self::Import => "import",
        }
    }
}
