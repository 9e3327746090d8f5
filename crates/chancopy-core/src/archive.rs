//! Exported channel snapshots: a source handle plus its media items, as JSON.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    domain::{ChannelHandle, MediaMessage},
    Error, Result,
};

pub const ARCHIVE_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChannelArchive {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub source: ChannelHandle,
    /// Chronological.
    pub items: Vec<MediaMessage>,
}

impl ChannelArchive {
    pub fn new(source: ChannelHandle, items: Vec<MediaMessage>) -> Self {
        Self {
            version: ARCHIVE_VERSION,
            created_at: Utc::now(),
            source,
            items,
        }
    }
}

#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Persist `archive`; returns the name to pass to [`ArchiveStore::load`].
    async fn save(&self, archive: &ChannelArchive) -> Result<String>;
    async fn load(&self, name: &str) -> Result<ChannelArchive>;
}

/// One `<name>.json` file per archive under a fixed directory.
pub struct JsonArchiveStore {
    dir: PathBuf,
}

impl JsonArchiveStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        let name = name.trim().trim_end_matches(".json");
        let valid = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if !valid {
            return Err(Error::InvalidPath {
                path: PathBuf::from(name),
                reason: "archive names may only contain letters, digits, '_' and '-'".to_string(),
            });
        }
        Ok(self.dir.join(format!("{name}.json")))
    }
}

/// `<title slug>_<channel id>_<utc timestamp>`.
pub fn archive_name(archive: &ChannelArchive) -> String {
    let slug: String = archive
        .source
        .title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    let slug = slug.trim_matches('_');
    let slug = if slug.is_empty() { "channel" } else { slug };
    let slug: String = slug.chars().take(40).collect();
    format!(
        "{slug}_{}_{}",
        archive.source.id.0.unsigned_abs(),
        archive.created_at.format("%Y%m%d%H%M%S")
    )
}

#[async_trait]
impl ArchiveStore for JsonArchiveStore {
    async fn save(&self, archive: &ChannelArchive) -> Result<String> {
        let name = archive_name(archive);
        let path = self.path_for(&name)?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(archive)?;

        // Write then rename so a crash never leaves a half-written archive.
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body).await?;
        tokio::fs::rename(&tmp, &path).await?;
        tracing::info!(path = %path.display(), items = archive.items.len(), "archive saved");
        Ok(name)
    }

    async fn load(&self, name: &str) -> Result<ChannelArchive> {
        let path = self.path_for(name)?;
        let body = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::InvalidPath {
                    path,
                    reason: "no such archive".to_string(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        let archive: ChannelArchive = serde_json::from_slice(&body)?;
        if archive.version != ARCHIVE_VERSION {
            return Err(Error::Config(format!(
                "archive version {} is not supported",
                archive.version
            )));
        }
        Ok(archive)
    }
}
