use std::{path::PathBuf, time::Duration};

/// Core error type.
///
/// Adapter crates map their specific errors into this type so the pipeline can
/// tell item-level failures (skip and continue) from job-level ones (abort the job).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("rate limited ({cause}): retry after {}s", wait.as_secs())]
    RateLimited { wait: Duration, cause: String },

    #[error("stale media reference: {0}")]
    StaleReference(String),

    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("unsupported item: {0}")]
    UnsupportedItemShape(String),

    #[error("local storage error: {0}")]
    TransientIo(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid path: {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("external error: {0}")]
    External(String),
}

impl Error {
    pub fn rate_limited(wait_secs: u64, cause: impl Into<String>) -> Self {
        Self::RateLimited {
            wait: Duration::from_secs(wait_secs),
            cause: cause.into(),
        }
    }

    /// Errors that end a single item but never the job on their own.
    pub fn is_item_level(&self) -> bool {
        matches!(
            self,
            Self::StaleReference(_)
                | Self::UnsupportedItemShape(_)
                | Self::TransientIo(_)
                | Self::Io(_)
                | Self::External(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
