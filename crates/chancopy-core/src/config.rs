use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{errors::Error, Result};

/// Typed configuration for the copier.
#[derive(Clone, Debug)]
pub struct Config {
    // Operator surface
    pub telegram_bot_token: String,
    pub operator_chat_ids: Vec<i64>,
    pub command_prefix: String,

    // Storage
    pub temp_dir: PathBuf,
    pub archive_dir: PathBuf,

    // Telegram limits
    pub telegram_message_limit: usize,

    pub pipeline: PipelineConfig,
}

/// Knobs the transfer pipeline reads. Split out so tests can build one without a token.
#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub temp_dir: PathBuf,
    pub default_memory_mode: crate::domain::MemoryMode,

    /// Consecutive stale references before the source channel is re-resolved.
    pub stale_escalation_threshold: usize,
    /// Re-resolutions allowed per job before it gives up.
    pub max_stale_restarts: usize,

    /// Signaled waits at or below this are multiplied by `short_wait_multiplier`.
    pub short_wait_threshold: Duration,
    pub short_wait_multiplier: u32,

    /// Upper bound of the random pause between items.
    pub item_jitter: Duration,
    /// Minimum spacing between progress artifact edits.
    pub progress_interval: Duration,

    /// Destination hard caption limit, in characters.
    pub caption_limit: usize,
    pub copy_title_suffix: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/chancopy"),
            default_memory_mode: crate::domain::MemoryMode::Full,
            stale_escalation_threshold: 5,
            max_stale_restarts: 3,
            short_wait_threshold: Duration::from_secs(2),
            short_wait_multiplier: 2,
            item_jitter: Duration::from_millis(300),
            progress_interval: Duration::from_millis(3000),
            caption_limit: 1024,
            copy_title_suffix: " [COPY]".to_string(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        load_dotenv_if_present(Path::new(".env"));

        // Required env vars
        let telegram_bot_token = env_str("TELEGRAM_BOT_TOKEN").unwrap_or_default();
        let operator_chat_ids = parse_csv_i64(env_str("OPERATOR_CHAT_IDS"));

        if telegram_bot_token.trim().is_empty() {
            return Err(Error::Config(
                "TELEGRAM_BOT_TOKEN environment variable is required".to_string(),
            ));
        }
        if operator_chat_ids.is_empty() {
            return Err(Error::Config(
                "OPERATOR_CHAT_IDS environment variable is required".to_string(),
            ));
        }

        let command_prefix = env_str("COMMAND_PREFIX")
            .and_then(non_empty)
            .unwrap_or_else(|| "***".to_string());

        let temp_dir = env_path("TEMP_DIR").unwrap_or_else(|| PathBuf::from("/tmp/chancopy"));
        let archive_dir = env_path("ARCHIVE_DIR").unwrap_or_else(|| temp_dir.join("archives"));
        fs::create_dir_all(&temp_dir)?;
        fs::create_dir_all(&archive_dir)?;

        let telegram_message_limit = env_usize("TELEGRAM_MESSAGE_LIMIT").unwrap_or(4096);

        let defaults = PipelineConfig::default();
        let default_memory_mode = if env_bool("DEFAULT_SAFE_MODE").unwrap_or(false) {
            crate::domain::MemoryMode::Safe
        } else {
            crate::domain::MemoryMode::Full
        };

        let pipeline = PipelineConfig {
            temp_dir: temp_dir.clone(),
            default_memory_mode,
            stale_escalation_threshold: env_usize("STALE_ESCALATION_THRESHOLD")
                .unwrap_or(defaults.stale_escalation_threshold)
                .max(1),
            max_stale_restarts: env_usize("MAX_STALE_RESTARTS")
                .unwrap_or(defaults.max_stale_restarts),
            short_wait_threshold: env_u64("SHORT_WAIT_THRESHOLD_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.short_wait_threshold),
            short_wait_multiplier: env_u32("SHORT_WAIT_MULTIPLIER")
                .unwrap_or(defaults.short_wait_multiplier)
                .max(1),
            item_jitter: env_u64("ITEM_JITTER_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.item_jitter),
            progress_interval: env_u64("PROGRESS_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.progress_interval),
            caption_limit: env_usize("CAPTION_LIMIT").unwrap_or(defaults.caption_limit),
            copy_title_suffix: env_str("COPY_TITLE_SUFFIX").unwrap_or(defaults.copy_title_suffix),
        };

        Ok(Self {
            telegram_bot_token,
            operator_chat_ids,
            command_prefix,
            temp_dir,
            archive_dir,
            telegram_message_limit,
            pipeline,
        })
    }
}

fn env_str(key: &str) -> Option<String> {
    env::var(key).ok()
}

fn load_dotenv_if_present(path: &Path) {
    let Ok(contents) = fs::read_to_string(path) else {
        return;
    };

    for (key, val) in parse_dotenv(&contents) {
        if env::var_os(&key).is_some() {
            continue; // do not override existing env
        }
        env::set_var(key, val);
    }
}

fn parse_dotenv(contents: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for raw in contents.lines() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let Some((k, v)) = line.split_once('=') else {
            continue;
        };

        let key = k.trim();
        if key.is_empty() {
            continue;
        }

        let mut val = v.trim().to_string();
        // Strip optional surrounding quotes.
        if val.len() >= 2
            && ((val.starts_with('"') && val.ends_with('"'))
                || (val.starts_with('\'') && val.ends_with('\'')))
        {
            val = val[1..val.len() - 1].to_string();
        }

        out.push((key.to_string(), val));
    }
    out
}

fn env_bool(key: &str) -> Option<bool> {
    env_str(key).map(|s| parse_bool(&s))
}

fn parse_bool(s: &str) -> bool {
    matches!(
        s.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_u64(key: &str) -> Option<u64> {
    env_str(key).and_then(|s| s.trim().parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    env_str(key).and_then(|s| s.trim().parse::<u32>().ok())
}

fn env_usize(key: &str) -> Option<usize> {
    env_str(key).and_then(|s| s.trim().parse::<usize>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var_os(key).map(PathBuf::from)
}

fn parse_csv_i64(v: Option<String>) -> Vec<i64> {
    v.unwrap_or_default()
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<i64>().ok())
        .collect()
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() {
        None
    } else {
        Some(s)
    }
}
