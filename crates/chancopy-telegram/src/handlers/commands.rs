use std::sync::Arc;

use teloxide::prelude::*;

use chancopy_core::{
    domain::{ChannelRef, ChatId, JobId, MemoryMode, Window},
    formatting::escape_html,
    jobs::CopyRequest,
};

use crate::router::AppState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Copy(CopyRequest),
    Export(ChannelRef),
    Import {
        archive: String,
        destination: Option<ChannelRef>,
    },
    Jobs,
    Cancel(JobId),
    Help,
}

/// Parse an operator message.
///
/// `None` when the text is not addressed to the bot at all; `Some(Err(_))` carries
/// a usage message.
pub fn parse_command(text: &str, prefix: &str) -> Option<Result<Command, String>> {
    let text = text.trim();
    let rest = if let Some(r) = text.strip_prefix(prefix) {
        r.trim()
    } else if let Some(r) = text.strip_prefix('/') {
        // `/help@botname` style
        let cmd = r.split_whitespace().next().unwrap_or("");
        let cmd = cmd.split('@').next().unwrap_or("").to_lowercase();
        return match cmd.as_str() {
            "start" | "help" => Some(Ok(Command::Help)),
            "jobs" => Some(Ok(Command::Jobs)),
            _ => None,
        };
    } else {
        return None;
    };

    if rest.is_empty() {
        return Some(Err("missing channel reference".to_string()));
    }

    let (verb, args) = match rest.split_once(char::is_whitespace) {
        Some((v, a)) => (v, a.trim()),
        None => (rest, ""),
    };

    Some(match verb.to_lowercase().as_str() {
        "copy" => parse_copy(args),
        "export" => match args {
            "" => Err("usage: export <channel>".to_string()),
            a => Ok(Command::Export(ChannelRef::new(a))),
        },
        "import" => parse_import(args),
        "jobs" => Ok(Command::Jobs),
        "cancel" => parse_job_id(args).map(Command::Cancel),
        "help" => Ok(Command::Help),
        _ => parse_copy(rest),
    })
}

/// `<src>|<window>|<dest>|<mode>`; everything after the source is optional.
fn parse_copy(args: &str) -> Result<Command, String> {
    let mut fields = args.split('|').map(str::trim);
    let source = fields.next().unwrap_or("");
    if source.is_empty() {
        return Err("usage: copy <channel>|<start-end>|<destination>|<safe|full>".to_string());
    }

    let window_raw = fields.next().unwrap_or("");
    let window =
        Window::parse(window_raw).ok_or_else(|| format!("invalid window '{window_raw}'"))?;

    let destination = match fields.next().unwrap_or("") {
        "" => None,
        d => Some(ChannelRef::new(d)),
    };

    let mode = match fields.next().unwrap_or("") {
        "" => None,
        m => Some(MemoryMode::parse(m).ok_or_else(|| format!("unknown mode '{m}' (safe|full)"))?),
    };

    if fields.next().is_some() {
        return Err("too many '|' separated fields".to_string());
    }

    Ok(Command::Copy(CopyRequest {
        source: ChannelRef::new(source),
        window,
        destination,
        mode,
    }))
}

fn parse_import(args: &str) -> Result<Command, String> {
    let (archive, dest) = match args.split_once('|') {
        Some((a, d)) => (a.trim(), d.trim()),
        None => (args.trim(), ""),
    };
    if archive.is_empty() {
        return Err("usage: import <archive>|<destination>".to_string());
    }
    Ok(Command::Import {
        archive: archive.to_string(),
        destination: (!dest.is_empty()).then(|| ChannelRef::new(dest)),
    })
}

fn parse_job_id(args: &str) -> Result<JobId, String> {
    args.trim()
        .trim_start_matches('#')
        .parse::<u64>()
        .map(JobId)
        .map_err(|_| format!("invalid job id '{args}'"))
}

pub fn help_text(prefix: &str) -> String {
    let p = escape_html(prefix);
    format!(
        "<b>Channel copier</b>\n\n\
         <code>{p}@channel</code> copy a whole channel into a new one\n\
         <code>{p}copy src|start-end|dest|safe</code> copy a window (all fields after src optional)\n\
         <code>{p}export src</code> save the channel's items to an archive\n\
         <code>{p}import name|dest</code> replay an archive\n\
         <code>{p}jobs</code> list running jobs\n\
         <code>{p}cancel N</code> cancel job #N\n\
         <code>{p}help</code> this message"
    )
}

async fn reply(state: &AppState, chat_id: ChatId, html: &str) {
    if let Err(e) = state.messenger.send_html(chat_id, html).await {
        tracing::warn!(chat_id = chat_id.0, "reply failed: {e}");
    }
}

pub async fn handle_command(msg: Message, state: Arc<AppState>) -> ResponseResult<()> {
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let chat_id = ChatId(msg.chat.id.0);
    let prefix = state.cfg.command_prefix.as_str();

    let command = match parse_command(text, prefix) {
        None => return Ok(()),
        Some(Err(usage)) => {
            let html = format!(
                "⚠️ {}\n\n{}",
                escape_html(&usage),
                help_text(prefix)
            );
            reply(&state, chat_id, &html).await;
            return Ok(());
        }
        Some(Ok(c)) => c,
    };
    tracing::info!(chat_id = chat_id.0, ?command, "operator command");

    match command {
        Command::Copy(req) => {
            state.jobs.submit_copy_job(chat_id, req);
        }
        Command::Export(source) => {
            state.jobs.submit_export_job(chat_id, source);
        }
        Command::Import {
            archive,
            destination,
        } => {
            state.jobs.submit_import_job(chat_id, archive, destination);
        }
        Command::Jobs => {
            let text = state.jobs.list_jobs_text();
            reply(&state, chat_id, &text).await;
        }
        Command::Cancel(id) => {
            let text = if state.jobs.cancel(id) {
                format!("🛑 Cancelling job {id}; the item in flight will finish first.")
            } else {
                format!("No running job {id}.")
            };
            reply(&state, chat_id, &text).await;
        }
        Command::Help => reply(&state, chat_id, &help_text(prefix)).await,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const P: &str = "***";

    fn parse(text: &str) -> Command {
        parse_command(text, P).unwrap().unwrap()
    }

    #[test]
    fn bare_reference_copies_everything() {
        assert_eq!(
            parse("***@cats"),
            Command::Copy(CopyRequest::new(ChannelRef::new("@cats")))
        );
        assert_eq!(
            parse("*** https://t.me/+AbC"),
            Command::Copy(CopyRequest::new(ChannelRef::new("https://t.me/+AbC")))
        );
    }

    #[test]
    fn copy_with_all_fields() {
        assert_eq!(
            parse("***copy @cats | 3-7 | @backup | safe"),
            Command::Copy(CopyRequest {
                source: ChannelRef::new("@cats"),
                window: Window::new(Some(3), Some(7)),
                destination: Some(ChannelRef::new("@backup")),
                mode: Some(MemoryMode::Safe),
            })
        );
        assert_eq!(
            parse("***@cats|5-||full"),
            Command::Copy(CopyRequest {
                source: ChannelRef::new("@cats"),
                window: Window::new(Some(5), None),
                destination: None,
                mode: Some(MemoryMode::Full),
            })
        );
    }

    #[test]
    fn management_verbs() {
        assert_eq!(parse("***jobs"), Command::Jobs);
        assert_eq!(parse("***cancel #4"), Command::Cancel(JobId(4)));
        assert_eq!(parse("***cancel 12"), Command::Cancel(JobId(12)));
        assert_eq!(parse("***HELP"), Command::Help);
        assert_eq!(parse("/help@copier_bot"), Command::Help);
        assert_eq!(
            parse("***export @cats"),
            Command::Export(ChannelRef::new("@cats"))
        );
        assert_eq!(
            parse("***import cats_1_20260101|@dest"),
            Command::Import {
                archive: "cats_1_20260101".to_string(),
                destination: Some(ChannelRef::new("@dest")),
            }
        );
    }

    #[test]
    fn usage_errors_and_non_commands() {
        assert!(parse_command("hello", P).is_none());
        assert!(parse_command("/unknown", P).is_none());
        for bad in ["***", "***copy", "***cancel x", "***@c|a-b", "***@c||| fast", "***export"] {
            assert!(matches!(parse_command(bad, P), Some(Err(_))), "{bad}");
        }
    }

    #[test]
    fn help_mentions_prefix() {
        assert!(help_text("!!").contains("<code>!!jobs</code>"));
    }
}
