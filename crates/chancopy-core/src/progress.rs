//! One overwritten status message per job, showing throughput and ETA.
//!
//! Edits are best-effort: a failed send/edit is logged and the transfer goes on.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{
    backoff::{WaitNotice, WaitObserver},
    domain::{ChatId, JobId, MessageRef},
    formatting::{escape_html, format_duration, truncate_with_ellipsis},
    messaging::port::MessagingPort,
};

/// Counters for one job. Written by that job's engine only; read by anyone.
#[derive(Debug)]
pub struct ProgressState {
    done: AtomicUsize,
    total: AtomicUsize,
    started_at: Instant,
}

impl ProgressState {
    pub fn new() -> Self {
        Self {
            done: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::SeqCst)
    }

    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub(crate) fn set_done(&self, done: usize) {
        self.done.store(done, Ordering::SeqCst);
    }

    pub(crate) fn set_total(&self, total: usize) {
        self.total.store(total, Ordering::SeqCst);
    }
}

impl Default for ProgressState {
    fn default() -> Self {
        Self::new()
    }
}

/// Throughput / ETA line for `done` of `total` items after `elapsed`.
pub fn render_progress_line(done: usize, total: usize, elapsed: Duration) -> String {
    let pct = if total == 0 {
        100
    } else {
        done.saturating_mul(100) / total
    };
    let secs = elapsed.as_secs_f64();
    let rate = if secs > 0.0 { done as f64 / secs } else { 0.0 };
    let eta = if done > 0 && rate > 0.0 && total > done {
        format_duration(Duration::from_secs_f64((total - done) as f64 / rate))
    } else if total > done {
        "?".to_string()
    } else {
        "0s".to_string()
    };
    format!(
        "{done}/{total} ({pct}%) · {rate:.2} items/s · ETA {eta} · elapsed {}",
        format_duration(elapsed)
    )
}

struct ReporterInner {
    artifact: Option<MessageRef>,
    last_edit: Option<Instant>,
    last_text: String,
    wait: Option<WaitNotice>,
    last_error: Option<String>,
}

pub struct ProgressReporter {
    messenger: Arc<dyn MessagingPort>,
    chat_id: ChatId,
    job_id: JobId,
    title: String,
    interval: Duration,
    state: Arc<ProgressState>,
    inner: Mutex<ReporterInner>,
}

impl ProgressReporter {
    pub fn new(
        messenger: Arc<dyn MessagingPort>,
        chat_id: ChatId,
        job_id: JobId,
        title: impl Into<String>,
        interval: Duration,
        state: Arc<ProgressState>,
    ) -> Self {
        Self {
            messenger,
            chat_id,
            job_id,
            title: title.into(),
            interval,
            state,
            inner: Mutex::new(ReporterInner {
                artifact: None,
                last_edit: None,
                last_text: String::new(),
                wait: None,
                last_error: None,
            }),
        }
    }

    pub fn state(&self) -> &Arc<ProgressState> {
        &self.state
    }

    pub async fn set_total(&self, total: usize) {
        self.state.set_total(total);
        self.render(true).await;
    }

    /// Record `done` terminal items. Clears any pending wait notice.
    pub async fn report(&self, done: usize) {
        self.state.set_done(done);
        self.inner.lock().await.wait = None;
        let force = done >= self.state.total();
        self.render(force).await;
    }

    pub async fn note_failure(&self, position: usize, error: &str) {
        self.inner.lock().await.last_error = Some(format!("#{position}: {error}"));
    }

    /// Final text replaces the progress artifact.
    pub async fn finish(&self, summary: &str) {
        let body = format!(
            "{}\n{}",
            self.header(),
            escape_html(&render_progress_line(
                self.state.done(),
                self.state.total(),
                self.state.started_at().elapsed()
            ))
        );
        let text = format!("{body}\n{summary}");
        let mut inner = self.inner.lock().await;
        inner.wait = None;
        self.publish(&mut inner, text).await;
    }

    fn header(&self) -> String {
        format!("<b>Job {}</b> {}", self.job_id, escape_html(&self.title))
    }

    fn compose(&self, inner: &ReporterInner) -> String {
        let mut text = format!(
            "{}\n{}",
            self.header(),
            escape_html(&render_progress_line(
                self.state.done(),
                self.state.total(),
                self.state.started_at().elapsed()
            ))
        );
        if let Some(wait) = &inner.wait {
            text.push_str(&format!("\n⏳ {}", escape_html(&wait.describe())));
        }
        if let Some(err) = &inner.last_error {
            text.push_str(&format!(
                "\n⚠️ last skipped: {}",
                escape_html(&truncate_with_ellipsis(err, 300))
            ));
        }
        text
    }

    async fn render(&self, force: bool) {
        let mut inner = self.inner.lock().await;
        if !force {
            if let Some(last) = inner.last_edit {
                if last.elapsed() < self.interval {
                    return;
                }
            }
        }
        let text = self.compose(&inner);
        self.publish(&mut inner, text).await;
    }

    async fn publish(&self, inner: &mut ReporterInner, text: String) {
        if text == inner.last_text {
            return;
        }
        let max = self.messenger.capabilities().max_message_len;
        let text = truncate_with_ellipsis(&text, max);

        match inner.artifact {
            None => match self.messenger.send_html(self.chat_id, &text).await {
                Ok(msg) => inner.artifact = Some(msg),
                Err(e) => tracing::warn!(job_id = self.job_id.0, "progress send failed: {e}"),
            },
            Some(msg) => {
                if let Err(e) = self.messenger.edit_html(msg, &text).await {
                    // Not-modified and externally deleted messages land here.
                    tracing::debug!(job_id = self.job_id.0, "progress edit failed: {e}");
                }
            }
        }
        inner.last_edit = Some(Instant::now());
        inner.last_text = text;
    }
}

#[async_trait]
impl WaitObserver for ProgressReporter {
    async fn on_wait(&self, notice: &WaitNotice) {
        let mut inner = self.inner.lock().await;
        inner.wait = Some(notice.clone());
        let text = self.compose(&inner);
        self.publish(&mut inner, text).await;
    }
}
