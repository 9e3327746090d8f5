//! Job manager: submit, list and cancel concurrent transfer jobs.
//!
//! Each job runs on its own task. The registry entry is inserted before the
//! task starts and removed by the task itself as soon as its work ends, ahead of
//! the final status edits. A drop guard covers panics.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use chrono::{DateTime, Local};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{
    archive::{ArchiveStore, ChannelArchive},
    backoff::{retry_until_done, BackoffPolicy},
    config::PipelineConfig,
    domain::{
        ChannelHandle, ChannelRef, ChatId, JobId, JobKind, MediaMessage, MemoryMode,
        TransferItem, Window,
    },
    engine::{RunOutcome, RunStats, TransferEngine},
    enumerator::{ContentEnumerator, WorkList},
    formatting::escape_html,
    messaging::port::MessagingPort,
    platform::ChannelPlatform,
    progress::{ProgressReporter, ProgressState},
    resolver::ChannelResolver,
    strategy::{build_strategy, select_strategy},
    Error, Result,
};

const MAX_LISTED_SKIPS: usize = 10;

/// Collaborators every job needs.
pub struct PipelineDeps {
    pub platform: Arc<dyn ChannelPlatform>,
    pub messenger: Arc<dyn MessagingPort>,
    pub archives: Arc<dyn ArchiveStore>,
    pub cfg: PipelineConfig,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyRequest {
    pub source: ChannelRef,
    pub window: Window,
    /// `None` provisions a destination named after the source.
    pub destination: Option<ChannelRef>,
    /// `None` uses the configured default.
    pub mode: Option<MemoryMode>,
}

impl CopyRequest {
    pub fn new(source: ChannelRef) -> Self {
        Self {
            source,
            window: Window::ALL,
            destination: None,
            mode: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobSpec {
    Copy(CopyRequest),
    Export {
        source: ChannelRef,
    },
    Import {
        archive: String,
        destination: Option<ChannelRef>,
    },
}

impl JobSpec {
    pub fn kind(&self) -> JobKind {
        match self {
            Self::Copy(_) => JobKind::Copy,
            Self::Export { .. } => JobKind::Export,
            Self::Import { .. } => JobKind::Import,
        }
    }

    /// What the operator named: a channel reference or an archive name.
    pub fn target(&self) -> String {
        match self {
            Self::Copy(req) => req.source.to_string(),
            Self::Export { source } => source.to_string(),
            Self::Import { archive, .. } => archive.clone(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct JobSummary {
    pub id: JobId,
    pub kind: JobKind,
    pub target: String,
    pub created_at: DateTime<Local>,
    pub done: usize,
    pub total: usize,
}

struct JobEntry {
    kind: JobKind,
    target: String,
    created_at: DateTime<Local>,
    cancel: CancellationToken,
    progress: Arc<ProgressState>,
    handle: Option<JoinHandle<()>>,
}

struct ManagerInner {
    deps: PipelineDeps,
    next_id: AtomicU64,
    jobs: Mutex<HashMap<JobId, JobEntry>>,
    /// Tasks of released jobs still sending their final messages.
    closing: Mutex<Vec<JoinHandle<()>>>,
}

impl ManagerInner {
    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, JobEntry>> {
        self.jobs.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn closing(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.closing.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// A job's place in the registry. Released once, explicitly or on drop.
struct Registration {
    inner: Arc<ManagerInner>,
    id: JobId,
    released: bool,
}

impl Registration {
    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let handle = self.inner.jobs().remove(&self.id).and_then(|e| e.handle);
        if let Some(handle) = handle {
            let mut closing = self.inner.closing();
            closing.retain(|h| !h.is_finished());
            closing.push(handle);
        }
        tracing::debug!(job_id = self.id.0, "job deregistered");
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Clone)]
pub struct JobManager {
    inner: Arc<ManagerInner>,
}

impl JobManager {
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                deps,
                next_id: AtomicU64::new(1),
                jobs: Mutex::new(HashMap::new()),
                closing: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register and start a job; returns immediately. Replies go to `operator`.
    pub fn submit(&self, operator: ChatId, spec: JobSpec) -> JobId {
        let id = JobId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let cancel = CancellationToken::new();
        let progress = Arc::new(ProgressState::new());

        self.inner.jobs().insert(
            id,
            JobEntry {
                kind: spec.kind(),
                target: spec.target(),
                created_at: Local::now(),
                cancel: cancel.clone(),
                progress: progress.clone(),
                handle: None,
            },
        );
        tracing::info!(job_id = id.0, kind = spec.kind().label(), target = %spec.target(), "job submitted");

        let inner = self.inner.clone();
        let handle = tokio::spawn(async move {
            let mut registration = Registration {
                inner: inner.clone(),
                id,
                released: false,
            };
            run_job(&inner, &mut registration, operator, spec, cancel, progress).await;
        });

        if let Some(entry) = self.inner.jobs().get_mut(&id) {
            entry.handle = Some(handle);
        }
        id
    }

    pub fn submit_copy_job(&self, operator: ChatId, request: CopyRequest) -> JobId {
        self.submit(operator, JobSpec::Copy(request))
    }

    pub fn submit_export_job(&self, operator: ChatId, source: ChannelRef) -> JobId {
        self.submit(operator, JobSpec::Export { source })
    }

    pub fn submit_import_job(
        &self,
        operator: ChatId,
        archive: String,
        destination: Option<ChannelRef>,
    ) -> JobId {
        self.submit(
            operator,
            JobSpec::Import {
                archive,
                destination,
            },
        )
    }

    /// Snapshot of running jobs, oldest first.
    pub fn list(&self) -> Vec<JobSummary> {
        let mut out: Vec<JobSummary> = self
            .inner
            .jobs()
            .iter()
            .map(|(id, e)| JobSummary {
                id: *id,
                kind: e.kind,
                target: e.target.clone(),
                created_at: e.created_at,
                done: e.progress.done(),
                total: e.progress.total(),
            })
            .collect();
        out.sort_by_key(|s| s.id);
        out
    }

    pub fn list_jobs_text(&self) -> String {
        let jobs = self.list();
        if jobs.is_empty() {
            return "No active jobs.".to_string();
        }
        let mut lines = vec![format!("<b>Active jobs ({})</b>", jobs.len())];
        for j in jobs {
            lines.push(format!(
                "{} {} <code>{}</code> · {}/{} · since {}",
                j.id,
                j.kind.label(),
                escape_html(&j.target),
                j.done,
                j.total,
                j.created_at.format("%H:%M:%S")
            ));
        }
        lines.join("\n")
    }

    /// Request cancellation. `false` when no such job is running.
    pub fn cancel(&self, id: JobId) -> bool {
        match self.inner.jobs().get(&id) {
            Some(entry) => {
                tracing::info!(job_id = id.0, "cancellation requested");
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel every job and wait for their tasks, final messages included.
    pub async fn shutdown(&self) {
        let mut handles: Vec<JoinHandle<()>> = {
            let mut jobs = self.inner.jobs();
            jobs.values_mut()
                .filter_map(|e| {
                    e.cancel.cancel();
                    e.handle.take()
                })
                .collect()
        };
        handles.append(&mut self.inner.closing());
        for h in handles {
            if let Err(e) = h.await {
                tracing::warn!("job task ended abnormally: {e}");
            }
        }
    }
}

// ============== Job execution ==============

enum JobEnd {
    Completed(String),
    Cancelled,
    Failed(Error),
}

/// Where the items of a transfer job come from.
enum WorkSource {
    Channel { window: Window, mode: MemoryMode },
    Archive { items: Vec<MediaMessage> },
}

impl WorkSource {
    async fn work_list(
        &self,
        enumerator: &ContentEnumerator,
        source: &ChannelHandle,
        range: Option<(usize, usize)>,
    ) -> Result<WorkList> {
        match self {
            Self::Channel { window, mode } => {
                let window = match range {
                    Some((from, to)) => Window::new(Some(from), Some(to)),
                    None => *window,
                };
                enumerator.enumerate(source, window, *mode).await
            }
            Self::Archive { items } => {
                let (from, to) = range.unwrap_or((1, items.len()));
                if items.is_empty() {
                    return Ok(WorkList::empty());
                }
                let slice = items.get(from.saturating_sub(1)..to.min(items.len())).unwrap_or(&[]);
                Ok(WorkList {
                    items: slice.iter().cloned().map(TransferItem::Full).collect(),
                    first_position: from.max(1),
                    channel_count: items.len(),
                })
            }
        }
    }
}

async fn notify(inner: &ManagerInner, chat: ChatId, html: &str) {
    if let Err(e) = inner.deps.messenger.send_html(chat, html).await {
        tracing::warn!(chat_id = chat.0, "operator notification failed: {e}");
    }
}

async fn run_job(
    inner: &ManagerInner,
    registration: &mut Registration,
    operator: ChatId,
    spec: JobSpec,
    cancel: CancellationToken,
    state: Arc<ProgressState>,
) {
    let id = registration.id;
    let kind = spec.kind();
    let target = spec.target();
    let title = format!("{} {}", kind.label(), target);
    notify(
        inner,
        operator,
        &format!("📥 Job {id} received: {}", escape_html(&title)),
    )
    .await;

    let reporter = ProgressReporter::new(
        inner.deps.messenger.clone(),
        operator,
        id,
        title.clone(),
        inner.deps.cfg.progress_interval,
        state,
    );

    let end = match spec {
        JobSpec::Copy(req) => run_copy(inner, id, operator, req, &cancel, &reporter).await,
        JobSpec::Export { source } => run_export(inner, &source, &reporter).await,
        JobSpec::Import {
            archive,
            destination,
        } => run_import(inner, id, operator, &archive, destination, &cancel, &reporter).await,
    };
    registration.release();

    match end {
        JobEnd::Completed(summary) => {
            tracing::info!(job_id = id.0, "job completed");
            reporter.finish(&format!("✅ {summary}")).await;
            notify(inner, operator, &format!("✅ Job {id} finished. {summary}")).await;
        }
        JobEnd::Cancelled => {
            tracing::info!(job_id = id.0, "job cancelled");
            reporter.finish("🛑 cancelled").await;
            notify(inner, operator, &format!("🛑 Job {id} cancelled.")).await;
        }
        JobEnd::Failed(e) => {
            tracing::error!(job_id = id.0, target = %target, "job failed: {e}");
            notify(
                inner,
                operator,
                &format!(
                    "❌ Job {id} ({}) failed: {}\nCheck <code>{}</code> and submit again.",
                    escape_html(&title),
                    escape_html(&e.to_string()),
                    escape_html(&target)
                ),
            )
            .await;
        }
    }
}

fn backoff(inner: &ManagerInner) -> BackoffPolicy {
    BackoffPolicy::from_config(&inner.deps.cfg)
}

async fn provision_destination(
    inner: &ManagerInner,
    resolver: &ChannelResolver,
    source: &ChannelHandle,
    requested: Option<&ChannelRef>,
) -> Result<ChannelHandle> {
    if let Some(r) = requested {
        return resolver.resolve(r).await;
    }
    let platform = &inner.deps.platform;
    let title = format!("{}{}", source.title, inner.deps.cfg.copy_title_suffix);
    let policy = backoff(inner);

    if let Some(existing) =
        retry_until_done(&policy, || platform.find_owned_channel(&title)).await?
    {
        tracing::info!(dest = existing.id.0, "reusing destination channel");
        return Ok(existing);
    }
    let created = retry_until_done(&policy, || platform.create_channel(&title)).await?;
    tracing::info!(dest = created.id.0, title = %title, "created destination channel");
    Ok(created)
}

async fn run_copy(
    inner: &ManagerInner,
    id: JobId,
    operator: ChatId,
    req: CopyRequest,
    cancel: &CancellationToken,
    reporter: &ProgressReporter,
) -> JobEnd {
    let mode = req.mode.unwrap_or(inner.deps.cfg.default_memory_mode);
    run_transfer(
        inner,
        id,
        operator,
        req.source,
        req.destination,
        WorkSource::Channel {
            window: req.window,
            mode,
        },
        cancel,
        reporter,
    )
    .await
}

async fn run_import(
    inner: &ManagerInner,
    id: JobId,
    operator: ChatId,
    name: &str,
    destination: Option<ChannelRef>,
    cancel: &CancellationToken,
    reporter: &ProgressReporter,
) -> JobEnd {
    let archive = match inner.deps.archives.load(name).await {
        Ok(a) => a,
        Err(e) => return JobEnd::Failed(e),
    };
    run_transfer(
        inner,
        id,
        operator,
        ChannelRef::from(archive.source.id),
        destination,
        WorkSource::Archive {
            items: archive.items,
        },
        cancel,
        reporter,
    )
    .await
}

async fn run_export(
    inner: &ManagerInner,
    source_ref: &ChannelRef,
    reporter: &ProgressReporter,
) -> JobEnd {
    let policy = backoff(inner);
    let resolver = ChannelResolver::new(inner.deps.platform.clone(), policy);
    let enumerator = ContentEnumerator::new(inner.deps.platform.clone(), policy);

    let source = match resolver.resolve(source_ref).await {
        Ok(h) => h,
        Err(e) => return JobEnd::Failed(e),
    };
    let items = match enumerator.enumerate_all(&source).await {
        Ok(v) => v,
        Err(e) => return JobEnd::Failed(e),
    };
    let count = items.len();
    reporter.set_total(count).await;

    match inner
        .deps
        .archives
        .save(&ChannelArchive::new(source, items))
        .await
    {
        Ok(name) => {
            reporter.report(count).await;
            JobEnd::Completed(format!(
                "Saved {count} items as <code>{}</code>. Use <code>import {}</code> to replay.",
                escape_html(&name),
                escape_html(&name)
            ))
        }
        Err(e) => JobEnd::Failed(e),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_transfer(
    inner: &ManagerInner,
    id: JobId,
    operator: ChatId,
    source_ref: ChannelRef,
    dest_ref: Option<ChannelRef>,
    work_source: WorkSource,
    cancel: &CancellationToken,
    reporter: &ProgressReporter,
) -> JobEnd {
    let cfg = &inner.deps.cfg;
    let policy = backoff(inner);
    let resolver = ChannelResolver::new(inner.deps.platform.clone(), policy);
    let enumerator = ContentEnumerator::new(inner.deps.platform.clone(), policy);

    let mut source = match resolver.resolve(&source_ref).await {
        Ok(h) => h,
        Err(e) => return JobEnd::Failed(e),
    };
    // Window errors surface before anything is created on the destination side.
    let mut work = match work_source.work_list(&enumerator, &source, None).await {
        Ok(w) => w,
        Err(e) => return JobEnd::Failed(e),
    };
    if work.items.is_empty() {
        reporter.set_total(0).await;
        return JobEnd::Completed("Nothing to transfer.".to_string());
    }
    let dest = match provision_destination(inner, &resolver, &source, dest_ref.as_ref()).await {
        Ok(h) => h,
        Err(e) => return JobEnd::Failed(e),
    };
    let first_position = work.first_position;
    let last_position = work.position_of(work.items.len() - 1);

    let strategy_kind = select_strategy(&source);
    let follow = dest
        .invite_link
        .as_deref()
        .map(|l| format!("\nFollow along: {}", escape_html(l)))
        .unwrap_or_default();
    notify(
        inner,
        operator,
        &format!(
            "▶️ Job {id}: {} → {} ({} items {}-{} of {}, {}){follow}",
            escape_html(&source.title),
            escape_html(&dest.title),
            work.items.len(),
            first_position,
            last_position,
            work.channel_count,
            strategy_kind.label()
        ),
    )
    .await;
    reporter.set_total(work.items.len()).await;

    let mut stats = RunStats::default();
    let mut restarts = 0usize;

    loop {
        let strategy = build_strategy(
            select_strategy(&source),
            inner.deps.platform.clone(),
            cfg.temp_dir.clone(),
            cfg.caption_limit,
        );
        let engine = TransferEngine::new(strategy, cfg);
        let done_before = stats.terminal();

        match engine
            .run(&source, dest.id, &work, done_before, cancel, reporter, &mut stats)
            .await
        {
            RunOutcome::Completed => return JobEnd::Completed(summarize(&stats, &dest)),
            RunOutcome::Cancelled => return JobEnd::Cancelled,
            RunOutcome::Aborted(e) => return JobEnd::Failed(e),
            RunOutcome::Restart { from_position } => {
                restarts += 1;
                if restarts > cfg.max_stale_restarts {
                    return JobEnd::Failed(Error::StaleReference(format!(
                        "source still stale after {} re-resolutions",
                        cfg.max_stale_restarts
                    )));
                }
                tracing::warn!(job_id = id.0, from_position, restarts, "re-resolving stale source");
                notify(
                    inner,
                    operator,
                    &format!(
                        "🔄 Job {id}: media references went stale; re-resolving source and resuming at #{from_position}."
                    ),
                )
                .await;

                source = match resolver.resolve(&source_ref).await {
                    Ok(h) => h,
                    Err(e) => {
                        return JobEnd::Failed(Error::ChannelNotFound(format!(
                            "channel link is no longer valid: {source_ref} ({e})"
                        )))
                    }
                };
                work = match work_source
                    .work_list(&enumerator, &source, Some((from_position, last_position)))
                    .await
                {
                    Ok(w) => w,
                    Err(e) => return JobEnd::Failed(e),
                };
            }
        }
    }
}

fn summarize(stats: &RunStats, dest: &ChannelHandle) -> String {
    let mut out = format!(
        "{} transferred, {} skipped, {} stale → {}",
        stats.succeeded,
        stats.hard_failed,
        stats.soft_failed,
        escape_html(&dest.title)
    );
    if let Some(link) = &dest.invite_link {
        out.push_str(&format!(" ({})", escape_html(link)));
    }
    if !stats.skipped.is_empty() {
        let listed: Vec<String> = stats
            .skipped
            .iter()
            .take(MAX_LISTED_SKIPS)
            .map(|(pos, _)| format!("#{pos}"))
            .collect();
        out.push_str(&format!("\nSkipped: {}", listed.join(", ")));
        if stats.skipped.len() > MAX_LISTED_SKIPS {
            out.push_str(&format!(" (+{} more)", stats.skipped.len() - MAX_LISTED_SKIPS));
        }
    }
    out
}
