//! Sequential per-item transfer loop with cooperative cancellation and
//! stale-reference escalation.

use std::{sync::Arc, time::Duration};

use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::{
    backoff::{BackoffPolicy, RetryError},
    config::PipelineConfig,
    domain::{ChannelHandle, ChatId, TransferItem},
    enumerator::WorkList,
    progress::ProgressReporter,
    strategy::{ItemContext, TransferStrategy},
    Error,
};

/// Terminal state of a single item.
#[derive(Debug)]
pub enum ItemOutcome {
    Succeeded,
    /// Stale reference; counts toward escalation.
    SoftFailed(Error),
    /// Skipped permanently.
    HardFailed(Error),
    /// Cancelled mid-wait; not counted as done.
    Abandoned,
}

/// How a run over a work list ended.
#[derive(Debug)]
pub enum RunOutcome {
    Completed,
    Cancelled,
    /// Too many consecutive stale references: re-resolve the source and resume
    /// at this absolute 1-based position.
    Restart { from_position: usize },
    /// A job-level error (destination gone, permission revoked).
    Aborted(Error),
}

#[derive(Clone, Debug, Default)]
pub struct RunStats {
    pub succeeded: usize,
    pub soft_failed: usize,
    pub hard_failed: usize,
    /// (position, reason) of every permanently skipped item.
    pub skipped: Vec<(usize, String)>,
}

impl RunStats {
    pub fn terminal(&self) -> usize {
        self.succeeded + self.soft_failed + self.hard_failed
    }
}

pub struct TransferEngine {
    strategy: Arc<dyn TransferStrategy>,
    backoff: BackoffPolicy,
    stale_threshold: usize,
    item_jitter: Duration,
}

impl TransferEngine {
    pub fn new(strategy: Arc<dyn TransferStrategy>, cfg: &PipelineConfig) -> Self {
        Self {
            strategy,
            backoff: BackoffPolicy::from_config(cfg),
            stale_threshold: cfg.stale_escalation_threshold.max(1),
            item_jitter: cfg.item_jitter,
        }
    }

    /// Transfer `work` into `dest`, in order.
    ///
    /// `done_before` is the number of items already terminal in earlier runs of
    /// the same job; progress is reported as `done_before + done here`.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &self,
        source: &ChannelHandle,
        dest: ChatId,
        work: &WorkList,
        done_before: usize,
        cancel: &CancellationToken,
        progress: &ProgressReporter,
        stats: &mut RunStats,
    ) -> RunOutcome {
        let mut consecutive_stale = 0usize;
        let mut done = done_before;
        tracing::debug!(
            strategy = self.strategy.kind().label(),
            items = work.items.len(),
            first_position = work.first_position,
            "transfer run started"
        );

        let outcome = 'items: {
            for (offset, item) in work.items.iter().enumerate() {
                if cancel.is_cancelled() {
                    break 'items RunOutcome::Cancelled;
                }
                if offset > 0 {
                    self.pause_between_items().await;
                    if cancel.is_cancelled() {
                        break 'items RunOutcome::Cancelled;
                    }
                }

                let position = work.position_of(offset);
                let ctx = ItemContext {
                    source,
                    dest,
                    backoff: &self.backoff,
                    cancel,
                    observer: progress,
                };

                match self.transfer_one(&ctx, item).await {
                    ItemOutcome::Succeeded => {
                        consecutive_stale = 0;
                        stats.succeeded += 1;
                    }
                    ItemOutcome::Abandoned => break 'items RunOutcome::Cancelled,
                    ItemOutcome::SoftFailed(e) => {
                        consecutive_stale += 1;
                        stats.soft_failed += 1;
                        tracing::warn!(
                            position,
                            consecutive = consecutive_stale,
                            "stale reference: {e}"
                        );
                        if consecutive_stale >= self.stale_threshold {
                            let from_position =
                                position.saturating_sub(self.stale_threshold - 1).max(1);
                            // The restarted run re-attempts these items; they are no longer terminal.
                            stats.soft_failed -= consecutive_stale;
                            return RunOutcome::Restart { from_position };
                        }
                        progress.note_failure(position, &e.to_string()).await;
                    }
                    ItemOutcome::HardFailed(e) if !e.is_item_level() => {
                        break 'items RunOutcome::Aborted(e);
                    }
                    ItemOutcome::HardFailed(e) => {
                        consecutive_stale = 0;
                        stats.hard_failed += 1;
                        tracing::warn!(position, "item skipped: {e}");
                        let reason = e.to_string();
                        progress.note_failure(position, &reason).await;
                        stats.skipped.push((position, reason));
                    }
                }

                done += 1;
                if cancel.is_cancelled() {
                    break 'items RunOutcome::Cancelled;
                }
                // A stale streak may still be rewound by a restart.
                if consecutive_stale == 0 {
                    progress.report(done).await;
                }
            }

            RunOutcome::Completed
        };

        match &outcome {
            // The job's final status edit shows the count; no throttled edit here.
            RunOutcome::Cancelled => progress.state().set_done(done),
            _ if consecutive_stale > 0 => progress.report(done).await,
            _ => {}
        }
        outcome
    }

    async fn transfer_one(&self, ctx: &ItemContext<'_>, item: &TransferItem) -> ItemOutcome {
        if let TransferItem::Full(m) = item {
            if !m.kind.is_transferable() {
                return ItemOutcome::HardFailed(Error::UnsupportedItemShape(format!(
                    "message {} is a {}",
                    m.id.0,
                    m.kind.label()
                )));
            }
        }

        match self.strategy.transfer(ctx, item).await {
            Ok(()) => ItemOutcome::Succeeded,
            Err(RetryError::Cancelled) => ItemOutcome::Abandoned,
            Err(RetryError::Failed(e @ Error::StaleReference(_))) => ItemOutcome::SoftFailed(e),
            Err(RetryError::Failed(e)) => ItemOutcome::HardFailed(e),
        }
    }

    async fn pause_between_items(&self) {
        let max_ms = self.item_jitter.as_millis() as u64;
        if max_ms == 0 {
            return;
        }
        let ms = rand::thread_rng().gen_range(0..=max_ms);
        tokio::time::sleep(Duration::from_millis(ms)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobId, MediaKind, MemoryMode, Window};
    use crate::enumerator::build_work_list;
    use crate::progress::ProgressState;
    use crate::strategy::{build_strategy, StrategyKind};
    use crate::testing::{sample_messages, FakeMessenger, FakePlatform};

    const SRC: ChatId = ChatId(-1001);
    const DEST: ChatId = ChatId(-2002);

    fn handle() -> ChannelHandle {
        ChannelHandle {
            id: SRC,
            title: "Src".to_string(),
            content_protected: false,
            preview: false,
            invite_link: None,
        }
    }

    fn engine(platform: Arc<FakePlatform>) -> TransferEngine {
        let cfg = PipelineConfig {
            item_jitter: Duration::ZERO,
            short_wait_threshold: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let strategy = build_strategy(StrategyKind::Forward, platform, cfg.temp_dir.clone(), 1024);
        TransferEngine::new(strategy, &cfg)
    }

    fn reporter() -> ProgressReporter {
        ProgressReporter::new(
            Arc::new(FakeMessenger::default()),
            ChatId(1),
            JobId(1),
            "test",
            Duration::ZERO,
            Arc::new(ProgressState::new()),
        )
    }

    fn work(n: usize, window: Window) -> WorkList {
        build_work_list(sample_messages(SRC, n), window, MemoryMode::Full).unwrap()
    }

    #[tokio::test]
    async fn hard_failures_are_skipped_and_the_run_continues() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 4));
        platform.script_errors(2, vec![Error::TransientIo("boom".into())]);
        let mut stats = RunStats::default();
        let progress = reporter();

        let out = engine(platform.clone())
            .run(&handle(), DEST, &work(4, Window::ALL), 0, &CancellationToken::new(), &progress, &mut stats)
            .await;

        assert!(matches!(out, RunOutcome::Completed));
        assert_eq!(platform.transferred(), vec![1, 3, 4]);
        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.hard_failed, 1);
        assert_eq!(stats.skipped[0].0, 2);
        assert_eq!(progress.state().done(), 4);
    }

    #[tokio::test]
    async fn fifth_consecutive_stale_requests_restart_four_back() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 10));
        for id in 3..=7 {
            platform.script_errors(id, vec![Error::StaleReference(format!("m{id}"))]);
        }
        let mut stats = RunStats::default();

        let out = engine(platform.clone())
            .run(&handle(), DEST, &work(10, Window::ALL), 0, &CancellationToken::new(), &reporter(), &mut stats)
            .await;

        assert!(matches!(out, RunOutcome::Restart { from_position: 3 }));
        assert_eq!(platform.transferred(), vec![1, 2]);
        assert_eq!(stats.soft_failed, 0);
    }

    #[tokio::test]
    async fn progress_does_not_rewind_across_a_stale_restart() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 10));
        for id in 3..=7 {
            platform.script_errors(id, vec![Error::StaleReference(format!("m{id}"))]);
        }
        let messenger = Arc::new(FakeMessenger::default());
        let progress = ProgressReporter::new(
            messenger.clone(),
            ChatId(1),
            JobId(1),
            "test",
            Duration::ZERO,
            Arc::new(ProgressState::new()),
        );
        progress.set_total(10).await;
        let engine = engine(platform.clone());
        let mut stats = RunStats::default();

        let out = engine
            .run(&handle(), DEST, &work(10, Window::ALL), 0, &CancellationToken::new(), &progress, &mut stats)
            .await;
        let RunOutcome::Restart { from_position } = out else {
            panic!("expected restart, got {out:?}");
        };
        assert_eq!(progress.state().done(), 2);

        let rest = work(10, Window::new(Some(from_position), Some(10)));
        let out = engine
            .run(&handle(), DEST, &rest, stats.terminal(), &CancellationToken::new(), &progress, &mut stats)
            .await;
        assert!(matches!(out, RunOutcome::Completed));
        assert_eq!(progress.state().done(), 10);

        let seen: Vec<usize> = messenger
            .all_texts()
            .iter()
            .filter_map(|t| t.split('\n').nth(1)?.split('/').next()?.parse().ok())
            .collect();
        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "{seen:?}");
        assert_eq!(seen.last(), Some(&10));
    }

    #[tokio::test]
    async fn interrupted_stale_streak_does_not_escalate() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 10));
        for id in [2, 3, 4, 5, 7, 8, 9, 10] {
            platform.script_errors(id, vec![Error::StaleReference(format!("m{id}"))]);
        }
        let mut stats = RunStats::default();
        let progress = reporter();

        let out = engine(platform.clone())
            .run(&handle(), DEST, &work(10, Window::ALL), 0, &CancellationToken::new(), &progress, &mut stats)
            .await;

        assert!(matches!(out, RunOutcome::Completed));
        assert_eq!(progress.state().done(), 10);
        assert_eq!(stats.soft_failed, 8);
        assert_eq!(platform.transferred(), vec![1, 6]);
    }

    #[tokio::test]
    async fn destination_permission_loss_aborts() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 3));
        platform.script_errors(2, vec![Error::PermissionDenied("not admin".into())]);
        let mut stats = RunStats::default();

        let out = engine(platform.clone())
            .run(&handle(), DEST, &work(3, Window::ALL), 0, &CancellationToken::new(), &reporter(), &mut stats)
            .await;

        assert!(matches!(out, RunOutcome::Aborted(Error::PermissionDenied(_))));
        assert_eq!(platform.transferred(), vec![1]);
    }

    #[tokio::test]
    async fn cancelled_before_start_transfers_nothing() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 3));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stats = RunStats::default();

        let out = engine(platform.clone())
            .run(&handle(), DEST, &work(3, Window::ALL), 0, &cancel, &reporter(), &mut stats)
            .await;

        assert!(matches!(out, RunOutcome::Cancelled));
        assert!(platform.transferred().is_empty());
    }

    #[tokio::test]
    async fn unsupported_full_item_is_hard_failed_without_a_call() {
        let platform = Arc::new(FakePlatform::with_channel(SRC, "Src", false, 0));
        let mut msg = crate::testing::sample_message(SRC, 1, MediaKind::Document);
        msg.caption = None;
        let list = WorkList {
            items: vec![TransferItem::Full(msg)],
            first_position: 1,
            channel_count: 1,
        };
        let mut stats = RunStats::default();

        let out = engine(platform.clone())
            .run(&handle(), DEST, &list, 0, &CancellationToken::new(), &reporter(), &mut stats)
            .await;

        assert!(matches!(out, RunOutcome::Completed));
        assert_eq!(stats.hard_failed, 1);
        assert!(platform.transferred().is_empty());
    }
}
