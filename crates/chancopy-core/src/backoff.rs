//! Rate-limit backoff: turn a "slow down for N seconds" signal into a sleep.
//!
//! The signal is authoritative, so there is no retry cap here. The loop in
//! [`retry_rate_limited`] is the only place the pipeline retries a platform call.

use std::{future::Future, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Local};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use crate::{config::PipelineConfig, Error, Result};

/// Extracted from a throttling error; consumed once.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BackoffSignal {
    pub wait: Duration,
    pub cause: String,
}

impl BackoffSignal {
    pub fn from_error(e: &Error) -> Option<Self> {
        match e {
            Error::RateLimited { wait, cause } => Some(Self {
                wait: *wait,
                cause: cause.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub short_wait_threshold: Duration,
    pub short_wait_multiplier: u32,
}

impl BackoffPolicy {
    pub fn from_config(cfg: &PipelineConfig) -> Self {
        Self {
            short_wait_threshold: cfg.short_wait_threshold,
            short_wait_multiplier: cfg.short_wait_multiplier,
        }
    }

    /// Sleep duration for a signal. Never less than signaled.
    pub fn on_rate_limited(&self, signal: &BackoffSignal) -> Duration {
        if signal.wait <= self.short_wait_threshold && self.short_wait_multiplier > 1 {
            return (signal.wait * self.short_wait_multiplier).max(signal.wait);
        }
        signal.wait
    }
}

/// Human-readable description of a pending wait, surfaced on the progress artifact.
#[derive(Clone, Debug)]
pub struct WaitNotice {
    pub cause: String,
    pub wait: Duration,
    pub until: DateTime<Local>,
}

impl WaitNotice {
    pub fn new(signal: &BackoffSignal, wait: Duration) -> Self {
        let until = Local::now()
            + chrono::Duration::from_std(wait).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            cause: signal.cause.clone(),
            wait,
            until,
        }
    }

    pub fn describe(&self) -> String {
        format!(
            "rate limited ({}): waiting {} until {}",
            self.cause,
            crate::formatting::format_duration(self.wait),
            self.until.format("%H:%M:%S")
        )
    }
}

/// Told about every wait before it starts (the progress reporter surfaces it).
#[async_trait]
pub trait WaitObserver: Send + Sync {
    async fn on_wait(&self, notice: &WaitNotice);
}

/// Observer for calls nobody watches (job setup).
pub struct SilentWait;

#[async_trait]
impl WaitObserver for SilentWait {
    async fn on_wait(&self, _notice: &WaitNotice) {}
}

/// Why a retried operation stopped without a result.
#[derive(Debug)]
pub enum RetryError {
    Cancelled,
    Failed(Error),
}

impl From<Error> for RetryError {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

/// Run `op` until it returns anything but `RateLimited`, sleeping the policy's
/// duration between attempts.
///
/// Cancellation is only observed while sleeping; an attempt in flight always
/// runs to completion.
pub async fn retry_rate_limited<T, F, Fut>(
    policy: &BackoffPolicy,
    cancel: &CancellationToken,
    observer: &dyn WaitObserver,
    mut op: F,
) -> std::result::Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => {
                let Some(signal) = BackoffSignal::from_error(&e) else {
                    return Err(RetryError::Failed(e));
                };
                let wait = policy.on_rate_limited(&signal);
                tracing::warn!(cause = %signal.cause, wait_secs = wait.as_secs(), "rate limited");
                observer.on_wait(&WaitNotice::new(&signal, wait)).await;
                tokio::select! {
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                    _ = sleep(wait) => {}
                }
            }
        }
    }
}

/// Same loop without a cancellation point, for job setup calls (resolve, provision).
pub async fn retry_until_done<T, F, Fut>(policy: &BackoffPolicy, op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let never = CancellationToken::new();
    match retry_rate_limited(policy, &never, &SilentWait, op).await {
        Ok(v) => Ok(v),
        Err(RetryError::Failed(e)) => Err(e),
        Err(RetryError::Cancelled) => Err(Error::External("retry cancelled".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct RecordingObserver {
        waits: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl WaitObserver for RecordingObserver {
        async fn on_wait(&self, notice: &WaitNotice) {
            self.waits.lock().unwrap().push(notice.wait);
        }
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy {
            short_wait_threshold: Duration::from_secs(2),
            short_wait_multiplier: 3,
        }
    }

    fn signal(secs: u64) -> BackoffSignal {
        BackoffSignal {
            wait: Duration::from_secs(secs),
            cause: "FLOOD_WAIT".to_string(),
        }
    }

    #[test]
    fn long_waits_are_exact() {
        assert_eq!(policy().on_rate_limited(&signal(5)), Duration::from_secs(5));
        assert_eq!(policy().on_rate_limited(&signal(600)), Duration::from_secs(600));
    }

    #[test]
    fn short_waits_are_multiplied_never_shortened() {
        assert_eq!(policy().on_rate_limited(&signal(1)), Duration::from_secs(3));
        assert_eq!(policy().on_rate_limited(&signal(0)), Duration::from_secs(0));
        let flat = BackoffPolicy {
            short_wait_multiplier: 1,
            ..policy()
        };
        assert_eq!(flat.on_rate_limited(&signal(1)), Duration::from_secs(1));
    }

    #[test]
    fn notice_mentions_cause_and_wait() {
        let text = WaitNotice::new(&signal(65), Duration::from_secs(65)).describe();
        assert!(text.contains("FLOOD_WAIT"));
        assert!(text.contains("1m 5s"));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_signaled_wait() {
        let counter = AtomicUsize::new(0);
        let calls = &counter;
        let observer = RecordingObserver::default();
        let started = Instant::now();

        let out = retry_rate_limited(
            &policy(),
            &CancellationToken::new(),
            &observer,
            || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::rate_limited(5, "FLOOD_WAIT"))
                } else {
                    Ok(42)
                }
            },
        )
        .await;

        assert!(matches!(out, Ok(42)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(started.elapsed() >= Duration::from_secs(5));
        assert_eq!(*observer.waits.lock().unwrap(), vec![Duration::from_secs(5)]);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_wait_abandons() {
        let cancel = CancellationToken::new();
        let c2 = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(1)).await;
            c2.cancel();
        });

        let out: std::result::Result<(), _> =
            retry_rate_limited(&policy(), &cancel, &SilentWait, || async {
                Err(Error::rate_limited(60, "FLOOD_WAIT"))
            })
            .await;
        assert!(matches!(out, Err(RetryError::Cancelled)));
    }

    #[tokio::test]
    async fn other_errors_pass_through() {
        let out: Result<()> = retry_until_done(&policy(), || async {
            Err(Error::ChannelNotFound("@x".into()))
        })
        .await;
        assert!(matches!(out, Err(Error::ChannelNotFound(_))));
    }
}
