//! Watchdog-bounded retry for external commands.
//!
//! A command runs in slices no longer than the sub-timeout. A slice that
//! expires kills the process, discards its partial output, and charges the
//! elapsed time against the overall budget before the command is started
//! again. A non-zero exit waits out the retry delay (also charged) before the
//! next attempt. The budget never grows back.
//!
//! Cancellation is observed between slices and during the backoff wait, never
//! in the middle of a slice, so the kill-and-cleanup path always runs before
//! the caller sees `Cancelled`.
//!
//! [`Heartbeat`] and [`watch_heartbeat`] supervise the process as a whole:
//! every slice, scan and idle tick beats, and the monitor reports a stall
//! once no beat has arrived for the configured limit.

use crate::config::MergeConfig;
use std::io;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, Command};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bytes of stderr kept for the failure message.
pub const STDERR_TAIL_BYTES: usize = 4096;

/// Time allowed for the stderr reader to drain after the process exits.
const STDERR_GRACE: Duration = Duration::from_secs(2);

/// Limits for one supervised command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Overall budget across every attempt and backoff.
    pub max_timeout: Duration,
    /// Longest single slice.
    pub sub_timeout: Duration,
    /// Ceiling on attempts.
    pub max_retries: u32,
    /// Wait after a non-timeout failure.
    pub retry_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(merge: &MergeConfig) -> Self {
        Self {
            max_timeout: merge.max_timeout(),
            sub_timeout: merge.sub_timeout(),
            max_retries: merge.max_retries,
            retry_delay: merge.retry_delay(),
        }
    }

    /// Same policy with a different overall budget.
    pub fn with_budget(self, max_timeout: Duration) -> Self {
        Self { max_timeout, ..self }
    }
}

/// Remaining time for one supervised command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    remaining: Duration,
}

impl Budget {
    pub fn new(total: Duration) -> Self {
        Self { remaining: total }
    }

    pub fn remaining(&self) -> Duration {
        self.remaining
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_zero()
    }

    /// Length of the next slice, or `None` when nothing is left.
    pub fn next_slice(&self, sub_timeout: Duration) -> Option<Duration> {
        (!self.is_exhausted()).then(|| sub_timeout.min(self.remaining))
    }

    /// Deducts `elapsed`, capped at what remains, and returns the amount charged.
    pub fn charge(&mut self, elapsed: Duration) -> Duration {
        let charged = elapsed.min(self.remaining);
        self.remaining -= charged;
        charged
    }
}

/// Accounting for one supervised command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WatchdogReport {
    /// Processes started.
    pub attempts: u32,
    /// Slices that ended by the watchdog killing the process.
    pub timeouts: u32,
    /// Budget charged per attempt and per backoff, in order.
    pub charges: Vec<Duration>,
}

impl WatchdogReport {
    /// Total budget consumed.
    pub fn charged(&self) -> Duration {
        self.charges.iter().sum()
    }
}

/// Why a supervised command did not succeed.
#[derive(Debug, Error)]
pub enum WatchdogError {
    /// The command could not be started at all; retrying will not help.
    #[error("failed to start command: {0}")]
    Spawn(io::Error),

    #[error("gave up after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    #[error("overall timeout of {budget:?} exhausted after {attempts} attempts: {last_error}")]
    BudgetExhausted {
        budget: Duration,
        attempts: u32,
        last_error: String,
    },

    #[error("cancelled")]
    Cancelled,
}

/// A failed supervised run with its accounting.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct WatchdogFailure {
    pub error: WatchdogError,
    pub report: WatchdogReport,
}

impl WatchdogFailure {
    pub fn is_cancelled(&self) -> bool {
        matches!(self.error, WatchdogError::Cancelled)
    }
}

/// Progress signal shared by everything the daemon does.
///
/// Clones beat the same channel. Once every clone is dropped the monitor
/// stops watching.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    tx: Arc<watch::Sender<u64>>,
}

impl Default for Heartbeat {
    fn default() -> Self {
        let (tx, _) = watch::channel(0);
        Self { tx: Arc::new(tx) }
    }
}

impl Heartbeat {
    pub fn beat(&self) {
        self.tx.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.tx.subscribe()
    }
}

/// Waits until no beat arrives for `limit`.
///
/// Returns `true` on a stall and `false` when `cancel` fires or every
/// [`Heartbeat`] clone has been dropped.
pub async fn watch_heartbeat(mut beats: watch::Receiver<u64>, limit: Duration, cancel: &CancellationToken) -> bool {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            beat = tokio::time::timeout(limit, beats.changed()) => match beat {
                Ok(Ok(())) => {}
                Ok(Err(_)) => return false,
                Err(_) => return true,
            },
        }
    }
}

/// Runs the command produced by `build` under `policy`.
///
/// # Arguments
///
/// * `build` - Produces a fresh command for every attempt
/// * `policy` - Budget, slice length, attempt ceiling and backoff
/// * `partial` - Output path deleted after every failed or killed attempt
/// * `cancel` - Checked between slices and during backoff
/// * `heartbeat` - Beaten before every slice
pub async fn run_watchdogged<F>(
    build: F,
    policy: RetryPolicy,
    partial: &Path,
    cancel: &CancellationToken,
    heartbeat: &Heartbeat,
) -> Result<WatchdogReport, WatchdogFailure>
where
    F: Fn() -> Command,
{
    let mut budget = Budget::new(policy.max_timeout);
    let mut report = WatchdogReport::default();
    let mut last_error = String::from("no attempt made");

    let fail = |error: WatchdogError, report: WatchdogReport| -> Result<WatchdogReport, WatchdogFailure> {
        Err(WatchdogFailure { error, report })
    };

    loop {
        if cancel.is_cancelled() {
            return fail(WatchdogError::Cancelled, report);
        }
        if report.attempts >= policy.max_retries {
            return fail(
                WatchdogError::RetriesExhausted {
                    attempts: report.attempts,
                    last_error,
                },
                report,
            );
        }
        let Some(slice) = budget.next_slice(policy.sub_timeout) else {
            return fail(
                WatchdogError::BudgetExhausted {
                    budget: policy.max_timeout,
                    attempts: report.attempts,
                    last_error,
                },
                report,
            );
        };

        heartbeat.beat();
        let mut command = build();
        command
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => return fail(WatchdogError::Spawn(e), report),
        };
        report.attempts += 1;
        let attempt = report.attempts;

        let stderr_task = child.stderr.take().map(|stderr| tokio::spawn(read_tail(stderr)));
        let started = Instant::now();

        debug!(attempt, slice_ms = slice.as_millis() as u64, "starting supervised command");

        let waited = tokio::time::timeout(slice, child.wait()).await;
        let timed_out = waited.is_err();

        if timed_out {
            if let Err(e) = child.start_kill() {
                warn!(attempt, error = %e, "failed to signal timed-out process");
            }
            let _ = child.wait().await;
        }
        report.charges.push(budget.charge(started.elapsed()));

        let stderr = match stderr_task {
            Some(handle) => match tokio::time::timeout(STDERR_GRACE, handle).await {
                Ok(Ok(tail)) => tail,
                _ => String::new(),
            },
            None => String::new(),
        };

        match waited {
            Ok(Ok(status)) if status.success() => return Ok(report),
            Ok(Ok(status)) => {
                last_error = describe_failure(&status.to_string(), &stderr);
                warn!(
                    attempt,
                    remaining_ms = budget.remaining().as_millis() as u64,
                    error = %last_error,
                    "command failed"
                );
            }
            Ok(Err(e)) => {
                last_error = format!("failed waiting for process: {}", e);
                warn!(attempt, error = %last_error, "command failed");
            }
            Err(_) => {
                report.timeouts += 1;
                last_error = describe_failure(&format!("killed after {:?} slice", slice), &stderr);
                warn!(
                    attempt,
                    remaining_ms = budget.remaining().as_millis() as u64,
                    "command exceeded its slice; killed"
                );
            }
        }

        remove_partial(partial);

        // Timeouts restart at once; other failures back off first
        if !timed_out && report.attempts < policy.max_retries && !budget.is_exhausted() {
            let delay = policy.retry_delay.min(budget.remaining());
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancel.cancelled() => return fail(WatchdogError::Cancelled, report),
            }
            report.charges.push(budget.charge(delay));
        }
    }
}

fn describe_failure(what: &str, stderr: &str) -> String {
    let stderr = stderr.trim();
    if stderr.is_empty() {
        what.to_string()
    } else {
        format!("{}: {}", what, stderr)
    }
}

/// Removes a partial output, tolerating its absence.
pub fn remove_partial(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed partial output"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove partial output"),
    }
}

/// Reads a pipe to EOF, keeping only the last `STDERR_TAIL_BYTES`.
async fn read_tail(mut stderr: ChildStderr) -> String {
    let mut tail: Vec<u8> = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                tail.extend_from_slice(&buf[..n]);
                if tail.len() > STDERR_TAIL_BYTES {
                    let excess = tail.len() - STDERR_TAIL_BYTES;
                    tail.drain(..excess);
                }
            }
        }
    }
    String::from_utf8_lossy(&tail).into_owned()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{count_lines, shell};
    use proptest::prelude::*;
    use std::fs;
    use tempfile::TempDir;

    fn policy(max_ms: u64, sub_ms: u64, retries: u32, delay_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_timeout: Duration::from_millis(max_ms),
            sub_timeout: Duration::from_millis(sub_ms),
            max_retries: retries,
            retry_delay: Duration::from_millis(delay_ms),
        }
    }

    #[tokio::test]
    async fn test_success_first_attempt() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let script = format!("echo done > '{}'", out.display());

        let report = run_watchdogged(|| shell(&script), policy(5_000, 2_000, 3, 10), &out, &CancellationToken::new(), &Heartbeat::default())
            .await
            .unwrap();

        assert_eq!(report.attempts, 1);
        assert_eq!(report.timeouts, 0);
        assert!(out.exists());
    }

    #[tokio::test]
    async fn test_failure_then_success_backs_off() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let counter = temp.path().join("counter");
        let script = format!(
            "echo x >> '{c}'; if [ $(wc -l < '{c}') -lt 3 ]; then echo partial > '{o}'; echo boom >&2; exit 1; fi; echo ok > '{o}'",
            c = counter.display(),
            o = out.display()
        );

        let report = run_watchdogged(|| shell(&script), policy(10_000, 2_000, 5, 20), &out, &CancellationToken::new(), &Heartbeat::default())
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(count_lines(&counter), 3);
        // Three attempts plus two backoffs
        assert_eq!(report.charges.len(), 5);
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "ok");
    }

    #[tokio::test]
    async fn test_two_timeouts_then_success_within_budget() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let counter = temp.path().join("counter");
        let script = format!(
            "echo x >> '{c}'; if [ $(wc -l < '{c}') -le 2 ]; then echo partial > '{o}'; exec sleep 10; fi; echo ok > '{o}'",
            c = counter.display(),
            o = out.display()
        );
        let max = Duration::from_millis(3_000);
        let started = std::time::Instant::now();

        let report = run_watchdogged(|| shell(&script), policy(3_000, 400, 5, 10), &out, &CancellationToken::new(), &Heartbeat::default())
            .await
            .unwrap();

        assert_eq!(report.attempts, 3);
        assert_eq!(report.timeouts, 2);
        assert!(report.charged() <= max);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(fs::read_to_string(&out).unwrap().trim(), "ok");
    }

    #[tokio::test]
    async fn test_budget_exhausted_removes_partial() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let script = format!("echo partial > '{}'; exec sleep 10", out.display());

        let failure = run_watchdogged(|| shell(&script), policy(700, 300, 10, 10), &out, &CancellationToken::new(), &Heartbeat::default())
            .await
            .unwrap_err();

        assert!(matches!(failure.error, WatchdogError::BudgetExhausted { .. }));
        assert!(failure.report.attempts >= 2);
        assert_eq!(failure.report.timeouts, failure.report.attempts);
        assert!(failure.report.charged() <= Duration::from_millis(700));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_retries_exhausted_keeps_last_error() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let counter = temp.path().join("counter");
        let script = format!(
            "echo x >> '{}'; echo 'Invalid data found' >&2; exit 3",
            counter.display()
        );

        let failure = run_watchdogged(|| shell(&script), policy(10_000, 2_000, 2, 10), &out, &CancellationToken::new(), &Heartbeat::default())
            .await
            .unwrap_err();

        match failure.error {
            WatchdogError::RetriesExhausted { attempts, last_error } => {
                assert_eq!(attempts, 2);
                assert!(last_error.contains("Invalid data found"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(count_lines(&counter), 2);
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let temp = TempDir::new().unwrap();
        let failure = run_watchdogged(
            || Command::new("/nonexistent/ffmpeg-binary"),
            policy(1_000, 500, 3, 10),
            &temp.path().join("x"),
            &CancellationToken::new(),
            &Heartbeat::default(),
        )
        .await
        .unwrap_err();

        assert!(matches!(failure.error, WatchdogError::Spawn(_)));
        assert_eq!(failure.report.attempts, 0);
    }

    #[tokio::test]
    async fn test_cancel_before_start() {
        let temp = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let failure = run_watchdogged(|| shell("exit 0"), policy(1_000, 500, 3, 10), &temp.path().join("x"), &cancel, &Heartbeat::default())
            .await
            .unwrap_err();

        assert!(failure.is_cancelled());
        assert_eq!(failure.report.attempts, 0);
    }

    #[tokio::test]
    async fn test_cancel_during_backoff_cleans_up() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let script = format!("echo partial > '{}'; exit 1", out.display());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let failure = run_watchdogged(|| shell(&script), policy(60_000, 5_000, 5, 30_000), &out, &cancel, &Heartbeat::default())
            .await
            .unwrap_err();

        assert!(failure.is_cancelled());
        assert_eq!(failure.report.attempts, 1);
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_every_slice_beats() {
        let temp = TempDir::new().unwrap();
        let out = temp.path().join("out.partial");
        let heartbeat = Heartbeat::default();
        let beats = heartbeat.subscribe();

        let failure = run_watchdogged(|| shell("exit 1"), policy(10_000, 2_000, 3, 10), &out, &CancellationToken::new(), &heartbeat)
            .await
            .unwrap_err();

        assert_eq!(failure.report.attempts, 3);
        assert_eq!(*beats.borrow(), 3);
    }

    #[tokio::test]
    async fn test_monitor_reports_stall_after_beats_stop() {
        let heartbeat = Heartbeat::default();
        let beats = heartbeat.subscribe();
        let beater = heartbeat.clone();
        tokio::spawn(async move {
            for _ in 0..10 {
                beater.beat();
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
        });
        let started = std::time::Instant::now();

        let stalled = watch_heartbeat(beats, Duration::from_millis(150), &CancellationToken::new()).await;

        assert!(stalled);
        assert!(started.elapsed() >= Duration::from_millis(300));
        drop(heartbeat);
    }

    #[tokio::test]
    async fn test_monitor_quiet_on_cancel_or_drop() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let heartbeat = Heartbeat::default();
        assert!(!watch_heartbeat(heartbeat.subscribe(), Duration::from_secs(5), &cancel).await);

        let beats = heartbeat.subscribe();
        drop(heartbeat);
        assert!(!watch_heartbeat(beats, Duration::from_secs(5), &CancellationToken::new()).await);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_budget_never_overspent(
            total_ms in 1u64..100_000,
            sub_ms in 1u64..50_000,
            elapsed in proptest::collection::vec(0u64..60_000, 1..30),
        ) {
            let total = Duration::from_millis(total_ms);
            let sub = Duration::from_millis(sub_ms);
            let mut budget = Budget::new(total);
            let mut charged = Duration::ZERO;
            let mut previous = budget.remaining();

            for ms in elapsed {
                let Some(slice) = budget.next_slice(sub) else { break };
                prop_assert!(slice <= sub);
                prop_assert!(slice <= budget.remaining());
                charged += budget.charge(Duration::from_millis(ms));
                prop_assert!(budget.remaining() <= previous);
                previous = budget.remaining();
            }

            prop_assert!(charged <= total);
            prop_assert_eq!(charged + budget.remaining(), total);
        }
    }
}
