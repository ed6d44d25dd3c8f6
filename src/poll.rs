//! # Clocks, Cancellation and Polling
//!
//! Readiness waits and every fixed pause of the lifecycle go through the
//! [`Clock`] trait so tests can drive them without real wall-clock delay.
//! Cancellation is a [`Shutdown`] token backed by a `tokio::sync::watch`
//! channel: [`spawn_signal_watcher`] flips it on the first SIGINT/SIGTERM,
//! and every wait observes it.

use crate::error::{BenchError, BenchResult};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Source of time for waits that must be testable.
#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by tokio's timer.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Clock that only moves when someone sleeps on it.
#[derive(Debug)]
pub struct ManualClock {
    origin: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += by;
    }

    /// Total simulated time elapsed so far.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Sending half of the cancellation token.
#[derive(Debug)]
pub struct ShutdownTrigger {
    tx: watch::Sender<bool>,
}

impl ShutdownTrigger {
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }
}

/// Cloneable cancellation token observed by every wait.
#[derive(Debug, Clone)]
pub struct Shutdown {
    rx: watch::Receiver<bool>,
}

impl Shutdown {
    pub fn new() -> (ShutdownTrigger, Shutdown) {
        let (tx, rx) = watch::channel(false);
        (ShutdownTrigger { tx }, Shutdown { rx })
    }

    /// A token that is never cancelled.
    pub fn never() -> Shutdown {
        let (_tx, rx) = watch::channel(false);
        Shutdown { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once the trigger fires; pends forever if it never can.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }

    /// Sleep on `clock`, returning `Cancelled` if the token fires first.
    pub async fn sleep(&self, clock: &dyn Clock, duration: Duration) -> BenchResult<()> {
        if self.is_cancelled() {
            return Err(BenchError::Cancelled);
        }
        tokio::select! {
            _ = clock.sleep(duration) => Ok(()),
            _ = self.cancelled() => Err(BenchError::Cancelled),
        }
    }
}

/// Install SIGINT/SIGTERM handlers and flip `trigger` on the first signal.
///
/// Later signals are logged; stopping the live server is not interruptible,
/// so they change nothing.
#[cfg(unix)]
pub fn spawn_signal_watcher(trigger: ShutdownTrigger) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    Ok(tokio::spawn(async move {
        let mut received = 0usize;
        loop {
            tokio::select! {
                Some(()) = sigterm.recv() => info!("Received SIGTERM"),
                Some(()) = sigint.recv() => info!("Received SIGINT"),
                else => break,
            }
            received += 1;
            if received == 1 {
                warn!("Stopping the live server and writing partial results");
                trigger.trigger();
            } else {
                warn!("Shutdown already in progress; waiting for the server to stop");
            }
        }
    }))
}

#[cfg(not(unix))]
pub fn spawn_signal_watcher(trigger: ShutdownTrigger) -> std::io::Result<JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("Could not install Ctrl-C handler; interrupts will not be graceful");
            return;
        }
        info!("Received Ctrl-C");
        warn!("Stopping the live server and writing partial results");
        trigger.trigger();
        while tokio::signal::ctrl_c().await.is_ok() {
            warn!("Shutdown already in progress; waiting for the server to stop");
        }
    }))
}

/// Result of one probe attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Ready,
    Pending,
    /// Stop polling; waiting longer cannot succeed
    Abort,
}

/// How a poll loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Ready(Duration),
    TimedOut(Duration),
    Aborted(Duration),
}

impl PollOutcome {
    pub fn elapsed(&self) -> Duration {
        match *self {
            PollOutcome::Ready(d) | PollOutcome::TimedOut(d) | PollOutcome::Aborted(d) => d,
        }
    }
}

/// Call `check` every `interval` until it reports ready, asks to abort, or
/// `timeout` has elapsed on `clock`.
///
/// The last sleep is clipped to the remaining budget, so the loop never
/// overshoots the timeout by more than one probe attempt.
pub async fn poll_until<F, Fut>(
    clock: &dyn Clock,
    shutdown: &Shutdown,
    interval: Duration,
    timeout: Duration,
    mut check: F,
) -> BenchResult<PollOutcome>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = PollStep>,
{
    let start = clock.now();
    loop {
        if shutdown.is_cancelled() {
            return Err(BenchError::Cancelled);
        }

        let step = tokio::select! {
            step = check() => step,
            _ = shutdown.cancelled() => return Err(BenchError::Cancelled),
        };
        let elapsed = clock.now().saturating_duration_since(start);
        match step {
            PollStep::Ready => return Ok(PollOutcome::Ready(elapsed)),
            PollStep::Abort => return Ok(PollOutcome::Aborted(elapsed)),
            PollStep::Pending => {}
        }

        if elapsed >= timeout {
            return Ok(PollOutcome::TimedOut(elapsed));
        }
        let remaining = timeout - elapsed;
        // A zero interval would spin; tests use it only with a manual clock.
        let nap = if interval.is_zero() {
            remaining.min(Duration::from_millis(10))
        } else {
            interval.min(remaining)
        };
        shutdown.sleep(clock, nap).await?;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_poll_times_out_on_manual_clock() {
        let clock = ManualClock::new();
        let attempts = AtomicUsize::new(0);

        let outcome = poll_until(
            &clock,
            &Shutdown::never(),
            Duration::from_secs(1),
            Duration::from_secs(5),
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { PollStep::Pending }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::TimedOut(Duration::from_secs(5)));
        // t = 0, 1, 2, 3, 4, 5
        assert_eq!(attempts.load(Ordering::SeqCst), 6);
        assert_eq!(clock.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_poll_reports_elapsed_until_ready() {
        let clock = ManualClock::new();
        let attempts = AtomicUsize::new(0);

        let outcome = poll_until(
            &clock,
            &Shutdown::never(),
            Duration::from_secs(1),
            Duration::from_secs(60),
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n >= 3 {
                        PollStep::Ready
                    } else {
                        PollStep::Pending
                    }
                }
            },
        )
        .await
        .unwrap();

        assert_eq!(outcome, PollOutcome::Ready(Duration::from_secs(3)));
    }

    #[tokio::test]
    async fn test_poll_abort_stops_early() {
        let clock = ManualClock::new();
        let outcome = poll_until(
            &clock,
            &Shutdown::never(),
            Duration::from_secs(1),
            Duration::from_secs(60),
            || async { PollStep::Abort },
        )
        .await
        .unwrap();
        assert_eq!(outcome, PollOutcome::Aborted(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_poll_observes_cancellation() {
        let clock = ManualClock::new();
        let (trigger, shutdown) = Shutdown::new();
        trigger.trigger();

        let result = poll_until(
            &clock,
            &shutdown,
            Duration::from_secs(1),
            Duration::from_secs(60),
            || async { PollStep::Pending },
        )
        .await;
        assert!(matches!(result, Err(BenchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_shutdown_sleep_interrupted() {
        let (trigger, shutdown) = Shutdown::new();
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                shutdown
                    .sleep(&SystemClock, Duration::from_secs(30))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();

        let result = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("sleep should be interrupted")
            .unwrap();
        assert!(matches!(result, Err(BenchError::Cancelled)));
    }

    #[tokio::test]
    async fn test_never_token_does_not_fire() {
        let shutdown = Shutdown::never();
        assert!(!shutdown.is_cancelled());
        let fired = tokio::time::timeout(Duration::from_millis(20), shutdown.cancelled()).await;
        assert!(fired.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_watcher_survives_repeated_signals() {
        use nix::sys::signal::{raise, Signal};

        let (trigger, shutdown) = Shutdown::new();
        let watcher = spawn_signal_watcher(trigger).unwrap();

        raise(Signal::SIGTERM).unwrap();
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .unwrap();

        raise(Signal::SIGTERM).unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!watcher.is_finished());
        assert!(shutdown.is_cancelled());
        watcher.abort();
    }
}
