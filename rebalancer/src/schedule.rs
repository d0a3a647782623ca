//! Periodic pass trigger and the stop signal shared with running passes.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use log::{error, info, warn};

use crate::error::Result;
use crate::rebalancer::RebalanceReport;

/// Longest uninterrupted sleep between stop checks.
const STOP_POLL: Duration = Duration::from_millis(100);

/// Cooperative stop signal. Passes check it between symbols, never in the
/// middle of an order.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    flag: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Trip `stop` on SIGINT or SIGTERM (Ctrl-C elsewhere), so a running pass
/// ends at the next symbol boundary instead of mid-order. A second signal
/// exits at once.
///
/// Returns once the handlers are installed. The listener runs on its own
/// thread with a single-threaded runtime.
pub fn stop_on_signal(stop: StopHandle) -> io::Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let (ready_tx, ready_rx) = mpsc::channel();
    thread::Builder::new()
        .name("signal-listener".into())
        .spawn(move || {
            runtime.block_on(async move {
                let mut signals = match ShutdownSignals::install() {
                    Ok(s) => {
                        let _ = ready_tx.send(Ok(()));
                        s
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let name = signals.recv().await;
                warn!("{name} received; stopping after the current order");
                stop.stop();
                let name = signals.recv().await;
                error!("{name} received again; exiting now");
                std::process::exit(130);
            });
        })?;
    ready_rx
        .recv()
        .map_err(|_| io::Error::other("signal listener exited before installing handlers"))?
}

#[cfg(unix)]
struct ShutdownSignals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        use tokio::signal::unix::{SignalKind, signal};
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    fn install() -> io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Ctrl-C listener failed: {e}");
            std::future::pending::<()>().await;
        }
        "Ctrl-C"
    }
}

/// Totals for one scheduler run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleSummary {
    pub passes: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Fires rebalance passes on a fixed interval.
pub struct Scheduler {
    interval: Duration,
    stop: StopHandle,
    max_passes: Option<u64>,
}

impl Scheduler {
    pub fn new(interval: Duration, stop: StopHandle) -> Self {
        Self {
            interval,
            stop,
            max_passes: None,
        }
    }

    /// Stop after `n` passes.
    pub fn with_max_passes(mut self, n: u64) -> Self {
        self.max_passes = Some(n);
        self
    }

    /// Run `pass` every interval until stopped, the pass limit is reached,
    /// or a pass fails fatally. Non-fatal failures are logged and the next
    /// trigger proceeds.
    pub fn run<F>(&self, mut pass: F) -> Result<ScheduleSummary>
    where
        F: FnMut(u64) -> Result<RebalanceReport>,
    {
        let mut summary = ScheduleSummary::default();
        while !self.stop.is_stopped() {
            summary.passes += 1;
            let n = summary.passes;
            match pass(n) {
                Ok(report) => {
                    summary.completed += 1;
                    info!(
                        "pass {n}: {} orders, {} filled, {} skipped",
                        report.submitted_count(),
                        report.filled_count(),
                        report.skipped.len()
                    );
                    if let Some(reason) = &report.aborted {
                        warn!("pass {n} stopped early: {reason}");
                    }
                }
                Err(e) if e.is_fatal() => {
                    error!("pass {n}: {e}; stopping");
                    return Err(e);
                }
                Err(e) => {
                    summary.failed += 1;
                    error!("pass {n} failed: {e}; waiting for next trigger");
                }
            }

            if self.max_passes.is_some_and(|max| n >= max) {
                break;
            }
            self.sleep();
        }
        Ok(summary)
    }

    /// Sleep one interval, waking early on stop.
    fn sleep(&self) {
        let deadline = Instant::now() + self.interval;
        loop {
            if self.stop.is_stopped() {
                return;
            }
            let now = Instant::now();
            if now >= deadline {
                return;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }
}
