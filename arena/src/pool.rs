//! Fixed-size worker pool over the job store.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::io::agent::Agent;
use crate::io::config::ArenaConfig;
use crate::io::journal::LogEntry;
use crate::io::store::ClaimedJob;
use crate::worker::{WorkerContext, process_claimed};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    pub workers: usize,
    /// Fixed sleep after finding the inbox empty.
    pub idle_backoff: Duration,
    /// Exit each worker the first time it finds nothing to claim.
    pub stop_when_idle: bool,
}

impl PoolConfig {
    pub fn from_config(cfg: &ArenaConfig) -> Self {
        Self {
            workers: cfg.workers,
            idle_backoff: cfg.idle_backoff(),
            stop_when_idle: false,
        }
    }
}

/// Totals across every worker in one `run_pool` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolSummary {
    pub processed: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl PoolSummary {
    fn record(&mut self, ok: bool) {
        self.processed += 1;
        if ok {
            self.succeeded += 1;
        } else {
            self.failed += 1;
        }
    }

    fn merge(&mut self, other: PoolSummary) {
        self.processed += other.processed;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
    }
}

/// Run `config.workers` threads until `shutdown` is set (or, with
/// `stop_when_idle`, until the inbox is empty).
///
/// A job in progress when `shutdown` is set is finished first; nothing is
/// cancelled.
pub fn run_pool<A: Agent>(
    ctx: &WorkerContext<A>,
    config: &PoolConfig,
    shutdown: &AtomicBool,
) -> PoolSummary {
    let workers = config.workers.max(1);
    info!(workers, "starting worker pool");
    let summary = thread::scope(|scope| {
        let handles: Vec<_> = (0..workers)
            .filter_map(|index| {
                thread::Builder::new()
                    .name(format!("arena-worker-{index}"))
                    .spawn_scoped(scope, move || worker_loop(ctx, config, shutdown))
                    .inspect_err(|err| error!(index, "failed to spawn worker: {err}"))
                    .ok()
            })
            .collect();

        let mut summary = PoolSummary::default();
        for handle in handles {
            match handle.join() {
                Ok(worker) => summary.merge(worker),
                Err(_) => error!("worker thread panicked outside job processing"),
            }
        }
        summary
    });
    info!(
        processed = summary.processed,
        succeeded = summary.succeeded,
        failed = summary.failed,
        "worker pool stopped"
    );
    summary
}

fn worker_loop<A: Agent>(
    ctx: &WorkerContext<A>,
    config: &PoolConfig,
    shutdown: &AtomicBool,
) -> PoolSummary {
    let mut summary = PoolSummary::default();
    while !shutdown.load(Ordering::Relaxed) {
        let claimed = match ctx.store.claim() {
            Ok(Some(claimed)) => claimed,
            Ok(None) if config.stop_when_idle => break,
            Ok(None) => {
                sleep_unless_shutdown(config.idle_backoff, shutdown);
                continue;
            }
            Err(err) => {
                warn!("claim failed: {err:#}");
                if config.stop_when_idle {
                    break;
                }
                sleep_unless_shutdown(config.idle_backoff, shutdown);
                continue;
            }
        };

        let ok = match panic::catch_unwind(AssertUnwindSafe(|| process_claimed(ctx, &claimed))) {
            Ok(Ok(outcome)) => outcome.ok,
            Ok(Err(err)) => {
                force_fail(ctx, &claimed, format!("worker error: {err:#}"));
                false
            }
            Err(payload) => {
                force_fail(
                    ctx,
                    &claimed,
                    format!("worker error: panic: {}", panic_message(payload.as_ref())),
                );
                false
            }
        };
        summary.record(ok);
    }
    debug!(processed = summary.processed, "worker exiting");
    summary
}

/// Last-resort settlement after `process_claimed` gave up on a job.
fn force_fail<A: Agent>(ctx: &WorkerContext<A>, claimed: &ClaimedJob, message: String) {
    error!(job_id = %claimed.id, "{message}");
    if claimed.path.exists()
        && let Err(err) = ctx.store.finish(claimed, false)
    {
        error!(job_id = %claimed.id, "could not move job to failed: {err:#}");
    }
    let entry = LogEntry::new(&claimed.id, false).with_error(message);
    if let Err(err) = ctx.journal.append(&entry) {
        error!(job_id = %claimed.id, "could not append log entry: {err:#}");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(text) = payload.downcast_ref::<&str>() {
        (*text).to_string()
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Sleep for `duration`, waking early once `shutdown` is set.
pub(crate) fn sleep_unless_shutdown(duration: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + duration;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            return;
        }
        thread::sleep(SHUTDOWN_POLL.min(deadline - now));
    }
}
