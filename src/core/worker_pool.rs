//! Worker pool running the dispatch loop on dedicated OS threads.
//!
//! Each worker calls [`Scheduler::run_once`] until it finds nothing due, then
//! blocks on the wake channel with the configured query delay as timeout.
//! `notify` nudges one sleeping worker; dropping the sender on shutdown
//! unblocks all of them at once.
//!
//! Worker 0 also runs [`Scheduler::housekeeping`] at startup and then once per
//! housekeeping interval.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::WorkQueueConfig;
use crate::core::error::SchedulerError;
use crate::core::scheduler::{DispatchOutcome, Scheduler};
use crate::core::work_item::WorkItemStatus;

/// Snapshot of pool activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    /// Number of worker threads.
    pub worker_count: usize,
    /// Items currently being processed.
    pub in_flight: usize,
    /// Passes that ran a handler.
    pub processed: u64,
    /// Passes that left the item Complete.
    pub completed: u64,
    /// Passes that left the item Failed.
    pub failed: u64,
    /// Passes declined by `can_start`.
    pub postponed: u64,
    /// Claims that lost the study lock.
    pub contention: u64,
    /// Backend errors seen by workers.
    pub errors: u64,
    /// Finished items deleted by housekeeping.
    pub purged: u64,
}

/// Thread-safe counters behind [`PoolStats`].
#[derive(Debug, Default)]
pub(crate) struct PoolCounters {
    processed: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    postponed: AtomicU64,
    contention: AtomicU64,
    errors: AtomicU64,
    purged: AtomicU64,
}

impl PoolCounters {
    fn record(&self, outcome: &DispatchOutcome) {
        match outcome {
            DispatchOutcome::NoWork => {}
            DispatchOutcome::LockContention(_) => {
                self.contention.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::Postponed(_) => {
                self.postponed.fetch_add(1, Ordering::Relaxed);
            }
            DispatchOutcome::Processed { status, .. } => {
                self.processed.fetch_add(1, Ordering::Relaxed);
                match status {
                    WorkItemStatus::Complete => {
                        self.completed.fetch_add(1, Ordering::Relaxed);
                    }
                    WorkItemStatus::Failed => {
                        self.failed.fetch_add(1, Ordering::Relaxed);
                    }
                    _ => {}
                }
            }
        }
    }

    pub(crate) fn snapshot(&self, worker_count: usize, in_flight: usize) -> PoolStats {
        PoolStats {
            worker_count,
            in_flight,
            processed: self.processed.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            postponed: self.postponed.load(Ordering::Relaxed),
            contention: self.contention.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            purged: self.purged.load(Ordering::Relaxed),
        }
    }
}

/// Pool of dispatch workers.
pub struct WorkerPool {
    scheduler: Arc<Scheduler>,
    wake_tx: Mutex<Option<Sender<()>>>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
    shutdown_timeout: Duration,
}

impl WorkerPool {
    /// Spawn `config.worker_count` threads named `wq-worker-{n}`.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::Config`] for an invalid configuration,
    /// [`SchedulerError::Backend`] if a thread cannot be spawned.
    pub fn start(scheduler: Arc<Scheduler>, config: &WorkQueueConfig) -> Result<Self, SchedulerError> {
        config.validate().map_err(SchedulerError::Config)?;

        let (wake_tx, wake_rx) = bounded::<()>(config.worker_count);
        let counters = Arc::new(PoolCounters::default());
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(config.worker_count);

        for idx in 0..config.worker_count {
            let spawned = spawn_worker(
                idx,
                Arc::clone(&scheduler),
                wake_rx.clone(),
                Arc::clone(&counters),
                Arc::clone(&shutdown),
                WorkerTiming {
                    query_delay: config.query_delay(),
                    housekeeping: (idx == 0).then(|| config.housekeeping_interval()),
                },
                config.thread_stack_size,
            );
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    shutdown.store(true, Ordering::Release);
                    drop(wake_tx);
                    return Err(SchedulerError::Backend(format!("spawn wq-worker-{idx}: {e}")));
                }
            }
        }

        info!(
            worker_count = config.worker_count,
            query_delay_ms = config.query_delay_ms,
            "work queue worker pool started"
        );

        Ok(Self {
            scheduler,
            wake_tx: Mutex::new(Some(wake_tx)),
            counters,
            shutdown,
            workers: Mutex::new(workers),
            worker_count: config.worker_count,
            shutdown_timeout: Duration::from_millis(config.shutdown_timeout_ms),
        })
    }

    /// Wake one idle worker, if any is sleeping.
    pub fn notify(&self) {
        if let Some(tx) = self.wake_tx.lock().as_ref() {
            let _ = tx.try_send(());
        }
    }

    /// Whether shutdown has begun.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Current statistics.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot(self.worker_count, self.scheduler.in_flight_count())
    }

    /// Stop all workers: trip in-flight cancellation tokens, close the wake
    /// channel and join with the configured timeout. Workers that do not exit
    /// in time are detached.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down work queue worker pool");

        self.scheduler.cancel_all();
        *self.wake_tx.lock() = None;

        let deadline = Instant::now() + self.shutdown_timeout;
        let mut workers = self.workers.lock();
        let worker_count = workers.len();
        for (idx, worker) in workers.drain(..).enumerate() {
            let (tx, rx) = mpsc::channel();
            let join_thread = thread::spawn(move || {
                let _ = tx.send(worker.join().is_ok());
            });

            match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                Ok(true) => debug!(worker_id = idx, "worker joined"),
                Ok(false) => warn!(worker_id = idx, "worker panicked"),
                Err(_) => {
                    warn!(worker_id = idx, "worker did not exit within timeout, detaching");
                    continue;
                }
            }
            let _ = join_thread.join();
        }

        info!(worker_count, "work queue worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.shutdown.swap(true, Ordering::AcqRel) {
            self.scheduler.cancel_all();
            *self.wake_tx.lock() = None;
            debug!("worker pool dropped without explicit shutdown, workers detached");
        }
    }
}

struct WorkerTiming {
    query_delay: Duration,
    /// Set for the one worker that runs housekeeping.
    housekeeping: Option<Duration>,
}

fn run_housekeeping(scheduler: &Scheduler, counters: &PoolCounters, worker_id: &str) {
    match scheduler.housekeeping() {
        Ok(purged) => {
            counters
                .purged
                .fetch_add(u64::try_from(purged).unwrap_or(u64::MAX), Ordering::Relaxed);
        }
        Err(e) => {
            counters.errors.fetch_add(1, Ordering::Relaxed);
            error!(worker_id, error = %e, "housekeeping failed");
        }
    }
}

fn spawn_worker(
    idx: usize,
    scheduler: Arc<Scheduler>,
    wake_rx: Receiver<()>,
    counters: Arc<PoolCounters>,
    shutdown: Arc<AtomicBool>,
    timing: WorkerTiming,
    stack_size: usize,
) -> std::io::Result<JoinHandle<()>> {
    let name = format!("wq-worker-{idx}");
    thread::Builder::new()
        .name(name.clone())
        .stack_size(stack_size)
        .spawn(move || {
            debug!(worker_id = %name, "worker started");
            let mut next_housekeeping = Instant::now();
            while !shutdown.load(Ordering::Acquire) {
                if let Some(interval) = timing.housekeeping {
                    if Instant::now() >= next_housekeeping {
                        run_housekeeping(&scheduler, &counters, &name);
                        next_housekeeping = Instant::now() + interval;
                    }
                }
                let idle = match scheduler.run_once(&name) {
                    Ok(outcome) => {
                        counters.record(&outcome);
                        outcome == DispatchOutcome::NoWork
                    }
                    Err(e) => {
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                        error!(worker_id = %name, error = %e, "dispatch pass failed");
                        true
                    }
                };
                if !idle {
                    continue;
                }
                match wake_rx.recv_timeout(timing.query_delay) {
                    Ok(()) | Err(RecvTimeoutError::Timeout) => {}
                    Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!(worker_id = %name, "worker exiting");
        })
}
