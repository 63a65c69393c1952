//! Worker dispatch
//!
//! Two bounded pools: `interactive` for realtime and interactive events,
//! `default` for the rest. Each pool is a bounded queue drained by a fixed
//! number of workers; a worker runs one action at a time on tokio's blocking
//! thread pool, so a slow action never stalls the poll loop, the timer task
//! or bus delivery.
//!
//! Overflow policy is drop-and-report: [`WorkerDispatch::submit`] never
//! blocks, and a fire that finds its queue full is dropped and surfaces as
//! [`EngineError::DispatchOverflow`].

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use evt_core::{Clock, PoolClass, SharedClock};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::WorkersConfig;
use crate::error::{EngineError, EngineResult};
use crate::event::{ActionContext, Event, RunRecord};
use crate::report::ErrorReporter;

/// One action run waiting for a worker
pub(crate) struct Job {
    pub event: Arc<Event>,
    pub ctx: ActionContext,
}

/// Runs jobs and records their outcome
pub(crate) struct JobRunner {
    clock: SharedClock,
    reporter: Arc<ErrorReporter>,
    history_to_keep: usize,
}

impl JobRunner {
    pub fn new(clock: SharedClock, reporter: Arc<ErrorReporter>, history_to_keep: usize) -> Self {
        Self {
            clock,
            reporter,
            history_to_keep,
        }
    }

    /// Run a job to completion; action panics become [`EngineError::ActionPanicked`]
    pub fn run(&self, job: Job) {
        let Job { event, mut ctx } = job;
        let started = self.clock.now();
        trace!(event = %event.id(), "Running action");

        let result = match catch_unwind(AssertUnwindSafe(|| event.action().run(&mut ctx))) {
            Ok(result) => result,
            Err(panic) => Err(EngineError::ActionPanicked {
                event: event.id().clone(),
                message: panic_message(panic.as_ref()),
            }),
        };

        let completed = self.clock.now();
        {
            let mut rt = event.runtime();
            rt.running = rt.running.saturating_sub(1);
            rt.push_run(
                RunRecord {
                    started,
                    completed,
                    ok: result.is_ok(),
                },
                self.history_to_keep,
            );
        }

        match result {
            Ok(()) => debug!(event = %event.id(), "Action completed"),
            Err(e) => self.reporter.report(&event, &e),
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct Pool {
    class: PoolClass,
    workers: usize,
    tx: mpsc::Sender<Job>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

impl Pool {
    fn new(class: PoolClass, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            class,
            workers,
            tx,
            rx: Arc::new(Mutex::new(rx)),
        }
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    fn saturation(&self) -> f64 {
        self.queued() as f64 / self.tx.max_capacity() as f64
    }
}

/// Priority-segregated bounded worker pools
pub struct WorkerDispatch {
    interactive: Pool,
    default: Pool,
    runner: Arc<JobRunner>,
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl WorkerDispatch {
    pub(crate) fn new(config: &WorkersConfig, runner: Arc<JobRunner>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            interactive: Pool::new(
                PoolClass::Interactive,
                config.interactive,
                config.queue_capacity,
            ),
            default: Pool::new(PoolClass::Default, config.default, config.queue_capacity),
            runner,
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
        }
    }

    fn pool(&self, class: PoolClass) -> &Pool {
        match class {
            PoolClass::Interactive => &self.interactive,
            PoolClass::Default => &self.default,
        }
    }

    /// Spawn the workers; must be called from within a tokio runtime
    pub fn start(&self) -> Vec<JoinHandle<()>> {
        if self.started.swap(true, Ordering::SeqCst) {
            warn!("Worker dispatch already started");
            return Vec::new();
        }

        let mut handles = Vec::new();
        for pool in [&self.interactive, &self.default] {
            info!(pool = ?pool.class, workers = pool.workers, "Starting worker pool");
            for index in 0..pool.workers {
                handles.push(tokio::spawn(worker(
                    pool.class,
                    index,
                    pool.rx.clone(),
                    self.runner.clone(),
                    self.shutdown_tx.subscribe(),
                )));
            }
        }
        handles
    }

    /// Stop taking new work; running actions finish, queued ones are dropped
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping worker dispatch");
        let _ = self.shutdown_tx.send(());
    }

    /// Enqueue an action run without blocking
    pub(crate) fn submit(&self, job: Job) -> EngineResult<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::Shutdown);
        }
        let class = job.event.options().priority.pool();
        let pool = self.pool(class);
        match pool.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(job)) => Err(EngineError::DispatchOverflow {
                event: job.event.id().clone(),
                pool: class,
            }),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(EngineError::Shutdown),
        }
    }

    /// Jobs waiting in a pool's queue
    pub fn queued(&self, class: PoolClass) -> usize {
        self.pool(class).queued()
    }

    /// Highest queue occupancy across pools, from 0 to 1
    pub fn saturation(&self) -> f64 {
        self.interactive.saturation().max(self.default.saturation())
    }
}

async fn worker(
    class: PoolClass,
    index: usize,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    runner: Arc<JobRunner>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    trace!(pool = ?class, index, "Worker started");
    loop {
        let job = tokio::select! {
            job = async { rx.lock().await.recv().await } => job,
            _ = shutdown_rx.recv() => break,
        };
        let Some(job) = job else {
            break;
        };

        let event = job.event.clone();
        let job_runner = runner.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || job_runner.run(job)).await {
            if e.is_panic() {
                let err = EngineError::ActionPanicked {
                    event: event.id().clone(),
                    message: panic_message(e.into_panic().as_ref()),
                };
                runner.reporter.report(&event, &err);
            } else {
                debug!(event = %event.id(), "Action cancelled by runtime shutdown");
            }
        }
    }
    trace!(pool = ?class, index, "Worker stopped");
}
