//! The dispatch loop and the in-process worker pool.
//!
//! Each worker repeats: promote due retries, claim one pending job, run it,
//! apply the outcome, save. Workers share nothing but the store; shutdown is
//! observed between iterations, so a running command always finishes (or
//! times out) before its worker exits.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use queuectl_core::Transition;

use super::executor::CommandExecutor;
use super::queue::{ProcessedJob, QueueError, QueueService};
use super::store::JobStore;

/// Pool-wide dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatchStats {
    pub processed: u64,
    pub succeeded: u64,
    /// Failures that were scheduled for retry.
    pub failed: u64,
    pub dead_lettered: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Counters {
    fn record(&self, transition: &Transition) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let bucket = match transition {
            Transition::Completed => &self.succeeded,
            Transition::Retrying { .. } => &self.failed,
            Transition::DeadLettered => &self.dead_lettered,
        };
        bucket.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            processed: self.processed.load(Ordering::Relaxed),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
        }
    }
}

/// One worker's dispatch loop.
pub struct Dispatcher<S, E: ?Sized> {
    name: String,
    queue: Arc<QueueService<S>>,
    executor: Arc<E>,
    counters: Arc<Counters>,
}

impl<S, E> Dispatcher<S, E>
where
    S: JobStore,
    E: CommandExecutor + ?Sized,
{
    pub fn new(name: impl Into<String>, queue: Arc<QueueService<S>>, executor: Arc<E>) -> Self {
        Self {
            name: name.into(),
            queue,
            executor,
            counters: Arc::new(Counters::default()),
        }
    }

    fn with_counters(mut self, counters: Arc<Counters>) -> Self {
        self.counters = counters;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// One iteration of the loop. `Ok(None)` means there was nothing to claim.
    ///
    /// Promotion errors are logged and do not stop the claim.
    pub async fn run_once(&self) -> Result<Option<ProcessedJob>, QueueError> {
        if let Err(e) = self.queue.promote_due().await {
            warn!(worker = %self.name, error = %e, "failed to promote retryable jobs");
        }

        let Some(job) = self.queue.claim_next().await? else {
            return Ok(None);
        };
        debug!(
            worker = %self.name,
            job_id = %job.id,
            attempts = job.attempts,
            "claimed job"
        );

        let started = Instant::now();
        let result = self
            .executor
            .execute(&job.command, self.queue.config().command_timeout())
            .await;
        debug!(
            worker = %self.name,
            job_id = %job.id,
            success = result.is_success(),
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "command finished"
        );

        let processed = self.queue.complete_attempt(job, &result).await?;
        self.counters.record(&processed.transition);
        Ok(Some(processed))
    }

    /// Run until `shutdown` flips to `true` or its sender is dropped.
    ///
    /// Sleeps for the poll interval whenever there was nothing to do or the
    /// store failed; the sleep is cut short by shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker = %self.name, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(worker = %self.name, error = %e, "dispatch iteration failed");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.queue.config().poll_interval()) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }

        let stats = self.stats();
        info!(
            worker = %self.name,
            processed = stats.processed,
            "worker stopped"
        );
    }
}

/// A set of dispatch loops running as tokio tasks over one shared queue.
#[derive(Debug)]
pub struct WorkerPool {
    shutdown: watch::Sender<bool>,
    workers: Vec<(String, JoinHandle<()>)>,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Spawn `count` workers named `worker-1` .. `worker-N`. Must be called
    /// inside a tokio runtime.
    pub fn spawn<S, E>(count: usize, queue: Arc<QueueService<S>>, executor: Arc<E>) -> Self
    where
        S: JobStore + 'static,
        E: CommandExecutor + ?Sized + 'static,
    {
        let (shutdown, rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let workers = (1..=count)
            .map(|n| {
                let name = format!("worker-{n}");
                let dispatcher = Dispatcher::new(name.clone(), queue.clone(), executor.clone())
                    .with_counters(counters.clone());
                let handle = tokio::spawn(dispatcher.run(rx.clone()));
                (name, handle)
            })
            .collect::<Vec<_>>();

        info!(count = workers.len(), "worker pool started");
        Self {
            shutdown,
            workers,
            counters,
        }
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    pub fn stats(&self) -> DispatchStats {
        self.counters.snapshot()
    }

    /// Signal every worker and wait for them to finish their current job.
    pub async fn shutdown(self) -> DispatchStats {
        // Receivers are alive until their tasks exit, so this cannot fail
        // while any worker is still running.
        let _ = self.shutdown.send(true);

        for (name, handle) in self.workers {
            if let Err(e) = handle.await {
                error!(worker = %name, error = %e, "worker task panicked");
            }
        }

        let stats = self.counters.snapshot();
        info!(
            processed = stats.processed,
            succeeded = stats.succeeded,
            failed = stats.failed,
            dead_lettered = stats.dead_lettered,
            "worker pool stopped"
        );
        stats
    }
}
