//! # Worker Pool
//!
//! A fixed set of worker tasks pulling plugin executions from a bounded ready
//! queue. Submitting waits while the queue is full, which pushes back on the
//! shard runners. Every execution goes through the [`Sandbox`], so a slow or
//! crashing plugin costs one worker for at most its timeout.

use crate::error::{ScanError, ScanResult};
use crate::models::{ExecutionError, ExecutionErrorKind};
use crate::registry::{CheckContext, CheckOutcome, LoadedPlugin, Sandbox, SandboxLimits};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Result of one execution as seen by its submitter
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    pub result: Result<CheckOutcome, ExecutionError>,
    pub duration: Duration,
}

impl ExecutionOutcome {
    fn cancelled(message: &str) -> Self {
        Self {
            result: Err(ExecutionError::new(ExecutionErrorKind::Cancelled, message)),
            duration: Duration::ZERO,
        }
    }
}

struct Job {
    plugin: Arc<LoadedPlugin>,
    ctx: CheckContext,
    limits: SandboxLimits,
    reply: oneshot::Sender<ExecutionOutcome>,
}

/// Pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    pub workers: usize,
    pub active: usize,
    pub completed: u64,
}

pub struct WorkerPool {
    sender: mpsc::Sender<Job>,
    workers: usize,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
    shutdown: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("workers", &self.workers)
            .field("active", &self.active.load(Ordering::Relaxed))
            .finish()
    }
}

impl WorkerPool {
    /// Spawn `workers` worker tasks sharing a ready queue of `queue_capacity`
    pub fn start(workers: usize, queue_capacity: usize, sandbox: Arc<dyn Sandbox>) -> Self {
        let workers = workers.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(queue_capacity.max(1));
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let active = Arc::new(AtomicUsize::new(0));
        let completed = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let handles = (0..workers)
            .map(|worker_id| {
                tokio::spawn(worker_loop(
                    worker_id,
                    receiver.clone(),
                    sandbox.clone(),
                    active.clone(),
                    completed.clone(),
                    shutdown.clone(),
                ))
            })
            .collect();

        info!(workers = workers, queue_capacity = queue_capacity, "🚀 Worker pool started");

        Self {
            sender,
            workers,
            active,
            completed,
            shutdown,
            handles: Mutex::new(handles),
        }
    }

    /// Queue an execution and wait for its outcome
    pub async fn execute(
        &self,
        plugin: Arc<LoadedPlugin>,
        ctx: CheckContext,
        limits: SandboxLimits,
    ) -> ScanResult<ExecutionOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.sender
            .send(Job {
                plugin,
                ctx,
                limits,
                reply,
            })
            .await
            .map_err(|_| ScanError::internal("worker pool is shut down"))?;

        Ok(outcome
            .await
            .unwrap_or_else(|_| ExecutionOutcome::cancelled("worker pool shut down before execution")))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.workers,
            active: self.active.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    /// Stop the workers. Executions already running are dropped at their next
    /// await point; queued ones resolve as cancelled.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handles = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "Worker task ended abnormally");
            }
        }
        info!(completed = self.completed.load(Ordering::Relaxed), "🛑 Worker pool stopped");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    sandbox: Arc<dyn Sandbox>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = async { receiver.lock().await.recv().await } => match job {
                Some(job) => job,
                None => break,
            },
        };

        active.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = tokio::select! {
            _ = shutdown.cancelled() => {
                Err(ExecutionError::new(ExecutionErrorKind::Cancelled, "worker pool shutting down"))
            }
            result = sandbox.execute(&job.plugin, job.ctx, &job.limits) => result,
        };
        active.fetch_sub(1, Ordering::Relaxed);
        completed.fetch_add(1, Ordering::Relaxed);

        // The submitter may have gone away; the result is simply discarded then
        let _ = job.reply.send(ExecutionOutcome {
            result,
            duration: started.elapsed(),
        });
    }
    debug!(worker_id = worker_id, "Worker exiting");
}
