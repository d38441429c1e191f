use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::error::{DispatchError, Result};
use crate::pool::trainer::{TrainOutcome, Trainer};
use crate::registry::job::Hyperparameters;

/// One unit of work handed to a worker.
struct Assignment {
    job_id: Uuid,
    hyperparameters: Hyperparameters,
    outcome_tx: oneshot::Sender<TrainOutcome>,
    cancel: CancellationToken,
}

/// Bookkeeping for one worker execution unit.
struct WorkerSlot {
    id: u64,
    tx: mpsc::Sender<Assignment>,
    busy: bool,
    current_job: Option<Uuid>,
    last_used: Instant,
}

struct PoolState {
    slots: Vec<WorkerSlot>,
    pending: VecDeque<Assignment>,
}

/// Handle to one in-flight dispatch attempt.
#[derive(Debug)]
pub struct ExecutionHandle {
    job_id: Uuid,
    outcome_rx: oneshot::Receiver<TrainOutcome>,
    cancel: CancellationToken,
}

impl ExecutionHandle {
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerStatus {
    pub id: u64,
    pub busy: bool,
    pub current_job: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub workers: Vec<WorkerStatus>,
    pub queued: usize,
    pub queue_depth: usize,
}

/// Fixed-size pool of workers, each running one job at a time.
pub struct WorkerPool {
    state: Mutex<PoolState>,
    queue_depth: usize,
    job_timeout: std::time::Duration,
}

impl WorkerPool {
    /// Start `config.workers` worker tasks running `trainer`.
    ///
    /// Workers hold only a weak reference back to the pool, so dropping the
    /// last `Arc` shuts the loops down.
    pub fn new(config: &PoolConfig, trainer: Arc<dyn Trainer>) -> Arc<Self> {
        let mut slots = Vec::with_capacity(config.workers);
        let mut receivers = Vec::with_capacity(config.workers);
        for id in 0..config.workers as u64 {
            let (tx, rx) = mpsc::channel(1);
            slots.push(WorkerSlot {
                id,
                tx,
                busy: false,
                current_job: None,
                last_used: Instant::now(),
            });
            receivers.push((id, rx));
        }

        let pool = Arc::new(Self {
            state: Mutex::new(PoolState {
                slots,
                pending: VecDeque::new(),
            }),
            queue_depth: config.queue_depth,
            job_timeout: config.job_timeout,
        });

        for (id, rx) in receivers {
            let weak = Arc::downgrade(&pool);
            let trainer = trainer.clone();
            tokio::spawn(worker_loop(weak, id, rx, trainer));
        }
        tracing::info!(workers = config.workers, queue_depth = config.queue_depth, "Worker pool started");

        pool
    }

    /// Hand a job to the pool. Non-blocking: the job goes to the
    /// least-recently-used idle worker, or into the bounded pending queue,
    /// or is rejected with `Overloaded`.
    ///
    /// The returned handle's cancellation scope is a child of `cancel`, so
    /// cancelling the parent abandons this attempt too.
    pub fn submit(
        &self,
        job_id: Uuid,
        hyperparameters: Hyperparameters,
        cancel: &CancellationToken,
    ) -> Result<ExecutionHandle> {
        let attempt_cancel = cancel.child_token();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let assignment = Assignment {
            job_id,
            hyperparameters,
            outcome_tx,
            cancel: attempt_cancel.clone(),
        };

        let mut state = self.state.lock();
        let idle_idx = state
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.busy)
            .min_by_key(|(_, s)| s.last_used)
            .map(|(i, _)| i);

        match idle_idx {
            Some(i) => {
                let slot = &mut state.slots[i];
                slot.busy = true;
                slot.current_job = Some(job_id);
                slot.last_used = Instant::now();
                let worker_id = slot.id;
                let tx = slot.tx.clone();
                drop(state);

                if tx.try_send(assignment).is_err() {
                    // Receiver gone: the worker task died. The dropped
                    // outcome sender surfaces as WorkerLost on await.
                    tracing::error!(worker_id, job_id = %job_id, "Worker channel closed");
                } else {
                    tracing::debug!(worker_id, job_id = %job_id, "Job assigned to idle worker");
                }
            }
            None if state.pending.len() < self.queue_depth => {
                state.pending.push_back(assignment);
                tracing::debug!(job_id = %job_id, queued = state.pending.len(), "All workers busy, job queued");
            }
            None => return Err(DispatchError::Overloaded),
        }

        Ok(ExecutionHandle {
            job_id,
            outcome_rx,
            cancel: attempt_cancel,
        })
    }

    /// Wait for the attempt behind `handle` to report, bounded by the
    /// per-job timeout. On timeout the attempt is abandoned (its token is
    /// fired so the worker frees itself) and `TimedOut` is returned.
    pub async fn await_result(&self, handle: ExecutionHandle) -> TrainOutcome {
        let ExecutionHandle {
            job_id,
            outcome_rx,
            cancel,
        } = handle;

        match tokio::time::timeout(self.job_timeout, outcome_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => {
                tracing::warn!(job_id = %job_id, "Worker dropped without reporting a result");
                TrainOutcome::WorkerLost
            }
            Err(_) => {
                cancel.cancel();
                tracing::warn!(
                    job_id = %job_id,
                    timeout_ms = self.job_timeout.as_millis() as u64,
                    "Attempt timed out, abandoning worker"
                );
                TrainOutcome::TimedOut
            }
        }
    }

    /// Called by a worker when its current attempt has reported. Hands the
    /// worker the next pending assignment, or marks it idle.
    fn finish(&self, worker_id: u64) -> Option<Assignment> {
        let mut state = self.state.lock();
        let next = state.pending.pop_front();
        if let Some(slot) = state.slots.iter_mut().find(|s| s.id == worker_id) {
            slot.last_used = Instant::now();
            match &next {
                Some(a) => slot.current_job = Some(a.job_id),
                None => {
                    slot.busy = false;
                    slot.current_job = None;
                }
            }
        }
        next
    }

    pub fn snapshot(&self) -> PoolStatus {
        let state = self.state.lock();
        PoolStatus {
            workers: state
                .slots
                .iter()
                .map(|s| WorkerStatus {
                    id: s.id,
                    busy: s.busy,
                    current_job: s.current_job,
                })
                .collect(),
            queued: state.pending.len(),
            queue_depth: self.queue_depth,
        }
    }
}

async fn worker_loop(
    pool: Weak<WorkerPool>,
    worker_id: u64,
    mut rx: mpsc::Receiver<Assignment>,
    trainer: Arc<dyn Trainer>,
) {
    while let Some(assignment) = rx.recv().await {
        let mut current = Some(assignment);
        while let Some(a) = current.take() {
            run_attempt(worker_id, a, &trainer).await;
            match pool.upgrade() {
                Some(pool) => current = pool.finish(worker_id),
                None => return,
            }
        }
    }
    tracing::debug!(worker_id, "Worker stopped");
}

/// Run one assignment to completion, cancellation, or death, and report
/// the outcome. The training future runs in its own task so a panic in the
/// trainer surfaces as `WorkerLost` instead of killing the worker loop.
async fn run_attempt(worker_id: u64, assignment: Assignment, trainer: &Arc<dyn Trainer>) {
    let Assignment {
        job_id,
        hyperparameters,
        outcome_tx,
        cancel,
    } = assignment;

    if cancel.is_cancelled() {
        let _ = outcome_tx.send(TrainOutcome::Aborted);
        return;
    }

    tracing::info!(worker_id, job_id = %job_id, "Worker executing job");
    let trainer = trainer.clone();
    let mut task = tokio::spawn(async move { trainer.train(job_id, &hyperparameters).await });

    let outcome = tokio::select! {
        _ = cancel.cancelled() => {
            task.abort();
            tracing::info!(worker_id, job_id = %job_id, "Attempt abandoned");
            TrainOutcome::Aborted
        }
        res = &mut task => match res {
            Ok(Ok(payload)) => TrainOutcome::Completed { payload },
            Ok(Err(err)) => TrainOutcome::Failed { reason: err.to_string() },
            Err(err) => {
                tracing::error!(worker_id, job_id = %job_id, error = %err, "Training task died");
                TrainOutcome::WorkerLost
            }
        }
    };

    // The awaiting side may have timed out and gone away; that is fine.
    let _ = outcome_tx.send(outcome);
}
