use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::RetryConfig;
use crate::error::{DispatchError, Result};
use crate::pool::trainer::TrainOutcome;
use crate::pool::workers::{ExecutionHandle, WorkerPool};
use crate::registry::job::{Hyperparameters, Job, JobState};
use crate::registry::table::{JobRegistry, TransitionUpdate};
use crate::store::artifact::ArtifactId;
use crate::store::disk::ArtifactStore;

/// Orchestrates the life of a job: validation, registration, dispatch,
/// retries, artifact commit, and cancellation.
///
/// One driver task is spawned per accepted job; it alone suspends on that
/// job's result and backoff delays, so unrelated submissions never wait on
/// each other. The registry and store locks are only ever held for
/// synchronous critical sections, never across a suspension.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<RwLock<JobRegistry>>,
    store: Arc<RwLock<ArtifactStore>>,
    pool: Arc<WorkerPool>,
    retry: RetryConfig,
    /// Live cancellation scopes, one per non-terminal job.
    cancellations: Arc<Mutex<HashMap<Uuid, CancellationToken>>>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<RwLock<JobRegistry>>,
        store: Arc<RwLock<ArtifactStore>>,
        pool: Arc<WorkerPool>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            registry,
            store,
            pool,
            retry,
            cancellations: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Accept a submission: validate, register, dispatch.
    ///
    /// Returns the job ID once the pool has accepted the first attempt.
    /// Invalid input fails before any record exists; an overloaded pool
    /// fails the freshly created job and surfaces `Overloaded` so the
    /// caller can retry later.
    pub async fn submit(&self, hyperparameters: Hyperparameters) -> Result<Uuid> {
        validate_hyperparameters(&hyperparameters)?;

        let job_id = self.registry.write().await.create(hyperparameters.clone())?;
        let cancel = CancellationToken::new();
        self.cancellations.lock().insert(job_id, cancel.clone());

        match self.pool.submit(job_id, hyperparameters, &cancel) {
            Ok(handle) => {
                let dispatched = {
                    let mut reg = self.registry.write().await;
                    match reg.transition(
                        &job_id,
                        &[JobState::Pending],
                        JobState::Running,
                        TransitionUpdate::default(),
                    ) {
                        Ok(()) => {
                            reg.record_attempt(&job_id)?;
                            true
                        }
                        // Lost the race to a concurrent cancel; the attempt
                        // aborts itself via the fired token.
                        Err(_) => false,
                    }
                };
                if dispatched {
                    tracing::info!(job_id = %job_id, "Job dispatched");
                    let this = self.clone();
                    tokio::spawn(async move { this.drive(job_id, handle, cancel).await });
                }
                Ok(job_id)
            }
            Err(DispatchError::Overloaded) => {
                self.cancellations.lock().remove(&job_id);
                let _ = self.registry.write().await.transition(
                    &job_id,
                    &[JobState::Pending],
                    JobState::Failed,
                    TransitionUpdate::with_error("overloaded"),
                );
                tracing::warn!(job_id = %job_id, "Worker pool overloaded, rejecting submission");
                Err(DispatchError::Overloaded)
            }
            Err(e) => {
                self.cancellations.lock().remove(&job_id);
                let _ = self.registry.write().await.transition(
                    &job_id,
                    &[JobState::Pending],
                    JobState::Failed,
                    TransitionUpdate::with_error(e.to_string()),
                );
                Err(e)
            }
        }
    }

    /// Cancel a pending or running job. Best-effort towards the worker: the
    /// attempt's token is fired, and a completion that still arrives is
    /// discarded because the job is already terminal.
    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.registry.write().await.transition(
            &job_id,
            &[JobState::Pending, JobState::Running],
            JobState::Cancelled,
            TransitionUpdate::default(),
        )?;
        if let Some(token) = self.cancellations.lock().remove(&job_id) {
            token.cancel();
        }
        tracing::info!(job_id = %job_id, "Job cancelled");
        Ok(())
    }

    /// Poll the registry until the job reaches a terminal state, bounded by
    /// `wait`. Returns the terminal snapshot.
    pub async fn wait_terminal(&self, job_id: Uuid, wait: Duration) -> Result<Job> {
        let deadline = tokio::time::Instant::now() + wait;
        let mut tick = tokio::time::interval(Duration::from_millis(25));
        loop {
            tick.tick().await;
            {
                let reg = self.registry.read().await;
                let job = reg.get(&job_id).ok_or(DispatchError::JobNotFound(job_id))?;
                if job.state.is_terminal() {
                    return Ok(job.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DispatchError::WaitTimeout);
            }
        }
    }

    /// Synchronous submission variant: dispatch and wait for the terminal
    /// state, surfacing the artifact ID on success.
    pub async fn submit_and_wait(
        &self,
        hyperparameters: Hyperparameters,
        wait: Duration,
    ) -> Result<(Uuid, ArtifactId)> {
        let job_id = self.submit(hyperparameters).await?;
        let job = self.wait_terminal(job_id, wait).await?;
        match job.state {
            JobState::Succeeded => {
                let artifact_id = job.artifact_id.ok_or_else(|| {
                    DispatchError::Internal(format!("job {job_id} succeeded without an artifact"))
                })?;
                Ok((job_id, artifact_id))
            }
            JobState::Cancelled => Err(DispatchError::Cancelled),
            _ => {
                let reason = job.error.unwrap_or_else(|| "unknown failure".to_string());
                if reason == "overloaded" {
                    Err(DispatchError::Overloaded)
                } else {
                    Err(DispatchError::Training(reason))
                }
            }
        }
    }

    /// Driver task: one per accepted job.
    async fn drive(self, job_id: Uuid, mut handle: ExecutionHandle, cancel: CancellationToken) {
        loop {
            match self.pool.await_result(handle).await {
                TrainOutcome::Completed { payload } => {
                    self.commit(job_id, payload).await;
                    break;
                }
                TrainOutcome::Failed { reason } => {
                    tracing::warn!(job_id = %job_id, error = %reason, "Job failed");
                    self.fail(job_id, reason).await;
                    break;
                }
                TrainOutcome::Aborted => {
                    tracing::debug!(job_id = %job_id, "Discarding aborted attempt");
                    break;
                }
                TrainOutcome::WorkerLost => {
                    match self.retry_or_fail(job_id, "worker lost", &cancel).await {
                        Some(next) => handle = next,
                        None => break,
                    }
                }
                TrainOutcome::TimedOut => {
                    match self.retry_or_fail(job_id, "attempt timed out", &cancel).await {
                        Some(next) => handle = next,
                        None => break,
                    }
                }
            }
        }
        self.cancellations.lock().remove(&job_id);
    }

    /// Handle a transient attempt failure: re-dispatch after backoff while
    /// the retry budget lasts, otherwise record the failure. Returns the
    /// next handle to await, or None when the driver should stop.
    async fn retry_or_fail(
        &self,
        job_id: Uuid,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Option<ExecutionHandle> {
        let (attempts, hyperparameters) = {
            let reg = self.registry.read().await;
            let job = reg.get(&job_id)?;
            (job.attempt_count, job.hyperparameters.clone())
        };

        if attempts >= self.retry.max_retries {
            tracing::warn!(job_id = %job_id, attempts, error = reason, "Retries exhausted");
            self.fail(job_id, reason).await;
            return None;
        }

        let delay = self.retry.backoff_delay(attempts);
        tracing::warn!(
            job_id = %job_id,
            attempts,
            delay_ms = delay.as_millis() as u64,
            error = reason,
            "Transient failure, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match self.pool.submit(job_id, hyperparameters, cancel) {
            Ok(next) => {
                if self.registry.write().await.record_attempt(&job_id).is_err() {
                    return None;
                }
                Some(next)
            }
            Err(DispatchError::Overloaded) => {
                tracing::warn!(job_id = %job_id, "Worker pool overloaded during retry");
                self.fail(job_id, "overloaded").await;
                None
            }
            Err(e) => {
                self.fail(job_id, e.to_string()).await;
                None
            }
        }
    }

    /// Commit a successful result: store the artifact, mark the job
    /// succeeded, then advance the latest pointer.
    ///
    /// The artifact is durable before Succeeded becomes observable, and the
    /// pointer only moves when the terminal transition was won, so a
    /// concurrently cancelled job never changes what "latest" means.
    async fn commit(&self, job_id: Uuid, payload: Vec<u8>) {
        let artifact_id = match self.store.write().await.put(job_id, &payload) {
            Ok(id) => id,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to store artifact");
                self.fail(job_id, format!("storage: {e}")).await;
                return;
            }
        };

        let won = self
            .registry
            .write()
            .await
            .transition(
                &job_id,
                &[JobState::Running],
                JobState::Succeeded,
                TransitionUpdate::with_artifact(artifact_id),
            )
            .is_ok();
        if !won {
            tracing::info!(job_id = %job_id, artifact_id, "Discarding late result for terminal job");
            return;
        }

        match self.store.write().await.advance_latest(artifact_id) {
            Ok(moved) => {
                tracing::info!(job_id = %job_id, artifact_id, latest_moved = moved, "Job succeeded")
            }
            Err(e) => {
                tracing::error!(job_id = %job_id, artifact_id, error = %e, "Failed to advance latest pointer")
            }
        }
    }

    /// Record a terminal failure, unless the job already reached a terminal
    /// state (e.g. was cancelled meanwhile).
    async fn fail(&self, job_id: Uuid, error: impl Into<String>) {
        let result = self.registry.write().await.transition(
            &job_id,
            &[JobState::Running],
            JobState::Failed,
            TransitionUpdate::with_error(error),
        );
        if let Err(e) = result {
            tracing::debug!(job_id = %job_id, error = %e, "Skipping failure transition");
        }
    }
}

/// Submission validation: non-empty mapping, non-empty keys, finite values.
fn validate_hyperparameters(hyperparameters: &Hyperparameters) -> Result<()> {
    if hyperparameters.is_empty() {
        return Err(DispatchError::Validation(
            "hyperparameters must not be empty".to_string(),
        ));
    }
    for (key, value) in hyperparameters {
        if key.trim().is_empty() {
            return Err(DispatchError::Validation(
                "hyperparameter keys must not be empty".to_string(),
            ));
        }
        if !value.is_finite() {
            return Err(DispatchError::Validation(format!(
                "hyperparameter \"{key}\" must be a finite number"
            )));
        }
    }
    Ok(())
}
