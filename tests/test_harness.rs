//! Shared helpers for end-to-end dispatcher and API tests.
//!
//! Provides a scripted fake trainer and builders for a fully wired service
//! backed by a temporary artifact directory.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::RwLock;
use uuid::Uuid;

use trainyard::config::{PoolConfig, RetryConfig};
use trainyard::dispatcher::Dispatcher;
use trainyard::pool::trainer::{TrainError, Trainer};
use trainyard::pool::WorkerPool;
use trainyard::registry::{Hyperparameters, JobRegistry, JobState};
use trainyard::store::ArtifactStore;

/// Payload the fake trainer produces once its script is exhausted.
pub const DEFAULT_PAYLOAD: &[u8] = b"model-payload";

/// One scripted behavior for the fake trainer.
#[allow(dead_code)]
pub enum Step {
    /// Return this payload.
    Succeed(Vec<u8>),
    /// Report a semantic training failure.
    FailSemantic(&'static str),
    /// Panic, simulating a crashed worker.
    Panic,
    /// Never return, exercising timeouts and cancellation.
    Hang,
    /// Succeed with this payload after a delay.
    Sleep(Duration, Vec<u8>),
}

/// Trainer that pops scripted steps in FIFO order and succeeds with
/// [`DEFAULT_PAYLOAD`] once the script runs dry.
pub struct FakeTrainer {
    script: Mutex<VecDeque<Step>>,
}

impl FakeTrainer {
    pub fn new(steps: Vec<Step>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(steps.into()),
        })
    }
}

#[async_trait]
impl Trainer for FakeTrainer {
    async fn train(
        &self,
        _job_id: Uuid,
        _hyperparameters: &Hyperparameters,
    ) -> Result<Vec<u8>, TrainError> {
        let step = self.script.lock().pop_front();
        match step {
            None => Ok(DEFAULT_PAYLOAD.to_vec()),
            Some(Step::Succeed(payload)) => Ok(payload),
            Some(Step::FailSemantic(reason)) => Err(TrainError(reason.to_string())),
            Some(Step::Panic) => panic!("scripted worker crash"),
            Some(Step::Hang) => std::future::pending().await,
            Some(Step::Sleep(delay, payload)) => {
                tokio::time::sleep(delay).await;
                Ok(payload)
            }
        }
    }
}

/// A fully wired service over a temporary artifact directory.
pub struct TestService {
    pub dispatcher: Dispatcher,
    pub registry: Arc<RwLock<JobRegistry>>,
    pub store: Arc<RwLock<ArtifactStore>>,
    pub pool: Arc<WorkerPool>,
    // Held so the artifact directory outlives the test.
    #[allow(dead_code)]
    pub dir: tempfile::TempDir,
}

/// Retry policy with zero backoff for fast tests.
#[allow(dead_code)]
pub fn fast_retry(max_retries: u32) -> RetryConfig {
    RetryConfig {
        max_retries,
        backoff_base_ms: 0,
        backoff_factor: 2,
        backoff_cap_ms: 0,
    }
}

#[allow(dead_code)]
pub fn small_pool(workers: usize, queue_depth: usize, job_timeout: Duration) -> PoolConfig {
    PoolConfig {
        workers,
        queue_depth,
        job_timeout,
    }
}

#[allow(dead_code)]
pub fn build_service(
    pool_config: PoolConfig,
    retry: RetryConfig,
    trainer: Arc<dyn Trainer>,
) -> TestService {
    let dir = tempfile::tempdir().expect("failed to create temp dir");
    let registry = Arc::new(RwLock::new(JobRegistry::new()));
    let store = Arc::new(RwLock::new(
        ArtifactStore::open(dir.path()).expect("failed to open artifact store"),
    ));
    let pool = WorkerPool::new(&pool_config, trainer);
    let dispatcher = Dispatcher::new(registry.clone(), store.clone(), pool.clone(), retry);
    TestService {
        dispatcher,
        registry,
        store,
        pool,
        dir,
    }
}

#[allow(dead_code)]
pub fn hp(pairs: &[(&str, f64)]) -> Hyperparameters {
    pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
}

/// Poll the registry until the job reaches `state`, panicking after `within`.
#[allow(dead_code)]
pub async fn wait_for_state(
    registry: &Arc<RwLock<JobRegistry>>,
    job_id: &Uuid,
    state: JobState,
    within: Duration,
) {
    let deadline = tokio::time::Instant::now() + within;
    loop {
        {
            let reg = registry.read().await;
            if let Some(job) = reg.get(job_id) {
                if job.state == state {
                    return;
                }
                assert!(
                    !job.state.is_terminal(),
                    "job {job_id} reached terminal state {} while waiting for {state}",
                    job.state
                );
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "job {job_id} did not reach {state} within {within:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
