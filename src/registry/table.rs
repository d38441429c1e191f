use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::registry::job::{Hyperparameters, Job, JobState};
use crate::store::artifact::ArtifactId;

const DEFAULT_MAX_JOBS: usize = 10_000;

/// Fields applied together with a state transition.
#[derive(Debug, Default)]
pub struct TransitionUpdate {
    pub artifact_id: Option<ArtifactId>,
    pub error: Option<String>,
}

impl TransitionUpdate {
    pub fn with_artifact(artifact_id: ArtifactId) -> Self {
        Self {
            artifact_id: Some(artifact_id),
            ..Default::default()
        }
    }

    pub fn with_error(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

/// Table of job records keyed by job ID.
///
/// All mutators take `&mut self`; callers share the registry behind
/// `Arc<RwLock<_>>` so each mutation is a single short critical section and
/// two racing transitions on the same job resolve deterministically: one
/// wins, the other observes `InvalidTransition`.
#[derive(Debug)]
pub struct JobRegistry {
    jobs: HashMap<Uuid, Job>,
    max_jobs: usize,
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: HashMap::new(),
            max_jobs,
        }
    }

    /// Insert a fresh Pending record and return its ID. IDs are generated
    /// per submission and never reused.
    pub fn create(&mut self, hyperparameters: Hyperparameters) -> Result<Uuid> {
        if self.jobs.len() >= self.max_jobs {
            return Err(DispatchError::Capacity);
        }
        let job = Job::new(hyperparameters);
        let id = job.id;
        self.jobs.insert(id, job);
        Ok(id)
    }

    pub fn get(&self, id: &Uuid) -> Option<&Job> {
        self.jobs.get(id)
    }

    /// Compare-and-set state transition.
    ///
    /// Fails with `InvalidTransition` unless the job's current state is one
    /// of `expected_from`. `started_at` is stamped on entry to Running and
    /// `finished_at` on entry to any terminal state; `artifact_id` and
    /// `error` are applied from the update.
    pub fn transition(
        &mut self,
        id: &Uuid,
        expected_from: &[JobState],
        to: JobState,
        update: TransitionUpdate,
    ) -> Result<()> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or(DispatchError::JobNotFound(*id))?;

        // Terminal states admit no exit, whatever the caller expected.
        if job.state.is_terminal() || !expected_from.contains(&job.state) {
            return Err(DispatchError::InvalidTransition {
                job_id: *id,
                from: job.state,
                to,
            });
        }

        let from = job.state;
        job.state = to;
        if to == JobState::Running && job.started_at.is_none() {
            job.started_at = Some(Utc::now());
        }
        if to.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        if let Some(artifact_id) = update.artifact_id {
            job.artifact_id = Some(artifact_id);
        }
        if let Some(error) = update.error {
            job.error = Some(error);
        }

        tracing::debug!(job_id = %id, %from, %to, "Job transitioned");
        Ok(())
    }

    /// Increment the job's dispatch attempt counter and return the new value.
    pub fn record_attempt(&mut self, id: &Uuid) -> Result<u32> {
        let job = self
            .jobs
            .get_mut(id)
            .ok_or(DispatchError::JobNotFound(*id))?;
        job.attempt_count += 1;
        Ok(job.attempt_count)
    }

    /// Jobs currently in the given state.
    pub fn jobs_in_state(&self, state: JobState) -> Vec<&Job> {
        self.jobs.values().filter(|j| j.state == state).collect()
    }

    /// All jobs sorted chronologically by submission time.
    pub fn all_jobs(&self) -> Vec<&Job> {
        let mut jobs: Vec<&Job> = self.jobs.values().collect();
        jobs.sort_by_key(|j| j.submitted_at);
        jobs
    }

    /// Drop terminal records to reclaim capacity. Returns how many were
    /// removed.
    pub fn evict_terminal(&mut self) -> usize {
        let before = self.jobs.len();
        self.jobs.retain(|_, job| !job.state.is_terminal());
        before - self.jobs.len()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}
