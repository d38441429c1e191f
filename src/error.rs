use thiserror::Error;
use uuid::Uuid;

use crate::registry::job::JobState;
use crate::store::artifact::ArtifactId;

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Invalid submission: {0}")]
    Validation(String),

    #[error("Worker pool is at capacity")]
    Overloaded,

    #[error("Job registry is at capacity")]
    Capacity,

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(ArtifactId),

    #[error("Invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Training failed: {0}")]
    Training(String),

    #[error("Job was cancelled")]
    Cancelled,

    #[error("Timed out waiting for job completion")]
    WaitTimeout,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        DispatchError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DispatchError>;
