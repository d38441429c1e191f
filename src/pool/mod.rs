//! Worker pool for running training jobs.
//!
//! A fixed set of worker execution units, each running one job at a time:
//! - **Submission**: non-blocking, routed to the least-recently-used idle
//!   worker, queued up to a bounded depth when all workers are busy, and
//!   rejected beyond that.
//! - **Results**: awaited per job through an [`ExecutionHandle`], bounded by
//!   a per-attempt timeout.
//! - **Cancellation**: each attempt carries a cancellation token; a fired
//!   token makes the worker abandon the attempt and free itself.
//!
//! The training computation itself is behind the [`Trainer`] seam; the pool
//! makes no assumptions about it beyond hyperparameters in, payload out.

pub mod trainer;
pub mod workers;

pub use trainer::{LocalTrainer, TrainOutcome, Trainer};
pub use workers::{ExecutionHandle, PoolStatus, WorkerPool};
