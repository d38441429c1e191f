pub mod job;
pub mod table;

pub use job::{Hyperparameters, Job, JobState};
pub use table::{JobRegistry, TransitionUpdate};
