//! Durable, version-addressed storage of training artifacts.
//!
//! Artifacts are write-once: each successful job produces one payload stored
//! under a monotonically increasing ID, with a single mutable pointer
//! designating the latest artifact. The pointer only moves forward in
//! completion-time order, so a late-finishing older job can never shadow a
//! newer result.

pub mod artifact;
pub mod disk;

pub use artifact::{Artifact, ArtifactId};
pub use disk::ArtifactStore;
