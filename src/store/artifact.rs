use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Monotonically increasing artifact version number.
pub type ArtifactId = u64;

/// Metadata for one stored artifact. The payload itself lives on disk next
/// to this record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: ArtifactId,
    /// The job whose completion produced this artifact.
    pub job_id: Uuid,
    pub created_at: DateTime<Utc>,
    /// Payload size in bytes.
    pub size: u64,
}

impl Artifact {
    /// File name of the payload on disk.
    pub fn payload_file(id: ArtifactId) -> String {
        format!("artifact-{id:06}.bin")
    }

    /// File name of the metadata sidecar on disk.
    pub fn meta_file(id: ArtifactId) -> String {
        format!("artifact-{id:06}.json")
    }
}
