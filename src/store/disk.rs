use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use uuid::Uuid;

use crate::error::{DispatchError, Result};
use crate::store::artifact::{Artifact, ArtifactId};

const LATEST_FILE: &str = "LATEST";

/// Filesystem-backed artifact store.
///
/// Each artifact is a payload file plus a JSON metadata sidecar; the sidecar
/// is written after the payload, so the presence of a sidecar implies the
/// payload is durable. The latest pointer is a separate file updated via
/// temp-file rename. The in-memory index is rebuilt by scanning the
/// directory on open.
///
/// Mutators take `&mut self`; callers share the store behind
/// `Arc<RwLock<_>>`, which makes `put` + pointer reads atomic with respect
/// to each other: a reader never observes a pointer to an artifact that is
/// not yet durable.
#[derive(Debug)]
pub struct ArtifactStore {
    dir: PathBuf,
    index: HashMap<ArtifactId, Artifact>,
    by_job: HashMap<Uuid, ArtifactId>,
    latest: Option<ArtifactId>,
    next_id: ArtifactId,
}

impl ArtifactStore {
    /// Open the store at `dir`, creating the directory if needed and
    /// rebuilding the index from existing sidecars.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut index = HashMap::new();
        let mut by_job = HashMap::new();
        let mut next_id: ArtifactId = 1;

        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !name.starts_with("artifact-") || !name.ends_with(".json") {
                continue;
            }
            let meta: Artifact = serde_json::from_slice(&fs::read(&path)?)?;
            next_id = next_id.max(meta.id + 1);
            by_job.insert(meta.job_id, meta.id);
            index.insert(meta.id, meta);
        }

        let latest = Self::read_latest_pointer(&dir, &index);

        tracing::info!(
            dir = %dir.display(),
            artifacts = index.len(),
            latest = ?latest,
            "Artifact store opened"
        );

        Ok(Self {
            dir,
            index,
            by_job,
            latest,
            next_id,
        })
    }

    fn read_latest_pointer(
        dir: &Path,
        index: &HashMap<ArtifactId, Artifact>,
    ) -> Option<ArtifactId> {
        let raw = fs::read_to_string(dir.join(LATEST_FILE)).ok()?;
        let id: ArtifactId = raw.trim().parse().ok()?;
        if index.contains_key(&id) {
            Some(id)
        } else {
            tracing::warn!(artifact_id = id, "Latest pointer refers to a missing artifact, ignoring");
            None
        }
    }

    /// Store a payload for the given job and return the assigned artifact ID.
    ///
    /// Idempotent per job: a second call for the same `job_id` returns the
    /// already assigned ID without writing anything.
    pub fn put(&mut self, job_id: Uuid, payload: &[u8]) -> Result<ArtifactId> {
        if let Some(&existing) = self.by_job.get(&job_id) {
            tracing::debug!(job_id = %job_id, artifact_id = existing, "Duplicate put, returning existing artifact");
            return Ok(existing);
        }

        let id = self.next_id;
        let meta = Artifact {
            id,
            job_id,
            created_at: Utc::now(),
            size: payload.len() as u64,
        };

        // Payload first, then the sidecar that makes it visible.
        fs::write(self.dir.join(Artifact::payload_file(id)), payload)?;
        fs::write(
            self.dir.join(Artifact::meta_file(id)),
            serde_json::to_vec_pretty(&meta)?,
        )?;

        self.next_id += 1;
        self.by_job.insert(job_id, id);
        self.index.insert(id, meta);

        tracing::info!(job_id = %job_id, artifact_id = id, size = payload.len(), "Artifact stored");
        Ok(id)
    }

    /// Read an artifact's payload.
    pub fn get(&self, id: ArtifactId) -> Result<Vec<u8>> {
        if !self.index.contains_key(&id) {
            return Err(DispatchError::ArtifactNotFound(id));
        }
        Ok(fs::read(self.dir.join(Artifact::payload_file(id)))?)
    }

    pub fn meta(&self, id: ArtifactId) -> Option<&Artifact> {
        self.index.get(&id)
    }

    /// Metadata of the artifact the latest pointer designates, if any.
    pub fn latest(&self) -> Option<&Artifact> {
        self.latest.and_then(|id| self.index.get(&id))
    }

    /// Move the latest pointer to `id`, unless the current target is newer.
    ///
    /// Ordering is by creation time, ties broken by ID, so out-of-order
    /// completions never regress the pointer. Returns whether the pointer
    /// moved.
    pub fn advance_latest(&mut self, id: ArtifactId) -> Result<bool> {
        let candidate = self
            .index
            .get(&id)
            .ok_or(DispatchError::ArtifactNotFound(id))?;

        if let Some(current) = self.latest.and_then(|cur| self.index.get(&cur)) {
            if (candidate.created_at, candidate.id) <= (current.created_at, current.id) {
                tracing::debug!(
                    artifact_id = id,
                    current = current.id,
                    "Latest pointer not advanced, current artifact is newer"
                );
                return Ok(false);
            }
        }

        // Durable before visible: temp file + rename.
        let tmp = self.dir.join(format!("{LATEST_FILE}.tmp"));
        fs::write(&tmp, id.to_string())?;
        fs::rename(&tmp, self.dir.join(LATEST_FILE))?;

        self.latest = Some(id);
        tracing::info!(artifact_id = id, "Latest pointer advanced");
        Ok(true)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
