use std::collections::HashMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::runtime::types::{ArtifactKind, JobId};

const TRASH_DIR: &str = ".trash";

/// Pointer to a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub job_id: JobId,
    pub kind: ArtifactKind,
    /// Store-specific location (a path for [`FsArtifactStore`]).
    pub location: String,
    pub size_bytes: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("artifact '{kind}' not found for job {job_id}")]
    NotFound { job_id: JobId, kind: ArtifactKind },

    #[error("artifact I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed artifact '{kind}' for job {job_id}: {reason}")]
    Malformed {
        job_id: JobId,
        kind: ArtifactKind,
        reason: String,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Per-job artifact persistence.
///
/// Every job owns one slot per [`ArtifactKind`]; `put` replaces the slot
/// atomically, so a concurrent reader sees either the previous or the new
/// content, never a partial write.
#[async_trait]
pub trait ArtifactStore: Send + Sync + std::fmt::Debug {
    async fn put(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
        bytes: Bytes,
    ) -> Result<ArtifactRef, StorageError>;

    async fn get(&self, job_id: JobId, kind: ArtifactKind) -> Result<Bytes, StorageError>;

    async fn describe(&self, job_id: JobId, kind: ArtifactKind)
    -> Result<ArtifactRef, StorageError>;

    async fn exists(&self, job_id: JobId, kind: ArtifactKind) -> Result<bool, StorageError> {
        match self.describe(job_id, kind).await {
            Ok(_) => Ok(true),
            Err(StorageError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Remove every artifact of `job_id`. Deleting an unknown job is a no-op.
    async fn delete_job(&self, job_id: JobId) -> Result<(), StorageError>;
}

// ── Filesystem store ─────────────────────────────────────────────────────────

/// Stores artifacts as `<root>/<job_id>/<file name>`.
#[derive(Debug)]
pub struct FsArtifactStore {
    root: PathBuf,
    seq: AtomicU64,
}

impl FsArtifactStore {
    /// Open (and create) the store rooted at `root`, purging leftovers of
    /// interrupted deletions.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| StorageError::io(&root, e))?;

        let trash = root.join(TRASH_DIR);
        match tokio::fs::remove_dir_all(&trash).await {
            Ok(()) => debug!(path = %trash.display(), "purged artifact trash"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io(&trash, e)),
        }

        Ok(Self {
            root,
            seq: AtomicU64::new(0),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn job_dir(&self, job_id: JobId) -> PathBuf {
        self.root.join(job_id.to_string())
    }

    fn path(&self, job_id: JobId, kind: ArtifactKind) -> PathBuf {
        self.job_dir(job_id).join(kind.file_name())
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn artifact_ref(&self, job_id: JobId, kind: ArtifactKind, size_bytes: u64) -> ArtifactRef {
        ArtifactRef {
            job_id,
            kind,
            location: self.path(job_id, kind).display().to_string(),
            size_bytes,
        }
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
        bytes: Bytes,
    ) -> Result<ArtifactRef, StorageError> {
        let dir = self.job_dir(job_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| StorageError::io(&dir, e))?;

        let tmp = dir.join(format!(".{}.{}.tmp", kind.file_name(), self.next_seq()));
        let target = self.path(job_id, kind);
        if let Err(e) = tokio::fs::write(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(StorageError::io(&tmp, e));
        }
        tokio::fs::rename(&tmp, &target)
            .await
            .map_err(|e| StorageError::io(&target, e))?;

        debug!(%job_id, %kind, size = bytes.len(), "artifact written");
        Ok(self.artifact_ref(job_id, kind, bytes.len() as u64))
    }

    async fn get(&self, job_id: JobId, kind: ArtifactKind) -> Result<Bytes, StorageError> {
        let path = self.path(job_id, kind);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound { job_id, kind })
            }
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn describe(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
    ) -> Result<ArtifactRef, StorageError> {
        let path = self.path(job_id, kind);
        match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(self.artifact_ref(job_id, kind, meta.len())),
            Ok(_) => Err(StorageError::NotFound { job_id, kind }),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound { job_id, kind })
            }
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    async fn delete_job(&self, job_id: JobId) -> Result<(), StorageError> {
        let trash = self.root.join(TRASH_DIR);
        tokio::fs::create_dir_all(&trash)
            .await
            .map_err(|e| StorageError::io(&trash, e))?;

        // Move out of the visible namespace first: readers then get the old
        // bytes (already open) or NotFound.
        let doomed = trash.join(format!("{job_id}.{}", self.next_seq()));
        let dir = self.job_dir(job_id);
        match tokio::fs::rename(&dir, &doomed).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(StorageError::io(&dir, e)),
        }

        if let Err(e) = tokio::fs::remove_dir_all(&doomed).await {
            // Left for the purge on next open.
            warn!(%job_id, path = %doomed.display(), error = %e, "failed to purge deleted artifacts");
        }
        debug!(%job_id, "artifacts deleted");
        Ok(())
    }
}

// ── In-memory store ──────────────────────────────────────────────────────────

/// Volatile store for tests and ephemeral runs.
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    slots: RwLock<HashMap<(JobId, ArtifactKind), Bytes>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of jobs with at least one artifact.
    pub async fn job_count(&self) -> usize {
        let slots = self.slots.read().await;
        let mut jobs: Vec<JobId> = slots.keys().map(|(id, _)| *id).collect();
        jobs.sort();
        jobs.dedup();
        jobs.len()
    }

    fn artifact_ref(job_id: JobId, kind: ArtifactKind, size_bytes: u64) -> ArtifactRef {
        ArtifactRef {
            job_id,
            kind,
            location: format!("memory://{job_id}/{}", kind.file_name()),
            size_bytes,
        }
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
        bytes: Bytes,
    ) -> Result<ArtifactRef, StorageError> {
        let size = bytes.len() as u64;
        self.slots.write().await.insert((job_id, kind), bytes);
        Ok(Self::artifact_ref(job_id, kind, size))
    }

    async fn get(&self, job_id: JobId, kind: ArtifactKind) -> Result<Bytes, StorageError> {
        self.slots
            .read()
            .await
            .get(&(job_id, kind))
            .cloned()
            .ok_or(StorageError::NotFound { job_id, kind })
    }

    async fn describe(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
    ) -> Result<ArtifactRef, StorageError> {
        self.slots
            .read()
            .await
            .get(&(job_id, kind))
            .map(|b| Self::artifact_ref(job_id, kind, b.len() as u64))
            .ok_or(StorageError::NotFound { job_id, kind })
    }

    async fn delete_job(&self, job_id: JobId) -> Result<(), StorageError> {
        self.slots.write().await.retain(|(id, _), _| *id != job_id);
        Ok(())
    }
}
