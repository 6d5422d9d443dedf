use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use crate::runtime::artifact::{ArtifactRef, ArtifactStore, StorageError};
use crate::runtime::job::JobInput;
use crate::runtime::types::{ArtifactKind, FailureKind, JobId, StageName};

/// Everything an executor may see while running one attempt.
#[derive(Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub input: JobInput,
    /// 1-based attempt number.
    pub attempt: u32,
    artifacts: Arc<dyn ArtifactStore>,
    cancel_rx: watch::Receiver<bool>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("job_id", &self.job_id)
            .field("input", &self.input)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl JobContext {
    pub fn new(
        job_id: JobId,
        input: JobInput,
        attempt: u32,
        artifacts: Arc<dyn ArtifactStore>,
        cancel_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            job_id,
            input,
            attempt,
            artifacts,
            cancel_rx,
        }
    }

    pub fn artifacts(&self) -> &dyn ArtifactStore {
        self.artifacts.as_ref()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Resolves once cancellation has been requested.
    pub async fn cancelled(&self) {
        wait_cancelled(&mut self.cancel_rx.clone()).await
    }

    /// Read an upstream artifact of this job.
    pub async fn load(&self, kind: ArtifactKind) -> Result<Bytes, StageFailure> {
        self.artifacts
            .get(self.job_id, kind)
            .await
            .map_err(StageFailure::storage)
    }

    /// Write this stage's artifact, replacing any previous attempt's output.
    pub async fn store(&self, kind: ArtifactKind, bytes: Bytes) -> Result<ArtifactRef, StageFailure> {
        self.artifacts
            .put(self.job_id, kind, bytes)
            .await
            .map_err(StageFailure::storage)
    }
}

/// Wait until `rx` carries `true`. Never resolves if the sender is gone.
pub(crate) async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|cancelled| *cancelled).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// A classified stage failure.
///
/// `message` is operator detail: it is logged, never shown to clients.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageFailure {
    pub kind: FailureKind,
    pub message: String,
    pub retryable: bool,
}

impl StageFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Transient,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Permanent,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Timeout,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: FailureKind::Cancelled,
            message: "cancellation requested".into(),
            retryable: false,
        }
    }

    /// Storage problems are never retried.
    pub fn storage(err: StorageError) -> Self {
        Self {
            kind: FailureKind::Storage,
            message: err.to_string(),
            retryable: false,
        }
    }
}

impl fmt::Display for StageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<StorageError> for StageFailure {
    fn from(err: StorageError) -> Self {
        Self::storage(err)
    }
}

/// Result of one executor invocation.
#[derive(Debug, Clone)]
pub enum StageOutcome {
    Success { artifacts: Vec<ArtifactRef> },
    Failure(StageFailure),
}

impl From<Result<Vec<ArtifactRef>, StageFailure>> for StageOutcome {
    fn from(result: Result<Vec<ArtifactRef>, StageFailure>) -> Self {
        match result {
            Ok(artifacts) => StageOutcome::Success { artifacts },
            Err(failure) => StageOutcome::Failure(failure),
        }
    }
}

/// One pipeline stage.
///
/// Executors read upstream artifacts and write only their own slot through
/// the [`JobContext`]; they never touch job status.
#[async_trait]
pub trait StageExecutor: Send + Sync {
    fn stage(&self) -> StageName;

    async fn run(&self, ctx: &JobContext) -> StageOutcome;
}
