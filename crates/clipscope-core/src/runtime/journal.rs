use async_trait::async_trait;
use thiserror::Error;

use crate::runtime::job::JobSnapshot;
use crate::runtime::types::JobId;

/// Error raised by a [`JobJournal`] backend.
#[derive(Debug, Error)]
#[error("job journal error: {source}")]
pub struct JournalError {
    #[source]
    source: Box<dyn std::error::Error + Send + Sync>,
}

impl JournalError {
    pub fn new(source: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Durable record of job snapshots, used to rebuild the registry after a
/// restart.
#[async_trait]
pub trait JobJournal: Send + Sync {
    /// Insert or replace the row of `snapshot.id`.
    async fn save(&self, snapshot: &JobSnapshot) -> Result<(), JournalError>;

    async fn remove(&self, job_id: JobId) -> Result<(), JournalError>;

    /// Every stored snapshot, in no particular order.
    async fn load(&self) -> Result<Vec<JobSnapshot>, JournalError>;
}

/// Journal that forgets everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

#[async_trait]
impl JobJournal for NoopJournal {
    async fn save(&self, _snapshot: &JobSnapshot) -> Result<(), JournalError> {
        Ok(())
    }

    async fn remove(&self, _job_id: JobId) -> Result<(), JournalError> {
        Ok(())
    }

    async fn load(&self) -> Result<Vec<JobSnapshot>, JournalError> {
        Ok(Vec::new())
    }
}
