use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tokio::sync::{RwLock, watch};
use tracing::{info, warn};

use crate::runtime::artifact::ArtifactStore;
use crate::runtime::broadcast::EventBroadcaster;
use crate::runtime::job::{FailureDetail, JobInput, JobRecord, JobSnapshot, StatusEvent};
use crate::runtime::journal::JobJournal;
use crate::runtime::types::{FailureKind, JobId, JobStatus, RuntimeError};

/// Read handle on a registered job.
#[derive(Debug, Clone)]
pub struct JobHandle {
    snapshot: Arc<JobSnapshot>,
    cancel_requested: bool,
}

impl JobHandle {
    pub fn snapshot(&self) -> &Arc<JobSnapshot> {
        &self.snapshot
    }

    pub fn status(&self) -> JobStatus {
        self.snapshot.status
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested
    }
}

struct Entry {
    snapshot: Arc<JobSnapshot>,
    cancel_tx: Arc<watch::Sender<bool>>,
}

impl Entry {
    fn new(snapshot: JobSnapshot) -> Self {
        let (cancel_tx, _) = watch::channel(false);
        Self {
            snapshot: Arc::new(snapshot),
            cancel_tx: Arc::new(cancel_tx),
        }
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, Entry>,
    /// Terminal jobs, oldest first.
    finished: VecDeque<JobId>,
}

/// Id → latest published snapshot of every retained job.
///
/// Readers only ever see whole `Arc<JobSnapshot>` values. Each commit of a
/// terminal snapshot may evict the oldest terminal jobs beyond the retention
/// limit, together with their artifacts, journal rows and event channels.
#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RwLock<Inner>>,
    retention: usize,
    artifacts: Arc<dyn ArtifactStore>,
    journal: Arc<dyn JobJournal>,
    events: EventBroadcaster,
}

impl std::fmt::Debug for JobRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobRegistry")
            .field("retention", &self.retention)
            .field("artifacts", &self.artifacts)
            .finish()
    }
}

impl JobRegistry {
    /// `retention` is clamped to at least one so a finishing job always
    /// outlives its own terminal event.
    pub fn new(
        retention: usize,
        artifacts: Arc<dyn ArtifactStore>,
        journal: Arc<dyn JobJournal>,
        events: EventBroadcaster,
    ) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Inner::default())),
            retention: retention.max(1),
            artifacts,
            journal,
            events,
        }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    /// Register a new `queued` job and return its record plus the
    /// cancellation receiver its state machine must observe.
    pub(crate) async fn create(
        &self,
        job_id: JobId,
        input: JobInput,
    ) -> (JobRecord, watch::Receiver<bool>) {
        let record = JobRecord::new(job_id, input);
        let snapshot = record.snapshot();
        let entry = Entry::new(snapshot.clone());
        let cancel_rx = entry.cancel_tx.subscribe();

        // The channel exists before the job is visible to readers.
        if let Some(initial) = snapshot.last_event() {
            self.events.register(initial.clone());
        }
        self.inner.write().await.jobs.insert(job_id, entry);
        self.save(&snapshot).await;

        (record, cancel_rx)
    }

    pub async fn get(&self, job_id: JobId) -> Result<JobHandle, RuntimeError> {
        let inner = self.inner.read().await;
        let entry = inner
            .jobs
            .get(&job_id)
            .ok_or(RuntimeError::JobNotFound { job_id })?;
        Ok(JobHandle {
            snapshot: Arc::clone(&entry.snapshot),
            cancel_requested: *entry.cancel_tx.borrow(),
        })
    }

    /// All retained jobs, newest first.
    pub async fn list(&self) -> Vec<Arc<JobSnapshot>> {
        let inner = self.inner.read().await;
        let mut jobs: Vec<Arc<JobSnapshot>> =
            inner.jobs.values().map(|e| Arc::clone(&e.snapshot)).collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Jobs that have not reached a terminal state, newest first.
    pub async fn list_active(&self) -> Vec<Arc<JobSnapshot>> {
        let mut jobs = self.list().await;
        jobs.retain(|s| !s.status.is_terminal());
        jobs
    }

    /// Signal cancellation to a non-terminal job; returns its current status.
    pub async fn request_cancel(&self, job_id: JobId) -> Result<JobStatus, RuntimeError> {
        let inner = self.inner.read().await;
        let entry = inner
            .jobs
            .get(&job_id)
            .ok_or(RuntimeError::JobNotFound { job_id })?;
        let status = entry.snapshot.status;
        if status.is_terminal() {
            return Err(RuntimeError::NotCancellable { job_id, status });
        }
        entry.cancel_tx.send_replace(true);
        Ok(status)
    }

    /// Publish a new snapshot of a job and, when given, its status event.
    ///
    /// The map is updated before the event goes out so a subscriber woken by
    /// the event can already poll the new state.
    pub(crate) async fn commit(&self, snapshot: JobSnapshot, event: Option<StatusEvent>) {
        let job_id = snapshot.id;
        let snapshot = Arc::new(snapshot);
        let evicted = {
            let mut inner = self.inner.write().await;
            let Some(entry) = inner.jobs.get_mut(&job_id) else {
                warn!(%job_id, "commit for unknown job dropped");
                return;
            };
            entry.snapshot = Arc::clone(&snapshot);
            if event.as_ref().is_some_and(StatusEvent::is_terminal) {
                inner.finished.push_back(job_id);
                self.overflow(&mut inner)
            } else {
                Vec::new()
            }
        };

        if let Some(event) = event {
            self.events.publish(event);
        }
        for id in &evicted {
            self.events.forget(*id);
        }
        self.save(&snapshot).await;
        for id in evicted {
            self.purge(id).await;
        }
    }

    /// Rebuild the registry from journaled snapshots.
    ///
    /// Jobs that were mid-flight when the process stopped are failed with
    /// [`FailureKind::Interrupted`]. Returns the number of restored jobs.
    pub(crate) async fn restore(&self, mut snapshots: Vec<JobSnapshot>) -> usize {
        snapshots.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));

        let mut restored = Vec::with_capacity(snapshots.len());
        for snapshot in snapshots {
            let job_id = snapshot.id;
            if snapshot.last_event().map(|e| e.status) != Some(snapshot.status) {
                warn!(%job_id, "journaled snapshot has inconsistent transitions, skipping");
                continue;
            }
            if snapshot.status.is_terminal() {
                restored.push(snapshot);
                continue;
            }
            let mut record = JobRecord::from_snapshot(snapshot);
            let stage = record.snapshot().current_stage();
            match record.fail(FailureDetail::new(FailureKind::Interrupted, stage)) {
                Ok(_) => {
                    let snapshot = record.snapshot();
                    self.save(&snapshot).await;
                    info!(%job_id, "job interrupted by restart marked failed");
                    restored.push(snapshot);
                }
                Err(e) => warn!(%job_id, error = %e, "cannot fail interrupted job"),
            }
        }

        let count = restored.len();
        let evicted = {
            let mut inner = self.inner.write().await;
            for snapshot in restored {
                if let Some(last) = snapshot.last_event() {
                    self.events.register(last.clone());
                }
                inner.finished.push_back(snapshot.id);
                inner.jobs.insert(snapshot.id, Entry::new(snapshot));
            }
            self.overflow(&mut inner)
        };
        for id in evicted {
            self.events.forget(id);
            self.purge(id).await;
        }
        count
    }

    fn overflow(&self, inner: &mut Inner) -> Vec<JobId> {
        let mut evicted = Vec::new();
        while inner.finished.len() > self.retention {
            if let Some(oldest) = inner.finished.pop_front() {
                inner.jobs.remove(&oldest);
                evicted.push(oldest);
            }
        }
        evicted
    }

    /// Delete the artifacts and journal row of an evicted job.
    async fn purge(&self, job_id: JobId) {
        if let Err(e) = self.artifacts.delete_job(job_id).await {
            warn!(%job_id, error = %e, "failed to delete artifacts of evicted job");
        }
        if let Err(e) = self.journal.remove(job_id).await {
            warn!(%job_id, error = %e, "failed to remove evicted job from journal");
        }
        info!(%job_id, "job evicted");
    }

    async fn save(&self, snapshot: &JobSnapshot) {
        if let Err(e) = self.journal.save(snapshot).await {
            warn!(job_id = %snapshot.id, error = %e, "failed to journal job snapshot");
        }
    }
}
