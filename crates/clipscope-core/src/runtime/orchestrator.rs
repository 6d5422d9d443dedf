use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use futures::future::{self, Either};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::runtime::admission::JobAdmission;
use crate::runtime::artifact::{ArtifactRef, ArtifactStore, StorageError};
use crate::runtime::broadcast::{EventBroadcaster, StatusStream};
use crate::runtime::config::OrchestratorConfig;
use crate::runtime::job::{
    FailureDetail, JobInput, JobRecord, JobSnapshot, StageResult, StageResultOutcome,
};
use crate::runtime::journal::JobJournal;
use crate::runtime::pipeline::Pipeline;
use crate::runtime::registry::JobRegistry;
use crate::runtime::stage::{
    JobContext, StageExecutor, StageFailure, StageOutcome, wait_cancelled,
};
use crate::runtime::types::{ArtifactKind, FailureKind, JobId, JobStatus, RuntimeError, StageName};

/// Commands sent to the orchestrator's internal event loop.
#[derive(Debug)]
pub enum OrchestratorCommand {
    /// Register a job and start its state machine.
    Submit {
        job_id: JobId,
        input: JobInput,
        reply_tx: oneshot::Sender<JobId>,
    },
    /// Request cancellation of a non-terminal job.
    Cancel {
        job_id: JobId,
        reply_tx: oneshot::Sender<Result<JobStatus, RuntimeError>>,
    },
}

/// Everything a job's state machine needs, shared by all jobs.
#[derive(Clone)]
struct JobRuntime {
    registry: JobRegistry,
    pipeline: Pipeline,
    admission: JobAdmission,
    config: Arc<OrchestratorConfig>,
}

/// Outcome of one stage, all attempts included.
struct StageRun {
    stage: StageName,
    attempts: u32,
    elapsed: Duration,
    outcome: Result<Vec<ArtifactRef>, StageFailure>,
}

/// A failed phase: the failing stage plus any sibling that finished first.
struct PhaseFailure {
    completed: Vec<StageRun>,
    failed: StageRun,
}

impl PhaseFailure {
    fn alone(failed: StageRun) -> Self {
        Self {
            completed: Vec::new(),
            failed,
        }
    }
}

impl StageRun {
    fn into_result(self) -> (StageResult, Vec<ArtifactRef>, Option<StageFailure>) {
        let (outcome, artifacts, error, failure) = match self.outcome {
            Ok(refs) => (StageResultOutcome::Ok, refs, None, None),
            Err(failure) => (
                StageResultOutcome::Failed,
                Vec::new(),
                Some(FailureDetail::new(failure.kind, Some(self.stage))),
                Some(failure),
            ),
        };
        let result = StageResult {
            stage: self.stage,
            outcome,
            artifacts: artifacts.iter().map(|a| a.kind).collect(),
            error,
            attempts: self.attempts,
            duration_ms: self.elapsed.as_millis() as u64,
            finished_at: Utc::now(),
        };
        (result, artifacts, failure)
    }
}

/// The job orchestrator.
///
/// Accepts submissions and cancellations through a bounded command queue,
/// runs one state machine task per job and publishes every transition to the
/// [`JobRegistry`], the journal and the event broadcaster.
///
/// # Usage
///
/// ```rust,ignore
/// let orchestrator = Orchestrator::start(config, pipeline, artifacts, journal).await?;
/// let job_id = orchestrator.submit(JobInput::Url { url }).await?;
/// let mut events = orchestrator.subscribe(job_id).await?;
/// ```
#[derive(Clone, Debug)]
pub struct Orchestrator {
    submit_tx: mpsc::Sender<OrchestratorCommand>,
    registry: JobRegistry,
    config: Arc<OrchestratorConfig>,
}

impl Orchestrator {
    /// Start the orchestrator.
    ///
    /// Restores retained jobs from `journal`, spawns the command loop and
    /// returns a cloneable handle.
    pub async fn start(
        config: OrchestratorConfig,
        pipeline: Pipeline,
        artifacts: Arc<dyn ArtifactStore>,
        journal: Arc<dyn JobJournal>,
    ) -> Result<Self, RuntimeError> {
        let config = Arc::new(config);
        let events = EventBroadcaster::new(config.event_buffer);
        let registry = JobRegistry::new(
            config.retention_limit,
            artifacts,
            Arc::clone(&journal),
            events,
        );

        let restored = registry.restore(journal.load().await?).await;
        if restored > 0 {
            info!(restored, "restored jobs from journal");
        }

        let (submit_tx, submit_rx) = mpsc::channel(config.queue_capacity.max(1));
        let runtime = JobRuntime {
            registry: registry.clone(),
            pipeline,
            admission: JobAdmission::new(config.max_concurrent_jobs),
            config: Arc::clone(&config),
        };
        tokio::spawn(Self::run_loop(submit_rx, runtime));

        Ok(Self {
            submit_tx,
            registry,
            config,
        })
    }

    /// Internal event loop: receives commands and spawns job state machines.
    async fn run_loop(mut rx: mpsc::Receiver<OrchestratorCommand>, runtime: JobRuntime) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                OrchestratorCommand::Submit {
                    job_id,
                    input,
                    reply_tx,
                } => {
                    let (record, cancel_rx) = runtime.registry.create(job_id, input).await;
                    let _ = reply_tx.send(job_id);
                    info!(%job_id, "job queued");

                    let job_runtime = runtime.clone();
                    tokio::spawn(async move {
                        job_runtime.run_job(record, cancel_rx).await;
                    });
                }

                OrchestratorCommand::Cancel { job_id, reply_tx } => {
                    let result = runtime.registry.request_cancel(job_id).await;
                    match &result {
                        Ok(status) => info!(%job_id, %status, "cancellation requested"),
                        Err(e) => debug!(%job_id, error = %e, "cancel rejected"),
                    }
                    let _ = reply_tx.send(result);
                }
            }
        }
        debug!("orchestrator command loop stopped");
    }

    fn send(&self, cmd: OrchestratorCommand) -> Result<(), RuntimeError> {
        self.submit_tx.try_send(cmd).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RuntimeError::QueueFull {
                capacity: self.submit_tx.max_capacity(),
            },
            mpsc::error::TrySendError::Closed(_) => RuntimeError::Shutdown,
        })
    }

    // ── Public API ───────────────────────────────────────────────────────────

    /// Submit a job. Returns as soon as the job is registered as `queued`.
    pub async fn submit(&self, input: JobInput) -> Result<JobId, RuntimeError> {
        self.submit_with_id(JobId::new(), input).await
    }

    /// Store an uploaded video and submit a job analysing it.
    pub async fn submit_upload(
        &self,
        file_name: impl Into<String>,
        video: Bytes,
    ) -> Result<JobId, RuntimeError> {
        let job_id = JobId::new();
        let artifacts = self.registry.artifacts();
        artifacts
            .put(job_id, ArtifactKind::SourceVideo, video)
            .await?;

        let input = JobInput::Upload {
            file_name: file_name.into(),
        };
        match self.submit_with_id(job_id, input).await {
            Ok(id) => Ok(id),
            Err(e) => {
                if let Err(cleanup) = artifacts.delete_job(job_id).await {
                    warn!(%job_id, error = %cleanup, "failed to drop rejected upload");
                }
                Err(e)
            }
        }
    }

    async fn submit_with_id(&self, job_id: JobId, input: JobInput) -> Result<JobId, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(OrchestratorCommand::Submit {
            job_id,
            input,
            reply_tx,
        })?;
        reply_rx.await.map_err(|_| RuntimeError::Shutdown)
    }

    /// Ask a job to stop. Returns the status it had when the request landed.
    pub async fn cancel(&self, job_id: JobId) -> Result<JobStatus, RuntimeError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send(OrchestratorCommand::Cancel { job_id, reply_tx })?;
        reply_rx.await.map_err(|_| RuntimeError::Shutdown)?
    }

    /// Latest snapshot of a job.
    pub async fn status(&self, job_id: JobId) -> Result<Arc<JobSnapshot>, RuntimeError> {
        Ok(Arc::clone(self.registry.get(job_id).await?.snapshot()))
    }

    /// Status events of a job, starting with the last known one.
    pub async fn subscribe(&self, job_id: JobId) -> Result<StatusStream, RuntimeError> {
        self.registry
            .events()
            .subscribe(job_id)
            .ok_or(RuntimeError::JobNotFound { job_id })
    }

    /// Read an artifact of a completed job.
    pub async fn artifact(
        &self,
        job_id: JobId,
        kind: ArtifactKind,
    ) -> Result<(ArtifactRef, Bytes), RuntimeError> {
        let snapshot = self.status(job_id).await?;
        if snapshot.status != JobStatus::Complete {
            return Err(RuntimeError::NotComplete {
                job_id,
                status: snapshot.status,
            });
        }
        let artifacts = self.registry.artifacts();
        let artifact = artifacts.describe(job_id, kind).await?;
        let bytes = artifacts.get(job_id, kind).await?;
        Ok((artifact, bytes))
    }

    /// Markdown report of a completed job.
    pub async fn report(&self, job_id: JobId) -> Result<String, RuntimeError> {
        let (_, bytes) = self.artifact(job_id, ArtifactKind::Report).await?;
        String::from_utf8(bytes.to_vec()).map_err(|e| {
            RuntimeError::Storage(StorageError::Malformed {
                job_id,
                kind: ArtifactKind::Report,
                reason: e.to_string(),
            })
        })
    }

    /// Every retained job, newest first.
    pub async fn list_jobs(&self) -> Vec<Arc<JobSnapshot>> {
        self.registry.list().await
    }

    pub async fn list_active(&self) -> Vec<Arc<JobSnapshot>> {
        self.registry.list_active().await
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }
}

// ── Job state machine ────────────────────────────────────────────────────────

impl JobRuntime {
    /// Drive one job from `queued` to a terminal state.
    async fn run_job(&self, mut record: JobRecord, mut cancel_rx: watch::Receiver<bool>) {
        let job_id = record.id();

        let _permit = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel_rx) => {
                self.fail(&mut record, FailureDetail::new(FailureKind::Cancelled, None)).await;
                return;
            }
            permit = self.admission.acquire() => match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!(%job_id, error = %e, "admission closed");
                    self.fail(&mut record, FailureDetail::new(FailureKind::Interrupted, None)).await;
                    return;
                }
            },
        };
        debug!(%job_id, "job admitted");

        for phase in [
            JobStatus::Downloading,
            JobStatus::Extracting,
            JobStatus::Analyzing,
            JobStatus::Synthesizing,
        ] {
            if *cancel_rx.borrow() {
                self.fail(&mut record, FailureDetail::new(FailureKind::Cancelled, None))
                    .await;
                return;
            }
            if !self.advance(&mut record, phase).await {
                return;
            }

            match self.run_phase(&record, phase, &cancel_rx).await {
                Ok(runs) => {
                    for run in runs {
                        let (result, artifacts, _) = run.into_result();
                        record.record_stage(result, artifacts);
                    }
                }
                Err(PhaseFailure { completed, failed: run }) => {
                    for done in completed {
                        let (result, artifacts, _) = done.into_result();
                        record.record_stage(result, artifacts);
                    }
                    let stage = run.stage;
                    let (result, _, failure) = run.into_result();
                    record.record_stage(result, Vec::new());
                    let kind = failure.as_ref().map_or(FailureKind::Permanent, |f| f.kind);
                    if let Some(failure) = &failure {
                        warn!(%job_id, %stage, kind = %failure.kind, error = %failure.message, "stage failed");
                    }
                    self.fail(&mut record, FailureDetail::new(kind, Some(stage)))
                        .await;
                    return;
                }
            }
        }

        // The report must exist in the store, not only in the record.
        match self
            .registry
            .artifacts()
            .describe(job_id, ArtifactKind::Report)
            .await
        {
            Ok(report) if report.size_bytes > 0 => {
                record.set_artifact(report);
                self.advance(&mut record, JobStatus::Complete).await;
            }
            Ok(_) | Err(_) => {
                error!(%job_id, "report missing or empty at completion");
                self.fail(
                    &mut record,
                    FailureDetail::new(FailureKind::Storage, Some(StageName::Synthesize)),
                )
                .await;
            }
        }
    }

    /// Run every stage of `phase`.
    ///
    /// The analysis pair runs concurrently. The first failure drops a sibling
    /// that is still running; a sibling that already finished is reported in
    /// [`PhaseFailure::completed`].
    async fn run_phase(
        &self,
        record: &JobRecord,
        phase: JobStatus,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<Vec<StageRun>, PhaseFailure> {
        let job_id = record.id();
        let input = record.input();
        match phase.stages() {
            [stage] => {
                let run = self
                    .attempt_stage(job_id, input, *stage, cancel_rx)
                    .await
                    .map_err(PhaseFailure::alone)?;
                Ok(vec![run])
            }
            [first, second] => {
                let a = pin!(self.attempt_stage(job_id, input, *first, cancel_rx));
                let b = pin!(self.attempt_stage(job_id, input, *second, cancel_rx));
                let (done, pending) = match future::select(a, b).await {
                    Either::Left((run, rest)) => (run, rest),
                    Either::Right((run, rest)) => (run, rest),
                };
                let done = done.map_err(PhaseFailure::alone)?;
                match pending.await {
                    Ok(other) => {
                        let mut runs = vec![done, other];
                        runs.sort_by_key(|run| run.stage != *first);
                        Ok(runs)
                    }
                    Err(failed) => Err(PhaseFailure {
                        completed: vec![done],
                        failed,
                    }),
                }
            }
            _ => Ok(Vec::new()),
        }
    }

    /// Execute one stage with timeout, retry and cancellation.
    async fn attempt_stage(
        &self,
        job_id: JobId,
        input: &JobInput,
        stage: StageName,
        cancel_rx: &watch::Receiver<bool>,
    ) -> Result<StageRun, StageRun> {
        let executor = Arc::clone(self.pipeline.executor(stage));
        let limit = self.config.timeouts.for_stage(stage);
        let policy = self.config.retry;
        let started = Instant::now();
        let mut cancel = cancel_rx.clone();
        let mut attempt = 1;

        let finish = |attempts: u32, outcome| StageRun {
            stage,
            attempts,
            elapsed: started.elapsed(),
            outcome,
        };

        loop {
            let ctx = JobContext::new(
                job_id,
                input.clone(),
                attempt,
                Arc::clone(self.registry.artifacts()),
                cancel_rx.clone(),
            );
            debug!(%job_id, %stage, attempt, "stage attempt started");

            let outcome = tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel) => StageOutcome::Failure(StageFailure::cancelled()),
                outcome = run_guarded(executor.as_ref(), &ctx, limit) => outcome,
            };

            let failure = match outcome {
                StageOutcome::Success { artifacts } => {
                    info!(%job_id, %stage, attempt, "stage succeeded");
                    return Ok(finish(attempt, Ok(artifacts)));
                }
                StageOutcome::Failure(failure) => failure,
            };

            if !failure.retryable || !policy.allows_retry(attempt) {
                return Err(finish(attempt, Err(failure)));
            }

            let delay = policy.delay_for(attempt);
            warn!(
                %job_id,
                %stage,
                attempt,
                kind = %failure.kind,
                error = %failure.message,
                delay_ms = delay.as_millis() as u64,
                "stage attempt failed, retrying"
            );
            tokio::select! {
                biased;
                _ = wait_cancelled(&mut cancel) => {
                    return Err(finish(attempt, Err(StageFailure::cancelled())));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn advance(&self, record: &mut JobRecord, next: JobStatus) -> bool {
        let job_id = record.id();
        let from = record.status();
        match record.transition(next) {
            Ok(event) => {
                info!(%job_id, %from, status = %next, "job advanced");
                self.registry.commit(record.snapshot(), Some(event)).await;
                true
            }
            Err(e) => {
                error!(%job_id, error = %e, "illegal job transition");
                let stage = record.snapshot().current_stage();
                self.fail(record, FailureDetail::new(FailureKind::Storage, stage))
                    .await;
                false
            }
        }
    }

    async fn fail(&self, record: &mut JobRecord, detail: FailureDetail) {
        let job_id = record.id();
        let kind = detail.kind;
        match record.fail(detail) {
            Ok(event) => {
                warn!(%job_id, %kind, stage = ?event.stage, "job failed");
                self.registry.commit(record.snapshot(), Some(event)).await;
            }
            Err(e) => error!(%job_id, error = %e, "cannot fail job"),
        }
    }
}

/// Run one attempt under `limit`, turning a panic into a permanent failure.
async fn run_guarded(
    executor: &dyn StageExecutor,
    ctx: &JobContext,
    limit: Duration,
) -> StageOutcome {
    match tokio::time::timeout(limit, AssertUnwindSafe(executor.run(ctx)).catch_unwind()).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => StageOutcome::Failure(StageFailure::permanent(format!(
            "executor panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => StageOutcome::Failure(StageFailure::timeout(format!(
            "attempt exceeded {}s",
            limit.as_secs_f64()
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
