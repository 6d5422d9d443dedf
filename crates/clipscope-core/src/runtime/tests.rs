use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::Notify;

use crate::runtime::artifact::{ArtifactStore, MemoryArtifactStore};
use crate::runtime::broadcast::EventBroadcaster;
use crate::runtime::config::{OrchestratorConfig, RetryPolicy, StageTimeouts};
use crate::runtime::job::{JobInput, JobRecord, JobSnapshot, StageResultOutcome};
use crate::runtime::journal::{JobJournal, JournalError, NoopJournal};
use crate::runtime::orchestrator::Orchestrator;
use crate::runtime::pipeline::Pipeline;
use crate::runtime::registry::JobRegistry;
use crate::runtime::stage::{JobContext, StageExecutor, StageFailure, StageOutcome};
use crate::runtime::types::{ArtifactKind, FailureKind, JobId, JobStatus, RuntimeError, StageName};
use crate::services::{
    Downloader, FrameAnalysis, FrameAnalyzer, ReportSynthesizer, SceneDetector, SceneFrame,
    ServiceError, SynthesisInput, Transcriber, Transcript, TranscriptSegment,
};

const WAIT: Duration = Duration::from_secs(10);

// ── Fake executors ────────────────────────────────────────────────────────────

#[derive(Clone)]
enum Step {
    Succeed,
    Fail(StageFailure),
    Hang,
    Panic,
    Gate(Arc<Notify>),
    GateThenFail(Arc<Notify>, StageFailure),
}

struct FakeStage {
    stage: StageName,
    kind: ArtifactKind,
    script: Mutex<VecDeque<Step>>,
    calls: Arc<AtomicU32>,
}

#[async_trait]
impl StageExecutor for FakeStage {
    fn stage(&self) -> StageName {
        self.stage
    }

    async fn run(&self, ctx: &JobContext) -> StageOutcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Succeed);
        match step {
            Step::Succeed => {}
            Step::Fail(failure) => return StageOutcome::Failure(failure),
            Step::Hang => std::future::pending::<()>().await,
            Step::Panic => panic!("executor blew up"),
            Step::Gate(gate) => gate.notified().await,
            Step::GateThenFail(gate, failure) => {
                gate.notified().await;
                return StageOutcome::Failure(failure);
            }
        }
        let body = match self.kind {
            ArtifactKind::Report => Bytes::from_static(b"# Report\n\nall good"),
            _ => Bytes::from_static(b"{}"),
        };
        match ctx.store(self.kind, body).await {
            Ok(artifact) => StageOutcome::Success {
                artifacts: vec![artifact],
            },
            Err(failure) => StageOutcome::Failure(failure),
        }
    }
}

fn stage_kind(stage: StageName) -> ArtifactKind {
    match stage {
        StageName::Download => ArtifactKind::SourceVideo,
        StageName::SceneExtract => ArtifactKind::Scenes,
        StageName::VisualAnalyze => ArtifactKind::VisualAnalysis,
        StageName::Transcribe => ArtifactKind::Transcript,
        StageName::Synthesize => ArtifactKind::Report,
    }
}

fn fake(stage: StageName, steps: Vec<Step>) -> FakeStage {
    FakeStage {
        stage,
        kind: stage_kind(stage),
        script: Mutex::new(steps.into()),
        calls: Arc::default(),
    }
}

/// Pipeline of fake stages; every stage succeeds unless scripted otherwise.
fn scripted(scripts: Vec<(StageName, Vec<Step>)>) -> (Pipeline, HashMap<StageName, Arc<AtomicU32>>) {
    let mut scripts: HashMap<StageName, Vec<Step>> = scripts.into_iter().collect();
    let mut calls = HashMap::new();
    let mut stage = |name: StageName| {
        let stage = fake(name, scripts.remove(&name).unwrap_or_default());
        calls.insert(name, Arc::clone(&stage.calls));
        stage
    };
    let pipeline = Pipeline::builder()
        .download(stage(StageName::Download))
        .scene_extract(stage(StageName::SceneExtract))
        .visual_analyze(stage(StageName::VisualAnalyze))
        .transcribe(stage(StageName::Transcribe))
        .synthesize(stage(StageName::Synthesize))
        .build()
        .expect("complete pipeline");
    (pipeline, calls)
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            factor: 2,
            max_delay: Duration::from_millis(10),
        },
        ..OrchestratorConfig::default()
    }
}

fn url(n: u32) -> JobInput {
    JobInput::Url {
        url: format!("https://www.tiktok.com/@someone/video/{n}"),
    }
}

async fn start(config: OrchestratorConfig, pipeline: Pipeline) -> (Orchestrator, Arc<MemoryArtifactStore>) {
    let store = Arc::new(MemoryArtifactStore::new());
    let orchestrator = Orchestrator::start(config, pipeline, store.clone(), Arc::new(NoopJournal))
        .await
        .expect("orchestrator starts");
    (orchestrator, store)
}

/// Follow the job's event stream to its end and return the final snapshot.
async fn finish(orchestrator: &Orchestrator, job_id: JobId) -> Arc<JobSnapshot> {
    let stream = orchestrator.subscribe(job_id).await.expect("subscribe");
    let events: Vec<_> = tokio::time::timeout(WAIT, stream.collect::<Vec<_>>())
        .await
        .expect("job reaches a terminal state");
    assert!(events.last().unwrap().is_terminal());
    orchestrator.status(job_id).await.expect("status")
}

async fn wait_for_status(orchestrator: &Orchestrator, job_id: JobId, status: JobStatus) {
    tokio::time::timeout(WAIT, async {
        loop {
            if orchestrator.status(job_id).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("status reached");
}

// ── Fake collaborators (real executors) ──────────────────────────────────────

#[derive(Default)]
struct CountingDownloader {
    calls: AtomicU32,
}

#[async_trait]
impl Downloader for CountingDownloader {
    async fn download(&self, _url: &str) -> Result<Bytes, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Bytes::from_static(b"downloaded-mp4"))
    }
}

struct OneScene;

#[async_trait]
impl SceneDetector for OneScene {
    async fn detect(&self, video: Bytes) -> Result<Vec<SceneFrame>, ServiceError> {
        assert!(!video.is_empty());
        Ok(vec![SceneFrame {
            index: 1,
            timestamp_secs: 0.0,
            image: Bytes::from_static(b"jpeg"),
        }])
    }
}

struct Describer;

#[async_trait]
impl FrameAnalyzer for Describer {
    async fn analyze(&self, frames: &[SceneFrame]) -> Result<Vec<FrameAnalysis>, ServiceError> {
        Ok(frames
            .iter()
            .map(|f| FrameAnalysis {
                index: f.index,
                timestamp_secs: f.timestamp_secs,
                description: "a cat on a sofa".into(),
                objects: vec!["cat".into()],
                text: Vec::new(),
            })
            .collect())
    }
}

struct Hello;

#[async_trait]
impl Transcriber for Hello {
    async fn transcribe(&self, _video: Bytes) -> Result<Transcript, ServiceError> {
        Ok(Transcript {
            language: Some("en".into()),
            segments: vec![TranscriptSegment {
                start_secs: 0.0,
                end_secs: 1.2,
                text: "hello there".into(),
            }],
        })
    }
}

struct Writer;

#[async_trait]
impl ReportSynthesizer for Writer {
    async fn synthesize(&self, input: &SynthesisInput) -> Result<String, ServiceError> {
        Ok(format!(
            "# Report\n\n{}\n\n{}",
            input.transcript.text(),
            input.frames[0].description
        ))
    }
}

fn service_pipeline(downloader: Arc<CountingDownloader>) -> Pipeline {
    Pipeline::from_services(
        downloader,
        Arc::new(OneScene),
        Arc::new(Describer),
        Arc::new(Hello),
        Arc::new(Writer),
    )
}

// ── Happy path ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn url_job_runs_every_stage_in_order() {
    let downloader = Arc::new(CountingDownloader::default());
    let (orchestrator, _store) = start(fast_config(), service_pipeline(downloader.clone())).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Complete);
    let statuses: Vec<JobStatus> = snapshot.transitions.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Queued,
            JobStatus::Downloading,
            JobStatus::Extracting,
            JobStatus::Analyzing,
            JobStatus::Synthesizing,
            JobStatus::Complete,
        ]
    );
    assert_eq!(snapshot.stage_results.len(), 5);
    assert!(
        snapshot
            .stage_results
            .iter()
            .all(|r| r.outcome == StageResultOutcome::Ok && r.attempts == 1)
    );
    assert_eq!(snapshot.artifacts.len(), ArtifactKind::ALL.len());
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 1);

    let report = orchestrator.report(job_id).await.unwrap();
    assert!(report.contains("hello there"));
    assert!(report.contains("a cat on a sofa"));
}

#[tokio::test]
async fn upload_job_skips_network_download() {
    let downloader = Arc::new(CountingDownloader::default());
    let (orchestrator, _store) = start(fast_config(), service_pipeline(downloader.clone())).await;

    let job_id = orchestrator
        .submit_upload("clip.mp4", Bytes::from_static(b"uploaded-mp4"))
        .await
        .unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Complete);
    assert_eq!(downloader.calls.load(Ordering::SeqCst), 0);
    let (_, video) = orchestrator
        .artifact(job_id, ArtifactKind::SourceVideo)
        .await
        .unwrap();
    assert_eq!(video, Bytes::from_static(b"uploaded-mp4"));
}

#[tokio::test]
async fn subscriber_sees_every_transition_exactly_once() {
    let gate = Arc::new(Notify::new());
    let (pipeline, _) = scripted(vec![(StageName::Download, vec![Step::Gate(gate.clone())])]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    wait_for_status(&orchestrator, job_id, JobStatus::Downloading).await;
    let stream = orchestrator.subscribe(job_id).await.unwrap();
    gate.notify_one();

    let statuses: Vec<JobStatus> = tokio::time::timeout(WAIT, stream.map(|e| e.status).collect())
        .await
        .unwrap();
    assert_eq!(
        statuses,
        vec![
            JobStatus::Downloading,
            JobStatus::Extracting,
            JobStatus::Analyzing,
            JobStatus::Synthesizing,
            JobStatus::Complete,
        ]
    );

    // A late subscriber gets the terminal event once and the stream closes.
    let late: Vec<_> = orchestrator.subscribe(job_id).await.unwrap().collect().await;
    assert_eq!(late.len(), 1);
    assert_eq!(late[0].status, JobStatus::Complete);
}

// ── Failures and retries ─────────────────────────────────────────────────────

#[tokio::test]
async fn transient_failure_is_retried_until_success() {
    let (pipeline, calls) = scripted(vec![(
        StageName::SceneExtract,
        vec![
            Step::Fail(StageFailure::transient("network blip")),
            Step::Fail(StageFailure::transient("network blip")),
        ],
    )]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Complete);
    assert_eq!(calls[&StageName::SceneExtract].load(Ordering::SeqCst), 3);
    let scenes = snapshot
        .stage_results
        .iter()
        .find(|r| r.stage == StageName::SceneExtract)
        .unwrap();
    assert_eq!(scenes.attempts, 3);
}

#[tokio::test]
async fn exhausted_retries_fail_the_job() {
    let failures = vec![Step::Fail(StageFailure::transient("model unavailable")); 5];
    let (pipeline, calls) = scripted(vec![(StageName::Synthesize, failures)]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(calls[&StageName::Synthesize].load(Ordering::SeqCst), 3);
    let error = snapshot.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::Transient);
    assert_eq!(error.stage, Some(StageName::Synthesize));
    assert!(!error.summary.contains("model unavailable"));
    assert_eq!(
        snapshot.last_event().unwrap().stage,
        Some(StageName::Synthesize)
    );
}

#[tokio::test]
async fn permanent_failure_is_not_retried() {
    let (pipeline, calls) = scripted(vec![(
        StageName::Download,
        vec![Step::Fail(StageFailure::permanent("private video"))],
    )]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(calls[&StageName::Download].load(Ordering::SeqCst), 1);
    assert_eq!(calls[&StageName::SceneExtract].load(Ordering::SeqCst), 0);
    assert_eq!(snapshot.error.as_ref().unwrap().kind, FailureKind::Permanent);
}

#[tokio::test]
async fn stage_timeout_is_reported_as_timeout() {
    let (pipeline, calls) = scripted(vec![(StageName::Download, vec![Step::Hang, Step::Hang])]);
    let config = OrchestratorConfig {
        retry: RetryPolicy {
            max_attempts: 2,
            ..fast_config().retry
        },
        timeouts: StageTimeouts {
            download: Duration::from_millis(20),
            ..StageTimeouts::default()
        },
        ..fast_config()
    };
    let (orchestrator, _store) = start(config, pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.as_ref().unwrap().kind, FailureKind::Timeout);
    assert_eq!(calls[&StageName::Download].load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn panicking_executor_fails_permanently() {
    let (pipeline, calls) = scripted(vec![(StageName::Transcribe, vec![Step::Panic])]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(calls[&StageName::Transcribe].load(Ordering::SeqCst), 1);
    let error = snapshot.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::Permanent);
    assert_eq!(error.stage, Some(StageName::Transcribe));
}

#[tokio::test]
async fn analysis_branch_failure_drops_sibling() {
    let (pipeline, calls) = scripted(vec![
        (
            StageName::VisualAnalyze,
            vec![Step::Fail(StageFailure::permanent("bad frames"))],
        ),
        (StageName::Transcribe, vec![Step::Hang]),
    ]);
    let (orchestrator, store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(
        snapshot.error.as_ref().unwrap().stage,
        Some(StageName::VisualAnalyze)
    );
    assert_eq!(calls[&StageName::Synthesize].load(Ordering::SeqCst), 0);
    assert!(
        !store
            .exists(job_id, ArtifactKind::Report)
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn finished_sibling_keeps_its_stage_result() {
    let gate = Arc::new(Notify::new());
    let (pipeline, calls) = scripted(vec![(
        StageName::VisualAnalyze,
        vec![Step::GateThenFail(
            gate.clone(),
            StageFailure::permanent("model refused the frames"),
        )],
    )]);
    let (orchestrator, store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    tokio::time::timeout(WAIT, async {
        while !store.exists(job_id, ArtifactKind::Transcript).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("transcript written");
    gate.notify_one();

    let snapshot = finish(&orchestrator, job_id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(calls[&StageName::Synthesize].load(Ordering::SeqCst), 0);

    let results: Vec<(StageName, StageResultOutcome)> = snapshot
        .stage_results
        .iter()
        .map(|r| (r.stage, r.outcome))
        .collect();
    assert_eq!(
        results,
        vec![
            (StageName::Download, StageResultOutcome::Ok),
            (StageName::SceneExtract, StageResultOutcome::Ok),
            (StageName::Transcribe, StageResultOutcome::Ok),
            (StageName::VisualAnalyze, StageResultOutcome::Failed),
        ]
    );
    let transcript = &snapshot.stage_results[2];
    assert_eq!(transcript.artifacts, vec![ArtifactKind::Transcript]);
}

#[tokio::test]
async fn visual_analysis_retries_up_to_the_cap() {
    let failures = vec![Step::Fail(StageFailure::transient("rate limited")); 5];
    let (pipeline, calls) = scripted(vec![(StageName::VisualAnalyze, failures)]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(calls[&StageName::VisualAnalyze].load(Ordering::SeqCst), 3);
    assert_eq!(calls[&StageName::Synthesize].load(Ordering::SeqCst), 0);
    let error = snapshot.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::Transient);
    assert_eq!(error.stage, Some(StageName::VisualAnalyze));
    let visual = snapshot
        .stage_results
        .iter()
        .find(|r| r.stage == StageName::VisualAnalyze)
        .unwrap();
    assert_eq!(visual.attempts, 3);
    assert_eq!(visual.outcome, StageResultOutcome::Failed);
}

#[tokio::test]
async fn missing_report_blocks_completion() {
    struct NoReport;

    #[async_trait]
    impl StageExecutor for NoReport {
        fn stage(&self) -> StageName {
            StageName::Synthesize
        }

        async fn run(&self, _ctx: &JobContext) -> StageOutcome {
            StageOutcome::Success {
                artifacts: Vec::new(),
            }
        }
    }

    let pipeline = Pipeline::builder()
        .download(fake(StageName::Download, Vec::new()))
        .scene_extract(fake(StageName::SceneExtract, Vec::new()))
        .visual_analyze(fake(StageName::VisualAnalyze, Vec::new()))
        .transcribe(fake(StageName::Transcribe, Vec::new()))
        .synthesize(NoReport)
        .build()
        .unwrap();
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    let snapshot = finish(&orchestrator, job_id).await;

    assert_eq!(snapshot.status, JobStatus::Failed);
    assert_eq!(snapshot.error.as_ref().unwrap().kind, FailureKind::Storage);
    assert!(matches!(
        orchestrator.report(job_id).await,
        Err(RuntimeError::NotComplete { .. })
    ));
}

// ── Cancellation and admission ───────────────────────────────────────────────

#[tokio::test]
async fn queued_job_waits_for_admission_and_can_be_cancelled() {
    let gate = Arc::new(Notify::new());
    let (pipeline, calls) = scripted(vec![(StageName::Download, vec![Step::Gate(gate.clone())])]);
    let config = OrchestratorConfig {
        max_concurrent_jobs: 1,
        ..fast_config()
    };
    let (orchestrator, _store) = start(config, pipeline).await;

    let first = orchestrator.submit(url(1)).await.unwrap();
    wait_for_status(&orchestrator, first, JobStatus::Downloading).await;
    let second = orchestrator.submit(url(2)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(
        orchestrator.status(second).await.unwrap().status,
        JobStatus::Queued
    );
    assert_eq!(orchestrator.list_active().await.len(), 2);

    assert_eq!(orchestrator.cancel(second).await.unwrap(), JobStatus::Queued);
    let cancelled = finish(&orchestrator, second).await;
    assert_eq!(cancelled.status, JobStatus::Failed);
    assert_eq!(cancelled.error.as_ref().unwrap().kind, FailureKind::Cancelled);

    gate.notify_one();
    assert_eq!(finish(&orchestrator, first).await.status, JobStatus::Complete);
    assert_eq!(calls[&StageName::Download].load(Ordering::SeqCst), 1);

    assert!(matches!(
        orchestrator.cancel(first).await,
        Err(RuntimeError::NotCancellable { .. })
    ));
}

#[tokio::test]
async fn running_stage_observes_cancellation() {
    let (pipeline, _) = scripted(vec![(StageName::SceneExtract, vec![Step::Hang])]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    wait_for_status(&orchestrator, job_id, JobStatus::Extracting).await;
    orchestrator.cancel(job_id).await.unwrap();

    let snapshot = finish(&orchestrator, job_id).await;
    assert_eq!(snapshot.status, JobStatus::Failed);
    let error = snapshot.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::Cancelled);
    assert_eq!(error.stage, Some(StageName::SceneExtract));
}

// ── Lookup, retention, restore ───────────────────────────────────────────────

#[tokio::test]
async fn artifacts_require_complete_and_unknown_jobs_are_not_found() {
    let gate = Arc::new(Notify::new());
    let (pipeline, _) = scripted(vec![(StageName::Synthesize, vec![Step::Gate(gate.clone())])]);
    let (orchestrator, _store) = start(fast_config(), pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    wait_for_status(&orchestrator, job_id, JobStatus::Synthesizing).await;
    assert!(matches!(
        orchestrator.artifact(job_id, ArtifactKind::SourceVideo).await,
        Err(RuntimeError::NotComplete {
            status: JobStatus::Synthesizing,
            ..
        })
    ));

    gate.notify_one();
    finish(&orchestrator, job_id).await;
    assert!(orchestrator.report(job_id).await.is_ok());

    let unknown = JobId::new();
    assert!(matches!(
        orchestrator.status(unknown).await,
        Err(RuntimeError::JobNotFound { .. })
    ));
    assert!(orchestrator.subscribe(unknown).await.is_err());
}

#[tokio::test]
async fn retention_evicts_oldest_terminal_jobs() {
    let (pipeline, _) = scripted(Vec::new());
    let config = OrchestratorConfig {
        retention_limit: 2,
        ..fast_config()
    };
    let (orchestrator, store) = start(config, pipeline).await;

    let mut ids = Vec::new();
    for n in 0..3 {
        let id = orchestrator.submit(url(n)).await.unwrap();
        finish(&orchestrator, id).await;
        ids.push(id);
    }

    assert!(matches!(
        orchestrator.status(ids[0]).await,
        Err(RuntimeError::JobNotFound { .. })
    ));
    assert!(orchestrator.subscribe(ids[0]).await.is_err());
    // Artifact deletion follows the terminal event of the evicting job.
    tokio::time::timeout(WAIT, async {
        while store.exists(ids[0], ArtifactKind::Report).await.unwrap() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("evicted artifacts deleted");
    assert!(orchestrator.status(ids[1]).await.is_ok());
    assert!(orchestrator.status(ids[2]).await.is_ok());
    assert_eq!(store.job_count().await, 2);

    let listed: Vec<JobId> = orchestrator.list_jobs().await.iter().map(|s| s.id).collect();
    assert_eq!(listed, vec![ids[2], ids[1]]);
}

#[tokio::test]
async fn live_subscriber_sees_completion_at_minimum_retention() {
    let gate = Arc::new(Notify::new());
    let (pipeline, _) = scripted(vec![(StageName::Download, vec![Step::Gate(gate.clone())])]);
    let config = OrchestratorConfig {
        retention_limit: 0,
        ..fast_config()
    };
    let (orchestrator, _store) = start(config, pipeline).await;

    let job_id = orchestrator.submit(url(1)).await.unwrap();
    wait_for_status(&orchestrator, job_id, JobStatus::Downloading).await;
    let stream = orchestrator.subscribe(job_id).await.unwrap();
    gate.notify_one();

    let statuses: Vec<JobStatus> = tokio::time::timeout(WAIT, stream.map(|e| e.status).collect())
        .await
        .unwrap();
    assert_eq!(statuses.last(), Some(&JobStatus::Complete));
    assert_eq!(
        orchestrator.status(job_id).await.unwrap().status,
        JobStatus::Complete
    );

    // The next finished job takes the single retained slot.
    let next = orchestrator.submit(url(2)).await.unwrap();
    finish(&orchestrator, next).await;
    assert!(matches!(
        orchestrator.status(job_id).await,
        Err(RuntimeError::JobNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn visible_job_is_always_subscribable() {
    for _ in 0..50 {
        let registry = JobRegistry::new(
            10,
            Arc::new(MemoryArtifactStore::new()),
            Arc::new(NoopJournal),
            EventBroadcaster::new(16),
        );
        let job_id = JobId::new();

        let reader = {
            let registry = registry.clone();
            tokio::spawn(async move {
                loop {
                    if registry.get(job_id).await.is_ok() {
                        return registry.events().subscribe(job_id).is_some();
                    }
                    tokio::task::yield_now().await;
                }
            })
        };
        registry.create(job_id, url(1)).await;

        assert!(reader.await.unwrap());
    }
}

#[derive(Default)]
struct MemoryJournal {
    rows: Mutex<HashMap<JobId, JobSnapshot>>,
}

#[async_trait]
impl JobJournal for MemoryJournal {
    async fn save(&self, snapshot: &JobSnapshot) -> Result<(), JournalError> {
        self.rows
            .lock()
            .unwrap()
            .insert(snapshot.id, snapshot.clone());
        Ok(())
    }

    async fn remove(&self, job_id: JobId) -> Result<(), JournalError> {
        self.rows.lock().unwrap().remove(&job_id);
        Ok(())
    }

    async fn load(&self) -> Result<Vec<JobSnapshot>, JournalError> {
        Ok(self.rows.lock().unwrap().values().cloned().collect())
    }
}

#[tokio::test]
async fn restart_marks_in_flight_jobs_interrupted() {
    let journal = Arc::new(MemoryJournal::default());

    let mut running = JobRecord::new(JobId::new(), url(1));
    running.transition(JobStatus::Downloading).unwrap();
    running.transition(JobStatus::Extracting).unwrap();
    journal.save(&running.snapshot()).await.unwrap();

    let mut finished = JobRecord::new(JobId::new(), url(2));
    finished.transition(JobStatus::Downloading).unwrap();
    finished
        .fail(crate::runtime::job::FailureDetail::new(
            FailureKind::Permanent,
            Some(StageName::Download),
        ))
        .unwrap();
    journal.save(&finished.snapshot()).await.unwrap();

    let (pipeline, _) = scripted(Vec::new());
    let store: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let orchestrator = Orchestrator::start(fast_config(), pipeline, store, journal.clone())
        .await
        .unwrap();

    let restored = orchestrator.status(running.id()).await.unwrap();
    assert_eq!(restored.status, JobStatus::Failed);
    let error = restored.error.as_ref().unwrap();
    assert_eq!(error.kind, FailureKind::Interrupted);
    assert_eq!(error.stage, Some(StageName::SceneExtract));
    assert_eq!(
        journal.rows.lock().unwrap()[&running.id()].status,
        JobStatus::Failed
    );

    let untouched = orchestrator.status(finished.id()).await.unwrap();
    assert_eq!(
        untouched.error.as_ref().unwrap().kind,
        FailureKind::Permanent
    );
    assert!(orchestrator.list_active().await.is_empty());
}

// ── Pipeline validation ──────────────────────────────────────────────────────

#[test]
fn pipeline_rejects_missing_and_mismatched_stages() {
    let missing = Pipeline::builder()
        .download(fake(StageName::Download, Vec::new()))
        .build();
    assert!(matches!(
        missing,
        Err(RuntimeError::PipelineIncomplete {
            stage: StageName::SceneExtract
        })
    ));

    let mismatched = Pipeline::builder()
        .download(fake(StageName::Transcribe, Vec::new()))
        .build();
    assert!(matches!(
        mismatched,
        Err(RuntimeError::StageMismatch {
            expected: StageName::Download,
            actual: StageName::Transcribe
        })
    ));
}
