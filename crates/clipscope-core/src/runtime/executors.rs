//! Stage executors backed by the collaborator traits in [`crate::services`].

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::runtime::artifact::{ArtifactRef, StorageError};
use crate::runtime::job::JobInput;
use crate::runtime::stage::{JobContext, StageExecutor, StageFailure, StageOutcome};
use crate::runtime::types::{ArtifactKind, StageName};
use crate::services::{
    Downloader, FrameAnalysis, FrameAnalyzer, ReportSynthesizer, SceneDetector, SceneFrame,
    ServiceError, SynthesisInput, Transcriber, Transcript,
};

fn service_failure(err: ServiceError) -> StageFailure {
    if matches!(err, ServiceError::Timeout(_)) {
        StageFailure::timeout(err.to_string())
    } else if err.is_retryable() {
        StageFailure::transient(err.to_string())
    } else {
        StageFailure::permanent(err.to_string())
    }
}

fn decode<T: DeserializeOwned>(
    ctx: &JobContext,
    kind: ArtifactKind,
    bytes: &[u8],
) -> Result<T, StageFailure> {
    serde_json::from_slice(bytes).map_err(|e| {
        StageFailure::storage(StorageError::Malformed {
            job_id: ctx.job_id,
            kind,
            reason: e.to_string(),
        })
    })
}

async fn store_json<T: Serialize + ?Sized>(
    ctx: &JobContext,
    kind: ArtifactKind,
    value: &T,
) -> Result<ArtifactRef, StageFailure> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| StageFailure::permanent(format!("encode {kind}: {e}")))?;
    ctx.store(kind, Bytes::from(bytes)).await
}

// ── Download ─────────────────────────────────────────────────────────────────

/// Fetches the source video, or checks the uploaded one is in place.
pub struct DownloadExecutor {
    downloader: Arc<dyn Downloader>,
}

impl DownloadExecutor {
    pub fn new(downloader: Arc<dyn Downloader>) -> Self {
        Self { downloader }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Vec<ArtifactRef>, StageFailure> {
        match &ctx.input {
            JobInput::Url { url } => {
                let video = self.downloader.download(url).await.map_err(service_failure)?;
                if video.is_empty() {
                    return Err(StageFailure::permanent("downloader returned an empty file"));
                }
                info!(job_id = %ctx.job_id, size = video.len(), "video downloaded");
                Ok(vec![ctx.store(ArtifactKind::SourceVideo, video).await?])
            }
            JobInput::Upload { file_name } => {
                match ctx
                    .artifacts()
                    .describe(ctx.job_id, ArtifactKind::SourceVideo)
                    .await
                {
                    Ok(artifact) if artifact.size_bytes > 0 => {
                        debug!(job_id = %ctx.job_id, %file_name, "using uploaded video");
                        Ok(vec![artifact])
                    }
                    Ok(_) | Err(StorageError::NotFound { .. }) => Err(StageFailure::permanent(
                        format!("uploaded video '{file_name}' is missing or empty"),
                    )),
                    Err(e) => Err(StageFailure::storage(e)),
                }
            }
        }
    }
}

#[async_trait]
impl StageExecutor for DownloadExecutor {
    fn stage(&self) -> StageName {
        StageName::Download
    }

    async fn run(&self, ctx: &JobContext) -> StageOutcome {
        self.execute(ctx).await.into()
    }
}

// ── Scene extraction ─────────────────────────────────────────────────────────

pub struct SceneExtractExecutor {
    detector: Arc<dyn SceneDetector>,
}

impl SceneExtractExecutor {
    pub fn new(detector: Arc<dyn SceneDetector>) -> Self {
        Self { detector }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Vec<ArtifactRef>, StageFailure> {
        let video = ctx.load(ArtifactKind::SourceVideo).await?;
        let scenes = self.detector.detect(video).await.map_err(service_failure)?;
        if scenes.is_empty() {
            return Err(StageFailure::permanent("no keyframes could be extracted"));
        }
        info!(job_id = %ctx.job_id, scenes = scenes.len(), "scenes extracted");
        Ok(vec![store_json(ctx, ArtifactKind::Scenes, &scenes).await?])
    }
}

#[async_trait]
impl StageExecutor for SceneExtractExecutor {
    fn stage(&self) -> StageName {
        StageName::SceneExtract
    }

    async fn run(&self, ctx: &JobContext) -> StageOutcome {
        self.execute(ctx).await.into()
    }
}

// ── Visual analysis ──────────────────────────────────────────────────────────

pub struct VisualAnalyzeExecutor {
    analyzer: Arc<dyn FrameAnalyzer>,
}

impl VisualAnalyzeExecutor {
    pub fn new(analyzer: Arc<dyn FrameAnalyzer>) -> Self {
        Self { analyzer }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Vec<ArtifactRef>, StageFailure> {
        let raw = ctx.load(ArtifactKind::Scenes).await?;
        let scenes: Vec<SceneFrame> = decode(ctx, ArtifactKind::Scenes, &raw)?;
        let frames = self
            .analyzer
            .analyze(&scenes)
            .await
            .map_err(service_failure)?;
        debug!(job_id = %ctx.job_id, frames = frames.len(), "frames analyzed");
        Ok(vec![store_json(ctx, ArtifactKind::VisualAnalysis, &frames).await?])
    }
}

#[async_trait]
impl StageExecutor for VisualAnalyzeExecutor {
    fn stage(&self) -> StageName {
        StageName::VisualAnalyze
    }

    async fn run(&self, ctx: &JobContext) -> StageOutcome {
        self.execute(ctx).await.into()
    }
}

// ── Transcription ────────────────────────────────────────────────────────────

pub struct TranscribeExecutor {
    transcriber: Arc<dyn Transcriber>,
}

impl TranscribeExecutor {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Vec<ArtifactRef>, StageFailure> {
        let video = ctx.load(ArtifactKind::SourceVideo).await?;
        let transcript = match self.transcriber.transcribe(video).await {
            Ok(transcript) => transcript,
            Err(ServiceError::NoAudio) => {
                warn!(job_id = %ctx.job_id, "no audio stream, using empty transcript");
                Transcript::default()
            }
            Err(e) => return Err(service_failure(e)),
        };
        debug!(job_id = %ctx.job_id, segments = transcript.segments.len(), "transcribed");
        Ok(vec![store_json(ctx, ArtifactKind::Transcript, &transcript).await?])
    }
}

#[async_trait]
impl StageExecutor for TranscribeExecutor {
    fn stage(&self) -> StageName {
        StageName::Transcribe
    }

    async fn run(&self, ctx: &JobContext) -> StageOutcome {
        self.execute(ctx).await.into()
    }
}

// ── Synthesis ────────────────────────────────────────────────────────────────

pub struct SynthesizeExecutor {
    synthesizer: Arc<dyn ReportSynthesizer>,
}

impl SynthesizeExecutor {
    pub fn new(synthesizer: Arc<dyn ReportSynthesizer>) -> Self {
        Self { synthesizer }
    }

    async fn execute(&self, ctx: &JobContext) -> Result<Vec<ArtifactRef>, StageFailure> {
        let transcript_raw = ctx.load(ArtifactKind::Transcript).await?;
        let scenes_raw = ctx.load(ArtifactKind::Scenes).await?;
        let frames_raw = ctx.load(ArtifactKind::VisualAnalysis).await?;

        let input = SynthesisInput {
            input: ctx.input.clone(),
            transcript: decode(ctx, ArtifactKind::Transcript, &transcript_raw)?,
            scenes: decode(ctx, ArtifactKind::Scenes, &scenes_raw)?,
            frames: decode::<Vec<FrameAnalysis>>(ctx, ArtifactKind::VisualAnalysis, &frames_raw)?,
        };

        let report = self
            .synthesizer
            .synthesize(&input)
            .await
            .map_err(service_failure)?;
        if report.trim().is_empty() {
            return Err(StageFailure::permanent("synthesizer returned an empty report"));
        }
        info!(job_id = %ctx.job_id, chars = report.len(), "report synthesized");
        Ok(vec![ctx.store(ArtifactKind::Report, Bytes::from(report)).await?])
    }
}

#[async_trait]
impl StageExecutor for SynthesizeExecutor {
    fn stage(&self) -> StageName {
        StageName::Synthesize
    }

    async fn run(&self, ctx: &JobContext) -> StageOutcome {
        self.execute(ctx).await.into()
    }
}
