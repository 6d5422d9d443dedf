use std::sync::Arc;

use crate::runtime::executors::{
    DownloadExecutor, SceneExtractExecutor, SynthesizeExecutor, TranscribeExecutor,
    VisualAnalyzeExecutor,
};
use crate::runtime::stage::StageExecutor;
use crate::runtime::types::{RuntimeError, StageName};
use crate::services::{Downloader, FrameAnalyzer, ReportSynthesizer, SceneDetector, Transcriber};

/// The five stage executors of the analysis pipeline.
#[derive(Clone)]
pub struct Pipeline {
    download: Arc<dyn StageExecutor>,
    scene_extract: Arc<dyn StageExecutor>,
    visual_analyze: Arc<dyn StageExecutor>,
    transcribe: Arc<dyn StageExecutor>,
    synthesize: Arc<dyn StageExecutor>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline").finish_non_exhaustive()
    }
}

impl Pipeline {
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::default()
    }

    /// Wire the standard executors to a set of collaborators.
    pub fn from_services(
        downloader: Arc<dyn Downloader>,
        detector: Arc<dyn SceneDetector>,
        analyzer: Arc<dyn FrameAnalyzer>,
        transcriber: Arc<dyn Transcriber>,
        synthesizer: Arc<dyn ReportSynthesizer>,
    ) -> Self {
        Self {
            download: Arc::new(DownloadExecutor::new(downloader)),
            scene_extract: Arc::new(SceneExtractExecutor::new(detector)),
            visual_analyze: Arc::new(VisualAnalyzeExecutor::new(analyzer)),
            transcribe: Arc::new(TranscribeExecutor::new(transcriber)),
            synthesize: Arc::new(SynthesizeExecutor::new(synthesizer)),
        }
    }

    pub fn executor(&self, stage: StageName) -> &Arc<dyn StageExecutor> {
        match stage {
            StageName::Download => &self.download,
            StageName::SceneExtract => &self.scene_extract,
            StageName::VisualAnalyze => &self.visual_analyze,
            StageName::Transcribe => &self.transcribe,
            StageName::Synthesize => &self.synthesize,
        }
    }
}

/// Collects one executor per stage; [`PipelineBuilder::build`] rejects
/// missing stages and executors registered under the wrong stage.
#[derive(Default)]
pub struct PipelineBuilder {
    download: Option<Arc<dyn StageExecutor>>,
    scene_extract: Option<Arc<dyn StageExecutor>>,
    visual_analyze: Option<Arc<dyn StageExecutor>>,
    transcribe: Option<Arc<dyn StageExecutor>>,
    synthesize: Option<Arc<dyn StageExecutor>>,
}

impl PipelineBuilder {
    pub fn download(mut self, executor: impl StageExecutor + 'static) -> Self {
        self.download = Some(Arc::new(executor));
        self
    }

    pub fn scene_extract(mut self, executor: impl StageExecutor + 'static) -> Self {
        self.scene_extract = Some(Arc::new(executor));
        self
    }

    pub fn visual_analyze(mut self, executor: impl StageExecutor + 'static) -> Self {
        self.visual_analyze = Some(Arc::new(executor));
        self
    }

    pub fn transcribe(mut self, executor: impl StageExecutor + 'static) -> Self {
        self.transcribe = Some(Arc::new(executor));
        self
    }

    pub fn synthesize(mut self, executor: impl StageExecutor + 'static) -> Self {
        self.synthesize = Some(Arc::new(executor));
        self
    }

    pub fn build(self) -> Result<Pipeline, RuntimeError> {
        fn slot(
            expected: StageName,
            executor: Option<Arc<dyn StageExecutor>>,
        ) -> Result<Arc<dyn StageExecutor>, RuntimeError> {
            let executor = executor.ok_or(RuntimeError::PipelineIncomplete { stage: expected })?;
            let actual = executor.stage();
            if actual != expected {
                return Err(RuntimeError::StageMismatch { expected, actual });
            }
            Ok(executor)
        }

        Ok(Pipeline {
            download: slot(StageName::Download, self.download)?,
            scene_extract: slot(StageName::SceneExtract, self.scene_extract)?,
            visual_analyze: slot(StageName::VisualAnalyze, self.visual_analyze)?,
            transcribe: slot(StageName::Transcribe, self.transcribe)?,
            synthesize: slot(StageName::Synthesize, self.synthesize)?,
        })
    }
}
