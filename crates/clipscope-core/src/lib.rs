mod runtime;

pub mod services;

pub use runtime::admission::JobAdmission;
pub use runtime::artifact::{
    ArtifactRef, ArtifactStore, FsArtifactStore, MemoryArtifactStore, StorageError,
};
pub use runtime::broadcast::{EventBroadcaster, StatusStream};
pub use runtime::executors::{
    DownloadExecutor, SceneExtractExecutor, SynthesizeExecutor, TranscribeExecutor,
    VisualAnalyzeExecutor,
};
pub use runtime::config::{OrchestratorConfig, RetryPolicy, StageTimeouts};
pub use runtime::job::{
    FailureDetail, JobInput, JobSnapshot, StageResult, StageResultOutcome, StatusEvent,
};
pub use runtime::journal::{JobJournal, JournalError, NoopJournal};
pub use runtime::orchestrator::Orchestrator;
pub use runtime::pipeline::{Pipeline, PipelineBuilder};
pub use runtime::registry::{JobHandle, JobRegistry};
pub use runtime::stage::{JobContext, StageExecutor, StageFailure, StageOutcome};
pub use runtime::types::{ArtifactKind, FailureKind, JobId, JobStatus, RuntimeError, StageName};
