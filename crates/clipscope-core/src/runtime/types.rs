use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};
use thiserror::Error;
use uuid::Uuid;

/// Opaque identifier of a submitted analysis job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Allocate a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle state of a job.
///
/// Non-terminal states are totally ordered; a job only ever moves one step
/// forward or to [`JobStatus::Failed`]. `Complete` and `Failed` are absorbing.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Downloading,
    Extracting,
    Analyzing,
    Synthesizing,
    Complete,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Returns `true` for `complete` and `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Complete | JobStatus::Failed)
    }

    /// Position in the forward order. `Failed` sorts after everything.
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Downloading => 1,
            JobStatus::Extracting => 2,
            JobStatus::Analyzing => 3,
            JobStatus::Synthesizing => 4,
            JobStatus::Complete => 5,
            JobStatus::Failed => 6,
        }
    }

    /// Whether `next` is a legal successor of `self`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed => true,
            _ => next.rank() == self.rank() + 1,
        }
    }

    /// Stages executed while the job sits in this state.
    pub fn stages(self) -> &'static [StageName] {
        match self {
            JobStatus::Downloading => &[StageName::Download],
            JobStatus::Extracting => &[StageName::SceneExtract],
            JobStatus::Analyzing => &[StageName::VisualAnalyze, StageName::Transcribe],
            JobStatus::Synthesizing => &[StageName::Synthesize],
            _ => &[],
        }
    }
}

/// The five pipeline stages.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StageName {
    Download,
    SceneExtract,
    VisualAnalyze,
    Transcribe,
    Synthesize,
}

impl StageName {
    pub fn as_str(self) -> &'static str {
        self.into()
    }
}

/// Named artifact slot; each job holds at most one artifact per kind.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ArtifactKind {
    SourceVideo,
    Scenes,
    VisualAnalysis,
    Transcript,
    Report,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 5] = [
        ArtifactKind::SourceVideo,
        ArtifactKind::Scenes,
        ArtifactKind::VisualAnalysis,
        ArtifactKind::Transcript,
        ArtifactKind::Report,
    ];

    /// File name used by file-backed stores.
    pub fn file_name(self) -> &'static str {
        match self {
            ArtifactKind::SourceVideo => "video.mp4",
            ArtifactKind::Scenes => "scenes.json",
            ArtifactKind::VisualAnalysis => "visual_analysis.json",
            ArtifactKind::Transcript => "transcript.json",
            ArtifactKind::Report => "report.md",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArtifactKind::SourceVideo => "video/mp4",
            ArtifactKind::Scenes | ArtifactKind::VisualAnalysis | ArtifactKind::Transcript => {
                "application/json"
            }
            ArtifactKind::Report => "text/markdown; charset=utf-8",
        }
    }
}

/// Classification of a stage failure.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// Network hiccup, model unavailable, rate limited.
    Transient,
    /// Malformed, private or unsupported input.
    Permanent,
    /// The stage exceeded its time budget.
    Timeout,
    /// Artifact read or write failed.
    Storage,
    /// A client asked for the job to stop.
    Cancelled,
    /// The process stopped while the job was running.
    Interrupted,
}

/// Errors produced by the orchestration runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The referenced job does not exist (or was evicted).
    #[error("job not found: {job_id}")]
    JobNotFound { job_id: JobId },

    /// The job exists but has not reached `complete`.
    #[error("job {job_id} is not complete (status: {status})")]
    NotComplete { job_id: JobId, status: JobStatus },

    /// The job is already terminal and can no longer be cancelled.
    #[error("job {job_id} cannot be cancelled (status: {status})")]
    NotCancellable { job_id: JobId, status: JobStatus },

    /// A state change that the lifecycle does not allow.
    #[error("illegal transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },

    /// `complete` was requested without a usable report artifact.
    #[error("job {job_id} has no report artifact")]
    MissingReport { job_id: JobId },

    /// Orchestrator submission queue is full.
    #[error("orchestrator queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    /// The orchestrator loop is gone.
    #[error("orchestrator shut down")]
    Shutdown,

    /// A pipeline was built without an executor for `stage`.
    #[error("pipeline has no executor for stage '{stage}'")]
    PipelineIncomplete { stage: StageName },

    /// An executor was registered under the wrong stage.
    #[error("executor for stage '{actual}' registered as '{expected}'")]
    StageMismatch {
        expected: StageName,
        actual: StageName,
    },

    #[error(transparent)]
    Storage(#[from] crate::runtime::artifact::StorageError),

    #[error(transparent)]
    Journal(#[from] crate::runtime::journal::JournalError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            JobStatus::Queued,
            JobStatus::Downloading,
            JobStatus::Extracting,
            JobStatus::Analyzing,
            JobStatus::Synthesizing,
            JobStatus::Complete,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(JobStatus::Synthesizing.to_string(), "synthesizing");
    }

    #[test]
    fn transitions_move_one_step_forward() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Downloading));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Extracting));
        assert!(!JobStatus::Analyzing.can_transition_to(JobStatus::Extracting));
        assert!(JobStatus::Synthesizing.can_transition_to(JobStatus::Complete));
        assert!(!JobStatus::Analyzing.can_transition_to(JobStatus::Complete));
    }

    #[test]
    fn failed_reachable_from_non_terminal_only() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Synthesizing.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Complete.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn analysis_phase_covers_both_branches() {
        assert_eq!(
            JobStatus::Analyzing.stages(),
            &[StageName::VisualAnalyze, StageName::Transcribe]
        );
        assert!(JobStatus::Complete.stages().is_empty());
    }

    #[test]
    fn job_id_parses_its_display_form() {
        let id = JobId::new();
        assert_eq!(id.to_string().parse::<JobId>().unwrap(), id);
        assert!("abc123".parse::<JobId>().is_err());
    }
}
