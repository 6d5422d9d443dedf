use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::runtime::artifact::ArtifactRef;
use crate::runtime::types::{ArtifactKind, FailureKind, JobId, JobStatus, RuntimeError, StageName};

/// What a job analyses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobInput {
    /// A short-form video page to download.
    Url { url: String },
    /// A media file uploaded with the submission.
    Upload { file_name: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageResultOutcome {
    Ok,
    Failed,
}

/// Immutable record of one stage execution (all attempts included).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    pub stage: StageName,
    pub outcome: StageResultOutcome,
    pub artifacts: Vec<ArtifactKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,
    pub attempts: u32,
    pub duration_ms: u64,
    pub finished_at: DateTime<Utc>,
}

/// A status change, as delivered to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Failing stage on a `failed` event.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Client-facing description of why a stage or job failed.
///
/// `summary` is derived from kind and stage only; collaborator output never
/// ends up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    pub kind: FailureKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<StageName>,
    pub summary: String,
}

impl FailureDetail {
    pub fn new(kind: FailureKind, stage: Option<StageName>) -> Self {
        let subject = stage.map(StageName::as_str).unwrap_or("job");
        let summary = match kind {
            FailureKind::Transient => format!("{subject} failed after retries"),
            FailureKind::Permanent => format!("{subject} failed: input could not be processed"),
            FailureKind::Timeout => format!("{subject} timed out"),
            FailureKind::Storage => format!("{subject} failed: artifact storage error"),
            FailureKind::Cancelled => "cancelled by client".to_owned(),
            FailureKind::Interrupted => "interrupted by server restart".to_owned(),
        };
        Self {
            kind,
            stage,
            summary,
        }
    }
}

/// Published, read-only view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSnapshot {
    pub id: JobId,
    pub input: JobInput,
    pub status: JobStatus,
    pub stage_results: Vec<StageResult>,
    pub artifacts: BTreeMap<ArtifactKind, ArtifactRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureDetail>,
    pub transitions: Vec<StatusEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobSnapshot {
    /// Most recent status event; every job has at least the `queued` one.
    pub fn last_event(&self) -> Option<&StatusEvent> {
        self.transitions.last()
    }

    /// Stage the job is in (or failed in), if any.
    pub fn current_stage(&self) -> Option<StageName> {
        match self.status {
            JobStatus::Failed => self.error.as_ref().and_then(|e| e.stage),
            status => status.stages().first().copied(),
        }
    }
}

/// Mutable job state, owned by exactly one state machine.
///
/// The status is only reachable through [`JobRecord::transition`] and
/// [`JobRecord::fail`], both of which append to `transitions`.
#[derive(Debug, Clone)]
pub(crate) struct JobRecord {
    inner: JobSnapshot,
}

impl JobRecord {
    pub(crate) fn new(id: JobId, input: JobInput) -> Self {
        let now = Utc::now();
        Self {
            inner: JobSnapshot {
                id,
                input,
                status: JobStatus::Queued,
                stage_results: Vec::new(),
                artifacts: BTreeMap::new(),
                error: None,
                transitions: vec![StatusEvent {
                    job_id: id,
                    status: JobStatus::Queued,
                    stage: None,
                    timestamp: now,
                }],
                created_at: now,
                updated_at: now,
            },
        }
    }

    pub(crate) fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self { inner: snapshot }
    }

    pub(crate) fn id(&self) -> JobId {
        self.inner.id
    }

    pub(crate) fn status(&self) -> JobStatus {
        self.inner.status
    }

    pub(crate) fn input(&self) -> &JobInput {
        &self.inner.input
    }

    pub(crate) fn artifact(&self, kind: ArtifactKind) -> Option<&ArtifactRef> {
        self.inner.artifacts.get(&kind)
    }

    /// Move to a non-failed successor state.
    pub(crate) fn transition(&mut self, next: JobStatus) -> Result<StatusEvent, RuntimeError> {
        if next == JobStatus::Failed || !self.inner.status.can_transition_to(next) {
            return Err(self.invalid(next));
        }
        if next == JobStatus::Complete
            && !self
                .artifact(ArtifactKind::Report)
                .is_some_and(|r| r.size_bytes > 0)
        {
            return Err(RuntimeError::MissingReport { job_id: self.id() });
        }
        Ok(self.push(next, None))
    }

    /// Move to `failed`, recording why.
    pub(crate) fn fail(&mut self, detail: FailureDetail) -> Result<StatusEvent, RuntimeError> {
        if !self.inner.status.can_transition_to(JobStatus::Failed) {
            return Err(self.invalid(JobStatus::Failed));
        }
        let stage = detail.stage;
        self.inner.error = Some(detail);
        Ok(self.push(JobStatus::Failed, stage))
    }

    /// Append a stage result and the artifacts it produced.
    pub(crate) fn record_stage(&mut self, result: StageResult, refs: Vec<ArtifactRef>) {
        for artifact in refs {
            self.inner.artifacts.insert(artifact.kind, artifact);
        }
        self.inner.stage_results.push(result);
        self.inner.updated_at = Utc::now();
    }

    /// Refresh the pointer to an artifact from the store.
    pub(crate) fn set_artifact(&mut self, artifact: ArtifactRef) {
        self.inner.artifacts.insert(artifact.kind, artifact);
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        self.inner.clone()
    }

    fn push(&mut self, status: JobStatus, stage: Option<StageName>) -> StatusEvent {
        let event = StatusEvent {
            job_id: self.inner.id,
            status,
            stage,
            timestamp: Utc::now(),
        };
        self.inner.status = status;
        self.inner.updated_at = event.timestamp;
        self.inner.transitions.push(event.clone());
        event
    }

    fn invalid(&self, to: JobStatus) -> RuntimeError {
        RuntimeError::InvalidTransition {
            job_id: self.inner.id,
            from: self.inner.status,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url_record() -> JobRecord {
        JobRecord::new(
            JobId::new(),
            JobInput::Url {
                url: "https://www.tiktok.com/@a/video/1".into(),
            },
        )
    }

    fn report_ref(id: JobId, size_bytes: u64) -> ArtifactRef {
        ArtifactRef {
            job_id: id,
            kind: ArtifactKind::Report,
            location: format!("{id}/report.md"),
            size_bytes,
        }
    }

    fn walk_to_synthesizing(record: &mut JobRecord) {
        for next in [
            JobStatus::Downloading,
            JobStatus::Extracting,
            JobStatus::Analyzing,
            JobStatus::Synthesizing,
        ] {
            record.transition(next).unwrap();
        }
    }

    #[test]
    fn new_record_is_queued_with_one_event() {
        let record = url_record();
        let snapshot = record.snapshot();
        assert_eq!(snapshot.status, JobStatus::Queued);
        assert_eq!(snapshot.transitions.len(), 1);
        assert_eq!(snapshot.last_event().unwrap().status, JobStatus::Queued);
    }

    #[test]
    fn skipping_a_phase_is_rejected() {
        let mut record = url_record();
        let err = record.transition(JobStatus::Analyzing).unwrap_err();
        assert!(matches!(err, RuntimeError::InvalidTransition { .. }));
        assert_eq!(record.status(), JobStatus::Queued);
    }

    #[test]
    fn complete_requires_non_empty_report() {
        let mut record = url_record();
        walk_to_synthesizing(&mut record);
        assert!(matches!(
            record.transition(JobStatus::Complete),
            Err(RuntimeError::MissingReport { .. })
        ));

        let id = record.id();
        record.record_stage(
            StageResult {
                stage: StageName::Synthesize,
                outcome: StageResultOutcome::Ok,
                artifacts: vec![ArtifactKind::Report],
                error: None,
                attempts: 1,
                duration_ms: 5,
                finished_at: Utc::now(),
            },
            vec![report_ref(id, 0)],
        );
        assert!(record.transition(JobStatus::Complete).is_err());

        record.record_stage(
            StageResult {
                stage: StageName::Synthesize,
                outcome: StageResultOutcome::Ok,
                artifacts: vec![ArtifactKind::Report],
                error: None,
                attempts: 2,
                duration_ms: 5,
                finished_at: Utc::now(),
            },
            vec![report_ref(id, 42)],
        );
        record.transition(JobStatus::Complete).unwrap();
        assert_eq!(record.status(), JobStatus::Complete);
    }

    #[test]
    fn failed_is_absorbing_and_status_tracks_transitions() {
        let mut record = url_record();
        record.transition(JobStatus::Downloading).unwrap();
        let event = record
            .fail(FailureDetail::new(FailureKind::Timeout, Some(StageName::Download)))
            .unwrap();
        assert_eq!(event.stage, Some(StageName::Download));

        assert!(record.transition(JobStatus::Extracting).is_err());
        assert!(
            record
                .fail(FailureDetail::new(FailureKind::Permanent, None))
                .is_err()
        );

        let snapshot = record.snapshot();
        assert_eq!(snapshot.status, snapshot.transitions.last().unwrap().status);
        assert_eq!(snapshot.current_stage(), Some(StageName::Download));
        assert_eq!(snapshot.error.unwrap().summary, "download timed out");
    }

    #[test]
    fn input_serializes_with_type_tag() {
        let json = serde_json::to_value(JobInput::Upload {
            file_name: "clip.mp4".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "upload");
        assert_eq!(json["file_name"], "clip.mp4");
    }
}
