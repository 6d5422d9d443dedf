use clipscope_core::{ArtifactKind, JobInput, JobSnapshot};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;

#[derive(Debug, Deserialize, ToSchema)]
pub struct AnalyzeRequest {
    /// Link to a single short-form video.
    pub url: String,
}

/// Multipart form of `POST /analyze-upload`.
#[derive(ToSchema)]
#[allow(dead_code)]
pub struct UploadForm {
    /// The video file.
    #[schema(value_type = String, format = Binary)]
    pub video: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobAccepted {
    pub job_id: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CancelAccepted {
    pub job_id: String,
    /// Status the job had when the cancellation was requested.
    pub status: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub job_id: String,
    pub status: String,
    /// Stage being run, or the stage that failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
    /// Short failure summary when `status` is `failed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: String,
}

impl From<&JobSnapshot> for StatusResponse {
    fn from(snapshot: &JobSnapshot) -> Self {
        Self {
            job_id: snapshot.id.to_string(),
            status: snapshot.status.as_str().to_owned(),
            stage: snapshot.current_stage().map(|s| s.as_str().to_owned()),
            error: snapshot.error.as_ref().map(|e| e.summary.clone()),
            updated_at: snapshot.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobSummary {
    pub job_id: String,
    pub status: String,
    /// `url` or `upload`.
    pub source_type: String,
    /// The URL or the uploaded file name.
    pub source: String,
    pub terminal: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl From<&JobSnapshot> for JobSummary {
    fn from(snapshot: &JobSnapshot) -> Self {
        let (source_type, source) = match &snapshot.input {
            JobInput::Url { url } => ("url", url.clone()),
            JobInput::Upload { file_name } => ("upload", file_name.clone()),
        };
        Self {
            job_id: snapshot.id.to_string(),
            status: snapshot.status.as_str().to_owned(),
            source_type: source_type.to_owned(),
            source,
            terminal: snapshot.status.is_terminal(),
            created_at: snapshot.created_at.to_rfc3339(),
            updated_at: snapshot.updated_at.to_rfc3339(),
        }
    }
}

/// File offered by `GET /download/{job_id}/{file_type}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
#[strum(serialize_all = "lowercase")]
pub enum DownloadFile {
    Video,
    Report,
}

impl DownloadFile {
    pub fn kind(self) -> ArtifactKind {
        match self {
            DownloadFile::Video => ArtifactKind::SourceVideo,
            DownloadFile::Report => ArtifactKind::Report,
        }
    }

    pub fn attachment_name(self, job_id: &str) -> String {
        match self {
            DownloadFile::Video => format!("{job_id}.mp4"),
            DownloadFile::Report => format!("{job_id}_report.md"),
        }
    }
}
