//! External collaborators of the analysis pipeline and their adapters.
//!
//! The runtime only sees the traits in this module; the adapters wrap the
//! command-line tools and HTTP APIs that do the actual media work.

mod downloader;
mod ffmpeg;
mod gemini;
mod process;
mod whisper;

pub use downloader::{YtDlpConfig, YtDlpDownloader, validate_video_url};
pub use ffmpeg::{FfmpegConfig, FfmpegSceneDetector};
pub use gemini::{
    GeminiClient, GeminiConfig, GeminiFrameAnalyzer, GeminiReportSynthesizer, InlineData, Part,
};
pub use whisper::{WhisperCliTranscriber, WhisperConfig};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runtime::job::JobInput;

/// One keyframe picked by scene detection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneFrame {
    /// 1-based scene number.
    pub index: usize,
    pub timestamp_secs: f64,
    /// JPEG bytes, base64 in JSON.
    #[serde(with = "base64_bytes")]
    pub image: Bytes,
}

/// What the vision model saw in one keyframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameAnalysis {
    pub index: usize,
    pub timestamp_secs: f64,
    pub description: String,
    #[serde(default)]
    pub objects: Vec<String>,
    /// On-screen text (OCR).
    #[serde(default)]
    pub text: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start_secs: f64,
    pub end_secs: f64,
    pub text: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
}

impl Transcript {
    /// Full text, segments joined with spaces.
    pub fn text(&self) -> String {
        self.segments
            .iter()
            .map(|s| s.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.text.trim().is_empty())
    }
}

/// Material handed to the report writer.
#[derive(Debug, Clone)]
pub struct SynthesisInput {
    pub input: JobInput,
    pub transcript: Transcript,
    pub scenes: Vec<SceneFrame>,
    pub frames: Vec<FrameAnalysis>,
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("unsupported url: {0}")]
    UnsupportedUrl(String),

    /// Private, removed or geo-blocked media.
    #[error("media unavailable: {0}")]
    Unavailable(String),

    #[error("media has no audio stream")]
    NoAudio,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}: {stderr}")]
    Process {
        program: String,
        status: String,
        stderr: String,
        retryable: bool,
    },

    #[error("'{0}' timed out")]
    Timeout(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Whether a later attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ServiceError::Process { retryable, .. } => *retryable,
            ServiceError::Timeout(_) => true,
            ServiceError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || e.status().is_some_and(|s| is_retryable_status(s.as_u16()))
            }
            ServiceError::Api { status, .. } => is_retryable_status(*status),
            ServiceError::UnsupportedUrl(_)
            | ServiceError::Unavailable(_)
            | ServiceError::NoAudio
            | ServiceError::Spawn { .. }
            | ServiceError::Malformed(_)
            | ServiceError::Io(_) => false,
        }
    }
}

fn is_retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

#[async_trait]
pub trait Downloader: Send + Sync {
    /// Fetch the video behind `url`.
    async fn download(&self, url: &str) -> Result<Bytes, ServiceError>;
}

#[async_trait]
pub trait SceneDetector: Send + Sync {
    /// Pick one keyframe per detected scene, in playback order.
    async fn detect(&self, video: Bytes) -> Result<Vec<SceneFrame>, ServiceError>;
}

#[async_trait]
pub trait FrameAnalyzer: Send + Sync {
    async fn analyze(&self, frames: &[SceneFrame]) -> Result<Vec<FrameAnalysis>, ServiceError>;
}

#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Returns [`ServiceError::NoAudio`] for silent media.
    async fn transcribe(&self, video: Bytes) -> Result<Transcript, ServiceError>;
}

#[async_trait]
pub trait ReportSynthesizer: Send + Sync {
    /// Produce the markdown report.
    async fn synthesize(&self, input: &SynthesisInput) -> Result<String, ServiceError>;
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}
