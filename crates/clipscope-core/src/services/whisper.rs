use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tracing::info;

use crate::services::process::{ScratchDir, run_tool};
use crate::services::{ServiceError, Transcriber, Transcript, TranscriptSegment};

/// ffmpeg stderr fragments meaning the input has no audio track.
const NO_AUDIO_MARKERS: &[&str] = &[
    "does not contain any stream",
    "matches no streams",
    "Output file #0 does not contain any stream",
];

#[derive(Debug, Clone)]
pub struct WhisperConfig {
    pub program: String,
    /// ggml model file passed to `whisper-cli -m`.
    pub model: PathBuf,
    /// Spoken language, or `auto`.
    pub language: String,
    pub threads: Option<usize>,
    /// Used to extract the audio track.
    pub ffmpeg_program: String,
    pub timeout: Duration,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            program: "whisper-cli".into(),
            model: PathBuf::from("models/ggml-base.bin"),
            language: "auto".into(),
            threads: None,
            ffmpeg_program: "ffmpeg".into(),
            timeout: Duration::from_secs(590),
        }
    }
}

/// Transcribes speech with the whisper.cpp command-line tool.
#[derive(Debug, Clone, Default)]
pub struct WhisperCliTranscriber {
    config: WhisperConfig,
}

impl WhisperCliTranscriber {
    pub fn new(config: WhisperConfig) -> Self {
        Self { config }
    }

    async fn extract_audio(&self, scratch: &ScratchDir) -> Result<PathBuf, ServiceError> {
        let input = scratch.join("input.mp4");
        let audio = scratch.join("audio.wav");
        let args = [
            "-hide_banner".to_owned(),
            "-nostdin".to_owned(),
            "-y".to_owned(),
            "-i".to_owned(),
            input.display().to_string(),
            "-vn".to_owned(),
            "-map".to_owned(),
            "0:a:0".to_owned(),
            "-ac".to_owned(),
            "1".to_owned(),
            "-ar".to_owned(),
            "16000".to_owned(),
            "-c:a".to_owned(),
            "pcm_s16le".to_owned(),
            audio.display().to_string(),
        ];
        let output = run_tool(&self.config.ffmpeg_program, &args, self.config.timeout).await?;
        if output.status.success() {
            return Ok(audio);
        }
        if NO_AUDIO_MARKERS.iter().any(|m| output.stderr.contains(m)) {
            return Err(ServiceError::NoAudio);
        }
        output.check(&self.config.ffmpeg_program, false)?;
        Ok(audio)
    }
}

#[derive(Deserialize)]
struct WhisperJson {
    #[serde(default)]
    result: Option<WhisperResult>,
    #[serde(default)]
    transcription: Vec<WhisperSegment>,
}

#[derive(Deserialize)]
struct WhisperResult {
    language: Option<String>,
}

#[derive(Deserialize)]
struct WhisperSegment {
    offsets: WhisperOffsets,
    text: String,
}

/// Milliseconds.
#[derive(Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}

fn parse_transcript(raw: &[u8]) -> Result<Transcript, ServiceError> {
    let parsed: WhisperJson = serde_json::from_slice(raw)
        .map_err(|e| ServiceError::Malformed(format!("whisper json: {e}")))?;
    let segments = parsed
        .transcription
        .into_iter()
        .map(|s| TranscriptSegment {
            start_secs: s.offsets.from as f64 / 1000.0,
            end_secs: s.offsets.to as f64 / 1000.0,
            text: s.text.trim().to_owned(),
        })
        .filter(|s| !s.text.is_empty())
        .collect();
    Ok(Transcript {
        language: parsed.result.and_then(|r| r.language),
        segments,
    })
}

#[async_trait]
impl Transcriber for WhisperCliTranscriber {
    async fn transcribe(&self, video: Bytes) -> Result<Transcript, ServiceError> {
        let scratch = ScratchDir::new("transcribe")?;
        tokio::fs::write(scratch.join("input.mp4"), &video).await?;
        let audio = self.extract_audio(&scratch).await?;

        let prefix = scratch.join("transcript");
        let mut args = vec![
            "-m".to_owned(),
            self.config.model.display().to_string(),
            "-f".to_owned(),
            audio.display().to_string(),
            "-l".to_owned(),
            self.config.language.clone(),
            "-oj".to_owned(),
            "-of".to_owned(),
            prefix.display().to_string(),
        ];
        if let Some(threads) = self.config.threads {
            args.push("-t".to_owned());
            args.push(threads.to_string());
        }
        run_tool(&self.config.program, &args, self.config.timeout)
            .await?
            .check(&self.config.program, false)?;

        let raw = tokio::fs::read(scratch.join("transcript.json")).await?;
        let transcript = parse_transcript(&raw)?;
        info!(
            segments = transcript.segments.len(),
            language = transcript.language.as_deref().unwrap_or("unknown"),
            "transcription finished"
        );
        Ok(transcript)
    }
}
