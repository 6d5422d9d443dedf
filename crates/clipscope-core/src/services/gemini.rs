//! Google Gemini `generateContent` client plus the vision and report
//! adapters built on top of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::runtime::job::JobInput;
use crate::services::{
    FrameAnalysis, FrameAnalyzer, ReportSynthesizer, SceneFrame, ServiceError, SynthesisInput,
};

const FRAME_PROMPT: &str = "You are a video frame analyst. For every keyframe below, describe \
what is shown in Simplified Chinese. Reply with a JSON array only, one object per keyframe: \
{\"index\": <keyframe number>, \"description\": <one or two sentences>, \
\"objects\": [<notable objects>], \"text\": [<on-screen text, verbatim>]}.";

const REPORT_INTRO: &str = "You are a world-class TikTok video analyst. Your task is to analyze \
the provided materials (transcript, keyframes and keyframe notes) of a short video and generate \
a comprehensive report in Markdown format.";

const REPORT_LANGUAGE: &str = "The report must follow these language requirements: the speech \
transcript stays in its original language, all other analysis is written in Simplified Chinese.";

const STORYBOARD_PROMPT: &str = "请根据提供的关键帧和文字记录，创建一个专业级的故事板和拍摄脚本。\
**必须使用标准的GitHub Flavored Markdown表格格式**，包含表头和分隔线。表格应包含以下列：\
`场景`、`关键帧描述`、`视觉元素`、`人物动作`、`镜头语言`、`音频/对话`、`音效/背景音乐`。\
直接回答内容，不需要其他说明。";

const DEEP_DIVE_PROMPT: &str = "请以资深内容策略师的视角，对视频进行多维度的深入分析。\
分析应包括但不限于以下方面：内容创意、叙事结构、视觉呈现、情感共鸣和传播潜力。\
请务必结合具体画面和对话进行讨论。直接回答内容，不需要其他说明。";

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    /// Per-request limit.
    pub timeout: Duration,
    /// Keyframes sent in one vision request.
    pub frames_per_request: usize,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .field("frames_per_request", &self.frames_per_request)
            .finish()
    }
}

impl Default for GeminiConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: "gemini-1.5-flash".into(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".into(),
            timeout: Duration::from_secs(600),
            frames_per_request: 8,
        }
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Part {
    Text(String),
    InlineData(InlineData),
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Part::Text(text.into())
    }

    pub fn jpeg(bytes: &[u8]) -> Self {
        Part::InlineData(InlineData {
            mime_type: "image/jpeg".into(),
            data: STANDARD.encode(bytes),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineData {
    pub mime_type: String,
    pub data: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    contents: Vec<Content>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Deserialize)]
struct ErrorDetail {
    message: String,
}

fn api_error(status: u16, body: &str) -> ServiceError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error.message)
        .unwrap_or_else(|_| body.chars().take(500).collect());
    ServiceError::Api { status, message }
}

fn extract_text(response: GenerateResponse) -> Result<String, ServiceError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(ServiceError::Malformed(format!("prompt blocked: {reason}")));
    }
    let candidate = response
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| ServiceError::Malformed("no candidates in response".into()))?;
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".into());
        return Err(ServiceError::Malformed(format!(
            "empty candidate (finish reason: {reason})"
        )));
    }
    Ok(text)
}

/// Remove a surrounding markdown code fence, if any.
fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

// ── Client ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct GeminiClient {
    http: Client,
    config: Arc<GeminiConfig>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, ServiceError> {
        let http = Client::builder()
            .user_agent(concat!("clipscope/", env!("CARGO_PKG_VERSION")))
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            http,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// Single-turn `generateContent` call returning the joined text parts.
    pub async fn generate(&self, parts: Vec<Part>, json: bool) -> Result<String, ServiceError> {
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        );
        let request = GenerateRequest {
            contents: vec![Content { role: "user", parts }],
            generation_config: json.then_some(GenerationConfig {
                response_mime_type: "application/json",
            }),
        };

        debug!(model = %self.config.model, json, "sending generateContent request");
        let resp = self
            .http
            .post(&url)
            .header("x-goog-api-key", &self.config.api_key)
            .json(&request)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(api_error(status.as_u16(), &body));
        }
        let response: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| ServiceError::Malformed(format!("generateContent response: {e}")))?;
        extract_text(response)
    }
}

// ── Vision ───────────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct RawFrame {
    index: usize,
    #[serde(default)]
    description: String,
    #[serde(default)]
    objects: Vec<String>,
    #[serde(default)]
    text: Vec<String>,
}

fn frame_parts(batch: &[SceneFrame]) -> Vec<Part> {
    let mut parts = Vec::with_capacity(1 + batch.len() * 2);
    parts.push(Part::text(FRAME_PROMPT));
    for frame in batch {
        parts.push(Part::text(format!(
            "Keyframe {} at {:.2}s:",
            frame.index, frame.timestamp_secs
        )));
        parts.push(Part::jpeg(&frame.image));
    }
    parts
}

fn parse_frame_batch(reply: &str, batch: &[SceneFrame]) -> Result<Vec<FrameAnalysis>, ServiceError> {
    let raw: Vec<RawFrame> = serde_json::from_str(strip_fences(reply))
        .map_err(|e| ServiceError::Malformed(format!("frame analysis json: {e}")))?;
    let timestamps: HashMap<usize, f64> =
        batch.iter().map(|f| (f.index, f.timestamp_secs)).collect();

    let mut frames: Vec<FrameAnalysis> = raw
        .into_iter()
        .filter_map(|r| {
            let Some(&timestamp_secs) = timestamps.get(&r.index) else {
                warn!(index = r.index, "model described a keyframe that was not sent");
                return None;
            };
            Some(FrameAnalysis {
                index: r.index,
                timestamp_secs,
                description: r.description.trim().to_owned(),
                objects: r.objects,
                text: r.text,
            })
        })
        .collect();
    if frames.is_empty() {
        return Err(ServiceError::Malformed(
            "frame analysis matched none of the keyframes".into(),
        ));
    }
    if frames.len() < batch.len() {
        warn!(
            sent = batch.len(),
            described = frames.len(),
            "some keyframes were not described"
        );
    }
    frames.sort_by_key(|f| f.index);
    frames.dedup_by_key(|f| f.index);
    Ok(frames)
}

/// Describes keyframes with Gemini vision, a batch of frames per request.
#[derive(Debug, Clone)]
pub struct GeminiFrameAnalyzer {
    client: GeminiClient,
}

impl GeminiFrameAnalyzer {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl FrameAnalyzer for GeminiFrameAnalyzer {
    async fn analyze(&self, frames: &[SceneFrame]) -> Result<Vec<FrameAnalysis>, ServiceError> {
        let batch_size = self.client.config().frames_per_request.max(1);
        let mut analyses = Vec::with_capacity(frames.len());
        for batch in frames.chunks(batch_size) {
            let reply = self.client.generate(frame_parts(batch), true).await?;
            analyses.extend(parse_frame_batch(&reply, batch)?);
        }
        info!(frames = analyses.len(), "keyframes described");
        Ok(analyses)
    }
}

// ── Report ───────────────────────────────────────────────────────────────────

fn describe_source(input: &JobInput) -> String {
    match input {
        JobInput::Url { url } => format!("Source: {url}"),
        JobInput::Upload { file_name } => format!("Source: uploaded file {file_name}"),
    }
}

fn frame_notes(frames: &[FrameAnalysis]) -> String {
    let mut notes = String::from("Keyframe notes:\n");
    for frame in frames {
        notes.push_str(&format!(
            "- #{} ({:.2}s): {}",
            frame.index, frame.timestamp_secs, frame.description
        ));
        if !frame.objects.is_empty() {
            notes.push_str(&format!(" | objects: {}", frame.objects.join(", ")));
        }
        if !frame.text.is_empty() {
            notes.push_str(&format!(" | on-screen text: {}", frame.text.join(" / ")));
        }
        notes.push('\n');
    }
    notes
}

/// Prompt of the report request: transcript, storyboard instructions with
/// the keyframes inline, then the strategic analysis instructions.
fn report_parts(input: &SynthesisInput) -> Vec<Part> {
    let transcript = input.transcript.text();
    let transcript = if transcript.is_empty() {
        "(no speech detected)".to_owned()
    } else {
        transcript
    };

    let mut parts = vec![
        Part::text(REPORT_INTRO),
        Part::text(REPORT_LANGUAGE),
        Part::text(describe_source(&input.input)),
        Part::text("\n---"),
        Part::text("\n\n**1. Full Speech Transcript:**"),
        Part::text(format!("\n> \"{transcript}\"")),
        Part::text("\n\n**2. 故事板和拍摄脚本:**"),
        Part::text(STORYBOARD_PROMPT),
    ];
    if !input.frames.is_empty() {
        parts.push(Part::text(frame_notes(&input.frames)));
    }
    parts.extend(input.scenes.iter().map(|scene| Part::jpeg(&scene.image)));
    parts.push(Part::text("\n\n**3. 深入分析:**"));
    parts.push(Part::text(DEEP_DIVE_PROMPT));
    parts
}

/// Writes the final markdown report with Gemini.
#[derive(Debug, Clone)]
pub struct GeminiReportSynthesizer {
    client: GeminiClient,
}

impl GeminiReportSynthesizer {
    pub fn new(client: GeminiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReportSynthesizer for GeminiReportSynthesizer {
    async fn synthesize(&self, input: &SynthesisInput) -> Result<String, ServiceError> {
        let report = self.client.generate(report_parts(input), false).await?;
        info!(chars = report.chars().count(), "report generated");
        Ok(report.trim().to_owned())
    }
}
